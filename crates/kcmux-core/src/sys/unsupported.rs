use std::os::fd::{BorrowedFd, OwnedFd};
use std::time::Duration;

use super::{Interest, Kernel, Watch};
use crate::error::{Error, Result};
use crate::mode::Mode;

/// Capability set for hosts without a Kernel Connection Multiplexor.
///
/// Every operation fails with [`Error::PlatformUnsupported`] and never issues
/// a system call, so callers can tell "not available" apart from "failed".
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsupported;

impl Kernel for Unsupported {
    fn supported(&self) -> Result<()> {
        Err(Error::PlatformUnsupported)
    }

    fn create_group(&self, _mode: Mode) -> Result<OwnedFd> {
        Err(Error::PlatformUnsupported)
    }

    fn clone_group(&self, _group: BorrowedFd<'_>) -> Result<OwnedFd> {
        Err(Error::PlatformUnsupported)
    }

    fn attach(
        &self,
        _group: BorrowedFd<'_>,
        _conn: BorrowedFd<'_>,
        _classifier: BorrowedFd<'_>,
    ) -> Result<()> {
        Err(Error::PlatformUnsupported)
    }

    fn detach(&self, _group: BorrowedFd<'_>, _conn: BorrowedFd<'_>) -> Result<()> {
        Err(Error::PlatformUnsupported)
    }

    fn socket_error(&self, _fd: BorrowedFd<'_>) -> Result<Option<i32>> {
        Err(Error::PlatformUnsupported)
    }

    fn watch_readable(&self, _fd: BorrowedFd<'_>) -> Result<Box<dyn Watch>> {
        Err(Error::PlatformUnsupported)
    }

    fn poll(
        &self,
        _fd: BorrowedFd<'_>,
        _interest: Interest,
        _timeout: Option<Duration>,
    ) -> Result<bool> {
        Err(Error::PlatformUnsupported)
    }

    fn read(&self, _fd: BorrowedFd<'_>, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::PlatformUnsupported)
    }

    fn write(&self, _fd: BorrowedFd<'_>, _buf: &[u8]) -> Result<usize> {
        Err(Error::PlatformUnsupported)
    }

    fn close(&self, _fd: OwnedFd) -> Result<()> {
        Err(Error::PlatformUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn every_capability_reports_unsupported() {
        let (a, b) = UnixStream::pair().unwrap();
        let k = Unsupported;

        assert!(matches!(k.supported(), Err(Error::PlatformUnsupported)));
        assert!(matches!(k.create_group(Mode::Datagram), Err(Error::PlatformUnsupported)));
        assert!(matches!(k.clone_group(a.as_fd()), Err(Error::PlatformUnsupported)));
        assert!(matches!(
            k.attach(a.as_fd(), b.as_fd(), b.as_fd()),
            Err(Error::PlatformUnsupported)
        ));
        assert!(matches!(k.detach(a.as_fd(), b.as_fd()), Err(Error::PlatformUnsupported)));
        assert!(matches!(k.socket_error(b.as_fd()), Err(Error::PlatformUnsupported)));
        assert!(matches!(k.watch_readable(b.as_fd()), Err(Error::PlatformUnsupported)));
    }
}
