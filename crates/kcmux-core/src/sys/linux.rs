//! AF_KCM system calls.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{getsockopt, sockopt};
use tracing::trace;

use super::{Interest, Kernel, Watch};
use crate::error::{Error, Result};
use crate::mode::Mode;

// linux/socket.h; libc only exports it for a few musl targets.
const AF_KCM: libc::c_int = 41;

/// Only valid protocol for AF_KCM sockets.
const KCMPROTO_CONNECTED: libc::c_int = 0;

// linux/sockios.h: SIOCPROTOPRIVATE; linux/kcm.h adds 0, 1, 2.
const SIOCKCMATTACH: libc::c_ulong = 0x89E0;
const SIOCKCMUNATTACH: libc::c_ulong = 0x89E1;
const SIOCKCMCLONE: libc::c_ulong = 0x89E2;

#[repr(C)]
pub struct KcmAttach {
    fd: libc::c_int,
    bpf_fd: libc::c_int,
}

#[repr(C)]
pub struct KcmUnattach {
    fd: libc::c_int,
}

#[repr(C)]
pub struct KcmClone {
    fd: libc::c_int,
}

#[allow(unsafe_code)]
mod ioctl {
    use super::{KcmAttach, KcmClone, KcmUnattach, SIOCKCMATTACH, SIOCKCMCLONE, SIOCKCMUNATTACH};

    nix::ioctl_write_ptr_bad!(kcm_attach, SIOCKCMATTACH, KcmAttach);
    nix::ioctl_write_ptr_bad!(kcm_unattach, SIOCKCMUNATTACH, KcmUnattach);
    nix::ioctl_readwrite_bad!(kcm_clone, SIOCKCMCLONE, KcmClone);
}

/// Capability set backed by the Linux kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelBacked;

impl Kernel for KernelBacked {
    fn supported(&self) -> Result<()> {
        Ok(())
    }

    fn create_group(&self, mode: Mode) -> Result<OwnedFd> {
        let ty = match mode {
            Mode::Datagram => libc::SOCK_DGRAM,
            Mode::SequencedPacket => libc::SOCK_SEQPACKET,
        };
        // SAFETY: socket(2) takes no pointers.
        #[allow(unsafe_code)]
        let fd = unsafe { libc::socket(AF_KCM, ty | libc::SOCK_CLOEXEC, KCMPROTO_CONNECTED) };
        let fd = Errno::result(fd).map_err(|e| Error::ResourceCreationFailed(e.into()))?;
        Ok(owned(fd))
    }

    fn clone_group(&self, group: BorrowedFd<'_>) -> Result<OwnedFd> {
        let mut info = KcmClone { fd: -1 };
        // SAFETY: `info` outlives the call and matches struct kcm_clone.
        #[allow(unsafe_code)]
        let rc = unsafe { ioctl::kcm_clone(group.as_raw_fd(), &raw mut info) };
        rc.map_err(|e| Error::ResourceCreationFailed(e.into()))?;
        // On success the kernel installed a new descriptor in `info.fd`.
        Ok(owned(info.fd))
    }

    fn attach(
        &self,
        group: BorrowedFd<'_>,
        conn: BorrowedFd<'_>,
        classifier: BorrowedFd<'_>,
    ) -> Result<()> {
        let info = KcmAttach {
            fd: conn.as_raw_fd(),
            bpf_fd: classifier.as_raw_fd(),
        };
        // SAFETY: `info` outlives the call and matches struct kcm_attach.
        #[allow(unsafe_code)]
        let rc = unsafe { ioctl::kcm_attach(group.as_raw_fd(), &raw const info) };
        rc.map(drop)
            .map_err(|e| Error::AttachRejected(e.into()))
    }

    fn detach(&self, group: BorrowedFd<'_>, conn: BorrowedFd<'_>) -> Result<()> {
        let info = KcmUnattach {
            fd: conn.as_raw_fd(),
        };
        // SAFETY: `info` outlives the call and matches struct kcm_unattach.
        #[allow(unsafe_code)]
        let rc = unsafe { ioctl::kcm_unattach(group.as_raw_fd(), &raw const info) };
        rc.map(drop)
            .map_err(|e| Error::DetachRejected(e.into()))
    }

    fn socket_error(&self, fd: BorrowedFd<'_>) -> Result<Option<i32>> {
        let code = getsockopt(&fd, sockopt::SocketError).map_err(io::Error::from)?;
        Ok((code != 0).then_some(code))
    }

    fn watch_readable(&self, fd: BorrowedFd<'_>) -> Result<Box<dyn Watch>> {
        EdgeWatch::new(fd).map(|w| Box::new(w) as Box<dyn Watch>)
    }

    fn poll(
        &self,
        fd: BorrowedFd<'_>,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let events = match interest {
            Interest::Read => libc::POLLIN,
            Interest::Write => libc::POLLOUT,
        };
        let mut pfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events,
            revents: 0,
        };
        // SAFETY: a single valid pollfd is passed with nfds = 1.
        #[allow(unsafe_code)]
        let n = unsafe { libc::poll(&raw mut pfd, 1, poll_millis(timeout)) };
        match Errno::result(n) {
            Ok(n) => Ok(n > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }

    fn read(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<usize> {
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        #[allow(unsafe_code)]
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        byte_count(n)
    }

    fn write(&self, fd: BorrowedFd<'_>, buf: &[u8]) -> Result<usize> {
        // SAFETY: `buf` is valid for reads of `buf.len()` bytes.
        #[allow(unsafe_code)]
        let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        byte_count(n)
    }

    fn close(&self, fd: OwnedFd) -> Result<()> {
        // SAFETY: ownership of the descriptor is released to close(2).
        #[allow(unsafe_code)]
        let rc = unsafe { libc::close(fd.into_raw_fd()) };
        Errno::result(rc).map(drop).map_err(|e| io::Error::from(e).into())
    }
}

/// Edge-triggered epoll registration for one descriptor.
///
/// Level-triggered polling would spin while bytes sit unconsumed in the
/// receive queue of an attached socket.
struct EdgeWatch {
    epoll: OwnedFd,
}

impl EdgeWatch {
    #[allow(clippy::cast_sign_loss)]
    fn new(fd: BorrowedFd<'_>) -> Result<Self> {
        // SAFETY: epoll_create1 takes no pointers.
        #[allow(unsafe_code)]
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        let epoll = owned(Errno::result(epfd).map_err(io::Error::from)?);

        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLET) as u32,
            u64: 0,
        };
        // SAFETY: both descriptors are open and `event` outlives the call.
        #[allow(unsafe_code)]
        let rc = unsafe {
            libc::epoll_ctl(
                epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd.as_raw_fd(),
                &raw mut event,
            )
        };
        Errno::result(rc).map_err(io::Error::from)?;
        trace!(fd = fd.as_raw_fd(), "watching attached connection");
        Ok(Self { epoll })
    }
}

impl Watch for EdgeWatch {
    fn wait(&mut self) -> Result<()> {
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        // SAFETY: room for exactly one event is passed.
        #[allow(unsafe_code)]
        let n = unsafe { libc::epoll_wait(self.epoll.as_raw_fd(), &raw mut event, 1, -1) };
        match Errno::result(n) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }
}

/// Take ownership of a descriptor the kernel just returned.
///
/// Only called with non-negative results of socket(2), epoll_create1(2) and
/// SIOCKCMCLONE, which are fresh descriptors nothing else owns.
#[allow(unsafe_code)]
fn owned(fd: RawFd) -> OwnedFd {
    // SAFETY: see above.
    unsafe { OwnedFd::from_raw_fd(fd) }
}

#[allow(clippy::cast_sign_loss)]
fn byte_count(n: libc::ssize_t) -> Result<usize> {
    Errno::result(n)
        .map(|n| n as usize)
        .map_err(|e| io::Error::from(e).into())
}

/// Milliseconds for poll(2), rounded up so a sub-millisecond remainder still
/// waits instead of spinning.
fn poll_millis(timeout: Option<Duration>) -> libc::c_int {
    timeout.map_or(-1, |d| {
        libc::c_int::try_from(d.as_micros().div_ceil(1000)).unwrap_or(libc::c_int::MAX)
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn poll_timeout_rounds_up() {
        assert_eq!(poll_millis(None), -1);
        assert_eq!(poll_millis(Some(Duration::ZERO)), 0);
        assert_eq!(poll_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(poll_millis(Some(Duration::from_millis(250))), 250);
        assert_eq!(poll_millis(Some(Duration::from_secs(u64::MAX))), libc::c_int::MAX);
    }

    #[test]
    fn stored_error_is_none_on_healthy_socket() {
        let (a, _b) = UnixStream::pair().unwrap();
        assert_eq!(KernelBacked.socket_error(a.as_fd()).unwrap(), None);
    }

    #[test]
    fn poll_reports_readiness() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let k = KernelBacked;
        assert!(!k.poll(a.as_fd(), Interest::Read, Some(Duration::ZERO)).unwrap());
        b.write_all(b"x").unwrap();
        assert!(k.poll(a.as_fd(), Interest::Read, Some(Duration::from_secs(1))).unwrap());
        assert!(k.poll(a.as_fd(), Interest::Write, Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn edge_watch_wakes_on_peer_data() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut watch = KernelBacked.watch_readable(a.as_fd()).unwrap();
        b.write_all(b"ping").unwrap();
        watch.wait().unwrap();
    }

    #[test]
    fn group_creation_succeeds_or_reports_missing_family() {
        for mode in Mode::ALL {
            match KernelBacked.create_group(mode) {
                Ok(fd) => KernelBacked.close(fd).unwrap(),
                Err(e) => assert!(e.is_facility_absent(), "got {e:?}"),
            }
        }
    }

    #[test]
    fn attach_on_non_kcm_socket_is_rejected() {
        let (a, b) = UnixStream::pair().unwrap();
        let err = KernelBacked.attach(a.as_fd(), b.as_fd(), b.as_fd()).unwrap_err();
        assert!(matches!(err, Error::AttachRejected(_)), "got {err:?}");
    }
}
