//! Multiplexor group handles.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, warn};

use crate::attach::{Attachable, AttachedConnection};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::mode::Mode;
use crate::sys::{self, Interest, Kernel};

/// A Kernel Connection Multiplexor socket.
///
/// Reads return whole messages the kernel's classifier routed to this
/// handle; writes go out on this handle's own path. Use
/// [`try_clone`](Self::try_clone) to give each worker its own handle in the
/// same group, and [`attach`](Self::attach) to hand accepted connections to
/// the kernel.
pub struct Multiplexor {
    group: Arc<OwnedFd>,
    mode: Mode,
    kernel: Arc<dyn Kernel>,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
}

impl Multiplexor {
    /// Open a new multiplexor group on this host.
    ///
    /// `mode` may be a [`Mode`] or any raw value that converts into one
    /// (`i32`, `&str`, `Option<Mode>`); unset or unknown values fail with
    /// [`Error::InvalidMode`] before the kernel is asked for anything. On
    /// hosts without the facility this fails with
    /// [`Error::PlatformUnsupported`] regardless of `mode`.
    pub fn open<M>(mode: M, config: &Config) -> Result<Self>
    where
        M: TryInto<Mode>,
        Error: From<M::Error>,
    {
        Self::open_with(sys::host(), mode, config)
    }

    /// Like [`open`](Self::open), against an explicit capability set.
    pub fn open_with<M>(kernel: Arc<dyn Kernel>, mode: M, _config: &Config) -> Result<Self>
    where
        M: TryInto<Mode>,
        Error: From<M::Error>,
    {
        kernel.supported()?;
        let mode = mode.try_into()?;
        let fd = kernel.create_group(mode)?;
        debug!(%mode, fd = fd.as_raw_fd(), "Opened multiplexor group");
        Ok(Self::from_parts(kernel, fd, mode))
    }

    fn from_parts(kernel: Arc<dyn Kernel>, fd: OwnedFd, mode: Mode) -> Self {
        Self {
            group: Arc::new(fd),
            mode,
            kernel,
            read_deadline: None,
            write_deadline: None,
        }
    }

    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Produce an independent handle attached to the same kernel group.
    ///
    /// The kernel distributes routed messages across every handle in the
    /// group. Deadlines are not carried over.
    pub fn try_clone(&self) -> Result<Self> {
        let fd = self.kernel.clone_group(self.group.as_fd())?;
        debug!(
            from = self.group.as_raw_fd(),
            fd = fd.as_raw_fd(),
            "Cloned multiplexor group"
        );
        Ok(Self::from_parts(Arc::clone(&self.kernel), fd, self.mode))
    }

    /// Hand `conn` to the kernel, framed by the `classifier` program.
    ///
    /// Ownership of `conn` moves in unconditionally. If the connection
    /// cannot surrender its descriptor, or the kernel rejects the attach,
    /// `conn` is closed before the error is returned. On success the
    /// returned [`AttachedConnection`] is the only owner; call
    /// [`AttachedConnection::wait`] to release it once it terminates.
    pub fn attach<C: Attachable>(
        &self,
        conn: C,
        classifier: impl AsFd,
    ) -> Result<AttachedConnection<C>> {
        match attach_borrowed(
            self.kernel.as_ref(),
            self.group.as_fd(),
            &conn,
            classifier.as_fd(),
        ) {
            Ok(()) => Ok(AttachedConnection::new(
                Arc::downgrade(&self.group),
                Arc::clone(&self.kernel),
                conn,
            )),
            Err(e) => {
                drop(conn);
                debug!(
                    group = self.group.as_raw_fd(),
                    error = %e,
                    "Attach failed, connection closed"
                );
                Err(e)
            }
        }
    }

    /// Set both the read and write deadline. `None` clears them.
    pub const fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
        self.write_deadline = deadline;
    }

    pub const fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    pub const fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    /// Close the handle, reporting any error from the kernel.
    ///
    /// The descriptor is released even while connections remain attached;
    /// their later detach then fails with [`Error::DetachRejected`].
    pub fn close(self) -> Result<()> {
        let Self {
            mut group, kernel, ..
        } = self;
        // Attached connections only hold a strong reference for the length
        // of a detach call.
        let fd = loop {
            match Arc::try_unwrap(group) {
                Ok(fd) => break fd,
                Err(shared) => {
                    group = shared;
                    thread::yield_now();
                }
            }
        };
        debug!(fd = fd.as_raw_fd(), "Closing multiplexor handle");
        kernel.close(fd)
    }

    /// Block until the group descriptor is ready for `interest` or the
    /// matching deadline passes.
    fn ready(&self, interest: Interest) -> Result<()> {
        let deadline = match interest {
            Interest::Read => self.read_deadline,
            Interest::Write => self.write_deadline,
        };
        let Some(deadline) = deadline else {
            return Ok(());
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            if self
                .kernel
                .poll(self.group.as_fd(), interest, Some(remaining))?
            {
                return Ok(());
            }
        }
    }
}

fn attach_borrowed(
    kernel: &dyn Kernel,
    group: BorrowedFd<'_>,
    conn: &impl Attachable,
    classifier: BorrowedFd<'_>,
) -> Result<()> {
    let fd = conn
        .control()
        .map_err(Error::ControlCapabilityUnavailable)?;
    kernel.attach(group, fd, classifier)?;
    debug!(
        group = group.as_raw_fd(),
        fd = fd.as_raw_fd(),
        classifier = classifier.as_raw_fd(),
        "Attached connection"
    );
    Ok(())
}

impl io::Read for Multiplexor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ready(Interest::Read)?;
        Ok(self.kernel.read(self.group.as_fd(), buf)?)
    }
}

impl io::Write for Multiplexor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ready(Interest::Write)?;
        Ok(self.kernel.write(self.group.as_fd(), buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsFd for Multiplexor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.group.as_fd()
    }
}

impl fmt::Debug for Multiplexor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexor")
            .field("fd", &self.group.as_raw_fd())
            .field("mode", &self.mode)
            .field("read_deadline", &self.read_deadline)
            .field("write_deadline", &self.write_deadline)
            .finish_non_exhaustive()
    }
}

/// Open a handle and clone it `clones` times, then close everything.
///
/// Returns the number of handles that were open at once. Useful as a
/// startup check: callers should treat [`Error::is_facility_absent`] as a
/// reason to degrade rather than fail.
pub fn probe(kernel: Arc<dyn Kernel>, mode: Mode, clones: usize) -> Result<usize> {
    let first = Multiplexor::open_with(kernel, mode, &Config::default())?;
    let mut handles = Vec::with_capacity(clones + 1);
    for _ in 0..clones {
        handles.push(first.try_clone()?);
    }
    handles.push(first);
    let opened = handles.len();

    let mut first_err = None;
    // Close newest first so the original is released last.
    for handle in handles.into_iter().rev() {
        if let Err(e) = handle.close() {
            warn!(error = %e, "Failed to close multiplexor handle");
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(opened), Err)
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::time::Duration;

    use super::*;
    use crate::sys::Unsupported;
    use crate::testing::{CallCounts, FakeKernel, TrackedConn, Wake};

    fn fake() -> (Arc<FakeKernel>, Arc<dyn Kernel>) {
        let fake = Arc::new(FakeKernel::new());
        let kernel: Arc<dyn Kernel> = fake.clone();
        (fake, kernel)
    }

    #[test]
    fn open_accepts_every_valid_mode() {
        for mode in Mode::ALL {
            let (_, kernel) = fake();
            let mux = Multiplexor::open_with(kernel, mode, &Config::default()).unwrap();
            assert_eq!(mux.mode(), mode);
        }
    }

    #[test]
    fn invalid_mode_fails_before_any_kernel_call() {
        let (fake, kernel) = fake();
        let err = Multiplexor::open_with(Arc::clone(&kernel), 0, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidMode(_)));
        let err = Multiplexor::open_with(Arc::clone(&kernel), 7, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidMode(_)));
        let err = Multiplexor::open_with(kernel, None::<Mode>, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidMode(_)));
        assert_eq!(fake.calls(), CallCounts::default());
    }

    #[test]
    fn unsupported_host_dominates_invalid_mode() {
        let kernel: Arc<dyn Kernel> = Arc::new(Unsupported);
        let err = Multiplexor::open_with(Arc::clone(&kernel), 0, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::PlatformUnsupported));
        let err = Multiplexor::open_with(kernel, Mode::Datagram, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::PlatformUnsupported));
    }

    #[test]
    fn creation_failure_is_reported() {
        let fake = Arc::new(FakeKernel::new().fail_create(nix::libc::EAFNOSUPPORT));
        let err = Multiplexor::open_with(fake, Mode::Datagram, &Config::default()).unwrap_err();
        assert!(matches!(err, Error::ResourceCreationFailed(_)));
        assert!(err.is_facility_absent());
    }

    #[test]
    fn three_clones_close_independently_in_any_order() {
        let (fake, kernel) = fake();
        let first = Multiplexor::open_with(kernel, Mode::Datagram, &Config::default()).unwrap();
        let a = first.try_clone().unwrap();
        let b = a.try_clone().unwrap();
        let c = first.try_clone().unwrap();
        assert_eq!(fake.calls().clone_group, 3);

        b.close().unwrap();
        first.close().unwrap();
        c.close().unwrap();
        a.close().unwrap();
        assert_eq!(fake.calls().close, 4);
    }

    #[test]
    fn clone_rejection_is_reported() {
        let fake = Arc::new(FakeKernel::new().fail_clone(nix::libc::EBADF));
        let mux = Multiplexor::open_with(fake, Mode::Datagram, &Config::default()).unwrap();
        assert!(matches!(mux.try_clone(), Err(Error::ResourceCreationFailed(_))));
    }

    #[test]
    fn probe_counts_every_handle() {
        let (fake, kernel) = fake();
        assert_eq!(probe(kernel, Mode::SequencedPacket, 3).unwrap(), 4);
        assert_eq!(fake.calls().close, 4);
    }

    #[test]
    fn attach_without_descriptor_control_closes_connection() {
        let (fake, kernel) = fake();
        let mux = Multiplexor::open_with(kernel, Mode::Datagram, &Config::default()).unwrap();
        let (conn, closes) = TrackedConn::uncontrollable().unwrap();
        let classifier = TrackedConn::classifier().unwrap();

        let err = mux.attach(conn, &classifier).unwrap_err();
        assert!(matches!(err, Error::ControlCapabilityUnavailable(_)));
        assert_eq!(closes.get(), 1);
        assert_eq!(fake.calls().attach, 0);
    }

    #[test]
    fn rejected_attach_closes_connection() {
        let fake = Arc::new(FakeKernel::new().fail_attach(nix::libc::EINVAL));
        let kernel: Arc<dyn Kernel> = fake.clone();
        let mux = Multiplexor::open_with(kernel, Mode::Datagram, &Config::default()).unwrap();
        let (conn, closes) = TrackedConn::new().unwrap();
        let classifier = TrackedConn::classifier().unwrap();

        let err = mux.attach(conn, &classifier).unwrap_err();
        assert!(matches!(err, Error::AttachRejected(_)));
        assert_eq!(err.raw_os_error(), Some(nix::libc::EINVAL));
        assert_eq!(closes.get(), 1);
        assert_eq!(fake.calls().attach, 1);
    }

    #[test]
    fn attach_on_unsupported_host_closes_connection() {
        let (a, _b) = std::os::unix::net::UnixDatagram::pair().unwrap();
        let mux = Multiplexor::from_parts(Arc::new(Unsupported), OwnedFd::from(a), Mode::Datagram);
        let (conn, closes) = TrackedConn::new().unwrap();
        let classifier = TrackedConn::classifier().unwrap();

        let err = mux.attach(conn, &classifier).unwrap_err();
        assert!(matches!(err, Error::PlatformUnsupported));
        assert_eq!(closes.get(), 1);
        assert!(matches!(mux.try_clone(), Err(Error::PlatformUnsupported)));
    }

    #[test]
    fn successful_attach_keeps_connection_open() {
        let (fake, kernel) = fake();
        let mux = Multiplexor::open_with(kernel, Mode::Datagram, &Config::default()).unwrap();
        let (conn, closes) = TrackedConn::new().unwrap();
        let classifier = TrackedConn::classifier().unwrap();

        let attached = mux.attach(conn, &classifier).unwrap();
        assert_eq!(closes.get(), 0);
        assert_eq!(fake.calls().attach, 1);
        drop(attached);
    }

    #[test]
    fn close_releases_descriptor_while_connections_are_attached() {
        let (fake, kernel) = fake();
        let mux = Multiplexor::open_with(kernel, Mode::Datagram, &Config::default()).unwrap();
        let peer = fake.peer(0).unwrap();
        let (conn, closes) = TrackedConn::new().unwrap();
        let classifier = TrackedConn::classifier().unwrap();
        let attached = mux.attach(conn, &classifier).unwrap();

        mux.close().unwrap();
        assert_eq!(fake.calls().close, 1);
        // Nothing reads the group socket any more.
        assert!(peer.send(b"routed to nobody").is_err());

        fake.push_wakeups([Wake::Stored(Some(nix::libc::EPIPE))]);
        let err = attached.wait().unwrap_err();
        assert!(matches!(err, Error::DetachRejected(_)), "got {err:?}");
        assert_eq!(err.raw_os_error(), Some(nix::libc::EBADF));
        assert_eq!(fake.calls().detach, 0);
        assert_eq!(closes.get(), 1);
    }

    #[test]
    fn read_and_write_pass_through_group_socket() {
        let (fake, kernel) = fake();
        let mut mux = Multiplexor::open_with(kernel, Mode::Datagram, &Config::default()).unwrap();
        let peer = fake.peer(0).unwrap();

        peer.send(b"routed message").unwrap();
        let mut buf = [0u8; 64];
        let n = mux.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"routed message");

        mux.write_all(b"reply").unwrap();
        let n = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply");
    }

    #[test]
    fn expired_read_deadline_times_out() {
        let (_, kernel) = fake();
        let mut mux = Multiplexor::open_with(kernel, Mode::Datagram, &Config::default()).unwrap();
        mux.set_read_deadline(Some(Instant::now()));

        let mut buf = [0u8; 16];
        let err = mux.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn read_deadline_expires_while_idle() {
        let (fake, kernel) = fake();
        let mut mux = Multiplexor::open_with(kernel, Mode::Datagram, &Config::default()).unwrap();
        mux.set_deadline(Some(Instant::now() + Duration::from_millis(30)));

        let mut buf = [0u8; 16];
        let err = mux.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(fake.calls().poll >= 1);
    }

    #[test]
    fn clearing_deadline_skips_readiness_wait() {
        let (fake, kernel) = fake();
        let mut mux = Multiplexor::open_with(kernel, Mode::Datagram, &Config::default()).unwrap();
        mux.set_write_deadline(Some(Instant::now()));
        mux.set_write_deadline(None);
        mux.write_all(b"x").unwrap();
        assert_eq!(fake.calls().poll, 0);
    }
}
