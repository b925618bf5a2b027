//! Connections handed over to a multiplexor group.

use std::fmt;
use std::io;
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::liveness;
use crate::sys::Kernel;

/// A connection that can give up control of its descriptor.
///
/// Dropping the value must close the connection.
pub trait Attachable: Send {
    /// Borrow the descriptor the kernel should take over.
    fn control(&self) -> io::Result<BorrowedFd<'_>>;
}

impl Attachable for TcpStream {
    fn control(&self) -> io::Result<BorrowedFd<'_>> {
        Ok(self.as_fd())
    }
}

impl Attachable for UnixStream {
    fn control(&self) -> io::Result<BorrowedFd<'_>> {
        Ok(self.as_fd())
    }
}

impl Attachable for OwnedFd {
    fn control(&self) -> io::Result<BorrowedFd<'_>> {
        Ok(self.as_fd())
    }
}

impl Attachable for tokio::net::TcpStream {
    fn control(&self) -> io::Result<BorrowedFd<'_>> {
        Ok(self.as_fd())
    }
}

/// A connection attached to a multiplexor group.
///
/// The kernel now owns the byte stream: never read, write or close the
/// connection directly. Every attached connection must eventually be
/// passed to [`wait`](Self::wait), usually on a dedicated thread.
///
/// The group is referenced weakly: closing the [`Multiplexor`] releases its
/// descriptor right away, and a later detach reports
/// [`Error::DetachRejected`].
///
/// [`Multiplexor`]: crate::Multiplexor
pub struct AttachedConnection<C: Attachable> {
    group: Weak<OwnedFd>,
    kernel: Arc<dyn Kernel>,
    conn: Option<C>,
}

impl<C: Attachable> AttachedConnection<C> {
    pub(crate) fn new(group: Weak<OwnedFd>, kernel: Arc<dyn Kernel>, conn: C) -> Self {
        Self {
            group,
            kernel,
            conn: Some(conn),
        }
    }

    /// Block until the connection terminates, then detach it from the group.
    ///
    /// Returns the detach result when the peer went away cleanly (broken
    /// pipe), or [`Error::TerminationAbnormal`] with the stored socket error
    /// otherwise; a detach failure on the abnormal path is not reported. The
    /// connection is closed exactly once before this returns, whichever way
    /// it ends.
    ///
    /// There is no cancellation: this only returns once the kernel reports
    /// the connection dead, which can take arbitrarily long.
    pub fn wait(mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        let outcome = match conn.control() {
            Ok(fd) => liveness::monitor(self.kernel.as_ref(), &self.group, fd),
            Err(e) => Err(Error::ControlCapabilityUnavailable(e)),
        };
        drop(conn);
        outcome
    }
}

impl<C: Attachable + 'static> AttachedConnection<C> {
    /// [`wait`](Self::wait) on tokio's blocking pool.
    pub async fn wait_async(self) -> Result<()> {
        tokio::task::spawn_blocking(move || self.wait())
            .await
            .map_err(|e| Error::Io(io::Error::other(e)))?
    }
}

impl<C: Attachable> Drop for AttachedConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if let Ok(fd) = conn.control() {
            warn!(
                fd = fd.as_raw_fd(),
                "Attached connection dropped without wait, detaching"
            );
            if let Err(e) = liveness::detach(self.kernel.as_ref(), &self.group, fd) {
                debug!(error = %e, "Best-effort detach on drop failed");
            }
        }
    }
}

impl<C: Attachable> fmt::Debug for AttachedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fd = self
            .conn
            .as_ref()
            .and_then(|c| c.control().ok())
            .map(|fd| fd.as_raw_fd());
        f.debug_struct("AttachedConnection")
            .field("group", &self.group.upgrade().map(|g| g.as_raw_fd()))
            .field("fd", &fd)
            .finish_non_exhaustive()
    }
}
