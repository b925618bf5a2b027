//! Termination detection for attached connections.
//!
//! The kernel has no "connection ended" event for attached sockets. When the
//! multiplexor gives up on a connection it stores an error on the socket and
//! wakes readers, so the monitor alternates between waiting for readiness
//! and reading the stored error until one shows up. Delivery is eventually
//! consistent: under load the wake-up can arrive late.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Weak;

use nix::libc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::sys::Kernel;

/// What a stored socket error says about an attached connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Nothing stored; the wake-up was spurious.
    Alive,
    /// Broken pipe: the multiplexor released the connection normally.
    Closed,
    /// Any other error code.
    Failed(i32),
}

impl Liveness {
    pub const fn classify(stored: Option<i32>) -> Self {
        match stored {
            None => Self::Alive,
            Some(libc::EPIPE) => Self::Closed,
            Some(code) => Self::Failed(code),
        }
    }
}

/// Detach `conn` from `group`, or fail with `EBADF` once the owning handle
/// has closed the group.
pub(crate) fn detach(
    kernel: &dyn Kernel,
    group: &Weak<OwnedFd>,
    conn: BorrowedFd<'_>,
) -> Result<()> {
    let Some(group) = group.upgrade() else {
        return Err(Error::DetachRejected(io::Error::from_raw_os_error(
            libc::EBADF,
        )));
    };
    kernel.detach(group.as_fd(), conn)
}

/// Run the wait-then-recheck loop for `conn` until it terminates.
pub(crate) fn monitor(
    kernel: &dyn Kernel,
    group: &Weak<OwnedFd>,
    conn: BorrowedFd<'_>,
) -> Result<()> {
    let mut watch = kernel.watch_readable(conn)?;
    loop {
        watch.wait()?;

        let stored = match kernel.socket_error(conn) {
            Ok(stored) => stored,
            Err(e) => return abandon(kernel, group, conn, e),
        };
        match Liveness::classify(stored) {
            Liveness::Alive => {}
            Liveness::Closed => {
                debug!(fd = conn.as_raw_fd(), "Connection closed, detaching");
                return detach(kernel, group, conn);
            }
            Liveness::Failed(code) => {
                let cause = Error::TerminationAbnormal(io::Error::from_raw_os_error(code));
                return abandon(kernel, group, conn, cause);
            }
        }
    }
}

/// Detach best-effort and report `cause`, never the detach outcome.
fn abandon(
    kernel: &dyn Kernel,
    group: &Weak<OwnedFd>,
    conn: BorrowedFd<'_>,
    cause: Error,
) -> Result<()> {
    debug!(fd = conn.as_raw_fd(), error = %cause, "Connection terminated abnormally");
    if let Err(e) = detach(kernel, group, conn) {
        debug!(fd = conn.as_raw_fd(), error = %e, "Ignoring detach failure");
    }
    Err(cause)
}
