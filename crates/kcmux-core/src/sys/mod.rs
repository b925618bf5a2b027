//! Host capability set for the multiplexor.
//!
//! Every kernel interaction goes through [`Kernel`]. Two implementations
//! exist: [`KernelBacked`] issues the real AF_KCM syscalls on Linux, and
//! [`Unsupported`] answers every call with [`crate::Error::PlatformUnsupported`]
//! without touching the OS. [`host`] picks one once per process.

#[cfg(target_os = "linux")]
mod linux;
mod unsupported;

use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::Result;
use crate::mode::Mode;

#[cfg(target_os = "linux")]
pub use linux::KernelBacked;
pub use unsupported::Unsupported;

/// Direction a readiness poll waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Blocks until a watched descriptor signals read readiness.
///
/// Wake-ups are edge-like: a watch returns once per readiness change, and a
/// return does not guarantee anything actually changed.
pub trait Watch: Send {
    fn wait(&mut self) -> Result<()>;
}

/// Boundary calls consumed from the host kernel.
pub trait Kernel: Send + Sync + fmt::Debug {
    /// Fails with [`crate::Error::PlatformUnsupported`] when the host has no
    /// multiplexor facility at all.
    fn supported(&self) -> Result<()>;

    /// Creates a new group socket of the given mode.
    fn create_group(&self, mode: Mode) -> Result<OwnedFd>;

    /// Creates a new descriptor joined to the same group as `group`.
    fn clone_group(&self, group: BorrowedFd<'_>) -> Result<OwnedFd>;

    /// Adds `conn` to the group, framed by the `classifier` program.
    fn attach(
        &self,
        group: BorrowedFd<'_>,
        conn: BorrowedFd<'_>,
        classifier: BorrowedFd<'_>,
    ) -> Result<()>;

    /// Removes `conn` from the group.
    fn detach(&self, group: BorrowedFd<'_>, conn: BorrowedFd<'_>) -> Result<()>;

    /// Reads and clears the stored socket error (`SO_ERROR`) of `fd`.
    fn socket_error(&self, fd: BorrowedFd<'_>) -> Result<Option<i32>>;

    /// Starts watching `fd` for read readiness.
    fn watch_readable(&self, fd: BorrowedFd<'_>) -> Result<Box<dyn Watch>>;

    /// Waits up to `timeout` (forever when `None`) for `fd` to become ready.
    /// Returns `false` when the call woke without readiness.
    fn poll(
        &self,
        fd: BorrowedFd<'_>,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<bool>;

    fn read(&self, fd: BorrowedFd<'_>, buf: &mut [u8]) -> Result<usize>;

    fn write(&self, fd: BorrowedFd<'_>, buf: &[u8]) -> Result<usize>;

    /// Closes `fd`, reporting the error `Drop` would swallow.
    fn close(&self, fd: OwnedFd) -> Result<()>;
}

/// The capability set for this host, selected on first use.
pub fn host() -> Arc<dyn Kernel> {
    static HOST: OnceLock<Arc<dyn Kernel>> = OnceLock::new();
    Arc::clone(HOST.get_or_init(select))
}

#[cfg(target_os = "linux")]
fn select() -> Arc<dyn Kernel> {
    Arc::new(KernelBacked)
}

#[cfg(not(target_os = "linux"))]
fn select() -> Arc<dyn Kernel> {
    Arc::new(Unsupported)
}
