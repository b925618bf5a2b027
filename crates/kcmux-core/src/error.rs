//! Error types for the kcmux core library.

use std::convert::Infallible;
use std::io;

use thiserror::Error;

/// Result type alias using kcmux Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by multiplexor and attached-connection operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The socket mode was unset or not recognised.
    #[error("Invalid multiplexor mode: {0}")]
    InvalidMode(String),

    /// The host has no Kernel Connection Multiplexor support at all.
    #[error("Kernel connection multiplexor not implemented on {}", std::env::consts::OS)]
    PlatformUnsupported,

    /// The kernel refused to create or clone a group socket.
    #[error("Failed to create multiplexor socket: {0}")]
    ResourceCreationFailed(#[source] io::Error),

    /// The external connection could not yield control of its descriptor.
    #[error("Connection descriptor unavailable: {0}")]
    ControlCapabilityUnavailable(#[source] io::Error),

    /// The kernel rejected attaching a connection to the group.
    #[error("Attach rejected: {0}")]
    AttachRejected(#[source] io::Error),

    /// The kernel rejected detaching a connection from the group.
    #[error("Detach rejected: {0}")]
    DetachRejected(#[source] io::Error),

    /// The attached connection terminated with an error other than a broken pipe.
    #[error("Connection terminated abnormally: {0}")]
    TerminationAbnormal(#[source] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A read or write deadline expired.
    #[error("I/O deadline exceeded")]
    Timeout,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether the error means the facility is not available on this host,
    /// rather than an operation failing.
    ///
    /// Callers should treat this as a skip/degrade condition.
    pub fn is_facility_absent(&self) -> bool {
        match self {
            Self::PlatformUnsupported => true,
            Self::ResourceCreationFailed(e) => matches!(
                e.raw_os_error(),
                Some(code) if code == nix::libc::EAFNOSUPPORT || code == nix::libc::EPROTONOSUPPORT
            ),
            _ => false,
        }
    }

    /// The OS error code behind this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::ResourceCreationFailed(e)
            | Self::ControlCapabilityUnavailable(e)
            | Self::AttachRejected(e)
            | Self::DetachRejected(e)
            | Self::TerminationAbnormal(e)
            | Self::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<Infallible> for Error {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Timeout => Self::new(io::ErrorKind::TimedOut, err),
            Error::PlatformUnsupported => Self::new(io::ErrorKind::Unsupported, err),
            Error::InvalidMode(_) => Self::new(io::ErrorKind::InvalidInput, err),
            other => Self::other(other),
        }
    }
}
