//! kcmux Core Library
//!
//! Multiplexes many stream connections onto a few consumer sockets through
//! the Linux Kernel Connection Multiplexor (AF_KCM):
//! - [`Multiplexor`]: a group socket, clonable across workers
//! - [`AttachedConnection`]: a connection handed to the kernel's classifier,
//!   released by a blocking liveness wait
//! - [`sys`]: the kernel capability set, with an unsupported-host fallback
//!
//! Message boundaries come from an externally loaded classifier program;
//! this crate only moves descriptors in and out of the kernel group.

pub mod attach;
pub mod config;
pub mod error;
pub mod liveness;
pub mod mode;
pub mod mux;
pub mod sys;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod tracing_init;

pub use attach::{Attachable, AttachedConnection};
pub use config::Config;
pub use error::{Error, Result};
pub use mode::Mode;
pub use mux::{Multiplexor, probe};
