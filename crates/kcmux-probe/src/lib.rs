//! Host capability check for Kernel Connection Multiplexor groups.
//!
//! Opens a group, clones it a few times and closes everything again, then
//! reports whether the facility is usable. Deployment scripts use the exit
//! status to decide between KCM-backed and fallback serving.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use kcmux_core::Mode;
use kcmux_core::sys::Kernel;

/// Overall verdict of a probe run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Groups can be opened, cloned and closed.
    Supported,
    /// The host lacks the facility; callers should degrade.
    Unavailable,
    /// The facility exists but an operation failed.
    Failed,
}

impl Status {
    /// Process exit status for this verdict.
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Supported => 0,
            Self::Failed => 1,
            Self::Unavailable => 2,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Supported => write!(f, "supported"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result of probing one mode.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub os: &'static str,
    pub mode: Mode,
    pub status: Status,
    /// Handles that were open at the same time (original plus clones).
    pub handles: usize,
    pub error: Option<String>,
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kcm {} on {}: {}", self.mode, self.os, self.status)?;
        match &self.error {
            Some(err) => write!(f, " ({err})"),
            None => write!(f, " ({} handles)", self.handles),
        }
    }
}

/// Probe `mode` against `kernel` with `clones` extra handles.
pub fn run(kernel: Arc<dyn Kernel>, mode: Mode, clones: usize) -> ProbeReport {
    debug!(%mode, clones, "Probing multiplexor support");
    let (status, handles, error) = match kcmux_core::probe(kernel, mode, clones) {
        Ok(handles) => {
            info!(%mode, handles, "Multiplexor groups supported");
            (Status::Supported, handles, None)
        }
        Err(e) if e.is_facility_absent() => {
            info!(%mode, error = %e, "Multiplexor groups unavailable on this host");
            (Status::Unavailable, 0, Some(e.to_string()))
        }
        Err(e) => {
            warn!(%mode, error = %e, "Multiplexor probe failed");
            (Status::Failed, 0, Some(e.to_string()))
        }
    };
    ProbeReport {
        os: std::env::consts::OS,
        mode,
        status,
        handles,
        error,
    }
}

/// Probe each mode in turn; the combined status is the worst one seen.
pub fn run_all(kernel: &Arc<dyn Kernel>, modes: &[Mode], clones: usize) -> (Status, Vec<ProbeReport>) {
    let reports: Vec<_> = modes
        .iter()
        .map(|&mode| run(Arc::clone(kernel), mode, clones))
        .collect();
    let status = reports
        .iter()
        .map(|r| r.status)
        .max_by_key(|s| match s {
            Status::Supported => 0,
            Status::Unavailable => 1,
            Status::Failed => 2,
        })
        .unwrap_or(Status::Supported);
    (status, reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        assert_eq!(Status::Supported.exit_code(), 0);
        assert_eq!(Status::Failed.exit_code(), 1);
        assert_eq!(Status::Unavailable.exit_code(), 2);
    }

    #[test]
    fn report_line_mentions_handle_count() {
        let report = ProbeReport {
            os: "linux",
            mode: Mode::Datagram,
            status: Status::Supported,
            handles: 4,
            error: None,
        };
        assert_eq!(report.to_string(), "kcm datagram on linux: supported (4 handles)");
    }
}
