//! Tracing/logging initialization for kcmux binaries and embedding hosts.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Build the env-filter: `RUST_LOG` wins over `default_filter`
/// (e.g. `"kcmux_core=debug"`).
fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global tracing subscriber.
///
/// * `default_filter` -- filter used when `RUST_LOG` is not set.
/// * `log_json` -- emit structured JSON lines instead of the human format.
///
/// Returns `false` when a global subscriber was already installed, which
/// happens when a host process sets up its own logging first.
pub fn init_tracing(default_filter: &str, log_json: bool) -> bool {
    let registry = tracing_subscriber::registry().with(env_filter(default_filter));
    let installed = if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    installed.is_ok()
}
