use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use kcmux_core::Mode;

#[derive(Parser, Debug)]
#[command(name = "kcmux-probe")]
#[command(version, about = "Check whether this host supports Kernel Connection Multiplexor groups")]
struct Args {
    /// Socket mode to probe ("datagram" or "sequenced-packet"); repeat to probe several
    #[arg(long = "mode", required = true, env = "KCMUX_MODE", value_delimiter = ',')]
    modes: Vec<Mode>,

    /// Extra handles to clone from each group
    #[arg(long, default_value_t = 3, env = "KCMUX_CLONES")]
    clones: usize,

    /// Print reports as JSON lines instead of text
    #[arg(long)]
    json: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "warn", env = "KCMUX_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "KCMUX_LOG_JSON")]
    log_json: bool,
}

#[allow(clippy::print_stdout)]
fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let log_filter = format!("kcmux_probe={0},kcmux_core={0}", args.log_level);
    kcmux_core::tracing_init::init_tracing(&log_filter, args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        modes = ?args.modes,
        clones = args.clones,
        "Starting kcmux-probe"
    );

    let kernel = kcmux_core::sys::host();
    let (status, reports) = kcmux_probe::run_all(&kernel, &args.modes, args.clones);
    for report in &reports {
        if args.json {
            println!("{}", serde_json::to_string(report)?);
        } else {
            println!("{report}");
        }
    }
    Ok(ExitCode::from(status.exit_code()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_stdout_for_reports() {
        let args = Args::try_parse_from(["kcmux-probe", "--mode", "datagram,seqpacket"]).unwrap();
        assert_eq!(args.modes, vec![Mode::Datagram, Mode::SequencedPacket]);
        assert_eq!(args.clones, 3);
        assert_eq!(args.log_level, "warn");
        assert!(!args.json);
        assert!(!args.log_json);
    }

    #[test]
    fn mode_is_required() {
        assert!(Args::try_parse_from(["kcmux-probe"]).is_err());
    }
}
