use std::env;

use once_cell::sync::OnceCell;
use tracing_subscriber::prelude::*;

static INIT: OnceCell<()> = OnceCell::new();

/// Environment variable with the highest precedence for the log filter.
pub const LOG_ENV: &str = "PAI_GATEWAY_LOG";

fn filter_from_verbosity(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Filter directive: `PAI_GATEWAY_LOG`, then `RUST_LOG`, then the `-v` count.
pub fn filter_directive(verbosity: u8) -> String {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .filter_map(|k| env::var(k).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| filter_from_verbosity(verbosity).to_string())
}

/// Install a stderr `fmt` subscriber. Safe to call more than once; only the first call
/// (or an already-installed global subscriber) wins.
pub fn logging_init(verbosity: u8) {
    if INIT.get().is_some() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_new(filter_directive(verbosity))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter_from_verbosity(verbosity)));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        eprintln!("pai-gateway: logging init skipped (global subscriber already set)");
    }
    let _ = INIT.set(());
}
