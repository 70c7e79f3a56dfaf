//! Logging setup for tessera.
//!
//! Log levels as used across the crate:
//! - ERROR: a node failed and the run is being torn down
//! - WARN: suspicious but recoverable input, such as reads of never-written data
//! - INFO: run lifecycle (cluster start, horizon retirement, shutdown)
//! - DEBUG: job start and finish, dependency bookkeeping
//! - TRACE: per-frame transfer and per-package traces
//!
//! `RUST_LOG` takes precedence. Without it, debug output can be enabled with
//! the `--debug` flag or `TESSERA_DEBUG=1`. Graph dumps use the
//! `tessera::graph` target.

use tracing_subscriber::EnvFilter;

pub const DEBUG_ENV: &str = "TESSERA_DEBUG";

/// Install the global subscriber. Later calls keep the first subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "tessera=debug"
    } else {
        "tessera=info"
    }
}
