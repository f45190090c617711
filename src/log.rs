//! Structured logging for agentflow.
//!
//! Log levels:
//! - ERROR: dispatcher or bookkeeping faults that should never happen
//! - WARN: recoverable conditions (dropped events, agent marked unhealthy)
//! - INFO: lifecycle notifications (start, shutdown, registration, escalation)
//! - DEBUG: per-task transitions and dispatch decisions
//! - TRACE: re-rank passes and queue snapshots
//!
//! The filter comes from `AGENTFLOW_LOG` when set. Otherwise debug mode is
//! enabled with the `--debug` flag or `AGENTFLOW_DEBUG=1`.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::Result;

pub const FILTER_ENV: &str = "AGENTFLOW_LOG";
pub const DEBUG_ENV: &str = "AGENTFLOW_DEBUG";

/// True when `AGENTFLOW_DEBUG` is set to `1` or `true`.
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Build the filter: explicit `AGENTFLOW_LOG` wins, then the debug switch.
pub fn build_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| {
        if debug || debug_from_env() {
            EnvFilter::new("agentflow=debug")
        } else {
            EnvFilter::new("agentflow=info")
        }
    })
}

/// Install the global subscriber, writing to stderr or to `file`.
///
/// Calling it twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init(debug: bool, file: Option<&Path>) -> Result<()> {
    let filter = build_filter(debug);
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let log_file = OpenOptions::new().create(true).append(true).open(path)?;
            registry
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(log_file)),
                )
                .try_init()
        }
        None => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    if installed.is_ok() {
        let verbose = debug;
        tracing::debug!(verbose, file = ?file, "logging initialized");
    }
    Ok(())
}
