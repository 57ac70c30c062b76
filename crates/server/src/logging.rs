//! Structured logging setup.
//!
//! Human-readable output on stderr by default. Setting
//! `AGENTDECK_LOG_FILE` switches to newline-delimited JSON appended to
//! that file through a non-blocking writer, which suits running the
//! gateway as a background service. The filter comes from
//! `AGENTDECK_LOG`, falling back to `RUST_LOG`, falling back to info.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. The returned guard must stay alive
/// for the process lifetime when a file sink is active, or buffered
/// lines are lost on exit.
pub fn init_logging() -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_env("AGENTDECK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=warn"));

    let registry = tracing_subscriber::registry().with(filter);

    let log_file = std::env::var("AGENTDECK_LOG_FILE")
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);

    let guard = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            registry
                .with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
                .init();
            tracing::info!(
                component = "logging",
                event = "logging.initialized",
                sink = %path.display(),
                "Logging to file"
            );
            Some(guard)
        }
        None => {
            registry
                .with(fmt::layer().with_writer(std::io::stderr).compact())
                .init();
            None
        }
    };

    Ok(guard)
}
