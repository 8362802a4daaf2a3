//! Log subscriber setup.
//!
//! The daemon writes JSON lines to a daily file under the configured logs
//! directory and mirrors them to stderr. One-shot subcommands (`sync`,
//! `update`) log to stderr only, in compact form, so their stdout report
//! stays clean.
//!
//! Both modes read `RUST_LOG`; without it, guildsync logs at `info` and the
//! HTTP, SQL and Docker client crates at `warn`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// File name prefix for the rolling daemon log.
const LOG_FILE_PREFIX: &str = "guildsync.log";

/// Filter applied when `RUST_LOG` is unset or invalid.
pub const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn,hyper=warn,reqwest=warn,bollard=warn";

/// Flushes the daemon log file when dropped; keep it alive until exit.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Install the daemon subscriber: daily JSON file plus stderr.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or a global
/// subscriber is already installed.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_writer(writer),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}

/// Install a compact stderr-only subscriber.
///
/// A second call is a no-op.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}

/// `RUST_LOG` if set and valid, otherwise [`DEFAULT_DIRECTIVES`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}
