//! Logging for vigil
//!
//! A monitor shares the terminal with the wrapped agent's own output, so
//! nothing is ever logged to stdout or stderr. Everything goes to a
//! daily-rolling file under the XDG state directory
//! (`~/.local/state/vigil/vigil.log.<date>`).

use crate::config::{Config, LoggingConfig};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the non-blocking log writer alive; dropping it flushes pending
/// writes. Hold it for the life of the process.
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

/// Install the global tracing subscriber.
///
/// The level comes from `RUST_LOG` when set, otherwise from the `[logging]`
/// config section. The notify backend is chatty below warn, so it gets its
/// own directive unless `RUST_LOG` overrides the whole filter.
pub fn init(config: &LoggingConfig) -> crate::error::Result<LoggingGuard> {
    let dir = Config::state_dir();
    std::fs::create_dir_all(&dir)?;

    // Non-blocking writer so monitor threads never stall on log IO
    let (writer, worker) = tracing_appender::non_blocking(RollingFileAppender::new(
        Rotation::DAILY,
        &dir,
        "vigil.log",
    ));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},notify=warn", config.level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %dir.display(),
        level = %config.level,
        "vigil logging started"
    );

    Ok(LoggingGuard { _worker: worker })
}

/// Route tracing output through the test harness's captured writer.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Current log file path, without the rotation date suffix.
pub fn log_file_path() -> PathBuf {
    Config::log_path()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_path() {
        let path = log_file_path();
        assert!(path.ends_with("vigil.log"));
    }
}
