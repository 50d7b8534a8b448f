// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`. Every component logs with an explicit
// `perfstore::<component>` target so filters can be set per subsystem.
// ============================================================================

use std::io;
use std::time::Instant;

use tracing::level_filters::LevelFilter;
use tracing::{info, trace, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{PerfStoreError, PerfStoreResult};

// ----------------------------------------------------------------------------
// Logger Initialization
// ----------------------------------------------------------------------------

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration.
///
/// When a log file is configured the returned guard must be kept alive for
/// the lifetime of the process, dropping it flushes the background writer.
pub fn init_logging(config: &LoggingConfig) -> PerfStoreResult<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let (writer, guard, ansi) = match &config.file {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path.file_name().ok_or_else(|| {
                PerfStoreError::Internal(format!("Invalid log file path: {}", path.display()))
            })?;
            let appender = tracing_appender::rolling::never(
                directory.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), false)
        }
        None => (BoxMakeWriter::new(io::stdout), None, config.colors),
    };

    let result = match config.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            )
            .try_init(),
        "compact" => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true),
            )
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_ansi(ansi)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            )
            .try_init(),
    };
    result.map_err(|e| PerfStoreError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "perfstore::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(guard)
}

// ----------------------------------------------------------------------------
// Operation Timer
// ----------------------------------------------------------------------------

/// Measures one lifecycle operation and warns when it runs long.
pub struct OpTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: u64,
}

impl OpTimer {
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer, logging if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        if elapsed > self.threshold_ms {
            warn!(
                target: "perfstore::perf",
                operation = self.name,
                elapsed_ms = elapsed,
                threshold_ms = self.threshold_ms,
                "Operation exceeded threshold"
            );
        } else {
            trace!(
                target: "perfstore::perf",
                operation = self.name,
                elapsed_ms = elapsed,
                "Operation completed"
            );
        }
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_parsing() {
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("warning"), LevelFilter::WARN);
        assert_eq!(level_filter("nonsense"), LevelFilter::INFO);
    }

    #[test]
    fn test_op_timer_reports_elapsed() {
        let timer = OpTimer::with_threshold("test", 10_000);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.stop() >= 5);
    }
}
