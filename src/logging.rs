//! Logging and tracing initialization.
//!
//! Structured logging through `tracing`: pretty console output for operators, JSON
//! lines when the run is collected by a log pipeline. Per-object failures are
//! reported here as they happen, at `warn`.

use std::time::{Duration, Instant};

use tracing::{Level, info};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

/// Initialize the tracing subscriber with the given configuration.
///
/// Call once, after config is loaded. `RUST_LOG` overrides the default level.
///
/// ```ignore
/// objmig::logging::init(LogConfig { verbose: true, ..Default::default() });
/// ```
pub fn init(config: LogConfig) {
    // Determine default log level based on verbose flag
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("objmig={}", default_level.as_str().to_lowercase()))
    });

    if config.json {
        // JSON output for structured logging / log aggregation
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        // Logs go to stderr so command output on stdout stays parseable
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// Rate-limited `Batch progress` lines for one batch.
///
/// The first finished object is reported, then at most one line per interval. The
/// last object is left to the batch's own summary line.
pub struct BatchProgress {
    source: String,
    total: usize,
    interval: Duration,
    last_logged: Option<Instant>,
}

impl BatchProgress {
    pub fn new(source: &str, total: usize, interval: Duration) -> Self {
        Self {
            source: source.to_string(),
            total,
            interval,
            last_logged: None,
        }
    }

    /// Note that `done` objects have finished; returns whether a line was logged.
    pub fn advance(&mut self, done: usize) -> bool {
        self.advance_at(done, Instant::now())
    }

    fn advance_at(&mut self, done: usize, now: Instant) -> bool {
        if done >= self.total {
            return false;
        }
        let due = self
            .last_logged
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if due {
            self.last_logged = Some(now);
            info!(source = %self.source, done, total = self.total, "Batch progress");
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_object_is_reported_then_throttled() {
        let mut progress = BatchProgress::new("aliyun", 10, Duration::from_secs(5));
        let start = Instant::now();
        assert!(progress.advance_at(1, start));
        assert!(!progress.advance_at(2, start + Duration::from_secs(1)));
        assert!(progress.advance_at(3, start + Duration::from_secs(5)));
        assert!(!progress.advance_at(4, start + Duration::from_secs(6)));
    }

    #[test]
    fn last_object_is_left_to_the_summary() {
        let mut progress = BatchProgress::new("aliyun", 2, Duration::ZERO);
        assert!(progress.advance(1));
        assert!(!progress.advance(2));
    }

    #[test]
    fn empty_batch_logs_nothing() {
        let mut progress = BatchProgress::new("aliyun", 0, Duration::ZERO);
        assert!(!progress.advance(0));
    }
}
