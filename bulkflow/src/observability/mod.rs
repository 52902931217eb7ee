//! Logging setup and stage timing.

use std::time::{Duration, Instant};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::model::JobStage;

/// Output format of the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Reads `RUST_LOG_FORMAT`; `json` selects JSON, anything else text.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("RUST_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Installs a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .json()
            .with_filter(filter)
            .boxed(),
    };
    tracing_subscriber::registry().with(layer).try_init().is_ok()
}

/// Measures one stage of a job and logs its duration when finished.
#[derive(Debug)]
pub struct StageTimer {
    stage: JobStage,
    start: Instant,
}

impl StageTimer {
    /// Starts timing a stage.
    #[must_use]
    pub fn start(stage: JobStage) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }

    /// The stage being timed.
    #[must_use]
    pub const fn stage(&self) -> JobStage {
        self.stage
    }

    /// Time elapsed so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Logs the stage duration and returns it.
    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        tracing::debug!(
            stage = %self.stage,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Stage finished"
        );
        elapsed
    }
}
