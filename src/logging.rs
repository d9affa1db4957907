//! Tracing setup shared by every process of the middleware.
//!
//! Components log with structured fields (`run`, `event`, `producer`, `state`). The
//! configured level is the default filter; `RUST_LOG` replaces it when set.
//!
//! ```no_run
//! use rust_eudaq::{config::EudaqConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EudaqConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(run = 42, "run started");
//! # Ok(())
//! # }
//! ```

use crate::config::EudaqConfig;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, coloured
    #[default]
    Pretty,
    /// One line per event, no colours
    Compact,
    /// One JSON object per event
    Json,
}

/// Install the global subscriber described by the `[application]` section.
pub fn init_from_config(config: &EudaqConfig) -> AppResult<()> {
    let level = parse_log_level(&config.application.log_level)?;
    init(level, config.application.log_format)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` without changes when a subscriber is already installed, so several
/// components and tests may share one process.
pub fn init(level: Level, format: OutputFormat) -> AppResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let layer = match format {
        OutputFormat::Pretty => fmt::layer().pretty().with_thread_names(true).boxed(),
        OutputFormat::Compact => fmt::layer().compact().with_ansi(false).boxed(),
        OutputFormat::Json => fmt::layer().json().boxed(),
    };

    match tracing_subscriber::registry().with(layer).with(filter).try_init() {
        Ok(()) => Ok(()),
        // Lost a race with another initializer
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(err) => Err(DaqError::Configuration(format!(
            "failed to initialize tracing: {err}"
        ))),
    }
}

/// Parse a level name such as `info` or `DEBUG`.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    level.parse::<Level>().map_err(|_| {
        DaqError::Configuration(format!(
            "invalid log level '{level}', expected trace, debug, info, warn or error"
        ))
    })
}
