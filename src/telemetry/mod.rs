//! Logging initialisation for threatscan
//!
//! Installs a `tracing_subscriber` registry with a level filter and either a
//! JSON or a human-readable formatting layer.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Telemetry error types
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TelemetryError {
    /// Failed to install the global subscriber
    #[error("Failed to initialize tracing: {0}")]
    Init(String),

    /// Unknown log format
    #[error("Unsupported log format: {0}")]
    Format(String),
}

/// Map a configured level name to a tracing level
///
/// Unknown names fall back to `INFO`.
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TelemetryError> {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(parse_level(&config.level));

    match config.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| TelemetryError::Init(e.to_string())),
        "pretty" | "text" => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .map_err(|e| TelemetryError::Init(e.to_string())),
        other => Err(TelemetryError::Format(other.to_string())),
    }
}
