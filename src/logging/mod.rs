//! Structured logging
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` plus either the
//! JSON or the plain `fmt` layer. `RUST_LOG` wins over the configured level.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {directive:?}: {message}")]
    InvalidFilter { directive: String, message: String },
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}

/// Filter from `RUST_LOG` when set, else from the configured level.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level).map_err(|err| LoggingError::InvalidFilter {
        directive: config.level.clone(),
        message: err.to_string(),
    })
}

/// Install the global subscriber. Fails instead of panicking when one is
/// already set.
pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(config)?;
    let registry = Registry::default().with(filter);
    let result = match config.format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
    };
    result.map_err(|err| LoggingError::AlreadyInitialized(err.to_string()))
}
