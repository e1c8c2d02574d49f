//! Configuration loading
//!
//! Reads a JSON5 file into [`FleetConfig`], then applies environment
//! overrides. A missing file is not an error; it yields the defaults.

mod types;

pub use types::*;

use std::path::{Path, PathBuf};
use tracing::debug;

pub const ENV_CONFIG_PATH: &str = "FLEETLINK_CONFIG_PATH";
pub const ENV_BIND: &str = "FLEETLINK_BIND";
pub const ENV_PORT: &str = "FLEETLINK_PORT";
pub const ENV_LOG_LEVEL: &str = "FLEETLINK_LOG_LEVEL";
pub const ENV_BATCH_WINDOW_SECS: &str = "FLEETLINK_BATCH_WINDOW_SECS";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("invalid configuration: {}", format_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// `$FLEETLINK_CONFIG_PATH`, else `<config dir>/fleetlink/config.json5`.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleetlink")
        .join("config.json5")
}

/// Load, override from the environment, and validate.
pub fn load_config() -> Result<FleetConfig, ConfigError> {
    let mut config = load_config_from(&get_config_path())?;
    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
}

/// Parse one file without environment overrides or validation.
pub fn load_config_from(path: &Path) -> Result<FleetConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(FleetConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if raw.trim().is_empty() {
        return Ok(FleetConfig::default());
    }
    json5::from_str(&raw).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Apply `FLEETLINK_*` overrides. `lookup` is `std::env::var` outside tests.
pub fn apply_env_overrides(
    config: &mut FleetConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(bind) = lookup(ENV_BIND).filter(|v| !v.trim().is_empty()) {
        config.server.bind = bind.trim().to_string();
    }
    if let Some(port) = lookup(ENV_PORT) {
        config.server.port = parse_env(ENV_PORT, &port)?;
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|v| !v.trim().is_empty()) {
        config.logging.level = level.trim().to_string();
    }
    if let Some(window) = lookup(ENV_BATCH_WINDOW_SECS) {
        config.dispatch.batch_window_secs = parse_env(ENV_BATCH_WINDOW_SECS, &window)?;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}
