//! Typed configuration structures
//!
//! Every field has a default so a partial (or missing) file is always valid
//! input. Keys are camelCase in the file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::catalog::DriverInfo;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
    pub catalog: CatalogConfig,
    pub tool: ToolConfig,
}

pub const DEFAULT_PORT: u16 = 8787;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// WebSocket channel limits and keepalive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    pub max_payload_bytes: usize,
    /// A channel that has not announced a role by then is closed.
    pub bind_timeout_ms: u64,
    pub ping_interval_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024,
            bind_timeout_ms: 10_000,
            ping_interval_secs: 30,
            idle_timeout_secs: 90,
        }
    }
}

impl TransportConfig {
    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchConfig {
    /// How long a batch's statuses stay visible after dispatch.
    pub batch_window_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_window_secs: 30,
        }
    }
}

impl DispatchConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.batch_window_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `fleetlink=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Driver catalog collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogConfig {
    /// Upstream base URL. When unset, `drivers` is served as-is.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub drivers: Vec<DriverInfo>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 5_000,
            drivers: Vec::new(),
        }
    }
}

/// Metadata for the agent installer offered to operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolConfig {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// A single validation failure, addressed by its config path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl FleetConfig {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut check = |ok: bool, path: &str, message: &str| {
            if !ok {
                errors.push(ValidationError {
                    path: path.to_string(),
                    message: message.to_string(),
                });
            }
        };

        check(self.server.port != 0, "server.port", "must be non-zero");
        check(
            self.dispatch.batch_window_secs > 0,
            "dispatch.batchWindowSecs",
            "must be at least 1",
        );
        check(
            self.transport.max_payload_bytes > 0,
            "transport.maxPayloadBytes",
            "must be non-zero",
        );
        check(
            self.transport.ping_interval_secs > 0,
            "transport.pingIntervalSecs",
            "must be at least 1",
        );
        check(
            self.transport.idle_timeout_secs > self.transport.ping_interval_secs,
            "transport.idleTimeoutSecs",
            "must be larger than pingIntervalSecs",
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
