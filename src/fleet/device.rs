//! Device records and the connection-code partition key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of digits in a connection code.
pub const CONNECTION_CODE_LEN: usize = 6;

/// Partition key shared by an operator and the agents it may command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionCode(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connection code must be exactly {CONNECTION_CODE_LEN} digits")]
pub struct InvalidConnectionCode;

impl ConnectionCode {
    pub fn parse(raw: &str) -> Result<Self, InvalidConnectionCode> {
        let trimmed = raw.trim();
        if trimmed.len() != CONNECTION_CODE_LEN || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidConnectionCode);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ConnectionCode {
    type Err = InvalidConnectionCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ConnectionCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ConnectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered agent machine, as seen by operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub connection_code: ConnectionCode,
    pub hostname: String,
    pub os: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default)]
    pub printers: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub is_online: bool,
}

/// What an agent announces about itself when it connects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Stable identity; assigned by the server when the agent has none yet.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub printers: Vec<String>,
}

/// Field-level update pushed by an agent. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePatch {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub printers: Option<Vec<String>>,
}

impl DevicePatch {
    pub fn is_empty(&self) -> bool {
        self.hostname.is_none()
            && self.os.is_none()
            && self.ip.is_none()
            && self.subnet.is_none()
            && self.gateway.is_none()
            && self.printers.is_none()
    }
}

impl Device {
    pub(crate) fn from_descriptor(
        id: String,
        code: ConnectionCode,
        descriptor: DeviceDescriptor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            connection_code: code,
            hostname: descriptor.hostname,
            os: descriptor.os,
            ip: descriptor.ip.unwrap_or_default(),
            subnet: descriptor.subnet,
            gateway: descriptor.gateway,
            printers: descriptor.printers,
            connected_at: now,
            is_online: true,
        }
    }

    /// Reconnect: refresh everything the agent may have changed. The id and
    /// connection code never change here.
    pub(crate) fn refresh(&mut self, descriptor: DeviceDescriptor, now: DateTime<Utc>) {
        self.hostname = descriptor.hostname;
        self.os = descriptor.os;
        if let Some(ip) = descriptor.ip {
            self.ip = ip;
        }
        self.subnet = descriptor.subnet;
        self.gateway = descriptor.gateway;
        self.printers = descriptor.printers;
        self.connected_at = now;
        self.is_online = true;
    }

    /// Last-write-wins merge of an agent update.
    pub(crate) fn apply(&mut self, patch: DevicePatch) {
        if let Some(hostname) = patch.hostname {
            self.hostname = hostname;
        }
        if let Some(os) = patch.os {
            self.os = os;
        }
        if let Some(ip) = patch.ip {
            self.ip = ip;
        }
        if let Some(subnet) = patch.subnet {
            self.subnet = Some(subnet);
        }
        if let Some(gateway) = patch.gateway {
            self.gateway = Some(gateway);
        }
        if let Some(printers) = patch.printers {
            self.printers = printers;
        }
    }

    /// Name shown for this device in install status rows.
    pub fn display_name(&self) -> &str {
        if self.hostname.trim().is_empty() {
            &self.id
        } else {
            &self.hostname
        }
    }
}
