//! Wire protocol
//!
//! JSON text frames with a snake_case `type` discriminator and camelCase
//! fields, in both directions. Inbound frames are decoded in two steps
//! (envelope, then payload) so that a frame with an unknown `type` can be told
//! apart from one whose payload is malformed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::fleet::device::{Device, DeviceDescriptor, DevicePatch};
use crate::fleet::tracker::InstallStatus;

pub const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERROR_INVALID_CODE: &str = "INVALID_CODE";
pub const ERROR_PARTITION_MISMATCH: &str = "PARTITION_MISMATCH";

/// Close code sent to an operator channel replaced by a newer one.
pub const CLOSE_SUPERSEDED: u16 = 4000;
/// Close code for policy violations (bind timeout, oversized or binary frames).
pub const CLOSE_POLICY: u16 = 1008;
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame has no type")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

impl FrameError {
    /// Short label used for the dropped-frame metric.
    pub fn reason(&self) -> &'static str {
        match self {
            FrameError::InvalidJson(_) => "invalid_json",
            FrameError::MissingType => "missing_type",
            FrameError::UnknownType(_) => "unknown_type",
            FrameError::InvalidPayload { .. } => "invalid_payload",
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    AdminConnect(AdminConnect),
    AgentConnect(AgentConnect),
    AgentUpdate(DevicePatch),
    Command(CommandRequest),
    Progress(ProgressReport),
    CommandResult(ResultReport),
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::AdminConnect(_) => "admin_connect",
            ClientMessage::AgentConnect(_) => "agent_connect",
            ClientMessage::AgentUpdate(_) => "agent_update",
            ClientMessage::Command(_) => "command",
            ClientMessage::Progress(_) => "progress",
            ClientMessage::CommandResult(_) => "command_result",
            ClientMessage::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConnect {
    pub connection_code: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnect {
    pub connection_code: String,
    #[serde(flatten)]
    pub descriptor: DeviceDescriptor,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    #[serde(default)]
    pub target_device_id: Option<String>,
    #[serde(default)]
    pub target_device_ids: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub params: Value,
}

impl CommandRequest {
    /// Union of both target fields, first occurrence order, blanks removed.
    pub fn targets(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let all = self
            .target_device_id
            .iter()
            .chain(self.target_device_ids.iter());
        for id in all {
            let id = id.trim();
            if !id.is_empty() && !out.iter().any(|seen| seen == id) {
                out.push(id.to_string());
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<String>,
}

fn payload<T: serde::de::DeserializeOwned>(kind: &str, value: Value) -> Result<T, FrameError> {
    serde_json::from_value(value).map_err(|err| FrameError::InvalidPayload {
        kind: kind.to_string(),
        reason: err.to_string(),
    })
}

/// Decode one inbound text frame.
pub fn decode_client_frame(text: &str) -> Result<ClientMessage, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::InvalidJson(err.to_string()))?;
    let kind = value
        .as_object()
        .and_then(|obj| obj.get("type"))
        .and_then(|v| v.as_str())
        .ok_or(FrameError::MissingType)?
        .to_string();

    match kind.as_str() {
        "admin_connect" => Ok(ClientMessage::AdminConnect(payload(&kind, value)?)),
        "agent_connect" => Ok(ClientMessage::AgentConnect(payload(&kind, value)?)),
        "agent_update" => Ok(ClientMessage::AgentUpdate(payload(&kind, value)?)),
        "command" => Ok(ClientMessage::Command(payload(&kind, value)?)),
        "progress" => Ok(ClientMessage::Progress(payload(&kind, value)?)),
        "command_result" => Ok(ClientMessage::CommandResult(payload(&kind, value)?)),
        "ping" => Ok(ClientMessage::Ping),
        _ => Err(FrameError::UnknownType(kind)),
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A frame the server sends to an agent or operator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Registered {
        device_id: String,
        connection_code: String,
    },
    DevicesList {
        devices: Vec<Device>,
    },
    DeviceOnline {
        device: Device,
    },
    #[serde(rename_all = "camelCase")]
    DeviceOffline {
        device_id: String,
    },
    DeviceUpdate {
        device: Device,
    },
    #[serde(rename_all = "camelCase")]
    Command {
        target_device_id: String,
        command: String,
        params: Value,
    },
    #[serde(rename_all = "camelCase")]
    CommandAck {
        batch_id: u64,
        command: String,
        requested: usize,
        sent_count: usize,
        skipped: Vec<String>,
        expires_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        device_id: String,
        device_name: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
    },
    #[serde(rename_all = "camelCase")]
    CommandResult {
        device_id: String,
        device_name: String,
        success: bool,
        result: String,
    },
    InstallStatus {
        statuses: BTreeMap<String, InstallStatus>,
    },
    Pong {
        ts: i64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Registered { .. } => "registered",
            ServerMessage::DevicesList { .. } => "devices_list",
            ServerMessage::DeviceOnline { .. } => "device_online",
            ServerMessage::DeviceOffline { .. } => "device_offline",
            ServerMessage::DeviceUpdate { .. } => "device_update",
            ServerMessage::Command { .. } => "command",
            ServerMessage::CommandAck { .. } => "command_ack",
            ServerMessage::Progress { .. } => "progress",
            ServerMessage::CommandResult { .. } => "command_result",
            ServerMessage::InstallStatus { .. } => "install_status",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// What the per-channel writer task knows how to put on the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Message(ServerMessage),
    Ping,
    Close { code: u16, reason: String },
}

/// Sending half of a channel's outbound queue.
pub type Outbox = mpsc::UnboundedSender<OutboundFrame>;

/// Queue a message for delivery. Returns `false` when the channel is gone;
/// callers must not treat `true` as proof of delivery.
pub fn send_message(tx: &Outbox, msg: ServerMessage) -> bool {
    match tx.send(OutboundFrame::Message(msg)) {
        Ok(()) => true,
        Err(err) => {
            if let OutboundFrame::Message(msg) = err.0 {
                tracing::debug!(kind = msg.kind(), "dropping frame for closed channel");
            }
            false
        }
    }
}

pub fn send_close(tx: &Outbox, code: u16, reason: &str) -> bool {
    // WebSocket close reasons are capped at 123 bytes
    let mut truncated = String::new();
    for ch in reason.chars() {
        if truncated.len() + ch.len_utf8() > 123 {
            break;
        }
        truncated.push(ch);
    }
    tx.send(OutboundFrame::Close {
        code,
        reason: truncated,
    })
    .is_ok()
}
