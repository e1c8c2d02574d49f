//! Agent channels: bind, updates, progress and results.
//!
//! Progress and results update the tracker. Reports the tracker applied are
//! relayed to the partition's operator, if one is connected; stale ones
//! (no live entry, or already terminal) stop here.

use tracing::{debug, info};

use crate::fleet::tracker::{clamp_percent, MSG_FAILED, MSG_INSTALLING, MSG_SUCCESS};
use crate::fleet::{AgentLink, ConnectionCode, DevicePatch, RegistryError};
use crate::protocol::{
    send_message, AgentConnect, ProgressReport, ResultReport, ServerMessage, ERROR_INVALID_CODE,
    ERROR_PARTITION_MISMATCH,
};
use crate::server::metrics::STD_METRICS;
use crate::server::ws::{ConnectionContext, WsServerState};

#[derive(Debug)]
pub struct AgentSession {
    pub code: ConnectionCode,
    pub device_id: String,
}

pub(super) fn bind(
    state: &WsServerState,
    conn: &ConnectionContext,
    req: AgentConnect,
) -> Option<AgentSession> {
    let code = match ConnectionCode::parse(&req.connection_code) {
        Ok(code) => code,
        Err(err) => {
            let _ = send_message(&conn.tx, ServerMessage::error(ERROR_INVALID_CODE, err.to_string()));
            return None;
        }
    };

    let mut descriptor = req.descriptor;
    if descriptor.ip.as_deref().is_none_or(|ip| ip.trim().is_empty()) {
        descriptor.ip = conn.remote_addr.map(|addr| addr.ip().to_canonical().to_string());
    }

    let link = AgentLink {
        conn_id: conn.conn_id.clone(),
        tx: conn.tx.clone(),
    };
    match state.registry.register_agent(&code, descriptor, link) {
        Ok(device) => {
            let _ = send_message(
                &conn.tx,
                ServerMessage::Registered {
                    device_id: device.id.clone(),
                    connection_code: code.to_string(),
                },
            );
            info!(conn_id = %conn.conn_id, device_id = %device.id, code = %code, "agent bound");
            Some(AgentSession {
                code,
                device_id: device.id,
            })
        }
        Err(err @ RegistryError::PartitionMismatch { .. }) => {
            let _ = send_message(
                &conn.tx,
                ServerMessage::error(ERROR_PARTITION_MISMATCH, err.to_string()),
            );
            None
        }
    }
}

pub(super) fn update(state: &WsServerState, session: &AgentSession, patch: DevicePatch) {
    if patch.is_empty() {
        debug!(device_id = %session.device_id, "empty agent update ignored");
        return;
    }
    state.registry.update_device(&session.device_id, patch);
}

/// Reports carry an optional `deviceId`; it must match the bound device.
fn claims_other_device(session: &AgentSession, claimed: Option<&str>, kind: &str) -> bool {
    match claimed.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) if id != session.device_id => {
            STD_METRICS.frames_dropped_total.inc("identity_mismatch");
            debug!(
                device_id = %session.device_id,
                claimed = id,
                kind,
                "dropping report for another device"
            );
            true
        }
        _ => false,
    }
}

fn device_name(state: &WsServerState, session: &AgentSession, reported: Option<String>) -> String {
    reported
        .filter(|name| !name.trim().is_empty())
        .or_else(|| {
            state
                .registry
                .get(&session.device_id)
                .map(|d| d.display_name().to_string())
        })
        .unwrap_or_else(|| session.device_id.clone())
}

pub(super) fn progress(state: &WsServerState, session: &AgentSession, report: ProgressReport) {
    if claims_other_device(session, report.device_id.as_deref(), "progress") {
        return;
    }
    let applied = state
        .dispatcher
        .on_progress(&session.device_id, report.progress, report.status.as_deref());
    if applied.is_none() {
        debug!(device_id = %session.device_id, "stale progress not relayed");
        return;
    }

    if let Some(operator) = state.operators.get(&session.code) {
        let status = report
            .status
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| MSG_INSTALLING.to_string());
        let _ = send_message(
            &operator.tx,
            ServerMessage::Progress {
                device_id: session.device_id.clone(),
                device_name: device_name(state, session, report.device_name),
                status,
                progress: report.progress.map(clamp_percent),
            },
        );
    }
}

pub(super) fn result(state: &WsServerState, session: &AgentSession, report: ResultReport) {
    if claims_other_device(session, report.device_id.as_deref(), "command_result") {
        return;
    }
    let applied = state
        .dispatcher
        .on_result(&session.device_id, report.success, report.result.as_deref());
    if applied.is_none() {
        debug!(device_id = %session.device_id, "stale result not relayed");
        return;
    }

    if let Some(operator) = state.operators.get(&session.code) {
        let fallback = if report.success { MSG_SUCCESS } else { MSG_FAILED };
        let result = report
            .result
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string());
        let _ = send_message(
            &operator.tx,
            ServerMessage::CommandResult {
                device_id: session.device_id.clone(),
                device_name: device_name(state, session, report.device_name),
                success: report.success,
                result,
            },
        );
    }
}

pub(super) fn release(state: &WsServerState, conn: &ConnectionContext, session: AgentSession) {
    if state.registry.disconnect(&session.device_id, &conn.conn_id) {
        info!(conn_id = %conn.conn_id, device_id = %session.device_id, "agent left");
    }
}
