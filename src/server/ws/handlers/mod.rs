//! Frame dispatch
//!
//! A channel starts [`Role::Unbound`] and becomes an operator or an agent on
//! its first valid bind frame. Each role accepts a fixed set of frame types;
//! anything else is dropped and counted.

use tracing::debug;

use super::{now_ms, ConnectionContext, WsServerState};
use crate::protocol::{send_message, ClientMessage, ServerMessage};
use crate::server::metrics::STD_METRICS;

mod agent;
mod operator;

pub use agent::AgentSession;
pub use operator::OperatorSession;

#[derive(Debug, Default)]
pub enum Role {
    #[default]
    Unbound,
    Operator(OperatorSession),
    Agent(AgentSession),
}

impl Role {
    pub fn is_unbound(&self) -> bool {
        matches!(self, Role::Unbound)
    }

    fn name(&self) -> &'static str {
        match self {
            Role::Unbound => "unbound",
            Role::Operator(_) => "operator",
            Role::Agent(_) => "agent",
        }
    }
}

pub(super) fn handle_frame(
    state: &WsServerState,
    conn: &ConnectionContext,
    role: &mut Role,
    frame: ClientMessage,
) {
    match frame {
        ClientMessage::Ping => {
            let _ = send_message(&conn.tx, ServerMessage::Pong { ts: now_ms() });
        }
        ClientMessage::AdminConnect(req) if role.is_unbound() => {
            if let Some(session) = operator::bind(state, conn, req) {
                *role = Role::Operator(session);
            }
        }
        ClientMessage::AgentConnect(req) if role.is_unbound() => {
            if let Some(session) = agent::bind(state, conn, req) {
                *role = Role::Agent(session);
            }
        }
        ClientMessage::Command(req) => match role {
            Role::Operator(session) => operator::command(state, conn, session, req),
            _ => drop_frame(conn, role, "command"),
        },
        ClientMessage::AgentUpdate(patch) => match role {
            Role::Agent(session) => agent::update(state, session, patch),
            _ => drop_frame(conn, role, "agent_update"),
        },
        ClientMessage::Progress(report) => match role {
            Role::Agent(session) => agent::progress(state, session, report),
            _ => drop_frame(conn, role, "progress"),
        },
        ClientMessage::CommandResult(report) => match role {
            Role::Agent(session) => agent::result(state, session, report),
            _ => drop_frame(conn, role, "command_result"),
        },
        other => drop_frame(conn, role, other.kind()),
    }
}

fn drop_frame(conn: &ConnectionContext, role: &Role, kind: &str) {
    let reason = match (role, kind) {
        (Role::Unbound, _) => "unbound",
        (_, "admin_connect" | "agent_connect") => "already_bound",
        _ => "role",
    };
    STD_METRICS.frames_dropped_total.inc(reason);
    debug!(
        conn_id = %conn.conn_id,
        role = role.name(),
        frame = kind,
        reason,
        "dropping frame"
    );
}

/// Channel-close cleanup for whatever role the channel ended in.
pub(super) fn release(state: &WsServerState, conn: &ConnectionContext, role: Role) {
    match role {
        Role::Unbound => {}
        Role::Operator(session) => operator::release(state, conn, session),
        Role::Agent(session) => agent::release(state, conn, session),
    }
}
