//! Operator channels: bind, command, release.

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::fleet::{CommandDispatcher, ConnectionCode};
use crate::protocol::{
    send_close, send_message, AdminConnect, CommandRequest, Outbox, ServerMessage,
    CLOSE_SUPERSEDED, ERROR_INVALID_CODE, ERROR_INVALID_REQUEST,
};
use crate::server::ws::{ConnectionContext, OperatorHandle, WsServerState};

#[derive(Debug)]
pub struct OperatorSession {
    pub code: ConnectionCode,
    subscription_id: u64,
    registry_task: JoinHandle<()>,
    status_task: Option<JoinHandle<()>>,
}

pub(super) fn bind(
    state: &WsServerState,
    conn: &ConnectionContext,
    req: AdminConnect,
) -> Option<OperatorSession> {
    let code = match ConnectionCode::parse(&req.connection_code) {
        Ok(code) => code,
        Err(err) => {
            let _ = send_message(&conn.tx, ServerMessage::error(ERROR_INVALID_CODE, err.to_string()));
            return None;
        }
    };

    let handle = OperatorHandle {
        conn_id: conn.conn_id.clone(),
        tx: conn.tx.clone(),
    };
    if let Some(previous) = state.operators.bind(code.clone(), handle) {
        info!(code = %code, superseded = %previous.conn_id, "operator superseded");
        let _ = send_close(&previous.tx, CLOSE_SUPERSEDED, "superseded");
    }

    // subscribe before the snapshot so nothing falls between the two
    let mut subscription = state.registry.subscribe(&code);
    let _ = send_message(
        &conn.tx,
        ServerMessage::DevicesList {
            devices: state.registry.snapshot(&code),
        },
    );

    let tx = conn.tx.clone();
    let registry_task = tokio::spawn(async move {
        while let Some(event) = subscription.events.recv().await {
            if !send_message(&tx, event.into()) {
                break;
            }
        }
    });

    info!(conn_id = %conn.conn_id, code = %code, "operator bound");
    Some(OperatorSession {
        status_task: Some(spawn_status_forwarder(&state.dispatcher, &code, conn.tx.clone())),
        code,
        subscription_id: subscription.id,
        registry_task,
    })
}

pub(super) fn command(
    state: &WsServerState,
    conn: &ConnectionContext,
    session: &mut OperatorSession,
    req: CommandRequest,
) {
    let targets = req.targets();
    if targets.is_empty() || req.command.trim().is_empty() {
        let _ = send_message(
            &conn.tx,
            ServerMessage::error(
                ERROR_INVALID_REQUEST,
                "command needs a name and at least one target",
            ),
        );
        return;
    }

    let handle = state
        .dispatcher
        .dispatch(&session.code, &targets, req.command.trim(), req.params);
    let _ = send_message(&conn.tx, handle.to_ack());

    if handle.sent_count > 0 {
        // restart observation so it covers the new batch
        if let Some(previous) = session.status_task.take() {
            previous.abort();
        }
        session.status_task = Some(spawn_status_forwarder(
            &state.dispatcher,
            &session.code,
            conn.tx.clone(),
        ));
    }
}

pub(super) fn release(state: &WsServerState, conn: &ConnectionContext, session: OperatorSession) {
    session.registry_task.abort();
    if let Some(task) = session.status_task {
        task.abort();
    }
    state
        .registry
        .unsubscribe(&session.code, session.subscription_id);
    if state.operators.release(&session.code, &conn.conn_id) {
        info!(conn_id = %conn.conn_id, code = %session.code, "operator left");
    } else {
        debug!(conn_id = %conn.conn_id, "superseded operator channel closed");
    }
}

/// Forward the tracker stream as `install_status` frames until it ends.
fn spawn_status_forwarder(
    dispatcher: &CommandDispatcher,
    code: &ConnectionCode,
    tx: Outbox,
) -> JoinHandle<()> {
    let stream = dispatcher.observe(code);
    tokio::spawn(async move {
        futures_util::pin_mut!(stream);
        while let Some(statuses) = stream.next().await {
            if !send_message(&tx, ServerMessage::InstallStatus { statuses }) {
                break;
            }
        }
    })
}
