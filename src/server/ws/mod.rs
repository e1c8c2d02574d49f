//! WebSocket session transport
//!
//! One long-lived channel per participant. Each channel gets an unbounded
//! outbound queue drained by a writer task, so registry fan-out, the
//! dispatcher and the channel's own loop can all enqueue frames without
//! touching the socket. The read loop owns the channel's [`Role`] and feeds
//! decoded frames to [`handlers`] in arrival order.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::fleet::{CommandDispatcher, ConnectionCode, DeviceRegistry};
use crate::protocol::{
    decode_client_frame, send_close, send_message, OutboundFrame, Outbox, ServerMessage,
    CLOSE_GOING_AWAY, CLOSE_POLICY, ERROR_INVALID_REQUEST,
};
use crate::server::connect_info::MaybeConnectInfo;
use crate::server::metrics::STD_METRICS;

mod handlers;

pub use handlers::Role;

/// How long the writer gets to flush after the read loop ends.
const WRITER_GRACE: Duration = Duration::from_secs(2);
/// Frames up to this far over `maxPayloadBytes` are read and rejected explicitly.
const PAYLOAD_HEADROOM: usize = 64 * 1024;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The operator channel currently bound to a code.
#[derive(Debug, Clone)]
pub struct OperatorHandle {
    pub conn_id: String,
    pub tx: Outbox,
}

/// At most one operator per connection code; the newest bind wins.
#[derive(Debug, Default)]
pub struct OperatorTable {
    inner: Mutex<HashMap<ConnectionCode, OperatorHandle>>,
}

impl OperatorTable {
    /// Returns the handle this bind replaced, if any.
    pub fn bind(&self, code: ConnectionCode, handle: OperatorHandle) -> Option<OperatorHandle> {
        self.inner
            .lock()
            .insert(code, handle)
            .filter(|previous| !previous.tx.is_closed())
    }

    /// Remove the entry only if it still belongs to `conn_id`.
    pub fn release(&self, code: &ConnectionCode, conn_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.get(code).is_some_and(|h| h.conn_id == conn_id) {
            inner.remove(code);
            true
        } else {
            false
        }
    }

    pub fn get(&self, code: &ConnectionCode) -> Option<OperatorHandle> {
        self.inner.lock().get(code).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State shared by every channel.
pub struct WsServerState {
    pub registry: Arc<DeviceRegistry>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub operators: OperatorTable,
    pub transport: TransportConfig,
}

impl WsServerState {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        transport: TransportConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            operators: OperatorTable::default(),
            transport,
        }
    }
}

/// Per-channel identity handed to the frame handlers.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub conn_id: String,
    pub remote_addr: Option<SocketAddr>,
    pub tx: Outbox,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsServerState>>,
    MaybeConnectInfo(remote_addr): MaybeConnectInfo,
) -> impl IntoResponse {
    // the socket layer reads past the cap so oversized text gets a 1008 close
    let max_payload = state
        .transport
        .max_payload_bytes
        .saturating_add(PAYLOAD_HEADROOM);
    ws.max_message_size(max_payload)
        .on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

fn to_ws_message(frame: OutboundFrame) -> Option<(Message, bool)> {
    match frame {
        OutboundFrame::Message(msg) => match serde_json::to_string(&msg) {
            Ok(text) => Some((Message::Text(text.into()), false)),
            Err(err) => {
                warn!(error = %err, "failed to serialize outbound frame");
                None
            }
        },
        OutboundFrame::Ping => Some((Message::Ping(Default::default()), false)),
        OutboundFrame::Close { code, reason } => Some((
            Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })),
            true,
        )),
    }
}

enum InboundText {
    Text(String),
    Control,
    Close,
}

fn message_to_text(msg: Message) -> Result<InboundText, &'static str> {
    match msg {
        Message::Text(text) => Ok(InboundText::Text(text.to_string())),
        Message::Binary(_) => Err("binary frames not supported"),
        Message::Close(_) => Ok(InboundText::Close),
        Message::Ping(_) | Message::Pong(_) => Ok(InboundText::Control),
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<WsServerState>,
    remote_addr: Option<SocketAddr>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Some((msg, closing)) = to_ws_message(frame) else {
                continue;
            };
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let conn = ConnectionContext {
        conn_id: Uuid::new_v4().to_string(),
        remote_addr,
        tx: tx.clone(),
    };
    STD_METRICS.ws_connections_active.inc();
    debug!(conn_id = %conn.conn_id, remote = ?remote_addr, "channel opened");

    let transport = &state.transport;
    let bind_deadline = Instant::now() + transport.bind_timeout();
    let ping_every = transport.ping_interval();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    let mut last_seen = Instant::now();
    let mut role = Role::Unbound;

    loop {
        let idle_deadline = last_seen + transport.idle_timeout();
        tokio::select! {
            next = receiver.next() => {
                let msg = match next {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        debug!(conn_id = %conn.conn_id, error = %err, "socket error");
                        break;
                    }
                    None => break,
                };
                last_seen = Instant::now();
                let text = match message_to_text(msg) {
                    Ok(InboundText::Text(text)) => text,
                    Ok(InboundText::Control) => continue,
                    Ok(InboundText::Close) => break,
                    Err(reason) => {
                        STD_METRICS.frames_dropped_total.inc("binary");
                        let _ = send_close(&tx, CLOSE_POLICY, reason);
                        break;
                    }
                };
                if text.len() > transport.max_payload_bytes {
                    STD_METRICS.frames_dropped_total.inc("oversized");
                    let _ = send_close(&tx, CLOSE_POLICY, "payload too large");
                    break;
                }
                match decode_client_frame(&text) {
                    Ok(frame) => {
                        STD_METRICS.ws_frames_total.inc(frame.kind());
                        handlers::handle_frame(&state, &conn, &mut role, frame);
                    }
                    Err(err) => {
                        STD_METRICS.frames_dropped_total.inc(err.reason());
                        debug!(conn_id = %conn.conn_id, error = %err, "dropping malformed frame");
                        let _ = send_message(
                            &tx,
                            ServerMessage::error(ERROR_INVALID_REQUEST, err.to_string()),
                        );
                    }
                }
            }
            _ = tokio::time::sleep_until(bind_deadline), if role.is_unbound() => {
                info!(conn_id = %conn.conn_id, "closing channel that never bound");
                let _ = send_close(&tx, CLOSE_POLICY, "bind timeout");
                break;
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                info!(conn_id = %conn.conn_id, "closing idle channel");
                let _ = send_close(&tx, CLOSE_GOING_AWAY, "idle timeout");
                break;
            }
            _ = ping.tick() => {
                let _ = tx.send(OutboundFrame::Ping);
            }
            // writer gone: a close was sent from elsewhere (supersede) or the sink failed
            _ = tx.closed() => break,
        }
    }

    handlers::release(&state, &conn, role);
    drop(conn);
    drop(tx);
    if tokio::time::timeout(WRITER_GRACE, &mut send_task).await.is_err() {
        send_task.abort();
    }
    STD_METRICS.ws_connections_active.dec();
}
