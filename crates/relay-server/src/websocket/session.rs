//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use relay_core::ids::ConnectionId;
use relay_core::protocol::{
    CloseCode, ConnectionPolicy, Frame, Hello, HelloOk, MAX_PROTOCOL, MIN_PROTOCOL, ServerInfo,
    negotiate_protocol,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::handler::{Inbound, classify};
use super::heartbeat::{HeartbeatOutcome, watch_liveness};
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_REJECTED_TOTAL,
    WS_CONNECTIONS_TOTAL, WS_MESSAGES_RECEIVED_TOTAL, WS_MESSAGES_SENT_TOTAL,
};
use crate::server::AppState;

/// Features advertised in `helloOk`.
pub const SERVER_CAPABILITIES: &[&str] = &["events", "idempotency", "approvals", "subagents"];

/// Close reasons are limited to 123 bytes by the WebSocket protocol.
const MAX_CLOSE_REASON: usize = 123;

// ── Connection slots ────────────────────────────────────────────────

/// Counts open connections against `max_connections`.
#[derive(Debug)]
pub struct ConnectionSlots {
    max: usize,
    used: AtomicUsize,
}

impl ConnectionSlots {
    /// Allow up to `max` concurrent connections.
    pub fn new(max: usize) -> Self {
        Self {
            max,
            used: AtomicUsize::new(0),
        }
    }

    /// Take a slot, or `None` at capacity. The slot frees on drop.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                return None;
            }
            match self.used.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SlotGuard {
                        slots: Arc::clone(self),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Slots in use.
    pub fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

/// One held connection slot.
#[derive(Debug)]
pub struct SlotGuard {
    slots: Arc<ConnectionSlots>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.slots.used.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── Handshake ───────────────────────────────────────────────────────

enum HandshakeError {
    /// The socket went away before a `hello`.
    Disconnected,
    /// Refuse with this close code and reason.
    Refused(CloseCode, String),
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_owned();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_owned()
}

fn close_message(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: code.code(),
        reason: truncate_reason(reason).into(),
    }))
}

async fn refuse(mut ws: WebSocket, code: CloseCode, reason: &str, label: &'static str) {
    counter!(WS_CONNECTIONS_REJECTED_TOTAL, "reason" => label).increment(1);
    info!(code = code.code(), reason, "connection refused");
    let _ = ws.send(close_message(code, reason)).await;
    let _ = ws.close().await;
}

/// Wait for the first frame; it must be a `hello`.
async fn read_hello(ws: &mut WebSocket) -> Result<Hello, HandshakeError> {
    while let Some(msg) = ws.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    return Err(HandshakeError::Refused(
                        CloseCode::InvalidHello,
                        "expected hello".into(),
                    ));
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return Err(HandshakeError::Disconnected),
        };
        return match Frame::parse(&text) {
            Ok(Frame::Hello(hello)) => Ok(hello),
            Ok(other) => Err(HandshakeError::Refused(
                CloseCode::InvalidHello,
                format!("expected hello, got {}", other.kind()),
            )),
            Err(err) => Err(HandshakeError::Refused(
                CloseCode::InvalidHello,
                err.to_string(),
            )),
        };
    }
    Err(HandshakeError::Disconnected)
}

/// Read and check the client's `hello`. Returns it with the negotiated
/// protocol version.
async fn handshake(ws: &mut WebSocket, state: &AppState) -> Result<(Hello, u32), HandshakeError> {
    let shutdown = state.shutdown.token();
    let hello = tokio::select! {
        () = shutdown.cancelled() => {
            return Err(HandshakeError::Refused(CloseCode::GoingAway, CloseCode::GoingAway.reason().into()));
        }
        read = tokio::time::timeout(state.config.handshake_timeout, read_hello(ws)) => match read {
            Ok(result) => result?,
            Err(_elapsed) => {
                return Err(HandshakeError::Refused(
                    CloseCode::HandshakeFailed,
                    "handshake timeout".into(),
                ));
            }
        },
    };

    if let Err(err) = state.auth.authenticate(&hello) {
        return Err(HandshakeError::Refused(CloseCode::AuthFailed, err.to_string()));
    }
    let version = negotiate_protocol(hello.min_protocol, hello.max_protocol, MIN_PROTOCOL, MAX_PROTOCOL)
        .map_err(|err| HandshakeError::Refused(CloseCode::VersionMismatch, err.to_string()))?;
    Ok((hello, version))
}

fn refusal_label(code: CloseCode) -> &'static str {
    match code {
        CloseCode::AuthFailed => "auth",
        CloseCode::VersionMismatch => "version",
        CloseCode::InvalidHello => "protocol",
        CloseCode::GoingAway => "shutdown",
        _ => "handshake",
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// Run a WebSocket session for a newly upgraded socket.
///
/// 1. Refuses with 1013 when no connection slot was available
/// 2. Reads `hello`, authenticates, negotiates a version, replies `helloOk`
/// 3. Dispatches `req` frames concurrently, each bounded by its timeout
/// 4. Forwards responses and events through the connection's bounded queue
/// 5. Pings on an interval and drops clients that stop answering
/// 6. Closes with 1001 on server shutdown
#[instrument(skip_all)]
pub async fn run_ws_session(mut ws: WebSocket, state: AppState, slot: Option<SlotGuard>) {
    let Some(_slot) = slot else {
        let code = CloseCode::TryAgainLater;
        refuse(ws, code, code.reason(), "capacity").await;
        return;
    };

    let (hello, protocol_version) = match handshake(&mut ws, &state).await {
        Ok(accepted) => accepted,
        Err(HandshakeError::Disconnected) => {
            debug!("socket closed during handshake");
            return;
        }
        Err(HandshakeError::Refused(code, reason)) => {
            refuse(ws, code, &reason, refusal_label(code)).await;
            return;
        }
    };

    let conn_id = ConnectionId::new();
    let hello_ok = Frame::HelloOk(HelloOk {
        protocol_version,
        connection_id: conn_id.clone(),
        capabilities: SERVER_CAPABILITIES.iter().map(|c| (*c).to_owned()).collect(),
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            host: Some(state.config.host.clone()),
        },
        policy: ConnectionPolicy {
            heartbeat_interval_ms: u64::try_from(state.config.heartbeat_interval.as_millis())
                .unwrap_or(u64::MAX),
            max_payload_bytes: state.config.max_payload_bytes,
        },
    });
    let sent = match hello_ok.to_json() {
        Ok(json) => ws.send(Message::Text(json.into())).await.is_ok(),
        Err(err) => {
            warn!(error = %err, "failed to serialize helloOk");
            false
        }
    };
    if !sent {
        return;
    }

    let conn_token = state.shutdown.token().child_token();
    let (send_tx, send_rx) = mpsc::channel::<String>(state.config.outbound_buffer);
    let connection = Arc::new(ClientConnection::new(conn_id.clone(), send_tx, conn_token.clone()));
    let connection_start = Instant::now();
    info!(
        conn_id = %conn_id,
        client = %hello.client_name,
        client_version = %hello.client_version,
        mode = hello.mode.as_str(),
        protocol_version,
        "client connected"
    );
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    state.broadcast.add(Arc::clone(&connection)).await;

    let (ws_tx, mut ws_rx) = ws.split();
    let outbound = tokio::spawn(write_loop(
        ws_tx,
        send_rx,
        state.config.heartbeat_interval,
        conn_token.clone(),
    ));
    let heartbeat = {
        let connection = Arc::clone(&connection);
        let interval = state.config.heartbeat_interval;
        let timeout = state.config.heartbeat_timeout;
        let token = conn_token.clone();
        tokio::spawn(async move {
            if let HeartbeatOutcome::Unresponsive { missed } =
                watch_liveness(Arc::clone(&connection), interval, timeout, token).await
            {
                warn!(conn_id = %connection.id, missed, "client unresponsive, disconnecting");
                connection.close();
            }
        })
    };

    let ctx = state.ctx.for_connection(Arc::clone(&connection));
    let mut inflight = JoinSet::new();
    loop {
        let msg = tokio::select! {
            () = conn_token.cancelled() => break,
            Some(_) = inflight.join_next(), if !inflight.is_empty() => continue,
            msg = ws_rx.next() => msg,
        };
        let Some(Ok(msg)) = msg else { break };
        counter!(WS_MESSAGES_RECEIVED_TOTAL).increment(1);

        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(conn_id = %conn_id, len = data.len(), "non-UTF8 binary frame ignored");
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                connection.mark_alive();
                continue;
            }
            Message::Close(_) => {
                info!(conn_id = %conn_id, "client sent close frame");
                break;
            }
        };
        connection.mark_alive();

        match classify(&text) {
            Inbound::Request(request) => {
                let timeout = request
                    .timeout_ms
                    .map_or(state.config.request_timeout, Duration::from_millis);
                let registry = Arc::clone(&state.registry);
                let ctx = ctx.clone();
                let connection = Arc::clone(&connection);
                let _ = inflight.spawn(async move {
                    let response = registry.dispatch(request, &ctx, timeout).await;
                    if !connection.send_response(response).await {
                        debug!(conn_id = %connection.id, "response dropped, connection closing");
                    }
                });
            }
            Inbound::Reject(response) => {
                let _ = connection.send_response(response).await;
            }
            Inbound::Ignore => {}
        }
    }

    connection.close();
    inflight.abort_all();
    let _ = heartbeat.await;
    let _ = outbound.await;
    state.broadcast.remove(&conn_id).await;

    info!(conn_id = %conn_id, dropped = connection.drop_count(), "client disconnected");
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection_start.elapsed().as_secs_f64());
}

/// Drain the outbound queue to the socket and send pings. On cancellation
/// the socket is closed with 1001.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<String>,
    ping_every: Duration,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + ping_every;
    let mut ping = tokio::time::interval_at(start, ping_every);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let code = CloseCode::GoingAway;
                let _ = ws_tx.send(close_message(code, code.reason())).await;
                break;
            }
            msg = send_rx.recv() => {
                let Some(text) = msg else { break };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                counter!(WS_MESSAGES_SENT_TOTAL).increment(1);
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_enforce_limit() {
        let slots = Arc::new(ConnectionSlots::new(2));
        let a = slots.try_acquire();
        let b = slots.try_acquire();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(slots.try_acquire().is_none());
        assert_eq!(slots.in_use(), 2);

        drop(a);
        assert_eq!(slots.in_use(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[test]
    fn zero_slots_refuse_everything() {
        let slots = Arc::new(ConnectionSlots::new(0));
        assert!(slots.try_acquire().is_none());
    }

    #[test]
    fn long_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let truncated = truncate_reason(&reason);
        assert!(truncated.len() <= MAX_CLOSE_REASON);
        assert!(truncated.chars().all(|c| c == 'é'));
        assert_eq!(truncate_reason("short"), "short");
    }

    #[test]
    fn refusal_labels() {
        assert_eq!(refusal_label(CloseCode::AuthFailed), "auth");
        assert_eq!(refusal_label(CloseCode::VersionMismatch), "version");
        assert_eq!(refusal_label(CloseCode::HandshakeFailed), "handshake");
        assert_eq!(refusal_label(CloseCode::InvalidHello), "protocol");
    }
}
