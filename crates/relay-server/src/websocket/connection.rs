//! WebSocket client connection state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use metrics::counter;
use parking_lot::Mutex;
use relay_core::ids::{ConnectionId, SessionId};
use relay_core::protocol::{EventFrame, Frame, ResponseFrame};
use relay_runtime::GatewayEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::metrics::WS_EVENTS_DROPPED_TOTAL;

/// A client that completed the handshake.
pub struct ClientConnection {
    /// Server-assigned connection ID.
    pub id: ConnectionId,
    /// Sessions whose events this connection receives.
    subscriptions: Mutex<HashSet<SessionId>>,
    /// Send channel to the connection's write task.
    tx: mpsc::Sender<String>,
    /// Last event sequence number handed out.
    seq: Mutex<u64>,
    /// Set by any inbound traffic, cleared by each liveness check.
    alive: AtomicBool,
    /// Messages dropped because the outbound queue was full.
    dropped_messages: AtomicU64,
    /// Fires when the connection should close.
    cancel: CancellationToken,
}

impl ClientConnection {
    /// Create a new connection. `cancel` ends the connection's tasks.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<String>, cancel: CancellationToken) -> Self {
        Self {
            id,
            subscriptions: Mutex::new(HashSet::new()),
            tx,
            seq: Mutex::new(0),
            alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
            cancel,
        }
    }

    /// Receive events for `session_id`. Returns `false` if already subscribed.
    pub fn subscribe(&self, session_id: SessionId) -> bool {
        self.subscriptions.lock().insert(session_id)
    }

    /// Stop receiving events for `session_id`.
    pub fn unsubscribe(&self, session_id: &str) -> bool {
        self.subscriptions.lock().remove(session_id)
    }

    /// Whether events for `session_id` go to this connection.
    pub fn is_subscribed(&self, session_id: &str) -> bool {
        self.subscriptions.lock().contains(session_id)
    }

    /// Current subscriptions, unordered.
    pub fn subscriptions(&self) -> Vec<SessionId> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Queue a text message.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: String) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize a frame and queue it.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match frame.to_json() {
            Ok(json) => self.send(json),
            Err(err) => {
                warn!(conn_id = %self.id, kind = frame.kind(), error = %err, "failed to serialize frame");
                false
            }
        }
    }

    /// Queue a response, waiting for room instead of dropping it.
    ///
    /// Returns `false` only if the write task is gone.
    pub async fn send_response(&self, response: ResponseFrame) -> bool {
        let frame = Frame::Res(response);
        match frame.to_json() {
            Ok(json) => self.tx.send(json).await.is_ok(),
            Err(err) => {
                warn!(conn_id = %self.id, error = %err, "failed to serialize response");
                false
            }
        }
    }

    /// Stamp the next sequence number on `event` and queue it.
    ///
    /// The number is consumed even when the queue is full, so a dropped
    /// event shows up at the client as a gap.
    pub fn send_event(&self, event: &GatewayEvent) -> bool {
        let mut seq = self.seq.lock();
        *seq += 1;
        let frame = Frame::Event(EventFrame {
            event: event.event.clone(),
            payload: event.payload.clone(),
            seq: *seq,
        });
        let sent = self.send_frame(&frame);
        if !sent {
            counter!(WS_EVENTS_DROPPED_TOTAL).increment(1);
        }
        sent
    }

    /// Consume `n` sequence numbers without sending, for events lost
    /// before they reached this connection.
    pub fn skip(&self, n: u64) {
        let mut seq = self.seq.lock();
        *seq = seq.saturating_add(n);
    }

    /// Last sequence number handed out (0 before the first event).
    pub fn last_seq(&self) -> u64 {
        *self.seq.lock()
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound traffic (a pong, a ping, or any frame).
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Whether anything arrived since the previous call. Clears the flag.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Token that fires when the connection closes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Ask the connection's tasks to shut down.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}
