//! Event fan-out to connected WebSocket clients.

use std::collections::HashMap;
use std::sync::Arc;

use relay_core::ids::ConnectionId;
use relay_runtime::GatewayEvent;
use relay_runtime::events::names;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::connection::ClientConnection;

/// Connected clients, indexed by connection ID.
#[derive(Default)]
pub struct BroadcastManager {
    connections: RwLock<HashMap<ConnectionId, Arc<ClientConnection>>>,
}

impl BroadcastManager {
    /// Create a new broadcast manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection.
    pub async fn add(&self, connection: Arc<ClientConnection>) {
        let mut conns = self.connections.write().await;
        let _ = conns.insert(connection.id.clone(), connection);
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, connection_id: &str) {
        let mut conns = self.connections.write().await;
        let _ = conns.remove(connection_id);
    }

    /// Look up a connection.
    pub async fn get(&self, connection_id: &str) -> Option<Arc<ClientConnection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    /// Send an event to every connection subscribed to `session_id`.
    /// Returns how many connections accepted it.
    pub async fn broadcast_to_session(&self, session_id: &str, event: &GatewayEvent) -> usize {
        let conns = self.connections.read().await;
        let mut delivered = 0;
        for conn in conns.values().filter(|c| c.is_subscribed(session_id)) {
            if conn.send_event(event) {
                delivered += 1;
            } else {
                warn!(conn_id = %conn.id, session_id, event = %event.event, "event dropped, outbound queue full");
            }
        }
        debug!(event = %event.event, session_id, delivered, "broadcast event to session");
        delivered
    }

    /// Send an event to every connection.
    pub async fn broadcast_all(&self, event: &GatewayEvent) -> usize {
        let conns = self.connections.read().await;
        let mut delivered = 0;
        for conn in conns.values() {
            if conn.send_event(event) {
                delivered += 1;
            } else {
                warn!(conn_id = %conn.id, event = %event.event, "event dropped, outbound queue full");
            }
        }
        debug!(event = %event.event, recipients = conns.len(), delivered, "broadcast event to all");
        delivered
    }

    /// Route an event by its session scope.
    ///
    /// `session.removed` is the last event a subscriber sees for that
    /// session; the subscription is dropped after delivery.
    pub async fn dispatch(&self, event: &GatewayEvent) -> usize {
        let Some(session_id) = &event.session_id else {
            return self.broadcast_all(event).await;
        };
        let delivered = self.broadcast_to_session(session_id, event).await;
        if event.event == names::SESSION_REMOVED {
            let _ = self.unsubscribe_all(session_id).await;
        }
        delivered
    }

    /// Drop every subscription to `session_id`.
    pub async fn unsubscribe_all(&self, session_id: &str) -> usize {
        let conns = self.connections.read().await;
        conns.values().filter(|c| c.unsubscribe(session_id)).count()
    }

    /// Advance every connection's sequence by `n` for events that were
    /// lost before dispatch. The owning sessions are unknown, so all
    /// connections see the gap.
    pub async fn skip_seq(&self, n: u64) {
        for conn in self.connections.read().await.values() {
            conn.skip(n);
        }
    }

    /// Close every connection.
    pub async fn close_all(&self) {
        for conn in self.connections.read().await.values() {
            conn.close();
        }
    }

    /// Number of active connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
