//! Event bridge: forwards runtime events to WebSocket clients.

use std::sync::Arc;

use metrics::counter;
use relay_runtime::GatewayEvent;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::broadcast::BroadcastManager;
use crate::metrics::WS_EVENTS_DROPPED_TOTAL;

/// Bridges [`relay_runtime::EventEmitter`] output to the connections.
pub struct EventBridge {
    rx: broadcast::Receiver<GatewayEvent>,
    broadcast: Arc<BroadcastManager>,
}

impl EventBridge {
    /// Create a new event bridge.
    pub fn new(rx: broadcast::Receiver<GatewayEvent>, broadcast: Arc<BroadcastManager>) -> Self {
        Self { rx, broadcast }
    }

    /// Run until `cancel` fires or the emitter is dropped.
    #[tracing::instrument(skip_all, name = "event_bridge")]
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = self.rx.recv() => received,
            };
            match received {
                Ok(event) => {
                    tracing::trace!(event = %event.event, "bridging event");
                    let _ = self.broadcast.dispatch(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    counter!(WS_EVENTS_DROPPED_TOTAL).increment(n);
                    tracing::warn!(lagged = n, "event bridge lagged");
                    self.broadcast.skip_seq(n).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("event emitter closed, bridge exiting");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::connection::ClientConnection;
    use relay_core::protocol::Frame;
    use relay_runtime::EventEmitter;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn forwards_events_until_cancelled() {
        let emitter = EventEmitter::new();
        let bm = Arc::new(BroadcastManager::new());
        let (tx, mut rx) = mpsc::channel(8);
        bm.add(Arc::new(ClientConnection::new(
            "c1".into(),
            tx,
            CancellationToken::new(),
        )))
        .await;

        let cancel = CancellationToken::new();
        let bridge = EventBridge::new(emitter.subscribe(), Arc::clone(&bm));
        let handle = tokio::spawn(bridge.run(cancel.clone()));

        let _ = emitter.emit(GatewayEvent::global("session.created", json!({ "k": 1 })));
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(text.contains("\"seq\":1"));
        assert!(text.contains("session.created"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn lag_surfaces_as_seq_gap() {
        let emitter = EventEmitter::with_capacity(4);
        let bm = Arc::new(BroadcastManager::new());
        let (tx, mut rx) = mpsc::channel(16);
        bm.add(Arc::new(ClientConnection::new(
            "c1".into(),
            tx,
            CancellationToken::new(),
        )))
        .await;

        let bridge = EventBridge::new(emitter.subscribe(), Arc::clone(&bm));
        for i in 0..10 {
            let _ = emitter.emit(GatewayEvent::global("tick", json!({ "i": i })));
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(bridge.run(cancel.clone()));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let frame = match Frame::parse(&text).unwrap() {
                Frame::Event(ev) => ev,
                other => panic!("expected event, got {}", other.kind()),
            };
            seen.push((frame.payload["i"].as_u64().unwrap(), frame.seq));
        }
        // six events were overwritten before the bridge read them
        assert_eq!(seen, vec![(6, 7), (7, 8), (8, 9), (9, 10)]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn exits_when_emitter_dropped() {
        let emitter = EventEmitter::new();
        let bridge = EventBridge::new(emitter.subscribe(), Arc::new(BroadcastManager::new()));
        drop(emitter);
        tokio::time::timeout(Duration::from_secs(2), bridge.run(CancellationToken::new()))
            .await
            .unwrap();
    }
}
