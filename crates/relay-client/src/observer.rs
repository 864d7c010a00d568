//! Connection lifecycle callbacks.

use relay_core::protocol::{EventFrame, HelloOk};
use tokio::sync::mpsc;

use crate::errors::ClientError;
use crate::sequencer::Gap;

/// Callbacks invoked from the client's driver task. Implementations must
/// not block.
pub trait ClientObserver: Send + Sync {
    /// Handshake completed.
    fn on_hello_ok(&self, _hello: &HelloOk) {}

    /// An event arrived (in order, or ahead of a gap).
    fn on_event(&self, _event: &EventFrame) {}

    /// Events were skipped; the consumer should refetch state.
    fn on_gap(&self, _gap: Gap) {}

    /// The socket closed.
    fn on_close(&self, _code: u16, _reason: &str) {}

    /// A connection attempt failed, or the client gave up.
    fn on_connect_error(&self, _error: &ClientError) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ClientObserver for NoopObserver {}

/// Everything [`ChannelObserver`] forwards.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientNotification {
    /// Handshake completed.
    HelloOk(HelloOk),
    /// Event delivered.
    Event(EventFrame),
    /// Sequence gap.
    Gap(Gap),
    /// Socket closed.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Connection failure.
    ConnectError(ClientError),
}

/// Observer that forwards every callback into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ClientNotification>,
}

impl ChannelObserver {
    /// Observer plus the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, notification: ClientNotification) {
        let _ = self.tx.send(notification);
    }
}

impl ClientObserver for ChannelObserver {
    fn on_hello_ok(&self, hello: &HelloOk) {
        self.forward(ClientNotification::HelloOk(hello.clone()));
    }

    fn on_event(&self, event: &EventFrame) {
        self.forward(ClientNotification::Event(event.clone()));
    }

    fn on_gap(&self, gap: Gap) {
        self.forward(ClientNotification::Gap(gap));
    }

    fn on_close(&self, code: u16, reason: &str) {
        self.forward(ClientNotification::Closed {
            code,
            reason: reason.to_owned(),
        });
    }

    fn on_connect_error(&self, error: &ClientError) {
        self.forward(ClientNotification::ConnectError(error.clone()));
    }
}
