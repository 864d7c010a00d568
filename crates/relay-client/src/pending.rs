//! Correlation table for requests written to the socket.

use std::collections::HashMap;

use relay_core::ids::RequestId;
use relay_core::protocol::ResponseFrame;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::ClientError;

pub(crate) type Reply = oneshot::Sender<Result<Value, ClientError>>;

struct PendingRequest {
    method: String,
    reply: Reply,
}

/// In-flight requests on the current connection, keyed by request ID.
#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: HashMap<RequestId, PendingRequest>,
}

impl PendingRequests {
    pub(crate) fn insert(&mut self, id: RequestId, method: String, reply: Reply) {
        let _ = self.entries.insert(id, PendingRequest { method, reply });
    }

    /// Complete the matching request. Responses with an unknown ID (a
    /// request that already timed out, typically) are discarded.
    pub(crate) fn resolve(&mut self, frame: ResponseFrame) -> bool {
        let Some(pending) = self.entries.remove(frame.id.as_str()) else {
            debug!(id = %frame.id, "discarding response for unknown request");
            return false;
        };
        let id = frame.id.clone();
        let result = frame.into_result().map_err(ClientError::from);
        if pending.reply.send(result).is_err() {
            debug!(%id, method = %pending.method, "caller went away before response");
        }
        true
    }

    /// Forget one request.
    pub(crate) fn cancel(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Fail every in-flight request with `err`.
    pub(crate) fn reject_all(&mut self, err: &ClientError) -> usize {
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            let _ = pending.reply.send(Err(err.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
