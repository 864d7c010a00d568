//! Inbound message classification for an established connection.

use relay_core::ids::RequestId;
use relay_core::protocol::{Frame, RequestFrame, ResponseFrame};
use serde_json::Value;
use tracing::{debug, warn};

use crate::rpc::errors;

/// What to do with one inbound text message.
#[derive(Debug)]
pub enum Inbound {
    /// Dispatch this request.
    Request(RequestFrame),
    /// Reply immediately without dispatching.
    Reject(ResponseFrame),
    /// Nothing to do.
    Ignore,
}

/// Classify a text message received after the handshake.
///
/// Only `req` frames are dispatched. Anything else that carries a string
/// `id` gets an `INVALID_REQUEST` reply so the caller is not left waiting;
/// the rest is logged and dropped.
pub fn classify(text: &str) -> Inbound {
    match Frame::parse(text) {
        Ok(Frame::Req(request)) => {
            debug!(id = %request.id, method = %request.method, "request received");
            Inbound::Request(request)
        }
        Ok(other) => reject_or_ignore(text, &format!("Unexpected '{}' frame", other.kind())),
        Err(err) => reject_or_ignore(text, &format!("Invalid frame: {err}")),
    }
}

fn reject_or_ignore(text: &str, message: &str) -> Inbound {
    let id = serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_str).map(RequestId::from));
    match id {
        Some(id) => Inbound::Reject(ResponseFrame::failure(id, errors::INVALID_REQUEST, message)),
        None => {
            warn!(len = text.len(), "dropping unparseable message without id");
            Inbound::Ignore
        }
    }
}
