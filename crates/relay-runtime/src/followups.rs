//! Per-session follow-up queues.
//!
//! When a run is submitted with `queue` set and the session is busy, the
//! input waits here and starts when the active run ends. Keys are session
//! keys, so a cascading stop can clear a child's queue without knowing its
//! session ID.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::Value;

/// One queued run input.
#[derive(Clone, Debug, PartialEq)]
pub struct FollowupItem {
    /// Run input.
    pub input: Value,
    /// Idempotency key carried to the run when it starts.
    pub idempotency_key: Option<String>,
}

/// FIFO queues keyed by session key.
#[derive(Default)]
pub struct FollowupQueues {
    queues: Mutex<HashMap<String, VecDeque<FollowupItem>>>,
}

impl FollowupQueues {
    /// Empty set of queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item. Returns the queue depth after insertion.
    pub fn enqueue(&self, session_key: &str, item: FollowupItem) -> usize {
        let mut queues = self.queues.lock();
        let queue = queues.entry(session_key.to_owned()).or_default();
        queue.push_back(item);
        queue.len()
    }

    /// Pop the oldest item.
    pub fn drain_next(&self, session_key: &str) -> Option<FollowupItem> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(session_key)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            let _ = queues.remove(session_key);
        }
        item
    }

    /// Drop everything queued for a key. Returns how many items were dropped.
    pub fn clear(&self, session_key: &str) -> usize {
        self.queues
            .lock()
            .remove(session_key)
            .map_or(0, |q| q.len())
    }

    /// Items waiting for a key.
    pub fn depth(&self, session_key: &str) -> usize {
        self.queues.lock().get(session_key).map_or(0, VecDeque::len)
    }

    /// Whether an item with this idempotency key is already waiting.
    pub fn contains_idempotency_key(&self, session_key: &str, key: &str) -> bool {
        self.queues.lock().get(session_key).is_some_and(|q| {
            q.iter()
                .any(|item| item.idempotency_key.as_deref() == Some(key))
        })
    }
}
