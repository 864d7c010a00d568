//! Event sequence tracking and gap detection.

use serde::Serialize;

/// A jump in the event sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Gap {
    /// Sequence number that was due.
    pub expected: u64,
    /// Sequence number that arrived.
    pub received: u64,
}

/// What to do with an inbound event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeqDecision {
    /// In order.
    Deliver,
    /// Ahead of the expected number: deliver, and report the gap so the
    /// consumer can refetch authoritative state.
    DeliverWithGap(Gap),
    /// Already delivered.
    Drop,
}

/// Per-connection sequence tracker.
///
/// The first event after [`reset`](Self::reset) is accepted as-is: numbering
/// restarts with each connection, so events are never compared across an
/// outage.
#[derive(Debug, Default)]
pub struct EventSequencer {
    expected: Option<u64>,
}

impl EventSequencer {
    /// Fresh tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `seq` and advance.
    pub fn observe(&mut self, seq: u64) -> SeqDecision {
        let decision = match self.expected {
            None => SeqDecision::Deliver,
            Some(expected) if seq == expected => SeqDecision::Deliver,
            Some(expected) if seq > expected => SeqDecision::DeliverWithGap(Gap {
                expected,
                received: seq,
            }),
            Some(_) => return SeqDecision::Drop,
        };
        self.expected = Some(seq.saturating_add(1));
        decision
    }

    /// Forget the previous connection's numbering.
    pub fn reset(&mut self) {
        self.expected = None;
    }

    /// Next sequence number due, if any event has been seen.
    pub fn expected(&self) -> Option<u64> {
        self.expected
    }
}
