//! Subagent hierarchy tracking and cascading stop.
//!
//! Each spawned subagent run is recorded with the session key of the
//! requester that spawned it. A child's session key can itself be a
//! requester, so entries form a tree keyed by session key.

use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use relay_core::clock;
use relay_core::ids::RunId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::followups::FollowupQueues;
use crate::registry::SessionRegistry;
use crate::runs::RunCoordinator;

/// Reason recorded on runs ended by a cascading stop.
pub const KILLED_REASON: &str = "killed";

/// What happens to the child session once the run is archived.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    /// Keep the child session.
    #[default]
    Keep,
    /// Remove the child session when the entry is swept.
    Delete,
}

/// How a subagent run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    /// Finished normally.
    Ok,
    /// Finished with an error.
    Error,
    /// Ran out of time.
    Timeout,
    /// Stopped by a cascading stop.
    Killed,
}

/// Terminal outcome of a subagent run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentOutcome {
    /// Status.
    pub status: OutcomeStatus,
    /// Free-form reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SubagentOutcome {
    /// Outcome recorded by a cascading stop.
    pub fn killed() -> Self {
        Self {
            status: OutcomeStatus::Killed,
            reason: Some(KILLED_REASON.to_owned()),
        }
    }
}

/// One spawned subagent run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubagentRunEntry {
    /// Run in the child session.
    pub run_id: RunId,
    /// Session key of the child.
    pub child_session_key: String,
    /// Session key that spawned the child.
    pub requester_session_key: String,
    /// Display form of the requester.
    pub requester_display_key: String,
    /// Task description.
    pub task: String,
    /// Cleanup policy.
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    /// Optional label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Registration time, Unix epoch milliseconds.
    pub created_at: u64,
    /// Start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// End time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    /// Terminal outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SubagentOutcome>,
}

impl SubagentRunEntry {
    /// Whether the run has ended.
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Fields supplied when registering a subagent run.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSubagent {
    /// Run in the child session.
    pub run_id: RunId,
    /// Child session key.
    pub child_session_key: String,
    /// Requester session key.
    pub requester_session_key: String,
    /// Display form of the requester. Defaults to the requester key.
    #[serde(default)]
    pub requester_display_key: Option<String>,
    /// Task description.
    #[serde(default)]
    pub task: String,
    /// Cleanup policy.
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    /// Optional label.
    #[serde(default)]
    pub label: Option<String>,
}

/// Side effects a cascading stop needs. Every call is best-effort.
#[cfg_attr(test, mockall::automock)]
pub trait SubagentControl: Send + Sync {
    /// Drop queued follow-ups for a session key. Returns how many.
    fn clear_queues(&self, session_key: &str) -> usize;

    /// Abort the active run of the session bound to `session_key`.
    /// Returns whether a live run was aborted.
    fn abort_session(&self, session_key: &str) -> bool;
}

/// [`SubagentControl`] backed by the runtime's own registries.
pub struct RuntimeControl {
    registry: Arc<SessionRegistry>,
    runs: Arc<RunCoordinator>,
    followups: Arc<FollowupQueues>,
}

impl RuntimeControl {
    /// Wire the control to the runtime.
    pub fn new(
        registry: Arc<SessionRegistry>,
        runs: Arc<RunCoordinator>,
        followups: Arc<FollowupQueues>,
    ) -> Self {
        Self {
            registry,
            runs,
            followups,
        }
    }
}

impl SubagentControl for RuntimeControl {
    fn clear_queues(&self, session_key: &str) -> usize {
        self.followups.clear(session_key)
    }

    fn abort_session(&self, session_key: &str) -> bool {
        self.registry
            .find_by_key(session_key)
            .and_then(|record| self.runs.abort(record.id()))
            .is_some()
    }
}

/// Registry of subagent runs.
#[derive(Default)]
pub struct SubagentTracker {
    entries: Mutex<Vec<SubagentRunEntry>>,
}

impl SubagentTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a spawned run. Re-registering a run ID replaces the entry.
    pub fn register(&self, req: RegisterSubagent) -> SubagentRunEntry {
        let entry = SubagentRunEntry {
            run_id: req.run_id,
            requester_display_key: req
                .requester_display_key
                .unwrap_or_else(|| req.requester_session_key.clone()),
            child_session_key: req.child_session_key,
            requester_session_key: req.requester_session_key,
            task: req.task,
            cleanup: req.cleanup,
            label: req.label,
            created_at: clock::epoch_ms(),
            started_at: None,
            ended_at: None,
            outcome: None,
        };
        let mut entries = self.entries.lock();
        entries.retain(|e| e.run_id != entry.run_id);
        entries.push(entry.clone());
        debug!(
            run_id = %entry.run_id,
            child = %entry.child_session_key,
            requester = %entry.requester_session_key,
            "subagent registered"
        );
        entry
    }

    /// Record the start time. `false` if unknown.
    pub fn mark_started(&self, run_id: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.run_id.as_str() == run_id) else {
            return false;
        };
        if entry.started_at.is_none() {
            entry.started_at = Some(clock::epoch_ms());
        }
        true
    }

    /// Record the outcome. `false` if unknown or already ended.
    pub fn mark_ended(&self, run_id: &str, outcome: SubagentOutcome) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries
            .iter_mut()
            .find(|e| e.run_id.as_str() == run_id && !e.is_ended())
        else {
            return false;
        };
        entry.ended_at = Some(clock::epoch_ms());
        entry.outcome = Some(outcome);
        true
    }

    /// Entry for a run.
    pub fn get(&self, run_id: &str) -> Option<SubagentRunEntry> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.run_id.as_str() == run_id)
            .cloned()
    }

    /// Entries spawned by a requester, in registration order.
    pub fn list_for_requester(&self, requester_session_key: &str) -> Vec<SubagentRunEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.requester_session_key == requester_session_key)
            .cloned()
            .collect()
    }

    /// Total tracked entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// No tracked entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every unended descendant of `requester_session_key`.
    ///
    /// For each distinct child key with an unended run: clear its queues,
    /// abort its run, and mark its entries killed. Recurses into every
    /// child, ended or not. Returns the number of children actually stopped.
    pub fn stop_subagents_for_requester(
        &self,
        requester_session_key: &str,
        control: &dyn SubagentControl,
    ) -> usize {
        let mut visited = HashSet::new();
        let _ = visited.insert(requester_session_key.to_owned());
        let stopped = self.stop_recursive(requester_session_key, control, &mut visited);
        if stopped > 0 {
            counter!("subagents_stopped_total").increment(stopped as u64);
            info!(requester = requester_session_key, stopped, "subagent tree stopped");
        }
        stopped
    }

    fn stop_recursive(
        &self,
        requester: &str,
        control: &dyn SubagentControl,
        visited: &mut HashSet<String>,
    ) -> usize {
        // (child key, has unended run), first-seen order
        let children: Vec<(String, bool)> = {
            let entries = self.entries.lock();
            let mut seen: Vec<(String, bool)> = Vec::new();
            for entry in entries.iter().filter(|e| e.requester_session_key == requester) {
                match seen.iter_mut().find(|(key, _)| *key == entry.child_session_key) {
                    Some((_, live)) => *live |= !entry.is_ended(),
                    None => seen.push((entry.child_session_key.clone(), !entry.is_ended())),
                }
            }
            seen
        };

        let mut stopped = 0;
        for (child, live) in children {
            if live {
                let _ = control.clear_queues(&child);
                let aborted = control.abort_session(&child);
                self.mark_child_killed(requester, &child);
                debug!(child, aborted, "subagent stopped");
                stopped += 1;
            }
            if visited.insert(child.clone()) {
                stopped += self.stop_recursive(&child, control, visited);
            }
        }
        stopped
    }

    fn mark_child_killed(&self, requester: &str, child: &str) {
        let now = clock::epoch_ms();
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut().filter(|e| {
            e.requester_session_key == requester && e.child_session_key == child && !e.is_ended()
        }) {
            entry.ended_at = Some(now);
            entry.outcome = Some(SubagentOutcome::killed());
        }
    }

    /// Drop ended entries older than `archive_after_ms` as of `now_ms`.
    /// Returns the removed entries so callers can apply their cleanup policy.
    pub fn sweep(&self, now_ms: u64, archive_after_ms: u64) -> Vec<SubagentRunEntry> {
        let mut entries = self.entries.lock();
        let mut removed = Vec::new();
        entries.retain(|e| {
            let expired = e
                .ended_at
                .is_some_and(|ended| now_ms.saturating_sub(ended) > archive_after_ms);
            if expired {
                removed.push(e.clone());
            }
            !expired
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn reg(tracker: &SubagentTracker, run: &str, child: &str, requester: &str) {
        let _ = tracker.register(RegisterSubagent {
            run_id: RunId::from(run),
            child_session_key: child.into(),
            requester_session_key: requester.into(),
            task: format!("task for {child}"),
            ..RegisterSubagent::default()
        });
    }

    fn permissive_control() -> MockSubagentControl {
        let mut control = MockSubagentControl::new();
        let _ = control.expect_clear_queues().returning(|_| 0);
        let _ = control.expect_abort_session().returning(|_| true);
        control
    }

    #[test]
    fn register_defaults_display_key() {
        let tracker = SubagentTracker::new();
        reg(&tracker, "r1", "child", "parent");
        let entry = tracker.get("r1").unwrap();
        assert_eq!(entry.requester_display_key, "parent");
        assert_eq!(entry.cleanup, CleanupPolicy::Keep);
        assert!(!entry.is_ended());
    }

    #[test]
    fn cascading_stop_counts_whole_tree() {
        let tracker = SubagentTracker::new();
        reg(&tracker, "r-a", "child-a", "root");
        reg(&tracker, "r-b", "child-b", "root");
        reg(&tracker, "r-a1", "grandchild-a1", "child-a");

        let mut control = MockSubagentControl::new();
        for key in ["child-a", "child-b", "grandchild-a1"] {
            let _ = control
                .expect_clear_queues()
                .with(eq(key))
                .times(1)
                .returning(|_| 0);
            let _ = control
                .expect_abort_session()
                .with(eq(key))
                .times(1)
                .returning(|_| true);
        }

        let stopped = tracker.stop_subagents_for_requester("root", &control);
        assert_eq!(stopped, 3);
        for run in ["r-a", "r-b", "r-a1"] {
            let entry = tracker.get(run).unwrap();
            assert!(entry.is_ended());
            assert_eq!(entry.outcome.unwrap().reason.as_deref(), Some("killed"));
        }
    }

    #[test]
    fn ended_child_is_not_counted_but_cascades() {
        let tracker = SubagentTracker::new();
        reg(&tracker, "r-a", "child-a", "root");
        reg(&tracker, "r-a1", "grandchild", "child-a");
        assert!(tracker.mark_ended(
            "r-a",
            SubagentOutcome {
                status: OutcomeStatus::Ok,
                reason: None,
            }
        ));

        let mut control = MockSubagentControl::new();
        let _ = control
            .expect_clear_queues()
            .with(eq("grandchild"))
            .times(1)
            .returning(|_| 0);
        let _ = control
            .expect_abort_session()
            .with(eq("grandchild"))
            .times(1)
            .returning(|_| false);

        assert_eq!(tracker.stop_subagents_for_requester("root", &control), 1);
        assert_eq!(
            tracker.get("r-a").unwrap().outcome.unwrap().status,
            OutcomeStatus::Ok
        );
        assert_eq!(
            tracker.get("r-a1").unwrap().outcome.unwrap().status,
            OutcomeStatus::Killed
        );
    }

    #[test]
    fn duplicate_child_keys_stopped_once() {
        let tracker = SubagentTracker::new();
        reg(&tracker, "r1", "child", "root");
        reg(&tracker, "r2", "child", "root");

        let mut control = MockSubagentControl::new();
        let _ = control.expect_clear_queues().times(1).returning(|_| 0);
        let _ = control.expect_abort_session().times(1).returning(|_| true);

        assert_eq!(tracker.stop_subagents_for_requester("root", &control), 1);
        assert!(tracker.get("r1").unwrap().is_ended());
        assert!(tracker.get("r2").unwrap().is_ended());
    }

    #[test]
    fn second_stop_is_noop() {
        let tracker = SubagentTracker::new();
        reg(&tracker, "r1", "child", "root");
        let control = permissive_control();
        assert_eq!(tracker.stop_subagents_for_requester("root", &control), 1);
        assert_eq!(tracker.stop_subagents_for_requester("root", &control), 0);
    }

    #[test]
    fn cycle_in_keys_terminates() {
        let tracker = SubagentTracker::new();
        reg(&tracker, "r1", "b", "a");
        reg(&tracker, "r2", "a", "b");
        let control = permissive_control();
        assert_eq!(tracker.stop_subagents_for_requester("a", &control), 2);
    }

    #[test]
    fn unknown_requester_stops_nothing() {
        let tracker = SubagentTracker::new();
        let control = MockSubagentControl::new();
        assert_eq!(tracker.stop_subagents_for_requester("nobody", &control), 0);
    }

    #[test]
    fn mark_ended_only_once() {
        let tracker = SubagentTracker::new();
        reg(&tracker, "r1", "child", "root");
        assert!(tracker.mark_started("r1"));
        assert!(tracker.mark_ended("r1", SubagentOutcome::killed()));
        assert!(!tracker.mark_ended("r1", SubagentOutcome::killed()));
        assert!(!tracker.mark_started("missing"));
    }

    #[test]
    fn sweep_drops_old_ended_entries() {
        let tracker = SubagentTracker::new();
        reg(&tracker, "r1", "c1", "root");
        reg(&tracker, "r2", "c2", "root");
        assert!(tracker.mark_ended("r1", SubagentOutcome::killed()));
        let ended = tracker.get("r1").unwrap().ended_at.unwrap();

        assert!(tracker.sweep(ended + 10, 100).is_empty());
        let removed = tracker.sweep(ended + 101, 100);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].run_id.as_str(), "r1");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn list_for_requester() {
        let tracker = SubagentTracker::new();
        reg(&tracker, "r1", "c1", "root");
        reg(&tracker, "r2", "c2", "other");
        let listed = tracker.list_for_requester("root");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].child_session_key, "c1");
    }
}
