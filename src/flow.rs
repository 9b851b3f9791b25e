//! The conductor's append-only task-flow log.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a single task-flow entry.
///
/// ```text
///   (none) -> REQUESTED -> RUNNING -> { SUCCEEDED | FAILED | ERRORED | CANCELED }
///                      \-> PAUSED -/
/// ```
/// Terminal states are absorbing; re-entry after a terminal state requires a
/// new flow entry (a new sequence index), not a mutation of the old one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Requested,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Errored,
    Canceled,
    Paused,
    Resuming,
}

impl TaskState {
    /// Terminal states are ones from which the conductor will never move the
    /// same flow entry forward again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Errored | TaskState::Canceled
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, TaskState::Succeeded)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Errored)
    }

    /// Lowercase keyword used inside `task_state(id) in [...]` criteria
    /// expressions — distinct from the `SCREAMING_SNAKE_CASE` wire form of
    /// the `state` field itself, matching `orchestra.states` constants
    /// (`'succeeded'`, `'failed'`, ...).
    pub fn as_lower(self) -> &'static str {
        match self {
            TaskState::Requested => "requested",
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Errored => "errored",
            TaskState::Canceled => "canceled",
            TaskState::Paused => "paused",
            TaskState::Resuming => "resuming",
        }
    }

    /// The `on-*` clauses a transition into this state triggers, per spec
    /// §4.4's state-to-clause mapping.
    pub fn triggered_clauses(self) -> &'static [&'static str] {
        if self.is_success() {
            &["on-success", "on-complete"]
        } else if self.is_failure() {
            &["on-error", "on-complete"]
        } else {
            &[]
        }
    }
}

/// One record in the flow sequence: a task's id, its current state, and the
/// index of its associated context snapshot (if any) in the conductor's
/// context array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskFlowEntry {
    pub id: String,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctx_idx: Option<usize>,
    /// Retry attempt number for this entry (0 for the first attempt).
    #[serde(default)]
    pub retry_attempt: u32,
    /// Expression errors accumulated while finalizing this entry's context.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    /// Per-destination post-finalize context index, populated when this
    /// entry reaches a terminal state and its outgoing transitions are
    /// evaluated. Keyed by destination task id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub published: BTreeMap<String, usize>,
}

impl TaskFlowEntry {
    pub fn new(id: impl Into<String>, state: TaskState) -> Self {
        Self {
            id: id.into(),
            state,
            ctx_idx: None,
            retry_attempt: 0,
            errors: Vec::new(),
            published: BTreeMap::new(),
        }
    }
}

/// The ordered, append-only history of task-flow entries plus the array of
/// context snapshots they reference.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FlowSequence {
    pub sequence: Vec<TaskFlowEntry>,
    pub contexts: Vec<crate::context::Context>,
}

impl FlowSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent flow entry for `task_id`, if any.
    pub fn last_entry(&self, task_id: &str) -> Option<&TaskFlowEntry> {
        self.sequence.iter().rev().find(|e| e.id == task_id)
    }

    pub fn last_entry_mut(&mut self, task_id: &str) -> Option<&mut TaskFlowEntry> {
        self.sequence.iter_mut().rev().find(|e| e.id == task_id)
    }

    /// Append a context snapshot and return its index.
    pub fn push_ctx(&mut self, ctx: crate::context::Context) -> usize {
        self.contexts.push(ctx);
        self.contexts.len() - 1
    }

    pub fn ctx_at(&self, idx: usize) -> Option<&crate::context::Context> {
        self.contexts.get(idx)
    }
}
