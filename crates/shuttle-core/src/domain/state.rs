//! Task state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Task state.
///
/// State transitions:
/// - Pending -> Leased -> Running -> Succeeded
/// - Running -> RetryScheduled -> Leased (loop until max_attempts)
/// - Running -> Dead (when max_attempts is reached)
/// - Running -> Failed (permanent handler error, or cancelled while running)
/// - Pending | RetryScheduled | Leased -> Failed (cancel)
/// - Leased | Running -> RetryScheduled | Dead (lease reclamation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Submitted, waiting for its first dispatch.
    Pending,

    /// Claimed by a worker slot, not started yet.
    Leased,

    /// Currently being executed by a worker slot.
    Running,

    /// Successfully completed.
    Succeeded,

    /// Failed permanently (non-retryable error or cancellation).
    Failed,

    /// Waiting for retry (delayed due to backoff).
    RetryScheduled,

    /// Attempts exhausted.
    Dead,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Pending,
        TaskState::Leased,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::RetryScheduled,
        TaskState::Dead,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Dead
        )
    }

    /// Can a dispatcher lease a task in this state?
    pub fn is_dispatchable(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::RetryScheduled)
    }

    /// Does this state require a live lease_owner / lease_expiry?
    pub fn holds_lease(self) -> bool {
        matches!(self, TaskState::Leased | TaskState::Running)
    }

    /// Is `self -> to` an edge of the lifecycle?
    ///
    /// Same-state edges exist for the states whose rows get touched in place
    /// (reconcile bumps `updated_at`, cancel flags a running task).
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        match (self, to) {
            (Pending, Pending | Leased | Failed) => true,
            (RetryScheduled, RetryScheduled | Leased | Failed) => true,
            (Leased, Running | RetryScheduled | Failed) => true,
            (Running, Running | Succeeded | Failed | RetryScheduled | Dead) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Leased => "LEASED",
            TaskState::Running => "RUNNING",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::RetryScheduled => "RETRY_SCHEDULED",
            TaskState::Dead => "DEAD",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
