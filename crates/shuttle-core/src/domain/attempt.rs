//! Attempt history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{LeaseId, TaskId};

/// How one execution attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    /// The worker never reported back before its lease ran out.
    LeaseExpired,
}

/// A single execution attempt of a task.
///
/// This is the "explain why" trail behind the task's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub task_id: TaskId,

    /// 1-indexed attempt number (equals attempt_count at the time it ran).
    pub attempt: u32,
    pub lease: LeaseId,
    pub outcome: AttemptOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn new(
        task_id: TaskId,
        attempt: u32,
        lease: LeaseId,
        outcome: AttemptOutcome,
        error: Option<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            attempt,
            lease,
            outcome,
            error,
            started_at,
            finished_at,
        }
    }
}
