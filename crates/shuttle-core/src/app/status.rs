//! Status - API 層に返すタスクのビューと集計

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{TaskId, TaskRecord, TaskState, TaskType};

/// What `get_status` returns: the row minus payload and lease internals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: TaskId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub priority: i32,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub lease_expiry: Option<DateTime<Utc>>,
}

impl TaskView {
    /// Decode a JSON result written by a typed handler.
    pub fn decode_result<O: DeserializeOwned>(&self) -> Option<Result<O, serde_json::Error>> {
        self.result.as_deref().map(serde_json::from_slice)
    }
}

impl From<&TaskRecord> for TaskView {
    fn from(r: &TaskRecord) -> Self {
        Self {
            id: r.id,
            task_type: r.task_type.clone(),
            state: r.state,
            attempt_count: r.attempt_count,
            max_attempts: r.max_attempts,
            priority: r.priority,
            result: r.result.clone(),
            error: r.error.clone(),
            cancel_requested: r.cancel_requested,
            created_at: r.created_at,
            updated_at: r.updated_at,
            next_retry_at: r.next_retry_at,
            lease_expiry: r.lease_expiry,
        }
    }
}
