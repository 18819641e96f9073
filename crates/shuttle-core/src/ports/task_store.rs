//! TaskStore port - タスク状態の正本（source of truth）
//!
//! # 設計原則
//! - すべての状態変更は `transition`（compare-and-swap）を通る
//! - Lease の権威はここにある（broker の dequeue は候補通知に過ぎない）
//! - 1 タスク単位でアトミック

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AttemptRecord, Expected, QueueCounts, StoreError, TaskId, TaskRecord, TaskState,
    TransitionFields,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new PENDING task.
    async fn create(&self, task: TaskRecord) -> Result<TaskId, StoreError>;

    /// Compare-and-swap on `expected`; returns the updated row.
    ///
    /// Fails with `StoreError::Conflict` when the stored state (or lease owner)
    /// differs, leaving the row untouched.
    async fn transition(
        &self,
        id: TaskId,
        expected: Expected,
        new_state: TaskState,
        fields: TransitionFields,
    ) -> Result<TaskRecord, StoreError>;

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError>;

    /// PENDING, or RETRY_SCHEDULED with `next_retry_at <= now`, ordered by
    /// priority desc then `created_at` asc.
    async fn list_ready(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError>;

    /// LEASED/RUNNING rows whose lease expiry is before `now`.
    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError>;

    async fn record_attempt(&self, attempt: AttemptRecord) -> Result<(), StoreError>;

    /// Attempt history, ordered by attempt number.
    async fn attempts(&self, id: TaskId) -> Result<Vec<AttemptRecord>, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}
