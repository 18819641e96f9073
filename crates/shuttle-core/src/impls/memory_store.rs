//! In-memory TaskStore implementation (development and tests).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    AttemptRecord, Expected, QueueCounts, StoreError, TaskId, TaskRecord, TaskState,
    TransitionFields,
};
use crate::ports::{Clock, SystemClock, TaskStore};

#[derive(Default)]
struct StoreState {
    /// All task rows (single source of truth).
    tasks: HashMap<TaskId, TaskRecord>,

    /// Attempt history per task, ordered by attempt number.
    attempts: HashMap<TaskId, Vec<AttemptRecord>>,

    /// Number of upcoming calls that fail with `Unavailable`.
    fail_next: u32,
}

impl StoreState {
    fn check_available(&mut self) -> Result<(), StoreError> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

/// In-memory store.
///
/// Design:
/// - One `Mutex` guards every row, so each call is atomic.
/// - CAS rules live in `TaskRecord::transition`; this type only routes to them.
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
        }
    }

    /// Make the next `n` calls fail with `StoreError::Unavailable`.
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.fail_next = n;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: TaskRecord) -> Result<TaskId, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if state.tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        if task.state != TaskState::Pending {
            return Err(StoreError::Invariant(format!(
                "new task {} must be PENDING, got {}",
                task.id, task.state
            )));
        }
        let id = task.id;
        state.tasks.insert(id, task);
        Ok(id)
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: Expected,
        new_state: TaskState,
        fields: TransitionFields,
    ) -> Result<TaskRecord, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_available()?;
        let record = state.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.transition(expected, new_state, fields, now)?;
        Ok(record.clone())
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.tasks.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    async fn list_ready(&self, limit: usize) -> Result<Vec<TaskRecord>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.check_available()?;
        let mut ready: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| t.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        ready.truncate(limit);
        Ok(ready)
    }

    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let mut expired: Vec<TaskRecord> = state
            .tasks
            .values()
            .filter(|t| t.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|t| t.lease_expiry);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn record_attempt(&self, attempt: AttemptRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if !state.tasks.contains_key(&attempt.task_id) {
            return Err(StoreError::NotFound(attempt.task_id));
        }
        let history = state.attempts.entry(attempt.task_id).or_default();
        let at = history.partition_point(|a| a.attempt <= attempt.attempt);
        history.insert(at, attempt);
        Ok(())
    }

    async fn attempts(&self, id: TaskId) -> Result<Vec<AttemptRecord>, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if !state.tasks.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        Ok(state.attempts.get(&id).cloned().unwrap_or_default())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        let mut counts = QueueCounts::default();
        for record in state.tasks.values() {
            counts.add(record.state);
        }
        Ok(counts)
    }
}
