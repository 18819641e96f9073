//! Task record: the persisted row for one task, and its compare-and-swap rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StoreError;
use super::ids::{LeaseId, TaskId};
use super::state::TaskState;
use super::task_type::TaskType;

/// One row per task.
///
/// Design:
/// - The store owns these rows; everyone else sees clones.
/// - Mutation only goes through [`TaskRecord::transition`], which is the
///   compare-and-swap every store implementation delegates to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    pub state: TaskState,

    /// Number of execution attempts started so far.
    pub attempt_count: u32,
    pub max_attempts: u32,

    /// Higher dequeues first.
    pub priority: i32,

    pub lease_owner: Option<LeaseId>,
    pub lease_expiry: Option<DateTime<Utc>>,

    pub result: Option<Vec<u8>>,

    /// Last handler error (or the cancellation reason).
    pub error: Option<String>,

    /// Set by `cancel` while the task is running.
    pub cancel_requested: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// CAS precondition: the stored state, and for lease-holder transitions the
/// stored lease owner, must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected {
    pub state: TaskState,
    pub lease: Option<LeaseId>,
}

impl Expected {
    pub fn state(state: TaskState) -> Self {
        Self { state, lease: None }
    }

    pub fn leased_by(state: TaskState, lease: LeaseId) -> Self {
        Self {
            state,
            lease: Some(lease),
        }
    }
}

/// Column updates that travel with a transition. `None` leaves a column as is
/// (subject to the per-state clearing rules in [`TaskRecord::transition`]).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionFields {
    pub lease: Option<(LeaseId, DateTime<Utc>)>,
    pub attempt_count: Option<u32>,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub cancel_requested: Option<bool>,
}

impl TransitionFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, owner: LeaseId, expiry: DateTime<Utc>) -> Self {
        self.lease = Some((owner, expiry));
        self
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = Some(attempt_count);
        self
    }

    pub fn with_result(mut self, result: Vec<u8>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn with_cancel_requested(mut self) -> Self {
        self.cancel_requested = Some(true);
        self
    }
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        payload: Vec<u8>,
        priority: i32,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            payload,
            state: TaskState::Pending,
            attempt_count: 0,
            max_attempts,
            priority,
            lease_owner: None,
            lease_expiry: None,
            result: None,
            error: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
        }
    }

    /// PENDING, or RETRY_SCHEDULED whose retry time has come.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            TaskState::Pending => true,
            TaskState::RetryScheduled => self.next_retry_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// LEASED/RUNNING whose lease expiry has passed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.holds_lease() && self.lease_expiry.is_none_or(|at| at < now)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Compare-and-swap transition.
    ///
    /// The row is only modified when every check passes; on error it is left
    /// untouched.
    pub fn transition(
        &mut self,
        expected: Expected,
        new_state: TaskState,
        fields: TransitionFields,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let lease_mismatch = expected
            .lease
            .is_some_and(|lease| self.lease_owner != Some(lease));
        if self.state != expected.state || lease_mismatch {
            return Err(StoreError::Conflict {
                id: self.id,
                expected: expected.state,
                actual: self.state,
            });
        }
        if !self.state.can_transition_to(new_state) {
            return Err(StoreError::IllegalTransition {
                from: self.state,
                to: new_state,
            });
        }

        let mut next = self.clone();
        next.state = new_state;
        next.updated_at = now;

        if new_state.holds_lease() {
            if let Some((owner, expiry)) = fields.lease {
                next.lease_owner = Some(owner);
                next.lease_expiry = Some(expiry);
            }
            if next.lease_owner.is_none() || next.lease_expiry.is_none() {
                return Err(StoreError::Invariant(format!(
                    "{new_state} requires a lease owner and expiry"
                )));
            }
        } else {
            next.lease_owner = None;
            next.lease_expiry = None;
        }

        if new_state == TaskState::RetryScheduled {
            match fields.next_retry_at {
                // A time already passed means "ready now".
                Some(at) => next.next_retry_at = Some(at.max(now)),
                // Same-state touch keeps the existing retry time.
                None if self.state == TaskState::RetryScheduled => {}
                None => {
                    return Err(StoreError::Invariant(
                        "RETRY_SCHEDULED requires next_retry_at".to_string(),
                    ));
                }
            }
        } else {
            next.next_retry_at = None;
        }

        if let Some(attempt_count) = fields.attempt_count {
            next.attempt_count = attempt_count;
        }
        if next.attempt_count > next.max_attempts {
            return Err(StoreError::Invariant(format!(
                "attempt_count {} exceeds max_attempts {}",
                next.attempt_count, next.max_attempts
            )));
        }

        if let Some(result) = fields.result {
            next.result = Some(result);
        }
        if new_state == TaskState::Succeeded {
            next.error = None;
        } else if let Some(error) = fields.error {
            next.error = Some(error);
        }
        if let Some(flag) = fields.cancel_requested {
            next.cancel_requested = flag;
        }

        *self = next;
        Ok(())
    }
}
