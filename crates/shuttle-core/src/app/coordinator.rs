//! LifecycleCoordinator - タスクのライフサイクルを束ねる状態機械
//!
//! TaskStore への `transition` を呼ぶのはこの型だけです。
//! 1 タスクあたりの単一書き込み者は compare-and-swap で保証し、ロックは使いません。
//!
//! # フロー
//! 1. `submit`: 検証 → TaskStore に PENDING で保存 → broker に enqueue
//! 2. `claim`: dequeue されたメッセージを TaskStore と突き合わせ、
//!    PENDING|RETRY_SCHEDULED → LEASED → RUNNING（重複配送なら ack して捨てる）
//! 3. `settle`: handler の結果で SUCCEEDED / RETRY_SCHEDULED / DEAD / FAILED へ遷移し ack / nack
//! 4. `reclaim_expired`: lease 期限切れを回収（ReaperLoop から）
//! 5. `reconcile_orphans`: broker から消えた ready タスクを再配送（ReconcileLoop から）

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::status::TaskView;
use crate::config::EngineConfig;
use crate::domain::{
    AttemptOutcome, AttemptRecord, BrokerError, DeliveryId, Expected, HandlerError, LeaseId,
    QueueCounts, RetryDecision, RetryPolicy, ShuttleError, StoreError, TaskId, TaskRecord, TaskState,
    TaskType, TransitionFields,
};
use crate::ports::{Clock, Delivery, IdGenerator, JitterSource, QueueBroker, TaskStore};
use crate::typed::{HandlerRegistry, Task};

/// Error recorded on tasks failed by `cancel`.
pub const CANCELLED_ERROR: &str = "cancelled by request";

/// Error recorded when a running task's lease runs out.
pub const LEASE_EXPIRED_ERROR: &str = "lease expired before the worker reported back";

/// A claimed, running task. Only valid until `lease.expires_at`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub task_id: TaskId,
    pub lease_id: LeaseId,
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    /// 1-indexed attempt number of this execution.
    pub attempt: u32,
    pub token: DeliveryId,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// What to do with a dequeued message.
#[derive(Debug)]
pub enum Claim {
    /// Leased and marked RUNNING; hand it to a slot.
    Leased(Lease),
    /// Duplicate or stale delivery; already acked.
    Duplicate,
    /// Retry time not reached; already nacked with the remaining delay.
    Deferred(Duration),
    /// Cancel was requested before it could run; already acked.
    Cancelled,
}

/// How an attempt (or a reclaimed lease) was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Succeeded,
    Retrying { at: DateTime<Utc> },
    Dead,
    Failed,
    /// The lease was lost (reclaimed or already terminal); the outcome was dropped.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailurePlan {
    Retry(DateTime<Utc>),
    Dead,
    Failed,
    Cancelled,
}

/// Where the follow-up message for a retry comes from.
#[derive(Debug, Clone, Copy)]
enum Redelivery {
    /// Settle the delivery we hold (nack with delay / ack).
    Token(DeliveryId),
    /// No delivery in hand (reclaim); publish a fresh message.
    Publish,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    lease_id: LeaseId,
    token: DeliveryId,
}

pub struct LifecycleCoordinator {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn QueueBroker>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    jitter: Arc<dyn JitterSource>,
    retry_policy: RetryPolicy,
    config: EngineConfig,

    /// Outstanding leases held by this process.
    in_flight: Mutex<HashMap<TaskId, InFlight>>,

    /// Acks that failed while the broker was down.
    pending_acks: Mutex<Vec<DeliveryId>>,
}

impl LifecycleCoordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn QueueBroker>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        jitter: Arc<dyn JitterSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            retry_policy: config.retry_policy(),
            store,
            broker,
            registry,
            clock,
            ids,
            jitter,
            config,
            in_flight: Mutex::new(HashMap::new()),
            pending_acks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ------------------------------------------------------------------
    // API surface
    // ------------------------------------------------------------------

    /// Validate and persist a task, then publish it.
    ///
    /// Once the row is stored the call succeeds even if the broker is down;
    /// the reconcile loop publishes the task later.
    pub async fn submit(
        &self,
        task_type: &str,
        payload: Vec<u8>,
        priority: i32,
        max_attempts: Option<u32>,
    ) -> Result<TaskId, ShuttleError> {
        let task_type = TaskType::parse(task_type).map_err(ShuttleError::Validation)?;
        if !self.registry.contains(&task_type) {
            return Err(ShuttleError::Validation(format!(
                "no handler registered for task type '{task_type}'"
            )));
        }
        let max_attempts = max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(ShuttleError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let id = self.ids.generate_task_id();
        let record = TaskRecord::new(
            id,
            task_type.clone(),
            payload,
            priority,
            max_attempts,
            self.clock.now(),
        );
        self.with_store_retry("create", || self.store.create(record.clone()))
            .await?;
        info!(task_id = %id, %task_type, priority, max_attempts, "task submitted");

        if let Err(e) = self.broker.enqueue(id, priority, Duration::ZERO).await {
            warn!(task_id = %id, error = %e, "enqueue failed; reconcile loop will republish");
        }
        Ok(id)
    }

    /// `submit` for a typed task (payload encoded as JSON).
    pub async fn submit_typed<T: Task>(
        &self,
        task: &T,
        priority: i32,
        max_attempts: Option<u32>,
    ) -> Result<TaskId, ShuttleError> {
        let payload = serde_json::to_vec(task)
            .map_err(|e| ShuttleError::Validation(format!("payload encode: {e}")))?;
        self.submit(T::TYPE, payload, priority, max_attempts).await
    }

    pub async fn get_status(&self, id: TaskId) -> Result<TaskView, ShuttleError> {
        let record = self.get(id).await?;
        Ok(TaskView::from(&record))
    }

    pub async fn attempts(&self, id: TaskId) -> Result<Vec<AttemptRecord>, ShuttleError> {
        Ok(self
            .with_store_retry("attempts", || self.store.attempts(id))
            .await?)
    }

    pub async fn counts(&self) -> Result<QueueCounts, ShuttleError> {
        Ok(self.with_store_retry("counts", || self.store.counts()).await?)
    }

    /// Leases currently held by this process.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Advisory cancel.
    ///
    /// Not yet running (PENDING / RETRY_SCHEDULED / LEASED): FAILED right away.
    /// RUNNING: the attempt finishes; a success is kept, a failure that would
    /// retry ends FAILED instead.
    pub async fn cancel(&self, id: TaskId) -> Result<TaskView, ShuttleError> {
        loop {
            let task = self.get(id).await?;
            if task.state.is_terminal() {
                return Err(ShuttleError::AlreadyTerminal {
                    id,
                    state: task.state,
                });
            }

            let attempt = if task.state == TaskState::Running {
                if task.cancel_requested {
                    return Ok(TaskView::from(&task));
                }
                self.cas(
                    id,
                    Expected::state(TaskState::Running),
                    TaskState::Running,
                    TransitionFields::new().with_cancel_requested(),
                )
                .await
            } else {
                self.cas(
                    id,
                    Expected::state(task.state),
                    TaskState::Failed,
                    TransitionFields::new()
                        .with_cancel_requested()
                        .with_error(CANCELLED_ERROR),
                )
                .await
            };

            match attempt {
                Ok(updated) => {
                    info!(task_id = %id, from = %task.state, to = %updated.state, "cancel applied");
                    return Ok(TaskView::from(&updated));
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch path
    // ------------------------------------------------------------------

    /// Reconcile a dequeued message against the store and lease the task.
    ///
    /// Every delivery may be a duplicate. Anything that is not a fresh lease
    /// is acked (or nacked) here, so the caller only deals with `Leased`.
    pub async fn claim(&self, delivery: &Delivery) -> Result<Claim, StoreError> {
        let id = delivery.task_id;
        let task = match self.get(id).await {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                warn!(task_id = %id, "message for unknown task; dropping");
                self.ack(delivery.token).await;
                return Ok(Claim::Duplicate);
            }
            Err(e) => return Err(e),
        };

        if !task.state.is_dispatchable() {
            debug!(task_id = %id, state = %task.state, delivery = delivery.delivery_count, "duplicate delivery");
            self.ack(delivery.token).await;
            return Ok(Claim::Duplicate);
        }

        let now = self.clock.now();
        if task.cancel_requested {
            // Cancelled while running, then rescheduled by a reclaim.
            return match self
                .cas(
                    id,
                    Expected::state(task.state),
                    TaskState::Failed,
                    TransitionFields::new().with_error(CANCELLED_ERROR),
                )
                .await
            {
                Ok(_) | Err(StoreError::Conflict { .. }) => {
                    self.ack(delivery.token).await;
                    Ok(Claim::Cancelled)
                }
                Err(e) => Err(e),
            };
        }

        if let Some(at) = task.next_retry_at.filter(|at| *at > now) {
            let remaining = (at - now).to_std().unwrap_or_default();
            debug!(task_id = %id, ?remaining, "early redelivery; deferring");
            self.nack(delivery.token, remaining).await;
            return Ok(Claim::Deferred(remaining));
        }

        let lease_id = self.ids.generate_lease_id();
        let expires_at = now + chrono_duration(self.config.lease_duration());
        match self
            .cas(
                id,
                Expected::state(task.state),
                TaskState::Leased,
                TransitionFields::new().with_lease(lease_id, expires_at),
            )
            .await
        {
            Ok(_) => {}
            Err(StoreError::Conflict { actual, .. }) => {
                debug!(task_id = %id, %actual, "lost lease race; dropping delivery");
                self.ack(delivery.token).await;
                return Ok(Claim::Duplicate);
            }
            Err(e) => return Err(e),
        }

        let attempt = task.attempt_count + 1;
        let running = match self
            .cas(
                id,
                Expected::leased_by(TaskState::Leased, lease_id),
                TaskState::Running,
                TransitionFields::new().with_attempt_count(attempt),
            )
            .await
        {
            Ok(running) => running,
            Err(StoreError::Conflict { actual, .. }) => {
                // Cancelled (or reclaimed) between the two transitions.
                debug!(task_id = %id, %actual, "lease revoked before start");
                self.ack(delivery.token).await;
                return Ok(if actual == TaskState::Failed {
                    Claim::Cancelled
                } else {
                    Claim::Duplicate
                });
            }
            Err(e) => return Err(e),
        };

        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                InFlight {
                    lease_id,
                    token: delivery.token,
                },
            );
        info!(task_id = %id, lease = %lease_id, attempt, "task running");

        Ok(Claim::Leased(Lease {
            task_id: id,
            lease_id,
            task_type: running.task_type,
            payload: running.payload,
            attempt,
            token: delivery.token,
            started_at: now,
            expires_at,
        }))
    }

    /// Apply a handler outcome to the store and settle the broker message.
    pub async fn settle(
        &self,
        lease: &Lease,
        outcome: Result<Vec<u8>, HandlerError>,
    ) -> Result<Settlement, StoreError> {
        self.forget_in_flight(lease.task_id, lease.lease_id);
        let id = lease.task_id;
        let finished_at = self.clock.now();
        let expected = Expected::leased_by(TaskState::Running, lease.lease_id);

        let error = match outcome {
            Ok(output) => {
                return match self
                    .cas(
                        id,
                        expected,
                        TaskState::Succeeded,
                        TransitionFields::new().with_result(output),
                    )
                    .await
                {
                    Ok(_) => {
                        self.record_attempt(lease, AttemptOutcome::Succeeded, None, finished_at)
                            .await;
                        self.ack(lease.token).await;
                        info!(task_id = %id, attempt = lease.attempt, "task succeeded");
                        Ok(Settlement::Succeeded)
                    }
                    Err(StoreError::Conflict { actual, .. }) => {
                        Ok(self.discard(lease, actual).await)
                    }
                    Err(e) => Err(e),
                };
            }
            Err(error) => error,
        };

        // Fresh read: attempt_count and cancel_requested drive the decision.
        // A lost lease was already recorded by whoever took it over.
        let task = self.get(id).await?;
        if task.state != TaskState::Running || task.lease_owner != Some(lease.lease_id) {
            return Ok(self.discard(lease, task.state).await);
        }

        let plan = self.plan_failure(&task, error.is_retryable(), finished_at);
        warn!(task_id = %id, attempt = lease.attempt, error = %error, ?plan, "task attempt failed");
        match self
            .apply_failure(
                &task,
                expected,
                plan,
                error.message(),
                Redelivery::Token(lease.token),
            )
            .await
        {
            Ok(settlement) => {
                self.record_attempt(
                    lease,
                    AttemptOutcome::Failed,
                    Some(error.message().to_string()),
                    finished_at,
                )
                .await;
                Ok(settlement)
            }
            Err(StoreError::Conflict { actual, .. }) => Ok(self.discard(lease, actual).await),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Background sweeps
    // ------------------------------------------------------------------

    /// Force expired LEASED/RUNNING tasks back to RETRY_SCHEDULED (or DEAD).
    ///
    /// Returns how many tasks were reclaimed.
    pub async fn reclaim_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let batch = self.config.sweep_batch;
        let expired = self
            .with_store_retry("list_expired_leases", || {
                self.store.list_expired_leases(now, batch)
            })
            .await?;

        let mut reclaimed = 0;
        for task in expired {
            let Some(owner) = task.lease_owner else {
                continue;
            };
            let expected = Expected::leased_by(task.state, owner);

            let result = if task.state == TaskState::Leased {
                // Never started: no attempt consumed, reschedule immediately.
                self.apply_failure(
                    &task,
                    expected,
                    FailurePlan::Retry(now),
                    LEASE_EXPIRED_ERROR,
                    Redelivery::Publish,
                )
                .await
            } else {
                let plan = self.plan_failure(&task, true, now);
                let result = self
                    .apply_failure(
                        &task,
                        expected,
                        plan,
                        LEASE_EXPIRED_ERROR,
                        Redelivery::Publish,
                    )
                    .await;
                if result.is_ok() {
                    let started_at = task
                        .lease_expiry
                        .map(|at| at - chrono_duration(self.config.lease_duration()))
                        .unwrap_or(now);
                    let attempt = AttemptRecord::new(
                        task.id,
                        task.attempt_count,
                        owner,
                        AttemptOutcome::LeaseExpired,
                        Some(LEASE_EXPIRED_ERROR.to_string()),
                        started_at,
                        now,
                    );
                    if let Err(e) = self.store.record_attempt(attempt).await {
                        warn!(task_id = %task.id, error = %e, "failed to record attempt");
                    }
                }
                result
            };

            match result {
                Ok(settlement) => {
                    reclaimed += 1;
                    if let Some(token) = self.forget_in_flight(task.id, owner) {
                        // The hung slot's message is superseded by the reclaim.
                        self.ack(token).await;
                    }
                    warn!(task_id = %task.id, lease = %owner, from = %task.state, ?settlement, "reclaimed expired lease");
                }
                Err(StoreError::Conflict { actual, .. }) => {
                    debug!(task_id = %task.id, %actual, "lease settled before reclaim");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    /// Republish ready tasks that have sat untouched longer than the grace
    /// period (their message was lost). Returns how many were republished.
    pub async fn reconcile_orphans(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let grace = chrono_duration(self.config.reconcile_grace());
        let batch = self.config.reconcile_batch;
        let ready = self
            .with_store_retry("list_ready", || self.store.list_ready(batch))
            .await?;

        let mut republished = 0;
        for task in ready.into_iter().filter(|t| t.updated_at + grace <= now) {
            if let Err(e) = self.broker.enqueue(task.id, task.priority, Duration::ZERO).await {
                warn!(error = %e, "broker unavailable; reconcile pass stopped");
                break;
            }
            // Touch so the next pass does not republish it again.
            match self
                .cas(
                    task.id,
                    Expected::state(task.state),
                    task.state,
                    TransitionFields::new(),
                )
                .await
            {
                Ok(_) | Err(StoreError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
            republished += 1;
            info!(task_id = %task.id, state = %task.state, "republished orphaned task");
        }
        Ok(republished)
    }

    /// Retry acks that failed during a broker outage.
    pub async fn flush_pending_acks(&self) {
        let tokens = std::mem::take(
            &mut *self
                .pending_acks
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for token in tokens {
            self.ack(token).await;
        }
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn plan_failure(&self, task: &TaskRecord, retryable: bool, now: DateTime<Utc>) -> FailurePlan {
        if !retryable {
            return FailurePlan::Failed;
        }
        match self
            .retry_policy
            .next_attempt(task, now, self.jitter.as_ref())
        {
            RetryDecision::Dead => FailurePlan::Dead,
            RetryDecision::RetryAt(_) if task.cancel_requested => FailurePlan::Cancelled,
            RetryDecision::RetryAt(at) => FailurePlan::Retry(at),
        }
    }

    async fn apply_failure(
        &self,
        task: &TaskRecord,
        expected: Expected,
        plan: FailurePlan,
        error: &str,
        redelivery: Redelivery,
    ) -> Result<Settlement, StoreError> {
        let (state, fields, settlement) = match plan {
            FailurePlan::Retry(at) => (
                TaskState::RetryScheduled,
                TransitionFields::new()
                    .with_error(error)
                    .with_next_retry_at(at),
                Settlement::Retrying { at },
            ),
            FailurePlan::Dead => (
                TaskState::Dead,
                TransitionFields::new().with_error(error),
                Settlement::Dead,
            ),
            FailurePlan::Failed => (
                TaskState::Failed,
                TransitionFields::new().with_error(error),
                Settlement::Failed,
            ),
            FailurePlan::Cancelled => (
                TaskState::Failed,
                TransitionFields::new().with_error(CANCELLED_ERROR),
                Settlement::Failed,
            ),
        };
        self.cas(task.id, expected, state, fields).await?;

        let delay = match settlement {
            Settlement::Retrying { at } => Some((at - self.clock.now()).to_std().unwrap_or_default()),
            _ => None,
        };
        match (redelivery, delay) {
            (Redelivery::Token(token), Some(delay)) => self.nack(token, delay).await,
            (Redelivery::Token(token), None) => self.ack(token).await,
            (Redelivery::Publish, Some(delay)) => {
                if let Err(e) = self.broker.enqueue(task.id, task.priority, delay).await {
                    warn!(task_id = %task.id, error = %e, "enqueue failed; reconcile loop will republish");
                }
            }
            (Redelivery::Publish, None) => {}
        }
        Ok(settlement)
    }

    async fn discard(&self, lease: &Lease, actual: TaskState) -> Settlement {
        warn!(task_id = %lease.task_id, lease = %lease.lease_id, %actual, "lease lost; discarding outcome");
        self.ack(lease.token).await;
        Settlement::Discarded
    }

    async fn record_attempt(
        &self,
        lease: &Lease,
        outcome: AttemptOutcome,
        error: Option<String>,
        finished_at: DateTime<Utc>,
    ) {
        let attempt = AttemptRecord::new(
            lease.task_id,
            lease.attempt,
            lease.lease_id,
            outcome,
            error,
            lease.started_at,
            finished_at,
        );
        if let Err(e) = self
            .with_store_retry("record_attempt", || self.store.record_attempt(attempt.clone()))
            .await
        {
            warn!(task_id = %lease.task_id, error = %e, "failed to record attempt");
        }
    }

    /// Drop the in-flight entry if it still belongs to `lease_id`.
    fn forget_in_flight(&self, id: TaskId, lease_id: LeaseId) -> Option<DeliveryId> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.get(&id).is_some_and(|f| f.lease_id == lease_id) {
            return in_flight.remove(&id).map(|f| f.token);
        }
        None
    }

    async fn ack(&self, token: DeliveryId) {
        match self.broker.ack(token).await {
            Ok(()) => {}
            Err(BrokerError::UnknownToken(_)) => {
                debug!(%token, "ack for a delivery the broker already reissued");
            }
            Err(e @ BrokerError::Unavailable(_)) => {
                warn!(%token, error = %e, "ack deferred until the broker recovers");
                self.pending_acks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(token);
            }
        }
    }

    async fn nack(&self, token: DeliveryId, delay: Duration) {
        // A lost nack is recovered by the broker's visibility timeout.
        if let Err(e) = self.broker.nack(token, delay).await {
            warn!(%token, error = %e, "nack failed; relying on redelivery");
        }
    }

    async fn get(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.with_store_retry("get", || self.store.get(id)).await
    }

    async fn cas(
        &self,
        id: TaskId,
        expected: Expected,
        new_state: TaskState,
        fields: TransitionFields,
    ) -> Result<TaskRecord, StoreError> {
        self.with_store_retry("transition", || {
            self.store
                .transition(id, expected, new_state, fields.clone())
        })
        .await
    }

    /// Retry transient store errors locally; everything else passes through.
    async fn with_store_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let base = self.config.store_retry_backoff();
        let mut backoff = Backoff::new(base, base.saturating_mul(32));
        let mut retries = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && retries < self.config.store_retry_attempts => {
                    retries += 1;
                    let delay = backoff.next_delay();
                    warn!(op, retries, ?delay, error = %e, "store call failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
