//! Step-by-step coordinator scenarios: no background loops, a fixed clock,
//! and the broker driven by hand.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rstest::rstest;

use common::{Echo, EchoHandler, Mode, fast_config};
use shuttle_core::app::{
    CANCELLED_ERROR, Claim, LEASE_EXPIRED_ERROR, Lease, LifecycleCoordinator, Settlement,
};
use shuttle_core::domain::{
    AttemptOutcome, Expected, HandlerError, LeaseId, ShuttleError, TaskState, TransitionFields,
};
use shuttle_core::impls::{InMemoryBroker, InMemoryTaskStore};
use shuttle_core::ports::{Clock, Delivery, FixedClock, NoJitter, QueueBroker, TaskStore};
use shuttle_core::{Engine, EngineConfig, Task};

struct Harness {
    engine: Engine,
    store: Arc<InMemoryTaskStore>,
    broker: Arc<InMemoryBroker>,
    clock: Arc<FixedClock>,
    calls: Arc<AtomicU32>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(InMemoryTaskStore::new(clock.clone()));
        let broker = Arc::new(InMemoryBroker::new(config.visibility_timeout()));
        let (handler, calls) = EchoHandler::new(Mode::FailTimes(0));
        let engine = Engine::builder()
            .config(config)
            .register::<Echo, _>(handler)
            .unwrap()
            .store(store.clone())
            .broker(broker.clone())
            .clock(clock.clone())
            .jitter(Arc::new(NoJitter))
            .build()
            .unwrap();
        Self {
            engine,
            store,
            broker,
            clock,
            calls,
        }
    }

    fn coordinator(&self) -> &Arc<LifecycleCoordinator> {
        self.engine.coordinator()
    }

    async fn submit(&self) -> shuttle_core::TaskId {
        self.engine
            .submit_typed(&Echo { text: "hi".into() }, 0, Some(3))
            .await
            .unwrap()
    }

    async fn next_delivery(&self) -> Delivery {
        self.broker
            .dequeue(Duration::from_millis(200))
            .await
            .unwrap()
            .expect("a queued message")
    }

    async fn lease(&self) -> Lease {
        let delivery = self.next_delivery().await;
        match self.coordinator().claim(&delivery).await.unwrap() {
            Claim::Leased(lease) => lease,
            other => panic!("expected a lease, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn claim_moves_task_to_running_with_fresh_lease() {
    let h = Harness::new(fast_config());
    let id = h.submit().await;

    let lease = h.lease().await;
    assert_eq!(lease.task_id, id);
    assert_eq!(lease.attempt, 1);
    assert_eq!(lease.task_type.as_str(), Echo::TYPE);
    assert_eq!(h.coordinator().in_flight_count(), 1);

    let row = h.store.get(id).await.unwrap();
    assert_eq!(row.state, TaskState::Running);
    assert_eq!(row.lease_owner, Some(lease.lease_id));
    assert_eq!(row.lease_expiry, Some(h.clock.now() + chrono::Duration::seconds(30)));
}

#[tokio::test]
async fn duplicate_delivery_of_succeeded_task_is_acked_without_transition() {
    let h = Harness::new(fast_config());
    let id = h.submit().await;
    // Extra copies of the same message, as an at-least-once broker may produce.
    h.broker.enqueue(id, 0, Duration::ZERO).await.unwrap();
    h.broker.enqueue(id, 0, Duration::ZERO).await.unwrap();

    let lease = h.lease().await;
    let settled = h
        .coordinator()
        .settle(&lease, Ok(b"\"hi\"".to_vec()))
        .await
        .unwrap();
    assert_eq!(settled, Settlement::Succeeded);
    let before = h.store.get(id).await.unwrap();

    for _ in 0..2 {
        let duplicate = h.next_delivery().await;
        let claim = h.coordinator().claim(&duplicate).await.unwrap();
        assert!(matches!(claim, Claim::Duplicate));
        assert_eq!(h.store.get(id).await.unwrap(), before);
    }

    assert_eq!(h.broker.stats().await.acked, 3);
    assert_eq!(h.broker.depth().await, 0);
    assert_eq!(h.engine.attempts(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_pending_fails_task_and_skips_handler() {
    let h = Harness::new(fast_config());
    let id = h.submit().await;

    let view = h.engine.cancel(id).await.unwrap();
    assert_eq!(view.state, TaskState::Failed);
    assert_eq!(view.error.as_deref(), Some(CANCELLED_ERROR));

    let delivery = h.next_delivery().await;
    let claim = h.coordinator().claim(&delivery).await.unwrap();
    assert!(matches!(claim, Claim::Duplicate));
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    let err = h.engine.cancel(id).await.unwrap_err();
    assert!(matches!(
        err,
        ShuttleError::AlreadyTerminal {
            state: TaskState::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn cancel_leased_task_wins_over_start() {
    let h = Harness::new(fast_config());
    let id = h.submit().await;
    let lease = LeaseId::from_ulid(ulid::Ulid::new());
    let expiry = h.clock.now() + chrono::Duration::seconds(30);
    h.store
        .transition(
            id,
            Expected::state(TaskState::Pending),
            TaskState::Leased,
            TransitionFields::new().with_lease(lease, expiry),
        )
        .await
        .unwrap();

    let view = h.engine.cancel(id).await.unwrap();
    assert_eq!(view.state, TaskState::Failed);

    // The holder's LEASED -> RUNNING step now loses.
    let err = h
        .store
        .transition(
            id,
            Expected::leased_by(TaskState::Leased, lease),
            TaskState::Running,
            TransitionFields::new().with_attempt_count(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, shuttle_core::domain::StoreError::Conflict { .. }));
}

#[tokio::test]
async fn expired_running_lease_is_reclaimed_and_late_result_discarded() {
    let h = Harness::new(fast_config());
    let id = h.submit().await;
    let lease = h.lease().await;

    h.clock.advance(chrono::Duration::seconds(31));
    let reclaimed = h.coordinator().reclaim_expired().await.unwrap();
    assert_eq!(reclaimed, 1);
    assert_eq!(h.coordinator().in_flight_count(), 0);

    let row = h.store.get(id).await.unwrap();
    assert_eq!(row.state, TaskState::RetryScheduled);
    assert_eq!(row.attempt_count, 1);
    assert_eq!(row.lease_owner, None);

    // The hung worker reports back after losing its lease.
    let settled = h
        .coordinator()
        .settle(&lease, Ok(b"\"late\"".to_vec()))
        .await
        .unwrap();
    assert_eq!(settled, Settlement::Discarded);
    assert_eq!(h.store.get(id).await.unwrap().state, TaskState::RetryScheduled);

    let attempts = h.engine.attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::LeaseExpired);
}

#[tokio::test]
async fn late_failure_after_reclaim_adds_no_attempt_row() {
    let h = Harness::new(fast_config());
    let id = h.submit().await;
    let lease = h.lease().await;

    h.clock.advance(chrono::Duration::seconds(31));
    assert_eq!(h.coordinator().reclaim_expired().await.unwrap(), 1);

    let settled = h
        .coordinator()
        .settle(&lease, Err(HandlerError::transient("late boom")))
        .await
        .unwrap();
    assert_eq!(settled, Settlement::Discarded);

    let row = h.store.get(id).await.unwrap();
    assert_eq!(row.state, TaskState::RetryScheduled);
    assert_eq!(row.error.as_deref(), Some(LEASE_EXPIRED_ERROR));

    let attempts = h.engine.attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt, 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::LeaseExpired);
}

#[tokio::test]
async fn expired_leased_task_is_rescheduled_without_consuming_an_attempt() {
    let h = Harness::new(fast_config());
    let id = h.submit().await;
    // Drain the submit message so only the reclaim republishes.
    let first = h.next_delivery().await;
    h.broker.ack(first.token).await.unwrap();

    let lease = LeaseId::from_ulid(ulid::Ulid::new());
    let expiry = h.clock.now() + chrono::Duration::seconds(1);
    h.store
        .transition(
            id,
            Expected::state(TaskState::Pending),
            TaskState::Leased,
            TransitionFields::new().with_lease(lease, expiry),
        )
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(h.coordinator().reclaim_expired().await.unwrap(), 1);

    let row = h.store.get(id).await.unwrap();
    assert_eq!(row.state, TaskState::RetryScheduled);
    assert_eq!(row.attempt_count, 0);
    assert_eq!(row.next_retry_at, Some(h.clock.now()));

    let lease = h.lease().await;
    assert_eq!(lease.attempt, 1);
}

#[tokio::test]
async fn early_redelivery_is_deferred_until_retry_time() {
    let config = EngineConfig {
        retry_base_delay_ms: 10_000,
        retry_max_delay_ms: 10_000,
        ..fast_config()
    };
    let h = Harness::new(config);
    let id = h.submit().await;
    let lease = h.lease().await;

    let settled = h
        .coordinator()
        .settle(&lease, Err(HandlerError::transient("flaky")))
        .await
        .unwrap();
    let at = h.clock.now() + chrono::Duration::seconds(10);
    assert_eq!(settled, Settlement::Retrying { at });

    // A stray copy shows up before the retry time.
    h.broker.enqueue(id, 0, Duration::ZERO).await.unwrap();
    let stray = h.next_delivery().await;
    let claim = h.coordinator().claim(&stray).await.unwrap();
    assert!(matches!(claim, Claim::Deferred(d) if d == Duration::from_secs(10)));
    assert_eq!(h.store.get(id).await.unwrap().state, TaskState::RetryScheduled);

    h.clock.advance(chrono::Duration::seconds(10));
    h.broker.enqueue(id, 0, Duration::ZERO).await.unwrap();
    let lease = h.lease().await;
    assert_eq!(lease.attempt, 2);
}

#[tokio::test]
async fn orphaned_task_is_republished_once_after_grace() {
    let h = Harness::new(fast_config());
    h.broker.set_available(false).await;
    let id = h.submit().await;
    h.broker.set_available(true).await;
    assert_eq!(h.broker.depth().await, 0);

    assert_eq!(h.coordinator().reconcile_orphans().await.unwrap(), 0);

    h.clock.advance(chrono::Duration::milliseconds(100));
    assert_eq!(h.coordinator().reconcile_orphans().await.unwrap(), 1);
    assert_eq!(h.broker.depth().await, 1);

    // Touched, so the next pass leaves it alone.
    assert_eq!(h.coordinator().reconcile_orphans().await.unwrap(), 0);
    assert_eq!(h.next_delivery().await.task_id, id);
}

#[tokio::test]
async fn acks_during_outage_are_flushed_after_recovery() {
    let h = Harness::new(fast_config());
    h.submit().await;
    let lease = h.lease().await;

    h.broker.set_available(false).await;
    let settled = h
        .coordinator()
        .settle(&lease, Ok(b"\"hi\"".to_vec()))
        .await
        .unwrap();
    assert_eq!(settled, Settlement::Succeeded);
    assert_eq!(h.coordinator().pending_ack_count(), 1);

    h.broker.set_available(true).await;
    h.coordinator().flush_pending_acks().await;
    assert_eq!(h.coordinator().pending_ack_count(), 0);
    assert_eq!(h.broker.stats().await.acked, 1);
}

#[tokio::test]
async fn transient_store_failures_are_retried() {
    let h = Harness::new(fast_config());
    h.store.fail_next(2).await;
    let id = h.submit().await;
    assert_eq!(
        h.engine.get_status(id).await.unwrap().state,
        TaskState::Pending
    );
}

#[rstest]
#[case::unknown_type("test.unknown.v1", Some(3))]
#[case::blank_type("", Some(3))]
#[case::zero_attempts(Echo::TYPE, Some(0))]
#[tokio::test]
async fn submit_rejects_invalid_input(#[case] task_type: &str, #[case] max_attempts: Option<u32>) {
    let h = Harness::new(fast_config());
    let err = h
        .engine
        .submit(task_type, b"{}".to_vec(), 0, max_attempts)
        .await
        .unwrap_err();
    assert!(matches!(err, ShuttleError::Validation(_)));
    assert_eq!(h.engine.counts().await.unwrap().active(), 0);
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let h = Harness::new(fast_config());
    let id = shuttle_core::TaskId::from_ulid(ulid::Ulid::new());
    assert!(matches!(
        h.engine.get_status(id).await,
        Err(ShuttleError::NotFound(missing)) if missing == id
    ));
}

#[tokio::test]
async fn counts_track_states() {
    let h = Harness::new(fast_config());
    h.submit().await;
    let cancelled = h.submit().await;
    h.engine.cancel(cancelled).await.unwrap();

    let counts = h.engine.counts().await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.terminal(), 1);
}
