//! WorkerSlot - 1 つの lease を実行する実行スロット
//!
//! handler は別 task で動かすので、panic してもスロットとエンジンは生き残ります。
//! handler は lease の残り時間（と `handler_timeout`）で打ち切り、abort します。
//! スロットの permit が lease より長生きすることはありません。
//! panic / timeout は transient な handler エラーとして settle に回します。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::coordinator::{Lease, LifecycleCoordinator, Settlement};
use crate::domain::HandlerError;
use crate::ports::Clock;

pub struct WorkerSlot {
    coordinator: Arc<LifecycleCoordinator>,
    handler_timeout: Option<Duration>,
}

impl WorkerSlot {
    pub fn new(coordinator: Arc<LifecycleCoordinator>) -> Self {
        let handler_timeout = coordinator.config().handler_timeout();
        Self {
            coordinator,
            handler_timeout,
        }
    }

    /// Run the handler for `lease` and settle the outcome.
    pub async fn execute(&self, lease: Lease) -> Option<Settlement> {
        let outcome = self.run_handler(&lease).await;
        match self.coordinator.settle(&lease, outcome).await {
            Ok(settlement) => {
                debug!(task_id = %lease.task_id, ?settlement, "attempt settled");
                Some(settlement)
            }
            Err(e) => {
                // The lease will expire and the reaper takes over.
                error!(task_id = %lease.task_id, error = %e, "failed to settle attempt");
                None
            }
        }
    }

    async fn run_handler(&self, lease: &Lease) -> Result<Vec<u8>, HandlerError> {
        let Some(handler) = self.coordinator.registry().get(&lease.task_type) else {
            return Err(HandlerError::permanent(format!(
                "no handler registered for task type '{}'",
                lease.task_type
            )));
        };

        let (limit, timed_out) = self.limit_for(lease);
        let payload = lease.payload.clone();
        let mut join = tokio::spawn(async move { handler.handle_raw(&payload).await });

        match tokio::time::timeout(limit, &mut join).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_panic() => {
                warn!(task_id = %lease.task_id, attempt = lease.attempt, "handler panicked");
                Err(HandlerError::transient("handler panicked"))
            }
            Ok(Err(e)) => Err(HandlerError::transient(format!("handler aborted: {e}"))),
            Err(_) => {
                join.abort();
                warn!(task_id = %lease.task_id, attempt = lease.attempt, ?limit, "handler aborted at its time limit");
                Err(HandlerError::transient(format!("{timed_out} after {limit:?}")))
            }
        }
    }

    /// The sooner of `handler_timeout` and the lease expiry, with the error
    /// text for hitting it.
    fn limit_for(&self, lease: &Lease) -> (Duration, &'static str) {
        let remaining = (lease.expires_at - self.coordinator.clock().now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        match self.handler_timeout {
            Some(timeout) if timeout < remaining => (timeout, "handler timed out"),
            _ => (remaining, "handler outlived its lease"),
        }
    }
}
