//! ReconcileLoop - TaskStore と broker の突き合わせ
//!
//! store が正で broker は配送経路にすぎません。
//! PENDING / 期日の来た RETRY_SCHEDULED なのに grace を超えて触られていないタスクは
//! メッセージを失ったとみなして再 enqueue します（重複は claim 側で弾く）。

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::coordinator::LifecycleCoordinator;

pub struct ReconcileLoop {
    coordinator: Arc<LifecycleCoordinator>,
}

impl ReconcileLoop {
    pub fn new(coordinator: Arc<LifecycleCoordinator>) -> Self {
        Self { coordinator }
    }

    /// One pass. Returns how many tasks were republished.
    pub async fn tick(&self) -> usize {
        match self.coordinator.reconcile_orphans().await {
            Ok(0) => 0,
            Ok(n) => {
                info!(republished = n, "reconcile pass republished tasks");
                n
            }
            Err(e) => {
                warn!(error = %e, "reconcile pass failed");
                0
            }
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.coordinator.config().reconcile_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() { break; }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!("reconcile loop stopped");
    }
}
