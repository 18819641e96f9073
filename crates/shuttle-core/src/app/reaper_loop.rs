//! ReaperLoop - Lease 期限切れの回収
//!
//! # フロー
//! 1. 一定間隔で `LifecycleCoordinator::reclaim_expired` を呼ぶ
//! 2. LEASED のまま期限切れ → attempt を消費せず即 RETRY_SCHEDULED
//! 3. RUNNING のまま期限切れ → LeaseExpired の失敗として retry policy に回す

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::coordinator::LifecycleCoordinator;

pub struct ReaperLoop {
    coordinator: Arc<LifecycleCoordinator>,
}

impl ReaperLoop {
    pub fn new(coordinator: Arc<LifecycleCoordinator>) -> Self {
        Self { coordinator }
    }

    /// One sweep. Returns how many leases were reclaimed.
    pub async fn tick(&self) -> usize {
        match self.coordinator.reclaim_expired().await {
            Ok(0) => 0,
            Ok(n) => {
                info!(reclaimed = n, "lease sweep reclaimed tasks");
                n
            }
            Err(e) => {
                warn!(error = %e, "lease sweep failed");
                0
            }
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.coordinator.config().sweep_interval());
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
        debug!("reaper loop stopped");
    }
}
