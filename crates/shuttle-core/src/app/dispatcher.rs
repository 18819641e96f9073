//! Dispatcher - broker から取り出して WorkerSlot に割り当てるループ
//!
//! # フロー
//! 1. 空きスロット（Semaphore の permit）を確保
//! 2. broker から dequeue（shutdown と select で競合）
//! 3. `LifecycleCoordinator::claim` で重複配送を弾き、lease を取る
//! 4. lease を permit ごと別 task に渡して実行
//!
//! broker が落ちている間は指数バックオフで再接続を試みます。
//! shutdown 後は新規 dequeue を止め、実行中スロットの完了を待ちます。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::coordinator::{Claim, LifecycleCoordinator};
use super::slot::WorkerSlot;
use crate::ports::Delivery;

/// Requeue delay when the store could not be consulted for a delivery.
const CLAIM_ERROR_REQUEUE: Duration = Duration::from_millis(500);

pub struct Dispatcher {
    coordinator: Arc<LifecycleCoordinator>,
    slot: Arc<WorkerSlot>,
    slots: Arc<Semaphore>,
    slot_count: usize,
}

impl Dispatcher {
    pub fn new(coordinator: Arc<LifecycleCoordinator>) -> Self {
        let slot_count = coordinator.config().worker_slots;
        Self {
            slot: Arc::new(WorkerSlot::new(Arc::clone(&coordinator))),
            slots: Arc::new(Semaphore::new(slot_count)),
            slot_count,
            coordinator,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = self.coordinator.config();
        let dequeue_timeout = config.dequeue_timeout();
        let (initial, max) = config.broker_backoff();
        let mut backoff = Backoff::new(initial, max);
        info!(slots = self.slot_count, "dispatcher started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.coordinator.flush_pending_acks().await;

            let permit = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() { break; }
                    continue;
                }
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let dequeued = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() { break; }
                    continue;
                }
                dequeued = self.coordinator.broker().dequeue(dequeue_timeout) => dequeued,
            };

            let delivery = match dequeued {
                Ok(Some(delivery)) => {
                    backoff.reset();
                    delivery
                }
                Ok(None) => continue,
                Err(e) => {
                    drop(permit);
                    let delay = backoff.next_delay();
                    warn!(error = %e, ?delay, "dequeue failed; backing off");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            };

            match self.coordinator.claim(&delivery).await {
                Ok(Claim::Leased(lease)) => {
                    let slot = Arc::clone(&self.slot);
                    tokio::spawn(async move {
                        slot.execute(lease).await;
                        drop(permit);
                    });
                }
                Ok(claim) => {
                    debug!(task_id = %delivery.task_id, ?claim, "delivery not executed");
                }
                Err(e) => {
                    warn!(task_id = %delivery.task_id, error = %e, "claim failed; requeueing");
                    self.requeue(&delivery).await;
                }
            }
        }

        info!("dispatcher stopping; waiting for running slots");
        // Every permit back means every slot has settled.
        let _drained = self.slots.acquire_many(self.slot_count as u32).await;
        info!("dispatcher stopped");
    }

    async fn requeue(&self, delivery: &Delivery) {
        if let Err(e) = self
            .coordinator
            .broker()
            .nack(delivery.token, CLAIM_ERROR_REQUEUE)
            .await
        {
            debug!(task_id = %delivery.task_id, error = %e, "requeue failed; visibility timeout will redeliver");
        }
    }
}
