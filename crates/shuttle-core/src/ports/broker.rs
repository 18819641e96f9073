//! QueueBroker port - 配送キュー（at-least-once）
//!
//! Broker は task_id のみを流します（状態や payload は TaskStore が持つ）。
//!
//! # 配送保証
//! - at-least-once: visibility timeout 内に ack されなければ再配送される
//! - そのため dequeue は常に「重複かもしれない」として扱い、
//!   TaskStore の現在状態と突き合わせてから動く

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{BrokerError, DeliveryId, TaskId};

/// One delivery of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub task_id: TaskId,
    pub priority: i32,

    /// Ack token, valid for this delivery only.
    pub token: DeliveryId,

    /// 1 on first delivery; higher on redelivery.
    pub delivery_count: u32,
}

#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Queue a message that becomes visible after `not_before`.
    async fn enqueue(
        &self,
        task_id: TaskId,
        priority: i32,
        not_before: Duration,
    ) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for a visible message (`Ok(None)` on timeout).
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Remove the message permanently.
    async fn ack(&self, token: DeliveryId) -> Result<(), BrokerError>;

    /// Return the message to the queue, visible again after `requeue_delay`.
    async fn nack(&self, token: DeliveryId, requeue_delay: Duration) -> Result<(), BrokerError>;
}
