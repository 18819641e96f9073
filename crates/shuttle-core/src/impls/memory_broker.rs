//! InMemoryBroker - 開発用の at-least-once broker
//!
//! # 実装詳細
//! - ready: priority 降順 → 投入順の BinaryHeap
//! - delayed: visible_at 昇順の BinaryHeap（nack / not_before 用）
//! - in_flight: ack token → (message, visibility deadline)
//! - visibility timeout を過ぎた in-flight は新しい token で再配送
//! - `tokio::time::Instant` を使うので `tokio::time::pause()` と併用できる

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use ulid::Ulid;

use crate::domain::{BrokerError, DeliveryId, TaskId};
use crate::ports::{Delivery, QueueBroker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Message {
    task_id: TaskId,
    priority: i32,
    seq: u64,
    delivery_count: u32,
}

/// Max-heap entry: higher priority first, FIFO within a priority.
#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry(Message);

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then(other.0.seq.cmp(&self.0.seq))
    }
}

/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, PartialEq, Eq)]
struct DelayedEntry {
    visible_at: Instant,
    message: Message,
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .visible_at
            .cmp(&self.visible_at)
            .then(other.message.seq.cmp(&self.message.seq))
    }
}

struct InFlight {
    message: Message,
    deadline: Instant,
}

/// Counters for tests and the CLI summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    /// Deliveries reissued after a visibility timeout.
    pub redelivered: u64,
}

struct BrokerState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
    in_flight: HashMap<DeliveryId, InFlight>,
    next_seq: u64,
    available: bool,
    stats: BrokerStats,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            ready: BinaryHeap::new(),
            delayed: BinaryHeap::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
            available: true,
            stats: BrokerStats::default(),
        }
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.available {
            Ok(())
        } else {
            Err(BrokerError::Unavailable("broker is offline".to_string()))
        }
    }

    fn schedule(&mut self, message: Message, visible_at: Instant, now: Instant) {
        if visible_at <= now {
            self.ready.push(ReadyEntry(message));
        } else {
            self.delayed.push(DelayedEntry {
                visible_at,
                message,
            });
        }
    }

    /// Move due delayed messages and timed-out deliveries back to ready.
    fn promote(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.peek() {
            if entry.visible_at > now {
                break;
            }
            if let Some(entry) = self.delayed.pop() {
                self.ready.push(ReadyEntry(entry.message));
            }
        }

        let expired: Vec<DeliveryId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(flight) = self.in_flight.remove(&token) {
                self.stats.redelivered += 1;
                self.ready.push(ReadyEntry(flight.message));
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let delayed = self.delayed.peek().map(|e| e.visible_at);
        let in_flight = self.in_flight.values().map(|f| f.deadline).min();
        match (delayed, in_flight) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-memory broker.
///
/// # 使用例
/// ```ignore
/// let broker = InMemoryBroker::new(Duration::from_secs(30));
/// broker.enqueue(task_id, 0, Duration::ZERO).await?;
/// let delivery = broker.dequeue(Duration::from_secs(1)).await?;
/// ```
pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BrokerState::new()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub async fn set_available(&self, available: bool) {
        self.state.lock().await.available = available;
        if available {
            self.notify.notify_waiters();
        }
    }

    pub async fn stats(&self) -> BrokerStats {
        self.state.lock().await.stats
    }

    /// Messages not yet acked (ready + delayed + in flight).
    pub async fn depth(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len() + state.in_flight.len()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn enqueue(
        &self,
        task_id: TaskId,
        priority: i32,
        not_before: Duration,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            state.ensure_available()?;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.stats.enqueued += 1;
            let now = Instant::now();
            let message = Message {
                task_id,
                priority,
                seq,
                delivery_count: 0,
            };
            state.schedule(message, now + not_before, now);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            let wake = {
                let mut state = self.state.lock().await;
                state.ensure_available()?;
                let now = Instant::now();
                state.promote(now);

                if let Some(ReadyEntry(mut message)) = state.ready.pop() {
                    message.delivery_count += 1;
                    let token = DeliveryId::from_ulid(Ulid::new());
                    state.in_flight.insert(
                        token,
                        InFlight {
                            message,
                            deadline: now + self.visibility_timeout,
                        },
                    );
                    state.stats.delivered += 1;
                    return Ok(Some(Delivery {
                        task_id: message.task_id,
                        priority: message.priority,
                        token,
                        delivery_count: message.delivery_count,
                    }));
                }
                state.next_wake()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let until = wake.map_or(deadline, |w| w.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {},
                _ = tokio::time::sleep_until(until) => {},
            }
        }
    }

    async fn ack(&self, token: DeliveryId) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ensure_available()?;
        match state.in_flight.remove(&token) {
            Some(_) => {
                state.stats.acked += 1;
                Ok(())
            }
            None => Err(BrokerError::UnknownToken(token)),
        }
    }

    async fn nack(&self, token: DeliveryId, requeue_delay: Duration) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().await;
            state.ensure_available()?;
            let flight = state
                .in_flight
                .remove(&token)
                .ok_or(BrokerError::UnknownToken(token))?;
            state.stats.nacked += 1;
            let now = Instant::now();
            state.schedule(flight.message, now + requeue_delay, now);
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn task_id() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn enqueue_dequeue_ack() {
        let broker = InMemoryBroker::default();
        let id = task_id();
        broker.enqueue(id, 0, Duration::ZERO).await.unwrap();

        let d = broker.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(d.task_id, id);
        assert_eq!(d.delivery_count, 1);

        broker.ack(d.token).await.unwrap();
        assert_eq!(broker.depth().await, 0);
        assert!(matches!(
            broker.ack(d.token).await,
            Err(BrokerError::UnknownToken(_))
        ));
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first_then_fifo() {
        let broker = InMemoryBroker::default();
        let (low, high_a, high_b) = (task_id(), task_id(), task_id());
        broker.enqueue(low, 0, Duration::ZERO).await.unwrap();
        broker.enqueue(high_a, 9, Duration::ZERO).await.unwrap();
        broker.enqueue(high_b, 9, Duration::ZERO).await.unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            let d = broker.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
            order.push(d.task_id);
        }
        assert_eq!(order, vec![high_a, high_b, low]);
    }

    #[tokio::test]
    async fn dequeue_times_out_when_empty() {
        let broker = InMemoryBroker::default();
        let start = Instant::now();
        let d = broker.dequeue(Duration::from_millis(200)).await.unwrap();
        assert!(d.is_none());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn not_before_delays_visibility() {
        let broker = InMemoryBroker::default();
        broker
            .enqueue(task_id(), 0, Duration::from_millis(300))
            .await
            .unwrap();

        assert!(broker.dequeue(Duration::from_millis(50)).await.unwrap().is_none());
        assert!(broker.dequeue(Duration::from_secs(2)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn nack_requeues_after_delay() {
        let broker = InMemoryBroker::default();
        let id = task_id();
        broker.enqueue(id, 0, Duration::ZERO).await.unwrap();
        let d = broker.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();

        broker.nack(d.token, Duration::from_millis(100)).await.unwrap();
        let again = broker.dequeue(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(again.task_id, id);
        assert_eq!(again.delivery_count, 2);
        assert_ne!(again.token, d.token);
        assert_eq!(broker.stats().await.nacked, 1);
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered_after_visibility_timeout() {
        let broker = InMemoryBroker::new(Duration::from_millis(100));
        let id = task_id();
        broker.enqueue(id, 0, Duration::ZERO).await.unwrap();
        let first = broker.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();

        let second = broker.dequeue(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(second.task_id, id);
        assert_eq!(second.delivery_count, 2);
        assert_eq!(broker.stats().await.redelivered, 1);

        // The first token died with the redelivery.
        assert!(broker.ack(first.token).await.is_err());
        broker.ack(second.token).await.unwrap();
    }

    #[tokio::test]
    async fn outage_fails_fast_and_recovers() {
        let broker = InMemoryBroker::default();
        broker.set_available(false).await;
        assert!(matches!(
            broker.enqueue(task_id(), 0, Duration::ZERO).await,
            Err(BrokerError::Unavailable(_))
        ));
        assert!(broker.dequeue(Duration::from_millis(10)).await.is_err());

        broker.set_available(true).await;
        broker.enqueue(task_id(), 0, Duration::ZERO).await.unwrap();
        assert!(broker.dequeue(Duration::from_millis(10)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enqueue_wakes_waiting_dequeue() {
        let broker = Arc::new(InMemoryBroker::default());
        let id = task_id();

        let waiter = tokio::spawn({
            let broker = Arc::clone(&broker);
            async move { broker.dequeue(Duration::from_secs(5)).await.unwrap() }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        broker.enqueue(id, 0, Duration::ZERO).await.unwrap();

        let d = waiter.await.unwrap().unwrap();
        assert_eq!(d.task_id, id);
    }
}
