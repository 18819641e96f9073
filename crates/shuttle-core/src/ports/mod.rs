//! Ports - 抽象化レイヤー
//!
//! 外部システム（トランザクショナルな DB、at-least-once な broker）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - QueueBroker は配送キュー（task_id のみ）
//! - 時刻と乱数も port にして、テストで差し替えられるようにする

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod jitter;
pub mod task_store;

pub use self::broker::{Delivery, QueueBroker};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::jitter::{JitterSource, NoJitter, SeededJitter};
pub use self::task_store::TaskStore;
