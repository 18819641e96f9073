//! Impls - ports の実装（開発用・テスト用）
//!
//! - **InMemoryTaskStore**: テスト用の正本
//! - **InMemoryBroker**: 開発用の at-least-once broker
//!
//! 本番用の実装（トランザクショナル DB、永続 broker）は別クレートに置く想定です。

pub mod memory_broker;
pub mod memory_store;

pub use self::memory_broker::{BrokerStats, InMemoryBroker};
pub use self::memory_store::InMemoryTaskStore;
