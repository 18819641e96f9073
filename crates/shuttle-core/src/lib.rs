//! shuttle-core
//!
//! Core building blocks for the Shuttle task dispatch engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task_type, task record, state, retry policy, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, QueueBroker, Clock, IdGenerator, JitterSource）
//! - **app**: アプリケーションロジック（builder, coordinator, dispatcher, reaper, reconcile）
//! - **typed**: 型付き Task API（Task trait, Handler trait, HandlerRegistry）
//! - **impls**: 実装（InMemoryTaskStore, InMemoryBroker など開発用）
//! - **config**: EngineConfig（デフォルト + `SHUTTLE_*` 環境変数 + TOML）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod typed;

pub use app::{Engine, EngineBuilder, EngineHandle, QueueCounts, TaskView};
pub use config::{ConfigError, EngineConfig};
pub use domain::{HandlerError, ShuttleError, TaskId, TaskState};
pub use typed::{Handler, Task};
