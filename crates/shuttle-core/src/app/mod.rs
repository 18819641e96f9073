//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてアプリケーションロジックを実装します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder / Engine**: 構築・ワイヤリングと API の表面
//! - **LifecycleCoordinator**: 状態遷移の唯一の書き込み者
//! - **Dispatcher / WorkerSlot**: dequeue→claim→handle→settle
//! - **ReaperLoop**: Lease 期限切れの回収
//! - **ReconcileLoop**: store と broker の突き合わせ

pub mod backoff;
pub mod builder;
pub mod coordinator;
pub mod dispatcher;
pub mod reaper_loop;
pub mod reconcile_loop;
pub mod slot;
pub mod status;

// 主要な型を再エクスポート
pub use self::backoff::Backoff;
pub use self::builder::{BuildError, Engine, EngineBuilder, EngineHandle};
pub use self::coordinator::{
    CANCELLED_ERROR, Claim, LEASE_EXPIRED_ERROR, Lease, LifecycleCoordinator, Settlement,
};
pub use self::dispatcher::Dispatcher;
pub use self::reaper_loop::ReaperLoop;
pub use self::reconcile_loop::ReconcileLoop;
pub use self::slot::WorkerSlot;
pub use self::status::TaskView;
pub use crate::domain::QueueCounts;
