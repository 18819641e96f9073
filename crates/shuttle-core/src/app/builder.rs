//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - ports の差し替え（テストでは FixedClock / NoJitter を注入）

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::coordinator::LifecycleCoordinator;
use super::dispatcher::Dispatcher;
use super::reaper_loop::ReaperLoop;
use super::reconcile_loop::ReconcileLoop;
use super::status::TaskView;
use crate::config::{ConfigError, EngineConfig};
use crate::domain::{AttemptRecord, QueueCounts, ShuttleError, TaskId};
use crate::impls::{InMemoryBroker, InMemoryTaskStore};
use crate::ports::{
    Clock, IdGenerator, JitterSource, QueueBroker, SeededJitter, SystemClock, TaskStore,
    UlidGenerator,
};
use crate::typed::{Handler, HandlerRegistry, RegistryError, Task, TaskHandler};

/// EngineBuilder はエンジンを構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .config(EngineConfig::from_env()?)
///     .register::<SendEmail, _>(SendEmailHandler)?
///     .expect_tasks(&[SendEmail::TYPE])
///     .build()?;
/// let handle = engine.start();
/// engine.submit_typed(&SendEmail { to: "a@b".into() }, 0, None).await?;
/// handle.shutdown_and_join().await;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」と設定値をチェック
/// - store / broker / clock を指定しなければ in-memory 実装で埋める
pub struct EngineBuilder {
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<String>>,
    config: EngineConfig,
    store: Option<Arc<dyn TaskStore>>,
    broker: Option<Arc<dyn QueueBroker>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    jitter: Option<Arc<dyn JitterSource>>,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            expected_tasks: None,
            config: EngineConfig::default(),
            store: None,
            broker: None,
            clock: None,
            ids: None,
            jitter: None,
        }
    }

    /// Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 型なし handler を登録
    pub fn register_raw(
        mut self,
        task_type: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register_raw(task_type, handler)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn broker(mut self, broker: Arc<dyn QueueBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// 検証してエンジンを生成（まだ何も起動しない）
    pub fn build(self) -> Result<Engine, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        self.config.validate()?;

        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let store: Arc<dyn TaskStore> = match self.store {
            Some(store) => store,
            None => Arc::new(InMemoryTaskStore::new(Arc::clone(&clock))),
        };
        let broker: Arc<dyn QueueBroker> = match self.broker {
            Some(broker) => broker,
            None => Arc::new(InMemoryBroker::new(self.config.visibility_timeout())),
        };
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&clock))),
        };
        let jitter: Arc<dyn JitterSource> = match (self.jitter, self.config.jitter_seed) {
            (Some(jitter), _) => jitter,
            (None, Some(seed)) => Arc::new(SeededJitter::new(seed)),
            (None, None) => Arc::new(SeededJitter::from_entropy()),
        };

        info!(
            task_types = ?self.registry.registered_types(),
            slots = self.config.worker_slots,
            "engine built"
        );
        let coordinator = LifecycleCoordinator::new(
            store,
            broker,
            Arc::new(self.registry),
            clock,
            ids,
            jitter,
            self.config,
        );
        Ok(Engine {
            coordinator: Arc::new(coordinator),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine は API の表面（submit / status / cancel）と起動口
#[derive(Clone)]
pub struct Engine {
    coordinator: Arc<LifecycleCoordinator>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn coordinator(&self) -> &Arc<LifecycleCoordinator> {
        &self.coordinator
    }

    /// Spawn the dispatcher and both sweeps.
    pub fn start(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher::new(Arc::clone(&self.coordinator));
        let reaper = ReaperLoop::new(Arc::clone(&self.coordinator));
        let reconcile = ReconcileLoop::new(Arc::clone(&self.coordinator));

        let joins = vec![
            tokio::spawn(dispatcher.run(shutdown_rx.clone())),
            tokio::spawn(reaper.run(shutdown_rx.clone())),
            tokio::spawn(reconcile.run(shutdown_rx)),
        ];
        info!("engine started");
        EngineHandle { shutdown_tx, joins }
    }

    pub async fn submit(
        &self,
        task_type: &str,
        payload: Vec<u8>,
        priority: i32,
        max_attempts: Option<u32>,
    ) -> Result<TaskId, ShuttleError> {
        self.coordinator
            .submit(task_type, payload, priority, max_attempts)
            .await
    }

    pub async fn submit_typed<T: Task>(
        &self,
        task: &T,
        priority: i32,
        max_attempts: Option<u32>,
    ) -> Result<TaskId, ShuttleError> {
        self.coordinator
            .submit_typed(task, priority, max_attempts)
            .await
    }

    pub async fn get_status(&self, id: TaskId) -> Result<TaskView, ShuttleError> {
        self.coordinator.get_status(id).await
    }

    pub async fn cancel(&self, id: TaskId) -> Result<TaskView, ShuttleError> {
        self.coordinator.cancel(id).await
    }

    pub async fn attempts(&self, id: TaskId) -> Result<Vec<AttemptRecord>, ShuttleError> {
        self.coordinator.attempts(id).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, ShuttleError> {
        self.coordinator.counts().await
    }
}

/// Running engine handle.
/// - `shutdown_tx` を drop するとループ全体が止まる
/// - `shutdown_and_join()` で実行中スロットの完了まで待てる
pub struct EngineHandle {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stop taking new deliveries. Running handlers are not interrupted.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for every loop (and every running slot) to finish.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use crate::domain::HandlerError;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping;

    impl Task for Ping {
        const TYPE: &'static str = "test.ping.v1";
        type Output = ();
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong;

    impl Task for Pong {
        const TYPE: &'static str = "test.pong.v1";
        type Output = ();
    }

    struct PingHandler;

    #[async_trait]
    impl Handler<Ping> for PingHandler {
        async fn handle(&self, _task: Ping) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_build_success() {
        let engine = EngineBuilder::new()
            .register::<Ping, _>(PingHandler)
            .unwrap()
            .expect_tasks(&[Ping::TYPE])
            .build();
        assert!(engine.is_ok());
    }

    #[test]
    fn test_build_missing_task_types() {
        let engine = EngineBuilder::new()
            .register::<Ping, _>(PingHandler)
            .unwrap()
            .expect_tasks(&[Ping::TYPE, Pong::TYPE])
            .build();
        assert!(matches!(
            engine,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![Pong::TYPE.to_string()]
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let engine = EngineBuilder::new()
            .register::<Ping, _>(PingHandler)
            .unwrap()
            .config(EngineConfig {
                worker_slots: 0,
                ..Default::default()
            })
            .build();
        assert!(matches!(engine, Err(BuildError::Config(_))));
    }

    #[test]
    fn test_register_twice_fails() {
        let result = EngineBuilder::new()
            .register::<Ping, _>(PingHandler)
            .unwrap()
            .register::<Ping, _>(PingHandler);
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = EngineBuilder::new()
            .register::<Ping, _>(PingHandler)
            .unwrap()
            .build()
            .unwrap();
        let handle = engine.start();
        handle.shutdown_and_join().await;
    }
}
