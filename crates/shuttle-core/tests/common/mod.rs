#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use shuttle_core::app::TaskView;
use shuttle_core::domain::{HandlerError, TaskId};
use shuttle_core::{Engine, EngineConfig, Handler, Task};

/// Small delays everywhere so scenarios settle in milliseconds.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        worker_slots: 2,
        dequeue_timeout_ms: 20,
        sweep_interval_ms: 50,
        reconcile_interval_ms: 50,
        reconcile_grace_ms: 100,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        retry_jitter: 0.0,
        broker_backoff_initial_ms: 5,
        broker_backoff_max_ms: 20,
        store_retry_backoff_ms: 1,
        ..Default::default()
    }
}

/// Poll until `done` holds for the task, or panic after 5s.
pub async fn wait_for<F>(engine: &Engine, id: TaskId, done: F) -> TaskView
where
    F: Fn(&TaskView) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let view = engine.get_status(id).await.unwrap();
        if done(&view) {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on {id}: {view:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_terminal(engine: &Engine, id: TaskId) -> TaskView {
    wait_for(engine, id, |v| v.state.is_terminal()).await
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Echo {
    pub text: String,
}

impl Task for Echo {
    const TYPE: &'static str = "test.echo.v1";
    type Output = String;
}

/// What an `EchoHandler` call does.
#[derive(Debug, Clone, Copy)]
pub enum Mode {
    /// Transient failure for the first `n` calls, then success.
    FailTimes(u32),
    AlwaysTransient,
    Permanent,
    /// Panic on the first call, then success.
    PanicOnce,
    /// Sleep longer than any test timeout.
    Hang,
    /// Hang only on this text; echo anything else.
    HangOn(&'static str),
}

pub struct EchoHandler {
    mode: Mode,
    pub calls: Arc<AtomicU32>,
}

impl EchoHandler {
    pub fn new(mode: Mode) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                mode,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl Handler<Echo> for EchoHandler {
    async fn handle(&self, task: Echo) -> Result<String, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.mode {
            Mode::FailTimes(n) if call <= n => Err(HandlerError::transient(format!("flaky {call}"))),
            Mode::FailTimes(_) => Ok(task.text),
            Mode::AlwaysTransient => Err(HandlerError::transient("still broken")),
            Mode::Permanent => Err(HandlerError::permanent("malformed input")),
            Mode::PanicOnce if call == 1 => panic!("boom"),
            Mode::PanicOnce => Ok(task.text),
            Mode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(task.text)
            }
            Mode::HangOn(text) if task.text == text => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(task.text)
            }
            Mode::HangOn(_) => Ok(task.text),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Gated {
    pub succeed: bool,
}

impl Task for Gated {
    const TYPE: &'static str = "test.gated.v1";
    type Output = ();
}

/// Signals `started`, then blocks until `release` is notified.
pub struct GatedHandler {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl Handler<Gated> for GatedHandler {
    async fn handle(&self, task: Gated) -> Result<(), HandlerError> {
        self.started.notify_one();
        self.release.notified().await;
        if task.succeed {
            Ok(())
        } else {
            Err(HandlerError::transient("gate failed"))
        }
    }
}
