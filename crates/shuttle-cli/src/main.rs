//! shuttle - engine demo
//!
//! hello タスクを投入して、失敗 → リトライ → 成功（または DEAD）までを観察します。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use shuttle_core::{Engine, EngineConfig, Handler, HandlerError, Task, TaskId, TaskView};
use tracing::{info, warn};

/// Run a batch of demo tasks through an in-memory shuttle engine
#[derive(Parser, Debug)]
#[command(name = "shuttle")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with engine settings (SHUTTLE_* env vars override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker slots
    #[arg(short, long)]
    workers: Option<usize>,

    /// Number of tasks to submit
    #[arg(short, long, default_value = "3")]
    tasks: usize,

    /// How many times each task fails before it succeeds
    #[arg(short, long, default_value = "2")]
    fail_times: u32,

    /// Attempts per task (engine default when unset)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Base retry delay in milliseconds
    #[arg(long)]
    retry_base_ms: Option<u64>,

    /// Cancel the last submitted task right away
    #[arg(long)]
    cancel_last: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    name: String,
    fail_times: u32,
}

impl Task for Hello {
    const TYPE: &'static str = "shuttle.demo.hello.v1";
    type Output = String;
}

/// Fails `fail_times` times per name, then greets.
#[derive(Default)]
struct HelloHandler {
    calls: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl Handler<Hello> for HelloHandler {
    async fn handle(&self, task: Hello) -> Result<String, HandlerError> {
        let call = {
            let mut calls = self
                .calls
                .lock()
                .map_err(|_| HandlerError::transient("call counter poisoned"))?;
            let n = calls.entry(task.name.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if call <= task.fail_times {
            return Err(HandlerError::transient(format!(
                "intentional failure {call}/{}",
                task.fail_times
            )));
        }
        Ok(format!("Hello, {}!", task.name))
    }
}

fn load_config(args: &Args) -> anyhow::Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(workers) = args.workers {
        config.worker_slots = workers;
    }
    if let Some(base) = args.retry_base_ms {
        config.retry_base_delay_ms = base;
    }
    config.validate()?;
    Ok(config)
}

async fn wait_until_settled(engine: &Engine, ids: &[TaskId]) -> anyhow::Result<Vec<TaskView>> {
    loop {
        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            views.push(engine.get_status(*id).await?);
        }
        if views.iter().all(|v| v.state.is_terminal()) {
            return Ok(views);
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted; shutting down with tasks still active");
                return Ok(views);
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = load_config(&args)?;
    let engine = Engine::builder()
        .config(config)
        .register::<Hello, _>(HelloHandler::default())?
        .expect_tasks(&[Hello::TYPE])
        .build()?;
    let handle = engine.start();

    let mut ids = Vec::with_capacity(args.tasks);
    for i in 0..args.tasks {
        let task = Hello {
            name: format!("shuttle-{i}"),
            fail_times: args.fail_times,
        };
        // Later tasks get higher priority, so they run first.
        let id = engine
            .submit_typed(&task, i as i32, args.max_attempts)
            .await?;
        ids.push(id);
    }
    if args.cancel_last {
        if let Some(id) = ids.last() {
            match engine.cancel(*id).await {
                Ok(view) => info!(task_id = %id, state = %view.state, "cancel requested"),
                Err(e) => warn!(task_id = %id, error = %e, "cancel rejected"),
            }
        }
    }

    let views = wait_until_settled(&engine, &ids).await?;
    for view in &views {
        let greeting = view
            .decode_result::<String>()
            .transpose()
            .context("decoding result")?;
        println!(
            "{} state={} attempts={}/{} result={:?} error={:?}",
            view.id,
            view.state,
            view.attempt_count,
            view.max_attempts,
            greeting,
            view.error
        );
    }
    println!("counts: {}", serde_json::to_string(&engine.counts().await?)?);

    handle.shutdown_and_join().await;
    Ok(())
}
