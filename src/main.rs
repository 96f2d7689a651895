mod cli;
mod ui;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Command};
use ui::WaveProgress;
use wavegate::gate::{ResourceMonitor, ResourceSnapshot};
use wavegate::recovery::MemoryCheckpointStore;
use wavegate::state_machine::{ExecutionContext, LifecycleHandlers};
use wavegate::{
    LifecycleTaskExecutor, RecoveryEngine, ResourceGate, StateMachine, Task, TaskExecutor,
    WaveScheduler, WavegateConfig,
};

const DEMO_WAVE_ID: &str = "demo-batch";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => WavegateConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WavegateConfig::load()?,
    };
    if let Some(max) = cli.max_concurrent {
        config.gate.max_concurrent = max;
    }
    if let Some(size) = cli.wave_size {
        config.scheduler.wave_size = size;
    }
    config.validate()?;

    match cli.command {
        Command::Check { json } => {
            let gate = ResourceGate::new(config.gate.max_concurrent)?;
            gate.set_baseline().await;
            let check = gate.check_resources().await;
            ui::print_check(&check, json);
        }
        Command::Demo {
            tasks,
            failure_rate,
            halt_on_error,
        } => {
            if halt_on_error {
                config.scheduler.continue_on_error = false;
            }
            demo(&config, tasks, failure_rate.clamp(0.0, 1.0)).await?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Runs the batch once, then again under the same checkpoint so the second
/// run only reports what the first one settled.
async fn demo(config: &WavegateConfig, task_count: usize, failure_rate: f64) -> Result<()> {
    let gate = Arc::new(ResourceGate::with_monitor(
        config.gate.max_concurrent,
        config.thresholds(),
        Arc::new(SimulatedHost),
    )?);
    gate.set_baseline().await;

    let store = Arc::new(MemoryCheckpointStore::new());
    let recovery =
        RecoveryEngine::new(config.breaker_policy()).with_checkpoint_store(store.clone());
    let machine = Arc::new(StateMachine::new(config.state_machine()));
    let executor: Arc<dyn TaskExecutor> = Arc::new(LifecycleTaskExecutor::new(
        machine,
        SimulatedWorker { failure_rate },
    ));
    let (poll_initial, poll_max) = config.poll_interval();

    let shutdown = CancellationToken::new();
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, finishing in-flight tasks");
            on_ctrl_c.cancel();
        }
    });

    let batch: Vec<Task> = (1..=task_count)
        .map(|i| Task::new(format!("task-{i}"), json!({ "index": i })))
        .collect();

    for label in ["first run", "resumed run"] {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = WaveScheduler::new(gate.clone(), executor.clone())
            .with_options(config.wave_options())
            .with_poll(poll_initial, poll_max)
            .with_cancellation(shutdown.clone())
            .with_events(tx);

        let progress = WaveProgress::start(label, batch.len());
        let watcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                progress.handle(&event);
            }
            progress
        });

        let outcome = scheduler
            .execute_resumable(&recovery, DEMO_WAVE_ID, batch.clone())
            .await;
        drop(scheduler);
        let progress = watcher.await?;
        let result = outcome?;
        progress.finish(&result);

        if let Some(checkpoint) = store.get(DEMO_WAVE_ID) {
            tracing::info!(
                label,
                wave_number = checkpoint.wave_number,
                completed = checkpoint.completed_task_ids.len(),
                failed = checkpoint.failed_task_ids.len(),
                "checkpoint after run"
            );
        }
        if shutdown.is_cancelled() {
            break;
        }
    }

    Ok(())
}

/// Host readings that hover around the CPU threshold, so admission is
/// occasionally refused and the scheduler has to wait.
struct SimulatedHost;

#[async_trait]
impl ResourceMonitor for SimulatedHost {
    async fn current_metrics(&self) -> Result<ResourceSnapshot> {
        let mut rng = rand::thread_rng();
        Ok(ResourceSnapshot {
            cpu_percent_of_one_core: rng.gen_range(10.0..60.0),
            memory_pressure_percent: rng.gen_range(30.0..70.0),
            process_count: rng.gen_range(150..300),
            thread_count: Some(rng.gen_range(40..200)),
            timestamp: Utc::now(),
        })
    }
}

/// Sleeps through each phase; fails outright at `failure_rate` and asks for
/// a re-execution a third of the time.
struct SimulatedWorker {
    failure_rate: f64,
}

impl SimulatedWorker {
    async fn work(&self, min_ms: u64, max_ms: u64) {
        let ms = rand::thread_rng().gen_range(min_ms..max_ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl LifecycleHandlers for SimulatedWorker {
    async fn on_planning(&self, ctx: &mut ExecutionContext) -> Result<()> {
        self.work(50, 150).await;
        ctx.artifacts.insert("plan".into(), json!(["execute", "verify"]));
        Ok(())
    }

    async fn on_executing(&self, ctx: &mut ExecutionContext) -> Result<()> {
        self.work(200, 600).await;
        if rand::thread_rng().gen_bool(self.failure_rate) {
            anyhow::bail!("simulated worker crash on {}", ctx.task_id);
        }
        Ok(())
    }

    async fn on_verifying(&self, _ctx: &mut ExecutionContext) -> Result<bool> {
        self.work(50, 150).await;
        Ok(!rand::thread_rng().gen_bool(1.0 / 3.0))
    }

    async fn on_committing(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.outputs = json!({ "task": ctx.task_id, "committed_at": Utc::now() });
        Ok(())
    }
}
