use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use wavegate::gate::{ResourceMonitor, ResourceSnapshot, ResourceThresholds};
use wavegate::recovery::{BreakerPolicy, CircuitState, MemoryCheckpointStore, RetryOptions};
use wavegate::state_machine::{ExecutionContext, LifecycleHandlers, StateMachineConfig};
use wavegate::{
    LifecycleTaskExecutor, RecoveryEngine, ResourceGate, StateMachine, Task, TaskExecutor,
    TaskOutput, TaskStatus, WaveEvent, WaveOptions, WaveScheduler,
};

struct QuietHost;

#[async_trait]
impl ResourceMonitor for QuietHost {
    async fn current_metrics(&self) -> anyhow::Result<ResourceSnapshot> {
        Ok(ResourceSnapshot {
            cpu_percent_of_one_core: 12.0,
            memory_pressure_percent: 45.0,
            process_count: 180,
            thread_count: Some(64),
            timestamp: Utc::now(),
        })
    }
}

fn gate(max: usize) -> Arc<ResourceGate> {
    Arc::new(
        ResourceGate::with_monitor(max, ResourceThresholds::default(), Arc::new(QuietHost))
            .unwrap(),
    )
}

fn batch(n: usize) -> Vec<Task> {
    (1..=n)
        .map(|i| Task::new(format!("task-{i}"), json!({ "n": i })))
        .collect()
}

/// Verification of the ids in `redo_once` fails the first time; the ids in
/// `broken` crash during execution.
struct Script {
    redo_once: Mutex<HashSet<String>>,
    broken: HashSet<String>,
    executions: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Clone)]
struct Handlers(Arc<Script>);

impl Handlers {
    fn new(redo_once: &[&str], broken: &[&str]) -> Self {
        Self(Arc::new(Script {
            redo_once: Mutex::new(redo_once.iter().map(|s| s.to_string()).collect()),
            broken: broken.iter().map(|s| s.to_string()).collect(),
            executions: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }))
    }
}

#[async_trait]
impl LifecycleHandlers for Handlers {
    async fn on_executing(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        self.0.executions.fetch_add(1, Ordering::SeqCst);
        let now = self.0.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        if self.0.broken.contains(&ctx.task_id) {
            anyhow::bail!("worker for {} crashed", ctx.task_id);
        }
        Ok(())
    }

    async fn on_verifying(&self, ctx: &mut ExecutionContext) -> anyhow::Result<bool> {
        Ok(!self.0.redo_once.lock().unwrap().remove(&ctx.task_id))
    }

    async fn on_committing(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        ctx.outputs = json!({ "done": ctx.task_id });
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn lifecycle_waves_respect_the_gate() {
    let handlers = Handlers::new(&["task-2"], &["task-4"]);
    let executor = LifecycleTaskExecutor::new(
        Arc::new(StateMachine::new(StateMachineConfig::default())),
        handlers.clone(),
    );
    let gate = gate(2);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let scheduler = WaveScheduler::new(gate.clone(), Arc::new(executor)).with_events(tx);

    let result = scheduler
        .execute_wave(
            batch(6),
            &WaveOptions {
                wave_size: 3,
                continue_on_error: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(result.tasks.len(), 6);
    assert_eq!(result.total_success, 5);
    assert_eq!(result.total_failure, 1);
    assert_eq!(result.record("task-4").unwrap().status, TaskStatus::Failed);
    assert_eq!(result.waves.len(), 2);
    assert!(handlers.0.peak.load(Ordering::SeqCst) <= 2);
    // task-2 executed twice because its first verification failed.
    assert_eq!(handlers.0.executions.load(Ordering::SeqCst), 7);
    assert_eq!(gate.active_count(), 0);

    let output = result.record("task-2").unwrap().output.clone().unwrap();
    assert_eq!(output["retry_count"], json!(1));
    assert_eq!(output["outputs"], json!({ "done": "task-2" }));

    // Wave 2 never starts admitting before wave 1 has completed.
    let mut order = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            WaveEvent::WaveStarted { wave_number, .. } => {
                order.push(format!("start-{wave_number}"))
            }
            WaveEvent::WaveCompleted(summary) => order.push(format!("end-{}", summary.wave_number)),
            _ => {}
        }
    }
    assert_eq!(order, vec!["start-1", "end-1", "start-2", "end-2"]);
}

/// Fails every call until `healthy` is flipped.
struct Upstream {
    healthy: Mutex<bool>,
    calls: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for Upstream {
    async fn execute(&self, task: &Task) -> anyhow::Result<TaskOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.healthy.lock().unwrap() {
            Ok(TaskOutput::succeeded(json!({ "id": task.id })))
        } else {
            anyhow::bail!("upstream unavailable")
        }
    }
}

#[tokio::test(start_paused = true)]
async fn open_circuit_fails_fast_then_checkpoint_resumes() {
    let upstream = Arc::new(Upstream {
        healthy: Mutex::new(false),
        calls: AtomicUsize::new(0),
    });
    let engine = Arc::new(
        RecoveryEngine::new(BreakerPolicy {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        })
        .with_checkpoint_store(Arc::new(MemoryCheckpointStore::new())),
    );
    let retry = RetryOptions {
        max_attempts: 2,
        base_delay_ms: 100,
        max_delay_ms: 1000,
    };
    let scheduler = WaveScheduler::new(gate(1), upstream.clone())
        .with_recovery(engine.clone(), retry, Some("upstream".into()))
        .with_options(WaveOptions {
            wave_size: 4,
            continue_on_error: true,
        });

    let first = scheduler
        .execute_resumable(&engine, "nightly", batch(4))
        .await
        .unwrap();

    // Two attempts for task-1, one more trips the breaker, the rest are rejected.
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
    assert_eq!(first.total_failure, 4);
    assert_eq!(engine.state("upstream").state, CircuitState::Open);
    assert!(
        first
            .record("task-4")
            .unwrap()
            .error
            .as_deref()
            .unwrap()
            .contains("circuit open")
    );

    // Failures are recorded, so a resumed run does not retry them.
    *upstream.healthy.lock().unwrap() = true;
    tokio::time::advance(Duration::from_secs(61)).await;
    let resumed = scheduler
        .execute_resumable(&engine, "nightly", batch(5))
        .await
        .unwrap();

    assert_eq!(upstream.calls.load(Ordering::SeqCst), 4);
    assert_eq!(resumed.total_failure, 4);
    assert_eq!(resumed.total_success, 1);
    assert_eq!(resumed.record("task-5").unwrap().status, TaskStatus::Succeeded);
    assert_eq!(engine.state("upstream").state, CircuitState::Closed);
}
