//! Wave scheduling.
//!
//! Tasks are split, in input order, into sequential waves. Inside a wave each
//! task is admitted FIFO through the [`ResourceGate`]; a denied admission is
//! retried on a poll loop with exponential backoff instead of failing. The
//! next wave only starts once every admitted task of the current one settled.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RecoveryError, SchedulerError};
use crate::gate::ResourceGate;
use crate::recovery::{BatchExecutor, RecoveryEngine, RetryOptions};
use crate::state_machine::{ExecutionContext, LifecycleHandlers, StateMachine};
use crate::task::{
    Task, TaskExecutor, TaskOutput, TaskRecord, TaskStatus, WaveResult, WaveSummary,
};

pub const DEFAULT_POLL_INITIAL: Duration = Duration::from_millis(250);
pub const DEFAULT_POLL_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveOptions {
    /// Requested batch size. The gate's ceiling still bounds how many of a
    /// wave's tasks run at once.
    pub wave_size: usize,
    /// When false, a wave with any failure skips every later wave.
    pub continue_on_error: bool,
}

impl Default for WaveOptions {
    fn default() -> Self {
        Self {
            wave_size: 3,
            continue_on_error: true,
        }
    }
}

/// Progress notifications, sent in the order they happen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WaveEvent {
    WaveStarted {
        wave_number: u32,
        task_ids: Vec<String>,
    },
    TaskAdmitted {
        wave_number: u32,
        task_id: String,
        worker_id: String,
    },
    TaskSettled {
        wave_number: u32,
        task_id: String,
        status: TaskStatus,
    },
    WaveCompleted(WaveSummary),
    WavesSkipped {
        from_wave: u32,
        task_count: usize,
        reason: String,
    },
}

/// Retry and circuit breaking applied around every task call.
struct GuardedCalls {
    engine: Arc<RecoveryEngine>,
    options: RetryOptions,
    circuit: Option<String>,
}

pub struct WaveScheduler {
    gate: Arc<ResourceGate>,
    executor: Arc<dyn TaskExecutor>,
    guarded: Option<Arc<GuardedCalls>>,
    options: WaveOptions,
    poll_initial: Duration,
    poll_max: Duration,
    cancel: CancellationToken,
    events: Option<UnboundedSender<WaveEvent>>,
}

impl WaveScheduler {
    pub fn new(gate: Arc<ResourceGate>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            gate,
            executor,
            guarded: None,
            options: WaveOptions::default(),
            poll_initial: DEFAULT_POLL_INITIAL,
            poll_max: DEFAULT_POLL_MAX,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Options used when the scheduler runs as a [`BatchExecutor`].
    pub fn with_options(mut self, options: WaveOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_poll(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_initial = initial;
        self.poll_max = max.max(initial);
        self
    }

    /// Retry each task call per `options`; with a `circuit` key every attempt
    /// also passes through that circuit breaker. A task reporting
    /// `success: false` counts as a failed attempt.
    pub fn with_recovery(
        mut self,
        engine: Arc<RecoveryEngine>,
        options: RetryOptions,
        circuit: Option<String>,
    ) -> Self {
        self.guarded = Some(Arc::new(GuardedCalls {
            engine,
            options,
            circuit,
        }));
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<WaveEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling stops admissions; in-flight tasks are drained, not aborted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn gate(&self) -> &Arc<ResourceGate> {
        &self.gate
    }

    pub fn options(&self) -> &WaveOptions {
        &self.options
    }

    fn emit(&self, event: WaveEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is watching.
            let _ = events.send(event);
        }
    }

    pub async fn execute_wave(
        &self,
        tasks: Vec<Task>,
        options: &WaveOptions,
    ) -> Result<WaveResult, SchedulerError> {
        if options.wave_size == 0 {
            return Err(SchedulerError::InvalidWaveSize);
        }

        let total_waves = tasks.len().div_ceil(options.wave_size);
        tracing::info!(
            tasks = tasks.len(),
            waves = total_waves,
            wave_size = options.wave_size,
            max_concurrent = self.gate.max_concurrent(),
            "wave execution started"
        );

        let mut records = Vec::with_capacity(tasks.len());
        let mut waves = Vec::new();

        for (index, chunk) in tasks.chunks(options.wave_size).enumerate() {
            let wave_number = index as u32 + 1;

            let halt = if self.cancel.is_cancelled() {
                Some("cancelled")
            } else if !options.continue_on_error
                && waves.iter().any(|w: &WaveSummary| w.failure_count > 0)
            {
                Some("previous wave failed")
            } else {
                None
            };
            if let Some(reason) = halt {
                let rest = &tasks[index * options.wave_size..];
                tracing::warn!(
                    from_wave = wave_number,
                    tasks = rest.len(),
                    reason,
                    "skipping remaining waves"
                );
                self.emit(WaveEvent::WavesSkipped {
                    from_wave: wave_number,
                    task_count: rest.len(),
                    reason: reason.to_string(),
                });
                records.extend(rest.iter().map(|t| TaskRecord::skipped(&t.id, reason)));
                break;
            }

            let (wave_records, summary) = self.run_wave(wave_number, chunk).await;
            records.extend(wave_records);
            waves.push(summary);
        }

        let result = WaveResult::from_records(records, waves);
        tracing::info!(
            succeeded = result.total_success,
            failed = result.total_failure,
            skipped = result.total_skipped,
            "wave execution finished"
        );
        Ok(result)
    }

    /// Run one wave to completion.
    async fn run_wave(&self, wave_number: u32, tasks: &[Task]) -> (Vec<TaskRecord>, WaveSummary) {
        tracing::info!(wave = wave_number, tasks = tasks.len(), "wave started");
        self.emit(WaveEvent::WaveStarted {
            wave_number,
            task_ids: tasks.iter().map(|t| t.id.clone()).collect(),
        });

        let mut settled: Vec<Option<TaskRecord>> = vec![None; tasks.len()];
        let mut workers: Vec<String> = Vec::new();
        let mut join_set: JoinSet<(usize, TaskRecord)> = JoinSet::new();
        let mut next = 0;
        let mut poll = self.poll_initial;

        while next < tasks.len() {
            if self.cancel.is_cancelled() {
                tracing::info!(wave = wave_number, "cancelled, no further admissions");
                break;
            }

            if self.gate.can_spawn().await {
                let worker_id = format!("worker-{}", Uuid::new_v4());
                match self.gate.register(&worker_id) {
                    Ok(()) => {
                        let task = &tasks[next];
                        tracing::debug!(
                            wave = wave_number,
                            task = %task.id,
                            worker = %worker_id,
                            "task admitted"
                        );
                        self.emit(WaveEvent::TaskAdmitted {
                            wave_number,
                            task_id: task.id.clone(),
                            worker_id: worker_id.clone(),
                        });
                        self.spawn(&mut join_set, next, task.clone(), worker_id.clone());
                        workers.push(worker_id);
                        next += 1;
                        poll = self.poll_initial;
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(wave = wave_number, error = %e, "registration refused");
                    }
                }
            }

            tracing::debug!(
                wave = wave_number,
                in_flight = join_set.len(),
                wait_ms = poll.as_millis() as u64,
                "admission denied, waiting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                Some(joined) = join_set.join_next() => {
                    self.settle(wave_number, tasks, &mut settled, joined);
                    poll = self.poll_initial;
                }
                _ = tokio::time::sleep(poll) => {
                    poll = (poll * 2).min(self.poll_max);
                }
            }
        }

        if !join_set.is_empty() {
            tracing::info!(wave = wave_number, in_flight = join_set.len(), "draining wave");
        }
        while let Some(joined) = join_set.join_next().await {
            self.settle(wave_number, tasks, &mut settled, joined);
        }

        // Only reachable if a worker was torn down without reporting back.
        for worker in workers.iter().filter(|w| self.gate.is_active(w)) {
            self.gate.unregister(worker);
        }

        let records: Vec<TaskRecord> = tasks
            .iter()
            .zip(settled)
            .enumerate()
            .map(|(i, (task, record))| match record {
                Some(record) => record,
                None if i < next => TaskRecord::failed(&task.id, "worker lost before reporting"),
                None => TaskRecord::skipped(&task.id, "cancelled"),
            })
            .collect();

        let summary = WaveSummary {
            wave_number,
            task_count: tasks.len(),
            success_count: records
                .iter()
                .filter(|r| r.status == TaskStatus::Succeeded)
                .count(),
            failure_count: records
                .iter()
                .filter(|r| r.status == TaskStatus::Failed)
                .count(),
        };
        tracing::info!(
            wave = wave_number,
            succeeded = summary.success_count,
            failed = summary.failure_count,
            "wave completed"
        );
        self.emit(WaveEvent::WaveCompleted(summary.clone()));
        (records, summary)
    }

    fn spawn(
        &self,
        join_set: &mut JoinSet<(usize, TaskRecord)>,
        index: usize,
        task: Task,
        worker_id: String,
    ) {
        let gate = self.gate.clone();
        let executor = self.executor.clone();
        let guarded = self.guarded.clone();
        join_set.spawn(async move {
            let outcome = AssertUnwindSafe(run_task(executor.as_ref(), guarded.as_deref(), &task))
                .catch_unwind()
                .await;
            gate.unregister(&worker_id);
            let record = outcome.unwrap_or_else(|panic| {
                let message = panic_message(&*panic);
                tracing::error!(
                    task = %task.id,
                    worker = %worker_id,
                    panic = %message,
                    "task executor panicked"
                );
                TaskRecord::failed(&task.id, format!("executor panicked: {message}"))
            });
            (index, record)
        });
    }

    fn settle(
        &self,
        wave_number: u32,
        tasks: &[Task],
        settled: &mut [Option<TaskRecord>],
        joined: Result<(usize, TaskRecord), tokio::task::JoinError>,
    ) {
        match joined {
            Ok((index, record)) => {
                match record.status {
                    TaskStatus::Failed => tracing::warn!(
                        wave = wave_number,
                        task = %tasks[index].id,
                        error = record.error.as_deref().unwrap_or(""),
                        "task failed"
                    ),
                    _ => tracing::info!(
                        wave = wave_number,
                        task = %tasks[index].id,
                        "task succeeded"
                    ),
                }
                self.emit(WaveEvent::TaskSettled {
                    wave_number,
                    task_id: record.task_id.clone(),
                    status: record.status,
                });
                settled[index] = Some(record);
            }
            Err(e) => {
                tracing::error!(wave = wave_number, error = %e, "worker task did not complete")
            }
        }
    }

    /// Run `tasks` under the checkpoint `wave_id`: tasks the checkpoint
    /// already settled are not executed again.
    pub async fn execute_resumable(
        &self,
        recovery: &RecoveryEngine,
        wave_id: &str,
        tasks: Vec<Task>,
    ) -> Result<WaveResult, RecoveryError> {
        recovery
            .execute_with_recovery(tasks, Some(wave_id), Some(self as &dyn BatchExecutor))
            .await
    }
}

#[async_trait]
impl BatchExecutor for WaveScheduler {
    async fn execute_batch(&self, tasks: Vec<Task>) -> anyhow::Result<WaveResult> {
        Ok(self.execute_wave(tasks, &self.options).await?)
    }
}

async fn run_task(
    executor: &dyn TaskExecutor,
    guarded: Option<&GuardedCalls>,
    task: &Task,
) -> TaskRecord {
    let Some(guarded) = guarded else {
        return match executor.execute(task).await {
            Ok(output) if output.success => TaskRecord::succeeded(&task.id, Some(output.data)),
            Ok(output) => TaskRecord {
                output: Some(output.data),
                ..TaskRecord::failed(&task.id, "executor reported failure")
            },
            Err(e) => TaskRecord::failed(&task.id, format!("{e:#}")),
        };
    };

    let attempt = move || async move {
        let output = executor.execute(task).await?;
        if !output.success {
            anyhow::bail!("executor reported failure for task {}", task.id);
        }
        Ok(output)
    };
    let outcome = match guarded.circuit.as_deref() {
        Some(service) => guarded.engine.call(service, &guarded.options, attempt).await,
        None => guarded.engine.retry_with_backoff(attempt, &guarded.options).await,
    };
    match outcome {
        Ok(output) => TaskRecord::succeeded(&task.id, Some(output.data)),
        Err(e) => TaskRecord::failed(&task.id, e.to_string()),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drives every task through a [`StateMachine`] run with the given handlers.
///
/// The task payload becomes the context inputs. The run's final state, retry
/// count, outputs and error are reported as the task output.
pub struct LifecycleTaskExecutor<H> {
    machine: Arc<StateMachine>,
    handlers: H,
}

impl<H: LifecycleHandlers> LifecycleTaskExecutor<H> {
    pub fn new(machine: Arc<StateMachine>, handlers: H) -> Self {
        Self { machine, handlers }
    }
}

#[async_trait]
impl<H: LifecycleHandlers> TaskExecutor for LifecycleTaskExecutor<H> {
    async fn execute(&self, task: &Task) -> anyhow::Result<TaskOutput> {
        let mut ctx = ExecutionContext::new(&task.id, task.payload.clone());
        let run = self.machine.execute(&mut ctx, &self.handlers).await;
        let data = serde_json::json!({
            "final_state": run.final_state,
            "retry_count": run.retry_count,
            "transitions": run.history.len(),
            "outputs": ctx.outputs,
            "error": run.error.as_ref().map(|e| e.to_string()),
        });
        Ok(TaskOutput {
            success: run.success,
            data,
        })
    }
}
