//! Failure recovery: retry with backoff, per-service circuit breakers and
//! checkpoint-based resumption of task batches.

pub mod breaker;
pub mod checkpoint;
pub mod retry;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::RecoveryError;
use crate::task::{Task, TaskRecord, TaskStatus, WaveResult};
pub use breaker::{BreakerPolicy, CircuitBreakerState, CircuitBreakers, CircuitState};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, WaveCheckpoint};
pub use retry::{RetryOptions, retry_with_backoff};

/// Runs the tasks of a batch that still need executing.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute_batch(&self, tasks: Vec<Task>) -> anyhow::Result<WaveResult>;
}

pub struct RecoveryEngine {
    breakers: CircuitBreakers,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(BreakerPolicy::default())
    }
}

impl RecoveryEngine {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            breakers: CircuitBreakers::new(policy),
            checkpoints: None,
        }
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn has_checkpoint_store(&self) -> bool {
        self.checkpoints.is_some()
    }

    pub async fn retry_with_backoff<T, F, Fut>(
        &self,
        op: F,
        options: &RetryOptions,
    ) -> Result<T, RecoveryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        retry::retry_with_backoff(op, options).await
    }

    pub async fn execute_with_circuit_breaker<T, F, Fut>(
        &self,
        service_key: &str,
        op: F,
    ) -> Result<T, RecoveryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.breakers.call(service_key, op).await
    }

    /// Retry `op` with every attempt passing through the breaker for
    /// `service_key`. An open breaker ends the retry loop immediately.
    pub async fn call<T, F, Fut>(
        &self,
        service_key: &str,
        options: &RetryOptions,
        mut op: F,
    ) -> Result<T, RecoveryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        options.validate()?;
        let mut attempt = 1;
        loop {
            match self.breakers.call(service_key, &mut op).await {
                Ok(value) => return Ok(value),
                Err(e @ RecoveryError::CircuitOpen { .. }) => return Err(e),
                Err(RecoveryError::Operation(e)) if attempt >= options.max_attempts => {
                    return Err(RecoveryError::Exhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(RecoveryError::Operation(e)) => {
                    let delay = options.delay_for(attempt, retry::jitter_factor());
                    tracing::info!(
                        service = service_key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "guarded call failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    pub fn state(&self, service_key: &str) -> CircuitBreakerState {
        self.breakers.state(service_key)
    }

    pub fn states(&self) -> HashMap<String, CircuitBreakerState> {
        self.breakers.all()
    }

    pub fn reset_state(&self, service_key: &str) {
        self.breakers.reset(service_key);
    }

    /// Execute `tasks`, skipping those a prior checkpoint for `wave_id`
    /// already settled.
    ///
    /// Recorded successes and failures are reused as-is; previously failed
    /// tasks are not retried. When nothing remains, `executor` is not called.
    /// The checkpoint is rewritten only after the executor returns.
    pub async fn execute_with_recovery(
        &self,
        tasks: Vec<Task>,
        wave_id: Option<&str>,
        executor: Option<&dyn BatchExecutor>,
    ) -> Result<WaveResult, RecoveryError> {
        let store = match (&self.checkpoints, wave_id) {
            (Some(store), Some(id)) => Some((store.clone(), id)),
            _ => None,
        };

        let Some((store, wave_id)) = store else {
            let executor = executor.ok_or(RecoveryError::MissingExecutor)?;
            return executor
                .execute_batch(tasks)
                .await
                .map_err(RecoveryError::Batch);
        };

        let mut checkpoint = store
            .load_checkpoint(wave_id)
            .await
            .map_err(RecoveryError::Checkpoint)?
            .unwrap_or_else(|| WaveCheckpoint::new(wave_id));
        checkpoint.normalize();

        let mut records: Vec<Option<TaskRecord>> = Vec::with_capacity(tasks.len());
        let mut remaining = Vec::new();
        for task in &tasks {
            if checkpoint.is_completed(&task.id) {
                records.push(Some(TaskRecord::succeeded(&task.id, None)));
            } else if checkpoint.is_failed(&task.id) {
                records.push(Some(TaskRecord::failed(
                    &task.id,
                    "failed in a previous run",
                )));
            } else {
                records.push(None);
                remaining.push(task.clone());
            }
        }

        tracing::info!(
            wave_id,
            recovered = tasks.len() - remaining.len(),
            remaining = remaining.len(),
            "checkpoint loaded"
        );

        if remaining.is_empty() {
            let records = records.into_iter().flatten().collect();
            return Ok(WaveResult::from_records(records, Vec::new()));
        }

        let executor = executor.ok_or(RecoveryError::MissingExecutor)?;
        let batch = executor
            .execute_batch(remaining)
            .await
            .map_err(RecoveryError::Batch)?;

        let mut fresh: HashMap<String, TaskRecord> = HashMap::new();
        for record in batch.tasks {
            match record.status {
                TaskStatus::Succeeded => checkpoint.record_success(&record.task_id),
                TaskStatus::Failed => checkpoint.record_failure(&record.task_id),
                TaskStatus::Skipped => {}
            }
            fresh.insert(record.task_id.clone(), record);
        }

        checkpoint.wave_number += 1;
        checkpoint.timestamp = Utc::now();
        checkpoint.normalize();
        store
            .save_checkpoint(wave_id, &checkpoint)
            .await
            .map_err(RecoveryError::Checkpoint)?;
        tracing::info!(
            wave_id,
            wave_number = checkpoint.wave_number,
            completed = checkpoint.completed_task_ids.len(),
            failed = checkpoint.failed_task_ids.len(),
            "checkpoint saved"
        );

        let merged = tasks
            .iter()
            .zip(records)
            .map(|(task, recovered)| {
                // A repeated id shares the record its executions reported.
                recovered
                    .or_else(|| fresh.get(&task.id).cloned())
                    .unwrap_or_else(|| TaskRecord::skipped(&task.id, "not reported by executor"))
            })
            .collect();
        Ok(WaveResult::from_records(merged, batch.waves))
    }
}
