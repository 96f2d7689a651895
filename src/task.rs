//! Task and wave outcome types shared by the scheduler and the recovery layer.
//!
//! A [`Task`] is opaque to the orchestrator: its `payload` is handed to the
//! [`TaskExecutor`] untouched and only the `success` flag of the returned
//! [`TaskOutput`] is interpreted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A unit of work submitted to a wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// What the execution collaborator reports for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TaskOutput {
    pub fn succeeded(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
        }
    }

    pub fn failed(data: serde_json::Value) -> Self {
        Self {
            success: false,
            data,
        }
    }
}

/// External collaborator that actually runs a worker for a task.
///
/// Timeouts belong here; the orchestrator never aborts an in-flight call.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> anyhow::Result<TaskOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Succeeded,
    Failed,
    /// Never admitted: its wave was skipped or the run was cancelled.
    Skipped,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Per-task line of a [`WaveResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl TaskRecord {
    pub fn succeeded(task_id: impl Into<String>, output: Option<serde_json::Value>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Succeeded,
            error: None,
            output,
        }
    }

    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Failed,
            error: Some(error.into()),
            output: None,
        }
    }

    pub fn skipped(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Skipped,
            error: Some(reason.into()),
            output: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveSummary {
    pub wave_number: u32,
    pub task_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
}

/// Aggregate outcome of one `execute_wave` call. Every input task appears
/// exactly once in `tasks`, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaveResult {
    pub tasks: Vec<TaskRecord>,
    pub waves: Vec<WaveSummary>,
    pub total_success: usize,
    pub total_failure: usize,
    pub total_skipped: usize,
}

impl WaveResult {
    /// Build a result from per-task records, recomputing the totals.
    pub fn from_records(tasks: Vec<TaskRecord>, waves: Vec<WaveSummary>) -> Self {
        let mut result = Self {
            tasks,
            waves,
            ..Default::default()
        };
        result.recount();
        result
    }

    pub fn recount(&mut self) {
        self.total_success = self.count(TaskStatus::Succeeded);
        self.total_failure = self.count(TaskStatus::Failed);
        self.total_skipped = self.count(TaskStatus::Skipped);
    }

    pub fn record(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|r| r.task_id == task_id)
    }

    pub fn ids_with(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.task_id.clone())
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.total_failure == 0 && self.total_skipped == 0
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|r| r.status == status).count()
    }
}
