use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a task run.
///
/// A run flows IDLE → PLANNING → EXECUTING → VERIFYING → COMMITTING → COMPLETED,
/// looping VERIFYING → EXECUTING on failed verification. FAILED is reachable
/// from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Idle,
    Planning,
    Executing,
    Verifying,
    Committing,
    Completed,
    Failed,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 7] = [
        ExecutionState::Idle,
        ExecutionState::Planning,
        ExecutionState::Executing,
        ExecutionState::Verifying,
        ExecutionState::Committing,
        ExecutionState::Completed,
        ExecutionState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Failed)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Idle => write!(f, "IDLE"),
            ExecutionState::Planning => write!(f, "PLANNING"),
            ExecutionState::Executing => write!(f, "EXECUTING"),
            ExecutionState::Verifying => write!(f, "VERIFYING"),
            ExecutionState::Committing => write!(f, "COMMITTING"),
            ExecutionState::Completed => write!(f, "COMPLETED"),
            ExecutionState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Working state of one task run. Transitions only ever change `state`;
/// handlers and actions are free to fill `outputs` and `artifacts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub scope_id: String,
    pub task_id: String,
    pub state: ExecutionState,
    pub inputs: serde_json::Value,
    pub outputs: serde_json::Value,
    pub artifacts: HashMap<String, serde_json::Value>,
    pub start_time: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<String>, inputs: serde_json::Value) -> Self {
        Self {
            scope_id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            state: ExecutionState::Idle,
            inputs,
            outputs: serde_json::Value::Null,
            artifacts: HashMap::new(),
            start_time: Utc::now(),
        }
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = scope_id.into();
        self
    }
}

/// One committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from_state: ExecutionState,
    pub to_state: ExecutionState,
    pub transition_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_and_failed_are_terminal() {
        let terminal: Vec<_> = ExecutionState::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![&ExecutionState::Completed, &ExecutionState::Failed]
        );
    }

    #[test]
    fn state_display_and_serde_agree() {
        for state in ExecutionState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
    }

    #[test]
    fn new_context_starts_idle() {
        let ctx = ExecutionContext::new("t-1", serde_json::json!({"prompt": "x"}));
        assert_eq!(ctx.state, ExecutionState::Idle);
        assert_eq!(ctx.task_id, "t-1");
        assert!(ctx.outputs.is_null());
        assert!(!ctx.scope_id.is_empty());
        assert_eq!(ctx.with_scope("batch-9").scope_id, "batch-9");
    }
}
