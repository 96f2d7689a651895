use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::state_machine::ExecutionState;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Admission errors raised by [`ResourceGate`](crate::gate::ResourceGate).
///
/// The active set is never modified when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("max_concurrent must be within 1..=3, got {0}")]
    InvalidMaxConcurrent(usize),

    #[error("worker already registered: {0}")]
    DuplicateWorkerId(String),

    #[error("concurrency limit exceeded: {current}/{max} workers active")]
    LimitExceeded { current: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Rejected before the first attempt.
    #[error("invalid retry options: {0}")]
    InvalidOptions(String),

    /// Every attempt failed; wraps the last underlying error.
    #[error("operation failed after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: anyhow::Error,
    },

    /// The breaker for `service` is open; the operation was not invoked.
    #[error("circuit open for '{service}', retry in {}ms", .retry_in.as_millis())]
    CircuitOpen { service: String, retry_in: Duration },

    /// A single guarded call failed while the breaker let it through.
    #[error("operation failed: {0}")]
    Operation(anyhow::Error),

    #[error("no batch executor supplied and nothing to recover from checkpoint")]
    MissingExecutor,

    #[error("checkpoint store failed: {0}")]
    Checkpoint(anyhow::Error),

    #[error("batch execution failed: {0}")]
    Batch(anyhow::Error),
}

impl RecoveryError {
    /// True when the failure came from an open breaker rather than the operation.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RecoveryError::CircuitOpen { .. })
    }

    /// Number of attempts made, when this is a retry exhaustion.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            RecoveryError::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// A transition was requested from a state it does not leave from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from_state: ExecutionState,
    pub to_state: ExecutionState,
    pub reason: String,
    pub valid_transitions: Vec<String>,
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
}

impl InvalidTransition {
    /// Multi-line rendering for logs and operator output.
    pub fn verbose(&self) -> String {
        let valid = if self.valid_transitions.is_empty() {
            "  (none)".to_string()
        } else {
            self.valid_transitions
                .iter()
                .map(|t| format!("  - {t}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "Invalid state transition\n\
             task:      {}\n\
             from:      {}\n\
             to:        {}\n\
             reason:    {}\n\
             at:        {}\n\
             valid transitions from {}:\n{}",
            self.task_id,
            self.from_state,
            self.to_state,
            self.reason,
            self.timestamp.to_rfc3339(),
            self.from_state,
            valid
        )
    }
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} -> {} for task '{}': {}",
            self.from_state, self.to_state, self.task_id, self.reason
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error(transparent)]
    Invalid(#[from] InvalidTransition),

    #[error("guard '{guard}' rejected {from} -> {to}")]
    GuardRejected {
        guard: String,
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("pre-action failed during {from} -> {to}: {cause}")]
    PreActionFailed {
        from: ExecutionState,
        to: ExecutionState,
        cause: anyhow::Error,
    },

    #[error("post-action failed during {from} -> {to}: {cause}")]
    PostActionFailed {
        from: ExecutionState,
        to: ExecutionState,
        cause: anyhow::Error,
    },

    #[error("transition '{0}' is already registered")]
    Duplicate(String),

    #[error("cannot register a transition out of terminal state {0}")]
    FromTerminal(ExecutionState),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution must start in {required}, context is in {actual}")]
    NotIdle {
        required: ExecutionState,
        actual: ExecutionState,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{state} handler failed: {cause}")]
    Handler {
        state: ExecutionState,
        cause: anyhow::Error,
    },

    #[error("max retries exceeded ({max_retries})")]
    MaxRetriesExceeded { max_retries: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("wave size must be at least 1")]
    InvalidWaveSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invalid() -> InvalidTransition {
        InvalidTransition {
            from_state: ExecutionState::Idle,
            to_state: ExecutionState::Verifying,
            reason: "no edge".into(),
            valid_transitions: vec!["start_planning (IDLE -> PLANNING)".into()],
            task_id: "task-7".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn limit_exceeded_display() {
        let err = GateError::LimitExceeded { current: 3, max: 3 };
        assert_eq!(
            err.to_string(),
            "concurrency limit exceeded: 3/3 workers active"
        );
    }

    #[test]
    fn exhausted_keeps_last_error() {
        let err = RecoveryError::Exhausted {
            attempts: 3,
            last_error: anyhow::anyhow!("connection reset"),
        };
        assert_eq!(err.attempts(), Some(3));
        assert!(!err.is_circuit_open());
        assert_eq!(
            err.to_string(),
            "operation failed after 3 attempts: connection reset"
        );
    }

    #[test]
    fn invalid_transition_renderings() {
        let err = sample_invalid();
        assert_eq!(
            err.to_string(),
            "invalid transition IDLE -> VERIFYING for task 'task-7': no edge"
        );
        let verbose = err.verbose();
        assert!(verbose.contains("task:      task-7"));
        assert!(verbose.contains("  - start_planning (IDLE -> PLANNING)"));
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RecoveryError>();
        assert_send_sync::<ExecutionError>();
        assert_send_sync::<GateError>();
    }
}
