use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::state::{ExecutionContext, ExecutionState, HistoryEntry};
use super::transition::{Transition, TransitionResult, TransitionTable};
use crate::error::{ExecutionError, TransitionError};

/// Work performed as the run enters each state. Every hook is optional.
#[async_trait]
pub trait LifecycleHandlers: Send + Sync {
    async fn on_planning(&self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_executing(&self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// `false` sends the run back to EXECUTING, up to `max_retries` times.
    async fn on_verifying(&self, _ctx: &mut ExecutionContext) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn on_committing(&self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handlers that do nothing; the run walks straight to COMPLETED.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandlers;

impl LifecycleHandlers for NoopHandlers {}

pub type StateObserver = Arc<dyn Fn(ExecutionState, ExecutionState) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMachineConfig {
    pub max_retries: u32,
    /// Register a fail edge out of every non-terminal state.
    pub fail_transitions: bool,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            fail_transitions: true,
        }
    }
}

#[derive(Debug)]
pub struct ExecutionResult {
    pub success: bool,
    pub final_state: ExecutionState,
    pub history: Vec<HistoryEntry>,
    pub retry_count: u32,
    pub error: Option<ExecutionError>,
}

/// Drives one [`ExecutionContext`] through the lifecycle.
pub struct StateMachine {
    config: StateMachineConfig,
    table: TransitionTable,
    observers: Vec<StateObserver>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(StateMachineConfig::default())
    }
}

struct Run {
    history: Vec<HistoryEntry>,
    retry_count: u32,
}

impl StateMachine {
    pub fn new(config: StateMachineConfig) -> Self {
        Self {
            table: TransitionTable::with_defaults(config.fail_transitions),
            config,
            observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Add an edge, e.g. a guarded variant of a default one with a higher
    /// priority.
    pub fn register(&mut self, transition: Transition) -> Result<(), TransitionError> {
        self.table.register(transition)
    }

    /// Called synchronously, in commit order, for every committed transition.
    pub fn on_state_change<F>(&mut self, observer: F)
    where
        F: Fn(ExecutionState, ExecutionState) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
    }

    pub fn valid_transitions(&self, state: ExecutionState) -> Vec<&Transition> {
        self.table.valid_transitions(state)
    }

    pub fn valid_target_states(&self, state: ExecutionState) -> Vec<ExecutionState> {
        self.table.valid_target_states(state)
    }

    pub fn is_valid_transition(&self, from: ExecutionState, to: ExecutionState) -> bool {
        self.table.is_valid_transition(from, to)
    }

    /// Fire a single registered transition by id, recording nothing.
    pub async fn fire(&self, id: &str, ctx: &mut ExecutionContext) -> TransitionResult {
        let result = self.table.fire(id, ctx).await;
        if result.success {
            self.notify(result.from_state, result.to_state);
        }
        result
    }

    /// Run `ctx` from IDLE to a terminal state.
    pub async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        handlers: &dyn LifecycleHandlers,
    ) -> ExecutionResult {
        if ctx.state != ExecutionState::Idle {
            return ExecutionResult {
                success: false,
                final_state: ctx.state,
                history: Vec::new(),
                retry_count: 0,
                error: Some(ExecutionError::NotIdle {
                    required: ExecutionState::Idle,
                    actual: ctx.state,
                }),
            };
        }

        let mut run = Run {
            history: Vec::new(),
            retry_count: 0,
        };

        match self.drive(ctx, handlers, &mut run).await {
            Ok(()) => {
                tracing::info!(
                    task = %ctx.task_id,
                    retries = run.retry_count,
                    "task run completed"
                );
                ExecutionResult {
                    success: true,
                    final_state: ctx.state,
                    history: run.history,
                    retry_count: run.retry_count,
                    error: None,
                }
            }
            Err(error) => {
                tracing::warn!(task = %ctx.task_id, state = %ctx.state, %error, "task run failed");
                self.force_failed(ctx, &mut run).await;
                ExecutionResult {
                    success: false,
                    final_state: ctx.state,
                    history: run.history,
                    retry_count: run.retry_count,
                    error: Some(error),
                }
            }
        }
    }

    async fn drive(
        &self,
        ctx: &mut ExecutionContext,
        handlers: &dyn LifecycleHandlers,
        run: &mut Run,
    ) -> Result<(), ExecutionError> {
        use ExecutionState::*;

        self.advance(ctx, Planning, None, run).await?;
        handlers
            .on_planning(ctx)
            .await
            .map_err(|cause| handler_error(Planning, cause))?;

        self.advance(ctx, Executing, None, run).await?;
        handlers
            .on_executing(ctx)
            .await
            .map_err(|cause| handler_error(Executing, cause))?;

        loop {
            self.advance(ctx, Verifying, None, run).await?;
            let verified = handlers
                .on_verifying(ctx)
                .await
                .map_err(|cause| handler_error(Verifying, cause))?;
            if verified {
                break;
            }
            if run.retry_count >= self.config.max_retries {
                return Err(ExecutionError::MaxRetriesExceeded {
                    max_retries: self.config.max_retries,
                });
            }
            let attempt = run.retry_count + 1;
            tracing::info!(
                task = %ctx.task_id,
                attempt,
                max = self.config.max_retries,
                "verification failed, re-executing"
            );
            self.advance(ctx, Executing, Some(attempt), run).await?;
            run.retry_count = attempt;
            handlers
                .on_executing(ctx)
                .await
                .map_err(|cause| handler_error(Executing, cause))?;
        }

        self.advance(ctx, Committing, None, run).await?;
        handlers
            .on_committing(ctx)
            .await
            .map_err(|cause| handler_error(Committing, cause))?;

        ctx.state = Completed;
        self.commit(Committing, Completed, "complete", None, run);
        Ok(())
    }

    async fn advance(
        &self,
        ctx: &mut ExecutionContext,
        to: ExecutionState,
        retry_attempt: Option<u32>,
        run: &mut Run,
    ) -> Result<(), TransitionError> {
        let from = ctx.state;
        let Some(transition) = self.table.find(from, to) else {
            return Err(self
                .table
                .invalid(ctx, to, "no registered transition")
                .into());
        };
        let result = self.table.run(transition, ctx).await;
        if let Some(error) = result.error {
            return Err(error);
        }
        self.commit(from, to, &transition.name, retry_attempt, run);
        Ok(())
    }

    async fn force_failed(&self, ctx: &mut ExecutionContext, run: &mut Run) {
        let from = ctx.state;
        if from.is_terminal() {
            return;
        }
        if let Some(transition) = self.table.find(from, ExecutionState::Failed) {
            let result = self.table.run(transition, ctx).await;
            if result.success {
                self.commit(from, ExecutionState::Failed, &transition.name, None, run);
                return;
            }
            tracing::warn!(task = %ctx.task_id, "fail transition rejected, forcing FAILED");
        }
        ctx.state = ExecutionState::Failed;
        self.commit(from, ExecutionState::Failed, "fail", None, run);
    }

    fn commit(
        &self,
        from: ExecutionState,
        to: ExecutionState,
        name: &str,
        retry_attempt: Option<u32>,
        run: &mut Run,
    ) {
        tracing::debug!(%from, %to, transition = name, "transition committed");
        run.history.push(HistoryEntry {
            from_state: from,
            to_state: to,
            transition_name: name.to_string(),
            retry_attempt,
            timestamp: Utc::now(),
        });
        self.notify(from, to);
    }

    fn notify(&self, from: ExecutionState, to: ExecutionState) {
        for observer in &self.observers {
            observer(from, to);
        }
    }
}

fn handler_error(state: ExecutionState, cause: anyhow::Error) -> ExecutionError {
    ExecutionError::Handler { state, cause }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::transition::{Guard, RETRY_TRANSITION};
    use crate::state_machine::ExecutionState::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Verification answers are consumed in order; the last one repeats.
    struct Scripted {
        verdicts: Vec<bool>,
        verify_calls: AtomicU32,
        execute_calls: AtomicU32,
        fail_in: Option<ExecutionState>,
    }

    impl Scripted {
        fn new(verdicts: &[bool]) -> Self {
            Self {
                verdicts: verdicts.to_vec(),
                verify_calls: AtomicU32::new(0),
                execute_calls: AtomicU32::new(0),
                fail_in: None,
            }
        }

        fn failing_in(state: ExecutionState) -> Self {
            Self {
                fail_in: Some(state),
                ..Self::new(&[true])
            }
        }

        fn maybe_fail(&self, state: ExecutionState) -> anyhow::Result<()> {
            if self.fail_in == Some(state) {
                anyhow::bail!("{state} handler exploded");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LifecycleHandlers for Scripted {
        async fn on_planning(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
            ctx.artifacts.insert("plan".into(), json!(["step-1"]));
            self.maybe_fail(Planning)
        }

        async fn on_executing(&self, _ctx: &mut ExecutionContext) -> anyhow::Result<()> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            self.maybe_fail(Executing)
        }

        async fn on_verifying(&self, _ctx: &mut ExecutionContext) -> anyhow::Result<bool> {
            let n = self.verify_calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.maybe_fail(Verifying)?;
            Ok(*self
                .verdicts
                .get(n)
                .or(self.verdicts.last())
                .unwrap_or(&true))
        }

        async fn on_committing(&self, ctx: &mut ExecutionContext) -> anyhow::Result<()> {
            ctx.outputs = json!({"committed": true});
            self.maybe_fail(Committing)
        }
    }

    fn path(result: &ExecutionResult) -> Vec<(ExecutionState, ExecutionState)> {
        result
            .history
            .iter()
            .map(|h| (h.from_state, h.to_state))
            .collect()
    }

    #[tokio::test]
    async fn happy_path_walks_all_states() {
        let sm = StateMachine::default();
        let mut ctx = ExecutionContext::new("t", json!({}));
        let result = sm.execute(&mut ctx, &Scripted::new(&[true])).await;

        assert!(result.success);
        assert_eq!(result.final_state, Completed);
        assert_eq!(result.retry_count, 0);
        assert_eq!(
            path(&result),
            vec![
                (Idle, Planning),
                (Planning, Executing),
                (Executing, Verifying),
                (Verifying, Committing),
                (Committing, Completed),
            ]
        );
        assert_eq!(ctx.outputs, json!({"committed": true}));
        assert!(ctx.artifacts.contains_key("plan"));
    }

    #[tokio::test]
    async fn one_failed_verification_retries_once() {
        let sm = StateMachine::default();
        let handlers = Scripted::new(&[false, true]);
        let mut ctx = ExecutionContext::new("t", json!({}));
        let result = sm.execute(&mut ctx, &handlers).await;

        assert!(result.success);
        assert_eq!(result.retry_count, 1);
        let retries: Vec<_> = result
            .history
            .iter()
            .filter(|h| h.transition_name == RETRY_TRANSITION)
            .collect();
        assert_eq!(retries.len(), 1);
        assert_eq!(retries[0].retry_attempt, Some(1));
        assert_eq!(retries[0].from_state, Verifying);
        assert_eq!(retries[0].to_state, Executing);
        assert_eq!(handlers.execute_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn always_failing_verification_exhausts_retries() {
        let sm = StateMachine::default();
        let handlers = Scripted::new(&[false]);
        let mut ctx = ExecutionContext::new("t", json!({}));
        let result = sm.execute(&mut ctx, &handlers).await;

        assert!(!result.success);
        assert_eq!(result.final_state, Failed);
        assert_eq!(ctx.state, Failed);
        assert_eq!(result.retry_count, 3);
        assert_eq!(handlers.verify_calls.load(Ordering::SeqCst), 4);
        let error = result.error.unwrap();
        assert!(matches!(
            error,
            ExecutionError::MaxRetriesExceeded { max_retries: 3 }
        ));
        assert!(error.to_string().contains("max retries"));
        let last = result.history.last().unwrap();
        assert_eq!((last.from_state, last.to_state), (Verifying, Failed));
    }

    #[tokio::test]
    async fn handler_error_forces_failed() {
        let sm = StateMachine::default();
        let mut ctx = ExecutionContext::new("t", json!({}));
        let result = sm.execute(&mut ctx, &Scripted::failing_in(Executing)).await;

        assert!(!result.success);
        assert_eq!(result.final_state, Failed);
        match &result.error {
            Some(ExecutionError::Handler { state, cause }) => {
                assert_eq!(*state, Executing);
                assert!(cause.to_string().contains("exploded"));
            }
            other => panic!("expected handler error, got {other:?}"),
        }
        assert_eq!(path(&result).last(), Some(&(Executing, Failed)));
    }

    #[tokio::test]
    async fn must_start_idle() {
        let sm = StateMachine::default();
        let mut ctx = ExecutionContext::new("t", json!({}));
        ctx.state = Executing;
        let result = sm.execute(&mut ctx, &NoopHandlers).await;
        assert!(!result.success);
        assert!(result.history.is_empty());
        assert_eq!(ctx.state, Executing);
        let message = result.error.unwrap().to_string();
        assert!(message.contains("IDLE"));
    }

    #[tokio::test]
    async fn failed_without_fail_edges_still_terminates() {
        let sm = StateMachine::new(StateMachineConfig {
            max_retries: 0,
            fail_transitions: false,
        });
        assert!(!sm.is_valid_transition(Verifying, Failed));
        let mut ctx = ExecutionContext::new("t", json!({}));
        let result = sm.execute(&mut ctx, &Scripted::new(&[false])).await;
        assert_eq!(result.final_state, Failed);
        assert_eq!(result.retry_count, 0);
        assert_eq!(result.history.last().unwrap().transition_name, "fail");
    }

    #[tokio::test]
    async fn guard_rejection_fails_the_run() {
        let mut sm = StateMachine::default();
        sm.register(
            Transition::new("gated_commit", Verifying, Committing)
                .priority(5)
                .guard(Guard::new("approved", |ctx| {
                    ctx.artifacts.contains_key("approval")
                })),
        )
        .unwrap();

        let mut ctx = ExecutionContext::new("t", json!({}));
        let result = sm.execute(&mut ctx, &NoopHandlers).await;
        assert_eq!(result.final_state, Failed);
        assert!(matches!(
            result.error,
            Some(ExecutionError::Transition(TransitionError::GuardRejected { .. }))
        ));
    }

    #[tokio::test]
    async fn observers_see_every_commit_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut sm = StateMachine::default();
        sm.on_state_change(move |from, to| sink.lock().unwrap().push((from, to)));

        let mut ctx = ExecutionContext::new("t", json!({}));
        let result = sm.execute(&mut ctx, &Scripted::new(&[false, true])).await;
        assert_eq!(*seen.lock().unwrap(), path(&result));
    }

    #[test]
    fn introspection_matches_table() {
        let sm = StateMachine::default();
        assert_eq!(sm.valid_target_states(Idle), vec![Planning, Failed]);
        assert!(sm.valid_transitions(Completed).is_empty());
        assert!(sm.is_valid_transition(Verifying, Executing));
    }
}
