use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;

use super::state::{ExecutionContext, ExecutionState};
use crate::error::{InvalidTransition, TransitionError};

type CheckFn = dyn Fn(&ExecutionContext) -> bool + Send + Sync;
type AsyncCheckFn = dyn Fn(ExecutionContext) -> BoxFuture<'static, bool> + Send + Sync;

/// Side-effecting step run before or after the state change.
pub type Action = Arc<dyn Fn(&mut ExecutionContext) -> anyhow::Result<()> + Send + Sync>;

/// Predicate that must hold for a transition to proceed.
#[derive(Clone)]
pub struct Guard {
    name: String,
    check: GuardCheck,
}

#[derive(Clone)]
enum GuardCheck {
    Sync(Arc<CheckFn>),
    /// Receives a snapshot of the context.
    Async(Arc<AsyncCheckFn>),
}

impl Guard {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: GuardCheck::Sync(Arc::new(check)),
        }
    }

    pub fn new_async<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(ExecutionContext) -> BoxFuture<'static, bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: GuardCheck::Async(Arc::new(check)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        match &self.check {
            GuardCheck::Sync(f) => f(ctx),
            GuardCheck::Async(f) => f(ctx.clone()).await,
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("name", &self.name).finish()
    }
}

/// A registered edge of the state machine. Immutable once registered.
#[derive(Clone)]
pub struct Transition {
    pub id: String,
    pub name: String,
    pub from: ExecutionState,
    pub to: ExecutionState,
    pub guards: Vec<Guard>,
    pub pre_actions: Vec<Action>,
    pub post_actions: Vec<Action>,
    pub rollback: Option<Action>,
    /// Higher wins when several edges share `from` and `to`.
    pub priority: i32,
    pub is_retry: bool,
}

impl Transition {
    pub fn new(name: impl Into<String>, from: ExecutionState, to: ExecutionState) -> Self {
        let name = name.into();
        Self {
            id: format!("{name}:{from}->{to}"),
            name,
            from,
            to,
            guards: Vec::new(),
            pre_actions: Vec::new(),
            post_actions: Vec::new(),
            rollback: None,
            priority: 0,
            is_retry: false,
        }
    }

    pub fn guard(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn pre_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.pre_actions.push(Arc::new(action));
        self
    }

    pub fn post_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.post_actions.push(Arc::new(action));
        self
    }

    pub fn rollback<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut ExecutionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.rollback = Some(Arc::new(action));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn retry(mut self) -> Self {
        self.is_retry = true;
        self
    }

    pub fn describe(&self) -> String {
        format!("{} ({} -> {})", self.name, self.from, self.to)
    }

    /// Guards, pre-actions, state change, post-actions. The caller has
    /// already checked that `ctx` is in `self.from`.
    async fn apply(&self, ctx: &mut ExecutionContext) -> TransitionResult {
        for guard in &self.guards {
            if !guard.evaluate(ctx).await {
                tracing::debug!(
                    task = %ctx.task_id,
                    guard = guard.name(),
                    transition = %self.name,
                    "guard rejected transition"
                );
                return self.result(Some(TransitionError::GuardRejected {
                    guard: guard.name().to_string(),
                    from: self.from,
                    to: self.to,
                }));
            }
        }

        let previous = ctx.state;

        for action in &self.pre_actions {
            if let Err(cause) = action(ctx) {
                return self.roll_back(ctx, previous, TransitionError::PreActionFailed {
                    from: self.from,
                    to: self.to,
                    cause,
                });
            }
        }

        ctx.state = self.to;

        for action in &self.post_actions {
            if let Err(cause) = action(ctx) {
                return self.roll_back(ctx, previous, TransitionError::PostActionFailed {
                    from: self.from,
                    to: self.to,
                    cause,
                });
            }
        }

        self.result(None)
    }

    fn roll_back(
        &self,
        ctx: &mut ExecutionContext,
        previous: ExecutionState,
        error: TransitionError,
    ) -> TransitionResult {
        tracing::warn!(
            task = %ctx.task_id,
            transition = %self.name,
            %error,
            "rolling back transition"
        );
        if let Some(rollback) = &self.rollback {
            if let Err(e) = rollback(ctx) {
                tracing::warn!(task = %ctx.task_id, error = %e, "rollback action failed");
            }
        }
        ctx.state = previous;
        let mut result = self.result(Some(error));
        result.rolled_back = true;
        result
    }

    fn result(&self, error: Option<TransitionError>) -> TransitionResult {
        TransitionResult {
            success: error.is_none(),
            from_state: self.from,
            to_state: self.to,
            rolled_back: false,
            error,
        }
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("guards", &self.guards)
            .field("pre_actions", &self.pre_actions.len())
            .field("post_actions", &self.post_actions.len())
            .field("rollback", &self.rollback.is_some())
            .field("priority", &self.priority)
            .field("is_retry", &self.is_retry)
            .finish()
    }
}

#[derive(Debug)]
pub struct TransitionResult {
    pub success: bool,
    pub from_state: ExecutionState,
    pub to_state: ExecutionState,
    pub rolled_back: bool,
    pub error: Option<TransitionError>,
}

pub const RETRY_TRANSITION: &str = "retry_execution";
pub const FAIL_TRANSITION: &str = "fail";

/// The registered edges, kept sorted by descending priority.
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    transitions: Vec<Transition>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The canonical lifecycle edges, plus a fail edge out of every
    /// non-terminal state when `fail_edges` is set.
    pub fn with_defaults(fail_edges: bool) -> Self {
        use ExecutionState::*;

        let mut table = Self::new();
        let defaults = [
            Transition::new("start_planning", Idle, Planning),
            Transition::new("begin_execution", Planning, Executing),
            Transition::new("submit_for_verification", Executing, Verifying),
            Transition::new(RETRY_TRANSITION, Verifying, Executing).retry(),
            Transition::new("commit", Verifying, Committing),
        ];
        for t in defaults {
            table.insert(t);
        }
        if fail_edges {
            for from in ExecutionState::ALL.into_iter().filter(|s| !s.is_terminal()) {
                table.insert(Transition::new(FAIL_TRANSITION, from, Failed).priority(-1));
            }
        }
        table
    }

    fn insert(&mut self, transition: Transition) {
        let at = self
            .transitions
            .partition_point(|t| t.priority >= transition.priority);
        self.transitions.insert(at, transition);
    }

    pub fn register(&mut self, transition: Transition) -> Result<(), TransitionError> {
        if transition.from.is_terminal() {
            return Err(TransitionError::FromTerminal(transition.from));
        }
        if self.get(&transition.id).is_some() {
            return Err(TransitionError::Duplicate(transition.id));
        }
        self.insert(transition);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.id == id)
    }

    /// Highest-priority edge from `from` to `to`.
    pub fn find(&self, from: ExecutionState, to: ExecutionState) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
    }

    pub fn valid_transitions(&self, state: ExecutionState) -> Vec<&Transition> {
        self.transitions.iter().filter(|t| t.from == state).collect()
    }

    pub fn valid_target_states(&self, state: ExecutionState) -> Vec<ExecutionState> {
        let mut targets = Vec::new();
        for t in self.valid_transitions(state) {
            if !targets.contains(&t.to) {
                targets.push(t.to);
            }
        }
        targets
    }

    pub fn is_valid_transition(&self, from: ExecutionState, to: ExecutionState) -> bool {
        self.find(from, to).is_some()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub(crate) fn invalid(
        &self,
        ctx: &ExecutionContext,
        to: ExecutionState,
        reason: impl Into<String>,
    ) -> InvalidTransition {
        InvalidTransition {
            from_state: ctx.state,
            to_state: to,
            reason: reason.into(),
            valid_transitions: self
                .valid_transitions(ctx.state)
                .iter()
                .map(|t| t.describe())
                .collect(),
            task_id: ctx.task_id.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Execute the registered transition `id` against `ctx`.
    ///
    /// A context in the wrong state is rejected without any mutation.
    pub async fn fire(&self, id: &str, ctx: &mut ExecutionContext) -> TransitionResult {
        let Some(transition) = self.get(id) else {
            return TransitionResult {
                success: false,
                from_state: ctx.state,
                to_state: ctx.state,
                rolled_back: false,
                error: Some(
                    self.invalid(ctx, ctx.state, format!("unknown transition '{id}'"))
                        .into(),
                ),
            };
        };
        self.run(transition, ctx).await
    }

    pub(crate) async fn run(
        &self,
        transition: &Transition,
        ctx: &mut ExecutionContext,
    ) -> TransitionResult {
        if ctx.state != transition.from {
            let reason = format!(
                "'{}' requires state {}, context is in {}",
                transition.name, transition.from, ctx.state
            );
            return transition.result(Some(self.invalid(ctx, transition.to, reason).into()));
        }
        transition.apply(ctx).await
    }
}
