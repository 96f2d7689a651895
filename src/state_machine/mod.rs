mod executor;
mod state;
mod transition;

pub use executor::{
    ExecutionResult, LifecycleHandlers, NoopHandlers, StateMachine, StateMachineConfig,
    StateObserver,
};
pub use state::{ExecutionContext, ExecutionState, HistoryEntry};
pub use transition::{
    Action, FAIL_TRANSITION, Guard, RETRY_TRANSITION, Transition, TransitionResult,
    TransitionTable,
};
