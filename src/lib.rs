//! Bounded-concurrency task orchestration.
//!
//! A [`gate::ResourceGate`] admits at most three workers at a time and only
//! while the host has headroom. The [`scheduler::WaveScheduler`] feeds tasks
//! through the gate in sequential waves, optionally driving each one through
//! the [`state_machine::StateMachine`] lifecycle and wrapping every call with
//! the retry and circuit breaking of [`recovery::RecoveryEngine`], which also
//! checkpoints batches so an interrupted run resumes where it stopped.

pub mod config;
pub mod error;
pub mod gate;
pub mod recovery;
pub mod scheduler;
pub mod state_machine;
pub mod task;

pub use config::WavegateConfig;
pub use gate::{ResourceCheck, ResourceGate};
pub use recovery::RecoveryEngine;
pub use scheduler::{LifecycleTaskExecutor, WaveEvent, WaveOptions, WaveScheduler};
pub use state_machine::StateMachine;
pub use task::{Task, TaskExecutor, TaskOutput, TaskRecord, TaskStatus, WaveResult};
