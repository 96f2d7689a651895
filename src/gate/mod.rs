//! Concurrency and resource admission gate.
//!
//! The gate owns the set of active worker ids and a hard ceiling of 1 to 3
//! concurrent workers. Admission additionally requires a clean
//! [`ResourceCheck`]. A failing metrics source never raises: the check fails
//! closed and admission is refused until the source recovers.

pub mod monitor;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::GateError;
pub use monitor::{ProcMonitor, ResourceMonitor, ResourceSnapshot, ResourceThresholds};

pub const MIN_CONCURRENT: usize = 1;
pub const MAX_CONCURRENT: usize = 3;

/// Violation reported when the metrics source itself fails.
pub const CHECK_FAILED_VIOLATION: &str = "resource check failed - conservative fallback";

/// Outcome of [`ResourceGate::check_resources`].
#[derive(Debug, Clone, Serialize)]
pub struct ResourceCheck {
    pub can_spawn: bool,
    /// `None` when the metrics source failed.
    pub metrics: Option<ResourceSnapshot>,
    pub violations: Vec<String>,
}

#[derive(Debug)]
struct Slots {
    active: BTreeSet<String>,
    max_concurrent: usize,
}

pub struct ResourceGate {
    slots: Mutex<Slots>,
    thresholds: ResourceThresholds,
    monitor: Arc<dyn ResourceMonitor>,
}

impl ResourceGate {
    /// Gate backed by direct OS probing.
    pub fn new(max_concurrent: usize) -> Result<Self, GateError> {
        Self::with_monitor(
            max_concurrent,
            ResourceThresholds::default(),
            Arc::new(ProcMonitor::new()),
        )
    }

    pub fn with_monitor(
        max_concurrent: usize,
        thresholds: ResourceThresholds,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Result<Self, GateError> {
        validate_max(max_concurrent)?;
        Ok(Self {
            slots: Mutex::new(Slots {
                active: BTreeSet::new(),
                max_concurrent,
            }),
            thresholds,
            monitor,
        })
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_concurrent(&self) -> usize {
        self.slots().max_concurrent
    }

    /// Change the ceiling. Workers already admitted above a lowered ceiling
    /// keep their slots; new admissions wait until the count drops.
    pub fn set_max_concurrent(&self, max_concurrent: usize) -> Result<(), GateError> {
        validate_max(max_concurrent)?;
        let mut slots = self.slots();
        tracing::info!(
            from = slots.max_concurrent,
            to = max_concurrent,
            "max_concurrent changed"
        );
        slots.max_concurrent = max_concurrent;
        Ok(())
    }

    pub fn thresholds(&self) -> &ResourceThresholds {
        &self.thresholds
    }

    pub fn active_count(&self) -> usize {
        self.slots().active.len()
    }

    pub fn active_workers(&self) -> Vec<String> {
        self.slots().active.iter().cloned().collect()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.slots().active.contains(id)
    }

    /// Whether a new worker could be admitted right now.
    pub async fn can_spawn(&self) -> bool {
        {
            let slots = self.slots();
            if slots.active.len() >= slots.max_concurrent {
                tracing::debug!(
                    active = slots.active.len(),
                    max = slots.max_concurrent,
                    "admission denied: at capacity"
                );
                return false;
            }
        }
        self.check_resources().await.can_spawn
    }

    /// Claim a slot for `id`. The capacity check and the insert happen under
    /// one lock, so concurrent callers can never over-admit.
    pub fn register(&self, id: &str) -> Result<(), GateError> {
        let mut slots = self.slots();
        if slots.active.contains(id) {
            return Err(GateError::DuplicateWorkerId(id.to_string()));
        }
        if slots.active.len() >= slots.max_concurrent {
            return Err(GateError::LimitExceeded {
                current: slots.active.len(),
                max: slots.max_concurrent,
            });
        }
        slots.active.insert(id.to_string());
        tracing::info!(
            worker = id,
            active = slots.active.len(),
            max = slots.max_concurrent,
            "worker registered"
        );
        Ok(())
    }

    /// Release the slot held by `id`. Unknown ids are logged and ignored.
    pub fn unregister(&self, id: &str) {
        let mut slots = self.slots();
        if slots.active.remove(id) {
            tracing::info!(worker = id, active = slots.active.len(), "worker unregistered");
        } else {
            tracing::warn!(worker = id, "unregister of unknown worker ignored");
        }
    }

    pub async fn check_resources(&self) -> ResourceCheck {
        match self.monitor.current_metrics().await {
            Ok(metrics) => {
                let violations = self.thresholds.violations(&metrics);
                if !violations.is_empty() {
                    tracing::info!(?violations, "resource thresholds violated");
                }
                ResourceCheck {
                    can_spawn: violations.is_empty(),
                    metrics: Some(metrics),
                    violations,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "resource monitor failed, refusing admission");
                ResourceCheck {
                    can_spawn: false,
                    metrics: None,
                    violations: vec![CHECK_FAILED_VIOLATION.to_string()],
                }
            }
        }
    }

    /// Ask the monitor to baseline. Failures are logged only.
    pub async fn set_baseline(&self) {
        if let Err(e) = self.monitor.set_baseline().await {
            tracing::warn!(error = %e, "failed to set resource baseline");
        }
    }
}

fn validate_max(max_concurrent: usize) -> Result<(), GateError> {
    if (MIN_CONCURRENT..=MAX_CONCURRENT).contains(&max_concurrent) {
        Ok(())
    } else {
        Err(GateError::InvalidMaxConcurrent(max_concurrent))
    }
}
