//! Per-service circuit breakers.
//!
//! CLOSED counts consecutive failures and trips to OPEN at the threshold.
//! OPEN rejects every call until the cooldown has elapsed, then lets one call
//! through as HALF_OPEN. HALF_OPEN closes on success and re-opens on failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::RecoveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<Instant>,
    pub last_failure_time: Option<DateTime<Utc>>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            last_failure_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Breaker states keyed by service name, behind a single lock.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    policy: BreakerPolicy,
    states: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl CircuitBreakers {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    fn states(&self) -> MutexGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state for `key`; unknown keys report a fresh CLOSED breaker.
    pub fn state(&self, key: &str) -> CircuitBreakerState {
        self.states().get(key).cloned().unwrap_or_default()
    }

    pub fn all(&self) -> HashMap<String, CircuitBreakerState> {
        self.states().clone()
    }

    /// Force `key` back to CLOSED with a zero failure count.
    pub fn reset(&self, key: &str) {
        self.states().insert(key.to_string(), CircuitBreakerState::default());
        tracing::info!(service = key, "circuit breaker reset");
    }

    /// Run `op` through the breaker for `key`.
    pub async fn call<T, F, Fut>(&self, key: &str, op: F) -> Result<T, RecoveryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.admit(key)?;
        match op().await {
            Ok(value) => {
                self.on_success(key);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(key);
                Err(RecoveryError::Operation(e))
            }
        }
    }

    fn admit(&self, key: &str) -> Result<(), RecoveryError> {
        let mut states = self.states();
        let entry = states.entry(key.to_string()).or_default();
        if entry.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = entry
            .opened_at
            .map(|at| at.elapsed())
            .unwrap_or(self.policy.cooldown);
        if elapsed < self.policy.cooldown {
            let retry_in = self.policy.cooldown - elapsed;
            tracing::debug!(
                service = key,
                retry_in_ms = retry_in.as_millis() as u64,
                "circuit open, call rejected"
            );
            return Err(RecoveryError::CircuitOpen {
                service: key.to_string(),
                retry_in,
            });
        }

        entry.state = CircuitState::HalfOpen;
        tracing::info!(service = key, "cooldown elapsed, circuit half-open");
        Ok(())
    }

    fn on_success(&self, key: &str) {
        let mut states = self.states();
        let entry = states.entry(key.to_string()).or_default();
        match entry.state {
            // Admitted before the breaker tripped; only a half-open trial may close it.
            CircuitState::Open => {
                tracing::debug!(service = key, "late success ignored, circuit stays open");
                return;
            }
            CircuitState::HalfOpen => {
                tracing::info!(service = key, "trial call succeeded, circuit closed");
            }
            CircuitState::Closed => {}
        }
        entry.state = CircuitState::Closed;
        entry.failure_count = 0;
        entry.opened_at = None;
    }

    fn on_failure(&self, key: &str) {
        let mut states = self.states();
        let entry = states.entry(key.to_string()).or_default();
        entry.failure_count += 1;
        entry.last_failure_time = Some(Utc::now());

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                tracing::warn!(service = key, "trial call failed, circuit re-opened");
            }
            CircuitState::Closed if entry.failure_count >= self.policy.failure_threshold => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(Instant::now());
                tracing::warn!(
                    service = key,
                    failures = entry.failure_count,
                    "failure threshold reached, circuit opened"
                );
            }
            _ => {}
        }
    }
}
