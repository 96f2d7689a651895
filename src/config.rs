//! Configuration loaded from `wavegate.toml`.
//!
//! [`WavegateConfig`] holds one section per component. Keys missing from the
//! file fall back to the documented defaults. The `WAVEGATE_MAX_CONCURRENT`
//! environment variable takes precedence over the file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::gate::{MAX_CONCURRENT, MIN_CONCURRENT, ResourceThresholds};
use crate::recovery::{BreakerPolicy, RetryOptions};
use crate::scheduler::WaveOptions;
use crate::state_machine::StateMachineConfig;

pub const CONFIG_FILE: &str = "wavegate.toml";
pub const MAX_CONCURRENT_ENV: &str = "WAVEGATE_MAX_CONCURRENT";

/// Top-level configuration loaded from `wavegate.toml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WavegateConfig {
    /// Admission ceiling and resource thresholds.
    #[serde(default)]
    pub gate: GateConfig,

    /// Circuit breaker and retry settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Lifecycle retry budget.
    #[serde(default)]
    pub state_machine: StateMachineSection,

    /// Wave partitioning and admission polling.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GateConfig {
    /// Hard ceiling on concurrent workers, 1 to 3.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Load, in percent of one core, at which admission stops.
    #[serde(default = "default_cpu_percent")]
    pub cpu_percent: f64,

    /// Free memory below this percentage refuses admission.
    #[serde(default = "default_min_memory_free_percent")]
    pub min_memory_free_percent: f64,

    /// Process count at which admission stops.
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,

    /// Thread count at which admission stops.
    #[serde(default = "default_thread_critical")]
    pub thread_critical: u32,

    /// Only logged, never blocks admission.
    #[serde(default = "default_thread_warning")]
    pub thread_warning: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecoveryConfig {
    /// Consecutive failures that open a circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before a half-open trial.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Attempts per guarded call, the first included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateMachineSection {
    /// Re-executions allowed after a failed verification.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Register the failure edges out of every working state.
    #[serde(default = "default_true")]
    pub fail_transitions: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SchedulerConfig {
    /// Tasks per wave.
    #[serde(default = "default_wave_size")]
    pub wave_size: usize,

    /// Keep running later waves after a failure.
    #[serde(default = "default_true")]
    pub continue_on_error: bool,

    /// First admission poll delay; doubles up to `poll_max_ms`.
    #[serde(default = "default_poll_initial_ms")]
    pub poll_initial_ms: u64,

    /// Ceiling for the admission poll delay.
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
}

// Default ceiling: the hard maximum of 3 workers.
fn default_max_concurrent() -> usize {
    MAX_CONCURRENT
}

// Default load threshold: 50% of one core.
fn default_cpu_percent() -> f64 {
    50.0
}

// Default free memory floor: 20%.
fn default_min_memory_free_percent() -> f64 {
    20.0
}

// Default process limit: 400.
fn default_max_processes() -> u32 {
    400
}

// Default critical thread count: 350.
fn default_thread_critical() -> u32 {
    350
}

// Default warning thread count: 300.
fn default_thread_warning() -> u32 {
    300
}

// Default failures before a circuit opens: 5.
fn default_failure_threshold() -> u32 {
    5
}

// Default cooldown: 60s.
fn default_cooldown_secs() -> u64 {
    60
}

// Default attempts per guarded call: 3.
fn default_max_attempts() -> u32 {
    3
}

// Default base delay: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

// Default backoff cap: 30s.
fn default_max_delay_ms() -> u64 {
    30_000
}

// Default lifecycle retries: 3.
fn default_max_retries() -> u32 {
    3
}

// Default for boolean switches that start enabled.
fn default_true() -> bool {
    true
}

// Default wave size: 3 tasks.
fn default_wave_size() -> usize {
    3
}

// Default first poll delay: 250ms.
fn default_poll_initial_ms() -> u64 {
    250
}

// Default poll ceiling: 5s.
fn default_poll_max_ms() -> u64 {
    5000
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            cpu_percent: default_cpu_percent(),
            min_memory_free_percent: default_min_memory_free_percent(),
            max_processes: default_max_processes(),
            thread_critical: default_thread_critical(),
            thread_warning: default_thread_warning(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for StateMachineSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            fail_transitions: true,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wave_size: default_wave_size(),
            continue_on_error: true,
            poll_initial_ms: default_poll_initial_ms(),
            poll_max_ms: default_poll_max_ms(),
        }
    }
}

impl WavegateConfig {
    /// Load `wavegate.toml` from the working directory, or defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<WavegateConfig>(&contents)?
        } else {
            Self::default()
        };

        if let Ok(value) = std::env::var(MAX_CONCURRENT_ENV)
            && !value.is_empty()
        {
            config.gate.max_concurrent = value.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{MAX_CONCURRENT_ENV} is not a number: {value}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENT..=MAX_CONCURRENT).contains(&self.gate.max_concurrent) {
            return Err(ConfigError::Invalid(format!(
                "gate.max_concurrent must be within {MIN_CONCURRENT}..={MAX_CONCURRENT}, got {}",
                self.gate.max_concurrent
            )));
        }
        if self.recovery.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "recovery.failure_threshold must be at least 1".into(),
            ));
        }
        self.retry_options()
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.scheduler.wave_size == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.wave_size must be at least 1".into(),
            ));
        }
        if self.scheduler.poll_initial_ms == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.poll_initial_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> ResourceThresholds {
        ResourceThresholds {
            cpu_percent: self.gate.cpu_percent,
            min_memory_free_percent: self.gate.min_memory_free_percent,
            max_processes: self.gate.max_processes,
            thread_critical: self.gate.thread_critical,
            thread_warning: self.gate.thread_warning,
        }
    }

    pub fn breaker_policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: self.recovery.failure_threshold,
            cooldown: Duration::from_secs(self.recovery.cooldown_secs),
        }
    }

    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions {
            max_attempts: self.recovery.max_attempts,
            base_delay_ms: self.recovery.base_delay_ms,
            max_delay_ms: self.recovery.max_delay_ms,
        }
    }

    pub fn state_machine(&self) -> StateMachineConfig {
        StateMachineConfig {
            max_retries: self.state_machine.max_retries,
            fail_transitions: self.state_machine.fail_transitions,
        }
    }

    pub fn wave_options(&self) -> WaveOptions {
        WaveOptions {
            wave_size: self.scheduler.wave_size,
            continue_on_error: self.scheduler.continue_on_error,
        }
    }

    pub fn poll_interval(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.scheduler.poll_initial_ms),
            Duration::from_millis(self.scheduler.poll_max_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = WavegateConfig::default();
        assert_eq!(config.gate.max_concurrent, 3);
        assert_eq!(config.thresholds(), ResourceThresholds::default());
        assert_eq!(config.breaker_policy().failure_threshold, 5);
        assert_eq!(config.breaker_policy().cooldown, Duration::from_secs(60));
        assert_eq!(config.retry_options(), RetryOptions::default());
        assert_eq!(config.state_machine(), StateMachineConfig::default());
        assert_eq!(config.wave_options(), WaveOptions::default());
        config.validate().unwrap();
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            [gate]
            max_concurrent = 2

            [scheduler]
            continue_on_error = false
        "#;
        let config: WavegateConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gate.max_concurrent, 2);
        assert_eq!(config.gate.cpu_percent, 50.0);
        assert!(!config.scheduler.continue_on_error);
        assert_eq!(config.scheduler.wave_size, 3);
        assert_eq!(config.recovery.max_delay_ms, 30_000);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[recovery]\nfailure_threshold = 2\ncooldown_secs = 5\n\n\
             [state_machine]\nmax_retries = 1"
        )
        .unwrap();

        let config = WavegateConfig::load_from(file.path()).unwrap();
        assert_eq!(config.breaker_policy().failure_threshold, 2);
        assert_eq!(config.breaker_policy().cooldown, Duration::from_secs(5));
        assert_eq!(config.state_machine().max_retries, 1);
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WavegateConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.scheduler.poll_max_ms, 5000);
    }

    #[test]
    fn invalid_values_fail_fast() {
        let mut config = WavegateConfig::default();
        config.gate.max_concurrent = 4;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = WavegateConfig::default();
        config.recovery.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = WavegateConfig::default();
        config.scheduler.wave_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gate\nmax_concurrent = ").unwrap();
        assert!(matches!(
            WavegateConfig::load_from(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
