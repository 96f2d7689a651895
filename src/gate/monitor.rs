//! Resource metrics and the thresholds that gate admission.
//!
//! [`ResourceMonitor`] is the seam for an external metrics source.
//! [`ProcMonitor`] is the default implementation: it reads `/proc` directly
//! and substitutes neutral values for any field it cannot read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Neutral CPU reading used when /proc cannot be read.
pub const FALLBACK_CPU_PERCENT: f64 = 30.0;
/// Neutral memory pressure used when probing fails.
pub const FALLBACK_MEMORY_PRESSURE_PERCENT: f64 = 60.0;
/// Neutral process count used when probing fails.
pub const FALLBACK_PROCESS_COUNT: u32 = 250;

/// Point-in-time system metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// 100.0 means one fully busy core.
    pub cpu_percent_of_one_core: f64,
    pub memory_pressure_percent: f64,
    pub process_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_count: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl ResourceSnapshot {
    pub fn memory_free_percent(&self) -> f64 {
        100.0 - self.memory_pressure_percent
    }
}

/// Admission thresholds. A reading at or beyond a limit is a violation,
/// except memory, which violates when free memory drops below the minimum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceThresholds {
    pub cpu_percent: f64,
    pub min_memory_free_percent: f64,
    pub max_processes: u32,
    pub thread_critical: u32,
    /// Logged only; never blocks admission.
    pub thread_warning: u32,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 50.0,
            min_memory_free_percent: 20.0,
            max_processes: 400,
            thread_critical: 350,
            thread_warning: 300,
        }
    }
}

impl ResourceThresholds {
    /// One message per breached threshold, in the order CPU, memory,
    /// processes, threads.
    pub fn violations(&self, snapshot: &ResourceSnapshot) -> Vec<String> {
        let mut violations = Vec::new();

        if snapshot.cpu_percent_of_one_core >= self.cpu_percent {
            violations.push(format!(
                "CPU usage {:.1}% >= {:.1}% limit",
                snapshot.cpu_percent_of_one_core, self.cpu_percent
            ));
        }

        let free = snapshot.memory_free_percent();
        if free < self.min_memory_free_percent {
            violations.push(format!(
                "Free memory {:.1}% < {:.1}% minimum",
                free, self.min_memory_free_percent
            ));
        }

        if snapshot.process_count >= self.max_processes {
            violations.push(format!(
                "Process count {} >= {} limit",
                snapshot.process_count, self.max_processes
            ));
        }

        if let Some(threads) = snapshot.thread_count {
            if threads >= self.thread_critical {
                violations.push(format!(
                    "Thread count {} >= {} critical limit",
                    threads, self.thread_critical
                ));
            } else if threads >= self.thread_warning {
                tracing::warn!(
                    threads,
                    warning = self.thread_warning,
                    "thread count above warning level"
                );
            }
        }

        violations
    }
}

/// Source of [`ResourceSnapshot`]s.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    async fn current_metrics(&self) -> anyhow::Result<ResourceSnapshot>;

    /// Record the current readings as the reference point. Advisory.
    async fn set_baseline(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Reads metrics straight from the operating system.
#[derive(Debug, Clone, Default)]
pub struct ProcMonitor;

impl ProcMonitor {
    pub fn new() -> Self {
        Self
    }

    /// Take a snapshot, falling back per field to the neutral values.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let cpu = read_load_percent().unwrap_or_else(|| {
            tracing::debug!("cpu reading failed, using fallback");
            FALLBACK_CPU_PERCENT
        });
        let memory = read_memory_pressure().unwrap_or_else(|| {
            tracing::debug!("memory reading failed, using fallback");
            FALLBACK_MEMORY_PRESSURE_PERCENT
        });
        let processes = count_processes().unwrap_or_else(|| {
            tracing::debug!("process reading failed, using fallback");
            FALLBACK_PROCESS_COUNT
        });

        ResourceSnapshot {
            cpu_percent_of_one_core: cpu,
            memory_pressure_percent: memory,
            process_count: processes,
            thread_count: read_thread_count(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl ResourceMonitor for ProcMonitor {
    async fn current_metrics(&self) -> anyhow::Result<ResourceSnapshot> {
        // /proc reads are synchronous file I/O.
        let monitor = self.clone();
        let snapshot = tokio::task::spawn_blocking(move || monitor.snapshot()).await?;
        Ok(snapshot)
    }
}

fn read_load_percent() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/loadavg").ok()?;
    parse_loadavg(&contents)
}

fn read_memory_pressure() -> Option<f64> {
    let contents = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo(&contents)
}

fn count_processes() -> Option<u32> {
    let entries = std::fs::read_dir("/proc").ok()?;
    let count = entries
        .filter_map(Result::ok)
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n.bytes().all(|b| b.is_ascii_digit()))
        })
        .count();
    u32::try_from(count).ok()
}

fn read_thread_count() -> Option<u32> {
    let contents = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_threads(&contents)
}

/// One-minute load average expressed as percent of one core.
fn parse_loadavg(contents: &str) -> Option<f64> {
    let one_minute: f64 = contents.split_whitespace().next()?.parse().ok()?;
    Some(one_minute * 100.0)
}

fn parse_meminfo(contents: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        contents
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

fn parse_threads(contents: &str) -> Option<u32> {
    contents
        .lines()
        .find(|l| l.starts_with("Threads:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}
