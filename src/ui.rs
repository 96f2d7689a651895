//! Terminal output: wave progress bar and colored reports.
//!
//! Uses `indicatif` for the progress bar and `console` for styling.
//! [`WaveProgress`] follows a batch by consuming [`WaveEvent`]s.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use wavegate::{ResourceCheck, TaskStatus, WaveEvent, WaveResult};

/// Progress bar for one batch, with colored per-task lines for success
/// (green), failure (red) and skipped waves (yellow).
pub struct WaveProgress {
    // Bar counting settled tasks against the batch size.
    pb: ProgressBar,
    // Succeeded tasks and clean batches.
    green: Style,
    // Failed tasks and batches with no success.
    red: Style,
    // Skipped tasks and partial batches.
    yellow: Style,
    // Admission and wave boundary lines.
    dim: Style,
}

impl WaveProgress {
    pub fn start(label: &str, total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_message(label.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    pub fn handle(&self, event: &WaveEvent) {
        match event {
            WaveEvent::WaveStarted {
                wave_number,
                task_ids,
            } => {
                self.pb
                    .set_message(format!("wave {wave_number} ({} tasks)", task_ids.len()));
            }
            WaveEvent::TaskAdmitted {
                task_id, worker_id, ..
            } => {
                self.pb.println(format!(
                    "  {} {task_id} admitted as {worker_id}",
                    self.dim.apply_to("→")
                ));
            }
            WaveEvent::TaskSettled {
                task_id, status, ..
            } => {
                self.pb.inc(1);
                let mark = match status {
                    TaskStatus::Succeeded => self.green.apply_to("✓"),
                    TaskStatus::Failed => self.red.apply_to("✗"),
                    TaskStatus::Skipped => self.yellow.apply_to("-"),
                };
                self.pb.println(format!("  {mark} {task_id} {status}"));
            }
            WaveEvent::WaveCompleted(summary) => {
                self.pb.println(format!(
                    "  {} wave {}: {} succeeded, {} failed",
                    self.dim.apply_to("═"),
                    summary.wave_number,
                    summary.success_count,
                    summary.failure_count
                ));
            }
            WaveEvent::WavesSkipped {
                from_wave,
                task_count,
                reason,
            } => {
                self.pb.inc(*task_count as u64);
                self.pb.println(format!(
                    "  {} skipping {task_count} tasks from wave {from_wave}: {reason}",
                    self.yellow.apply_to("↷")
                ));
            }
        }
    }

    /// Clear the bar and print the batch totals.
    pub fn finish(&self, result: &WaveResult) {
        self.pb.finish_and_clear();
        let style = if result.all_succeeded() {
            &self.green
        } else if result.total_success > 0 {
            &self.yellow
        } else {
            &self.red
        };
        println!(
            "{} {} succeeded, {} failed, {} skipped over {} waves",
            style.apply_to("■"),
            result.total_success,
            result.total_failure,
            result.total_skipped,
            result.waves.len()
        );
    }
}

pub fn print_check(check: &ResourceCheck, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(check).unwrap_or_default()
        );
        return;
    }

    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let dim = Style::new().dim();

    match &check.metrics {
        Some(m) => {
            println!("{}", dim.apply_to("─── Resources ───"));
            println!("  cpu        {:>6.1}% of one core", m.cpu_percent_of_one_core);
            println!("  memory     {:>6.1}% free", m.memory_free_percent());
            println!("  processes  {:>6}", m.process_count);
            match m.thread_count {
                Some(threads) => println!("  threads    {threads:>6}"),
                None => println!("  threads    {:>6}", dim.apply_to("n/a")),
            }
        }
        None => println!("{}", dim.apply_to("no metrics available")),
    }

    if check.can_spawn {
        println!("{} a worker can be admitted", green.apply_to("✓"));
    } else {
        println!("{} admission refused", red.apply_to("✗"));
        for violation in &check.violations {
            println!("  - {violation}");
        }
    }
}
