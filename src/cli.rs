//! Command line interface built on clap.
//!
//! [`Cli`] carries the subcommands ([`Command`]: check, demo) and the global
//! overrides for the configuration file (--config, --max-concurrent,
//! --wave-size, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Bounded-concurrency wave scheduler with resource gating and recovery.
#[derive(Debug, Parser)]
#[command(name = "wavegate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file. Defaults to `wavegate.toml` in the working directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Ceiling on concurrent workers (1 to 3).
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Tasks per wave.
    #[arg(long, global = true)]
    pub wave_size: Option<usize>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sample the host and report whether a worker could be admitted now.
    Check {
        /// Print the check as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Run a simulated batch through the gate, then resume it from its checkpoint.
    Demo {
        /// Number of tasks in the batch.
        #[arg(long, default_value_t = 8)]
        tasks: usize,

        /// Probability that a simulated worker fails outright.
        #[arg(long, default_value_t = 0.2)]
        failure_rate: f64,

        /// Skip the remaining waves after the first failing one.
        #[arg(long, default_value_t = false)]
        halt_on_error: bool,
    },
}
