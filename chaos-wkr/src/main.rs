//! Chaos stress worker.
//!
//! Spawned by chaosd, one process per stressed core. Runs until signalled,
//! until `--max-runtime` elapses, or until its parent goes away.

#![forbid(unsafe_code)]

mod duty_cycle;

use anyhow::Result;
use chaos_common::{LogConfig, init_logging};
use clap::{Parser, Subcommand};
use duty_cycle::{DutyCycle, StopConditions};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "chaos-wkr")]
#[command(author, version, about = "Chaos stress worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Hold one core at the given utilisation
    Stress {
        /// Target utilisation of one core, in percent
        #[arg(short, long)]
        percent: f64,

        /// Exit after this long even if never signalled (e.g. "10m")
        #[arg(long, value_parser = humantime::parse_duration)]
        max_runtime: Option<Duration>,

        /// Keep running if the parent process exits
        #[arg(long)]
        detached: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("warn").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Stress {
            percent,
            max_runtime,
            detached,
        } => {
            let cycle = DutyCycle::new(percent)?;
            let mut stop = StopConditions::default();
            if let Some(limit) = max_runtime {
                stop = stop.with_max_runtime(limit);
            }
            if !detached {
                stop = stop.watching_parent();
            }

            info!(
                pid = std::process::id(),
                percent = cycle.percent(),
                max_runtime = ?max_runtime,
                "stress worker started"
            );
            let summary = duty_cycle::run(cycle, stop);
            info!(
                reason = ?summary.reason,
                windows = summary.windows,
                observed_percent = summary.observed_percent(),
                "stress worker exiting"
            );
        }
    }

    Ok(())
}
