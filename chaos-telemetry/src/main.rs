//! Print a host telemetry sample.
#![forbid(unsafe_code)]

use anyhow::Result;
use chaos_telemetry::{LogConfig, ProcTelemetrySource, TelemetrySource, init_logging};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "chaos-telemetry", about = "Host telemetry as seen by the chaos safety controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Take one sample and print it
    Sample {
        #[arg(long, default_value = "json")]
        format: OutputFormat,

        /// CPU measurement window in milliseconds
        #[arg(long, default_value_t = 200)]
        sample_ms: u64,

        /// Filesystem reported as disk usage
        #[arg(long, default_value = "/")]
        disk_path: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum OutputFormat {
    Json,
    Pretty,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    match cli.command {
        Commands::Sample {
            format,
            sample_ms,
            disk_path,
        } => {
            let source = ProcTelemetrySource::new()
                .with_disk_path(disk_path)
                .with_min_window(Duration::from_millis(sample_ms));
            let sample = source.sample_now().await?;

            let output = match format {
                OutputFormat::Json => serde_json::to_string(&sample)?,
                OutputFormat::Pretty => serde_json::to_string_pretty(&sample)?,
            };
            println!("{output}");
        }
    }

    Ok(())
}
