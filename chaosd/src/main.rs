//! Chaos orchestrator daemon and CLI.
//!
//! `run` drives one experiment to a terminal status; `daemon` keeps the
//! safety sweep and scheduler running over a directory of experiments.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use chaos_common::{ChaosConfig, Experiment, ExperimentKind, ExperimentStatus, LogConfig, TargetScope, init_logging};
use chaos_telemetry::ProcTelemetrySource;
use chaos_telemetry::collect::hardware_concurrency;
use chaosd::executor::ExecutorRegistry;
use chaosd::experiment_file::{ExperimentFile, load_dir};
use chaosd::rules_watch::{reload_now, watch_rules};
use chaosd::{
    ChaosMetrics, EventBus, GLOBAL_REGISTRY, InMemoryStore, LoggingHook, Orchestrator,
    OrchestratorDeps, ProcessLauncher, Scheduler, TracingMetricsSink,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "chaosd")]
#[command(author, version, about = "Chaos experiment orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (defaults to ~/.config/chaos/config.toml)
    #[arg(short, long, global = true, env = "CHAOS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one experiment to completion and print its final record
    Run {
        /// Experiment definition (TOML)
        experiment: PathBuf,
    },

    /// Check an experiment definition without running it
    Validate {
        /// Experiment definition (TOML)
        experiment: PathBuf,
    },

    /// Evaluate the current host against preflight safety checks
    Preflight {
        /// Experiment definition; defaults to a CPU stress at default intensity
        experiment: Option<PathBuf>,
    },

    /// Run the safety sweep and scheduler over a directory of experiments
    Daemon {
        /// Directory of experiment definitions
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    let config = ChaosConfig::load(cli.config.as_deref())
        .map_err(|e| anyhow::anyhow!("[{}] {}", e.code(), e))?;

    match cli.command {
        Commands::Run { experiment } => run(config, &experiment).await,
        Commands::Validate { experiment } => validate(config, &experiment),
        Commands::Preflight { experiment } => preflight(config, experiment.as_deref()).await,
        Commands::Daemon { dir } => daemon(config, &dir).await,
    }
}

fn build_orchestrator(config: ChaosConfig) -> Result<Orchestrator> {
    let metrics = ChaosMetrics::new(&GLOBAL_REGISTRY).context("registering metrics")?;
    let telemetry = Arc::new(ProcTelemetrySource::new());
    let launcher = Arc::new(ProcessLauncher::from_config(&config.executor));
    debug!(worker = %launcher.program().display(), "stress worker program");

    Ok(Orchestrator::new(OrchestratorDeps {
        store: Arc::new(InMemoryStore::new()),
        telemetry,
        launcher,
        metrics_sink: Arc::new(TracingMetricsSink),
        hook: Arc::new(LoggingHook),
        events: EventBus::default(),
        metrics,
        registry: ExecutorRegistry::with_builtin(),
        config,
        hardware_concurrency: hardware_concurrency(),
    }))
}

fn load_experiment(path: &Path) -> Result<Experiment> {
    Ok(ExperimentFile::load(path)?.to_experiment())
}

async fn run(config: ChaosConfig, path: &Path) -> Result<()> {
    let experiment = load_experiment(path)?;
    let orchestrator = build_orchestrator(config)?;
    let id = orchestrator.submit(experiment).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = orchestrator.safety_sweep().start(shutdown_rx);

    orchestrator
        .start(&id)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e.to_record()))?;

    let status = tokio::select! {
        status = orchestrator.wait(&id) => status?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping experiment");
            orchestrator.stop(&id).await?;
            orchestrator.wait(&id).await?
        }
    };
    let _ = shutdown_tx.send(true);
    let _ = sweep.await;

    let record = orchestrator.status(&id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    if status != ExperimentStatus::Completed {
        bail!("experiment {} finished {}", id, status);
    }
    Ok(())
}

fn validate(config: ChaosConfig, path: &Path) -> Result<()> {
    let experiment = load_experiment(path)?;
    let orchestrator = build_orchestrator(config)?;
    let report = orchestrator.validate(&experiment)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.valid {
        bail!("experiment definition is invalid");
    }
    Ok(())
}

async fn preflight(config: ChaosConfig, path: Option<&Path>) -> Result<()> {
    let experiment = match path {
        Some(path) => load_experiment(path)?,
        None => Experiment::new("preflight", ExperimentKind::CpuStress, TargetScope::new("local")),
    };
    let orchestrator = build_orchestrator(config)?;
    let status = orchestrator.preflight(&experiment).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if !status.safe {
        bail!("preflight blocked: {}", status.message());
    }
    Ok(())
}

async fn daemon(config: ChaosConfig, dir: &Path) -> Result<()> {
    let rules_file = config.safety.rules_file.clone();
    let scheduler_config = config.scheduler.clone();
    let orchestrator = build_orchestrator(config)?;

    let _rules_watcher = match rules_file {
        Some(path) => {
            // A broken rules file at startup leaves the configured rules in place.
            let _ = reload_now(&path, orchestrator.safety(), orchestrator.events());
            Some(watch_rules(path, orchestrator.safety().clone(), orchestrator.events().clone())?)
        }
        None => None,
    };

    for (path, parsed) in load_dir(dir)? {
        let file = match parsed {
            Ok(file) => file,
            Err(e) => {
                warn!("Skipping experiment definition: {}", e);
                continue;
            }
        };
        let at = match file.schedule() {
            Ok(at) => at.unwrap_or_else(chrono::Utc::now),
            Err(e) => {
                warn!(path = %path.display(), "Skipping experiment definition: {}", e);
                continue;
            }
        };
        let id = orchestrator.submit(file.to_experiment()).await?;
        orchestrator.schedule(&id, at).await?;
        info!(experiment_id = %id, path = %path.display(), %at, "experiment loaded");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = orchestrator.safety_sweep().start(shutdown_rx.clone());
    let scheduler = Scheduler::new(orchestrator.clone(), &scheduler_config).start(shutdown_rx);
    info!(dir = %dir.display(), "chaosd daemon running");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    orchestrator.shutdown().await;
    let _ = tokio::join!(sweep, scheduler);

    if let Ok(text) = orchestrator.metrics().encode_text() {
        debug!("final metrics:\n{}", text);
    }
    Ok(())
}
