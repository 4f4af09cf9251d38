#![allow(dead_code)]

use chaos_common::{
    ChaosConfig, Comparator, Experiment, ExperimentKind, RuleAction, SafetyMetric, SafetyRule,
    TargetScope,
};
use chaos_telemetry::{ScriptedTelemetrySource, TelemetrySample};
use chaosd::executor::ExecutorRegistry;
use chaosd::mock::{MockLauncher, RecordingHook};
use chaosd::{ChaosMetrics, EventBus, InMemoryMetricsSink, InMemoryStore, Orchestrator, OrchestratorDeps};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

pub use chaos_common::testing::init_test_logging;

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "chaosd::tests", $($arg)*)
    };
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<InMemoryStore>,
    pub telemetry: Arc<ScriptedTelemetrySource>,
    pub launcher: Arc<MockLauncher>,
    pub sink: Arc<InMemoryMetricsSink>,
    pub hook: Arc<RecordingHook>,
    pub metrics: ChaosMetrics,
    pub events: EventBus,
}

/// Orchestrator over in-memory collaborators on a 4-core host idling at
/// 5% CPU and 30% memory.
pub fn harness(rules: Vec<SafetyRule>) -> Harness {
    let mut config = ChaosConfig::default();
    config.rules = rules;
    harness_with(config)
}

pub fn harness_with(config: ChaosConfig) -> Harness {
    init_test_logging();

    let store = Arc::new(InMemoryStore::new());
    let telemetry = Arc::new(ScriptedTelemetrySource::new([idle()]));
    let launcher = Arc::new(MockLauncher::new());
    let sink = Arc::new(InMemoryMetricsSink::new());
    let hook = Arc::new(RecordingHook::new());
    let metrics = ChaosMetrics::standalone().expect("metrics registry");
    let events = EventBus::default();

    let orchestrator = Orchestrator::new(OrchestratorDeps {
        store: store.clone(),
        telemetry: telemetry.clone(),
        launcher: launcher.clone(),
        metrics_sink: sink.clone(),
        hook: hook.clone(),
        events: events.clone(),
        metrics: metrics.clone(),
        registry: ExecutorRegistry::with_builtin(),
        config,
        hardware_concurrency: 4,
    });

    Harness {
        orchestrator,
        store,
        telemetry,
        launcher,
        sink,
        hook,
        metrics,
        events,
    }
}

pub fn idle() -> TelemetrySample {
    TelemetrySample::new(5.0, 30.0)
}

pub fn cpu_experiment(id: &str, cpu_percent: u64, duration_secs: u64, workers: u64) -> Experiment {
    Experiment::new(
        format!("{id} burn"),
        ExperimentKind::CpuStress,
        TargetScope::new("staging").with_selector("service", "checkout"),
    )
    .with_id(id)
    .with_parameter("cpu_percent", cpu_percent)
    .with_parameter("duration_secs", duration_secs)
    .with_parameter("workers", workers)
}

pub fn memory_guard(threshold: f64) -> SafetyRule {
    SafetyRule::new(
        "mem-guard",
        SafetyMetric::MemoryPercent,
        Comparator::Gt,
        threshold,
        RuleAction::Abort,
    )
}

/// The `chaos-wkr` binary for this profile.
///
/// A workspace test run builds it into the shared target directory. When
/// only this package is under test it is built into a private target
/// directory, since the shared one stays locked while tests run.
pub fn chaos_wkr_binary() -> PathBuf {
    static BINARY: OnceLock<PathBuf> = OnceLock::new();
    BINARY
        .get_or_init(|| {
            let profile = if cfg!(debug_assertions) { "debug" } else { "release" };
            let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
                .parent()
                .map(PathBuf::from)
                .expect("chaosd lives inside the workspace");
            let target = std::env::var("CARGO_TARGET_DIR")
                .map(PathBuf::from)
                .map(|dir| if dir.is_absolute() { dir } else { workspace_root.join(dir) })
                .unwrap_or_else(|_| workspace_root.join("target"));

            let shared = target.join(profile).join("chaos-wkr");
            if shared.is_file() {
                return shared;
            }

            let private = target.join("chaosd-test-workers");
            let mut build = std::process::Command::new(
                std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string()),
            );
            build
                .current_dir(&workspace_root)
                .args(["build", "--quiet", "-p", "chaos-wkr", "--target-dir"])
                .arg(&private);
            if profile == "release" {
                build.arg("--release");
            }
            let status = build.status().expect("run cargo build for chaos-wkr");
            assert!(status.success(), "building chaos-wkr failed: {status:?}");
            private.join(profile).join("chaos-wkr")
        })
        .clone()
}
