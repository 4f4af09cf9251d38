//! The contract every fault type implements, and the registry that builds
//! executors by experiment kind.
//!
//! Call order is fixed: `validate_parameters` → `preflight_check` → `setup`
//! → `execute` → `cleanup` (always) → `rollback` (on request). The
//! orchestrator owns that sequencing; executors only implement the steps.

pub mod cpu_stress;

pub use cpu_stress::{CpuStressExecutor, CpuStressParams};

use crate::control::StopSignal;
use crate::metrics_sink::MetricsSink;
use crate::safety::SafetyController;
use crate::worker_pool::WorkerLauncher;
use async_trait::async_trait;
use chaos_common::{Experiment, ExperimentError, ExperimentKind, ExecutorConfig, SafetyStatus};
use chaos_telemetry::{TelemetrySample, TelemetrySource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn into_result(self) -> Result<(), ExperimentError> {
        if self.valid {
            Ok(())
        } else {
            Err(ExperimentError::Validation {
                errors: self.errors,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupResult {
    pub setup_complete: bool,
    pub workers_planned: usize,
    pub baseline: TelemetrySample,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub duration_secs: f64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub ticks: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_metrics: Option<TelemetrySample>,
    pub workers_used: usize,
    pub target_cpu_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub cleanup_complete: bool,
    /// Workers terminated over the executor's lifetime.
    pub workers_terminated: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_metrics: Option<TelemetrySample>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlastRadius {
    pub scope: String,
    pub affected_resources: Vec<String>,
    pub severity: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceImpact {
    pub cpu_usage_increase: f64,
    pub estimated_response_time_impact: f64,
    pub system_load_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactReport {
    pub blast_radius: BlastRadius,
    pub performance_impact: PerformanceImpact,
    pub risk_level: String,
}

/// What `execute` gets to work with.
pub struct ExecutionContext {
    pub safety: Arc<SafetyController>,
    pub metrics: Arc<dyn MetricsSink>,
    pub stop: StopSignal,
}

#[async_trait]
pub trait ExperimentExecutor: Send + Sync {
    fn kind(&self) -> ExperimentKind;

    /// Pure check of the experiment's parameters.
    fn validate_parameters(&self) -> ValidationReport;

    async fn preflight_check(&self, safety: &SafetyController) -> SafetyStatus;

    async fn setup(&self) -> Result<SetupResult, ExperimentError>;

    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExperimentError>;

    /// Idempotent; must leave no injected load behind.
    async fn cleanup(&self) -> Result<CleanupResult, ExperimentError>;

    async fn rollback(&self) -> Result<CleanupResult, ExperimentError>;

    async fn impact_assessment(&self) -> Result<ImpactReport, ExperimentError>;
}

/// Shared collaborators handed to every executor factory.
#[derive(Clone)]
pub struct ExecutorDeps {
    pub config: ExecutorConfig,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub hardware_concurrency: usize,
}

pub type ExecutorFactory = Arc<
    dyn Fn(&Experiment, &ExecutorDeps) -> Result<Arc<dyn ExperimentExecutor>, ExperimentError>
        + Send
        + Sync,
>;

/// Kind → constructor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    factories: HashMap<ExperimentKind, ExecutorFactory>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in executor.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ExperimentKind::CpuStress, |experiment, deps| {
            Ok(Arc::new(CpuStressExecutor::new(experiment.clone(), deps.clone())) as Arc<dyn ExperimentExecutor>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: ExperimentKind, factory: F)
    where
        F: Fn(&Experiment, &ExecutorDeps) -> Result<Arc<dyn ExperimentExecutor>, ExperimentError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn supports(&self, kind: ExperimentKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn build(
        &self,
        experiment: &Experiment,
        deps: &ExecutorDeps,
    ) -> Result<Arc<dyn ExperimentExecutor>, ExperimentError> {
        let factory = self
            .factories
            .get(&experiment.kind)
            .ok_or(ExperimentError::UnknownKind(experiment.kind))?;
        factory(experiment, deps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLauncher;
    use chaos_common::TargetScope;
    use chaos_telemetry::ScriptedTelemetrySource;

    fn deps() -> ExecutorDeps {
        ExecutorDeps {
            config: ExecutorConfig::default(),
            telemetry: Arc::new(ScriptedTelemetrySource::constant(5.0, 20.0)),
            launcher: Arc::new(MockLauncher::new()),
            hardware_concurrency: 4,
        }
    }

    #[test]
    fn builtin_registry_builds_cpu_stress() {
        let registry = ExecutorRegistry::with_builtin();
        let exp = Experiment::new("burn", ExperimentKind::CpuStress, TargetScope::new("dev"));
        let executor = registry.build(&exp, &deps()).unwrap();
        assert_eq!(executor.kind(), ExperimentKind::CpuStress);
    }

    #[test]
    fn unregistered_kind_is_rejected() {
        let registry = ExecutorRegistry::with_builtin();
        assert!(!registry.supports(ExperimentKind::NetworkLatency));
        let exp = Experiment::new("lag", ExperimentKind::NetworkLatency, TargetScope::new("dev"));
        assert!(matches!(
            registry.build(&exp, &deps()),
            Err(ExperimentError::UnknownKind(ExperimentKind::NetworkLatency))
        ));
    }

    #[test]
    fn validation_report_into_result() {
        assert!(ValidationReport::from_errors(vec![]).into_result().is_ok());
        let err = ValidationReport::from_errors(vec!["bad".into()])
            .into_result()
            .unwrap_err();
        assert!(matches!(err, ExperimentError::Validation { errors } if errors == vec!["bad".to_string()]));
    }
}
