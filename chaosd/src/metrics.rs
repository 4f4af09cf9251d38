//! In-process Prometheus counters for experiment outcomes.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `chaos_experiments_total` | Counter | `kind`, `status` |
//! | `chaos_experiments_active` | Gauge | |
//! | `chaos_safety_triggers_total` | Counter | `rule_id`, `action` |
//! | `chaos_teardown_alarms_total` | Counter | |
//!
//! Nothing here serves HTTP; `encode_text` exists for logs and tests.

use chaos_common::{ExperimentKind, ExperimentStatus, RuleAction};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;

lazy_static! {
    /// Process-wide registry used by the daemon binary.
    pub static ref GLOBAL_REGISTRY: Registry = Registry::new();
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

#[derive(Clone)]
pub struct ChaosMetrics {
    registry: Registry,
    experiments_total: IntCounterVec,
    experiments_active: IntGauge,
    safety_triggers_total: IntCounterVec,
    teardown_alarms_total: IntCounter,
}

impl ChaosMetrics {
    pub fn new(registry: &Registry) -> Result<Self, MetricsError> {
        let experiments_total = IntCounterVec::new(
            Opts::new(
                "chaos_experiments_total",
                "Experiments that reached a terminal status",
            ),
            &["kind", "status"],
        )?;
        registry.register(Box::new(experiments_total.clone()))?;

        let experiments_active =
            IntGauge::new("chaos_experiments_active", "Experiments currently running")?;
        registry.register(Box::new(experiments_active.clone()))?;

        let safety_triggers_total = IntCounterVec::new(
            Opts::new(
                "chaos_safety_triggers_total",
                "Safety rule evaluations that found a violation",
            ),
            &["rule_id", "action"],
        )?;
        registry.register(Box::new(safety_triggers_total.clone()))?;

        let teardown_alarms_total = IntCounter::new(
            "chaos_teardown_alarms_total",
            "Workers that survived forced termination",
        )?;
        registry.register(Box::new(teardown_alarms_total.clone()))?;

        Ok(Self {
            registry: registry.clone(),
            experiments_total,
            experiments_active,
            safety_triggers_total,
            teardown_alarms_total,
        })
    }

    /// Metrics on a private registry, for tests and embedded use.
    pub fn standalone() -> Result<Self, MetricsError> {
        Self::new(&Registry::new())
    }

    pub fn run_started(&self) {
        self.experiments_active.inc();
    }

    pub fn run_ended(&self) {
        self.experiments_active.dec();
    }

    /// Count an experiment reaching terminal `status`.
    pub fn record_outcome(&self, kind: ExperimentKind, status: ExperimentStatus) {
        self.experiments_total
            .with_label_values(&[kind.as_str(), status.as_str()])
            .inc();
    }

    pub fn safety_triggered(&self, rule_id: &str, action: RuleAction) {
        let action = action.to_string();
        self.safety_triggers_total
            .with_label_values(&[rule_id, action.as_str()])
            .inc();
    }

    pub fn teardown_alarm(&self) {
        self.teardown_alarms_total.inc();
    }

    pub fn active(&self) -> i64 {
        self.experiments_active.get()
    }

    pub fn finished_count(&self, kind: ExperimentKind, status: ExperimentStatus) -> u64 {
        self.experiments_total
            .with_label_values(&[kind.as_str(), status.as_str()])
            .get()
    }

    pub fn trigger_count(&self, rule_id: &str, action: RuleAction) -> u64 {
        let action = action.to_string();
        self.safety_triggers_total
            .with_label_values(&[rule_id, action.as_str()])
            .get()
    }

    pub fn teardown_alarms(&self) -> u64 {
        self.teardown_alarms_total.get()
    }

    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
