//! Common types used across chaos orchestrator components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unique identifier for an experiment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(pub String);

impl ExperimentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random (v4) identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExperimentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Fault family an experiment injects.
///
/// Only `CpuStress` ships with an executor; the other kinds are accepted in
/// records so a registry can be extended without a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentKind {
    CpuStress,
    MemoryStress,
    NetworkLatency,
    ProcessKill,
}

impl ExperimentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CpuStress => "CPU_STRESS",
            Self::MemoryStress => "MEMORY_STRESS",
            Self::NetworkLatency => "NETWORK_LATENCY",
            Self::ProcessKill => "PROCESS_KILL",
        }
    }
}

impl fmt::Display for ExperimentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CPU_STRESS" => Ok(Self::CpuStress),
            "MEMORY_STRESS" => Ok(Self::MemoryStress),
            "NETWORK_LATENCY" => Ok(Self::NetworkLatency),
            "PROCESS_KILL" => Ok(Self::ProcessKill),
            other => Err(format!("unknown experiment kind '{other}'")),
        }
    }
}

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Draft,
    Scheduled,
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
    Stopped,
}

impl ExperimentStatus {
    pub const ALL: [ExperimentStatus; 8] = [
        Self::Draft,
        Self::Scheduled,
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::RolledBack,
        Self::Stopped,
    ];

    /// States a start command may be issued from.
    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Draft | Self::Scheduled)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::RolledBack | Self::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Scheduled => "SCHEDULED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an experiment is allowed to act: an environment plus a free-form
/// resource selector (labels, host names, service names).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetScope {
    pub environment: String,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
}

impl TargetScope {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            selector: BTreeMap::new(),
        }
    }

    pub fn with_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.selector.insert(key.into(), value.into());
        self
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: ExperimentStatus,
    pub to: ExperimentStatus,
    pub at: DateTime<Utc>,
}

/// An experiment record as owned by the orchestrator and persisted by the
/// external store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub name: String,
    pub kind: ExperimentKind,
    pub target: TargetScope,
    /// Fault-specific parameters (e.g. `cpu_percent`, `duration_secs`, `workers`).
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub status: ExperimentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<StatusTransition>,
}

impl Experiment {
    /// New DRAFT experiment with a generated id.
    pub fn new(name: impl Into<String>, kind: ExperimentKind, target: TargetScope) -> Self {
        Self {
            id: ExperimentId::generate(),
            name: name.into(),
            kind,
            target,
            parameters: Map::new(),
            status: ExperimentStatus::Draft,
            created_at: Utc::now(),
            scheduled_for: None,
            started_at: None,
            ended_at: None,
            result: None,
            errors: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<ExperimentId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Integer parameter; `None` when absent or not an unsigned integer.
    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }

    /// Numeric parameter, accepting integers and floats.
    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(Value::as_f64)
    }

    /// Record a status change and stamp the lifecycle timestamps it implies.
    pub fn apply_transition(&mut self, transition: StatusTransition) {
        self.status = transition.to;
        match transition.to {
            ExperimentStatus::Running => self.started_at = Some(transition.at),
            status if status.is_terminal() => self.ended_at = Some(transition.at),
            _ => {}
        }
        self.transitions.push(transition);
    }

    /// Time the last transition into `status` was recorded.
    pub fn transitioned_at(&self, status: ExperimentStatus) -> Option<DateTime<Utc>> {
        self.transitions
            .iter()
            .rev()
            .find(|t| t.to == status)
            .map(|t| t.at)
    }
}

impl From<String> for ExperimentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ── Safety rules ─────────────────────────────────────────────────────────

/// Telemetry field a safety rule observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyMetric {
    CpuPercent,
    MemoryPercent,
    DiskPercent,
    LoadAverage,
}

impl fmt::Display for SafetyMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::CpuPercent => "cpu_percent",
            Self::MemoryPercent => "memory_percent",
            Self::DiskPercent => "disk_percent",
            Self::LoadAverage => "load_average",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

impl Comparator {
    pub fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => observed > threshold,
            Self::Ge => observed >= threshold,
            Self::Lt => observed < threshold,
            Self::Le => observed <= threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

/// What happens when a rule's condition holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    Warn,
    Abort,
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warn => f.write_str("WARN"),
            Self::Abort => f.write_str("ABORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    #[default]
    Global,
    Kind(ExperimentKind),
}

/// Threshold policy evaluated against live telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyRule {
    pub id: String,
    pub metric: SafetyMetric,
    pub comparator: Comparator,
    pub threshold: f64,
    pub action: RuleAction,
    #[serde(default)]
    pub scope: RuleScope,
}

impl SafetyRule {
    pub fn new(
        id: impl Into<String>,
        metric: SafetyMetric,
        comparator: Comparator,
        threshold: f64,
        action: RuleAction,
    ) -> Self {
        Self {
            id: id.into(),
            metric,
            comparator,
            threshold,
            action,
            scope: RuleScope::Global,
        }
    }

    pub fn scoped_to(mut self, kind: ExperimentKind) -> Self {
        self.scope = RuleScope::Kind(kind);
        self
    }

    pub fn applies_to(&self, kind: ExperimentKind) -> bool {
        match self.scope {
            RuleScope::Global => true,
            RuleScope::Kind(k) => k == kind,
        }
    }

    pub fn is_violated(&self, observed: f64) -> bool {
        self.comparator.holds(observed, self.threshold)
    }

    /// Human-readable violation message.
    pub fn describe(&self, observed: f64) -> String {
        format!(
            "rule '{}' ({}): {} = {:.1} {} {:.1}",
            self.id,
            self.action,
            self.metric,
            observed,
            self.comparator.symbol(),
            self.threshold
        )
    }
}

/// The rule that tripped a safety evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggeredRule {
    pub rule_id: String,
    pub metric: SafetyMetric,
    pub observed: f64,
    pub threshold: f64,
    pub action: RuleAction,
}

/// Result of a single safety evaluation. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub safe: bool,
    pub warnings: Vec<String>,
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_rule: Option<TriggeredRule>,
}

impl Default for SafetyStatus {
    fn default() -> Self {
        Self::safe()
    }
}

impl SafetyStatus {
    pub fn safe() -> Self {
        Self {
            safe: true,
            warnings: Vec::new(),
            blockers: Vec::new(),
            triggered_rule: None,
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Record a blocker; any blocker makes the status unsafe.
    pub fn block(&mut self, message: impl Into<String>) {
        self.blockers.push(message.into());
        self.safe = false;
    }

    /// Summary used in error messages and logs.
    pub fn message(&self) -> String {
        if self.blockers.is_empty() {
            "safe".to_string()
        } else {
            self.blockers.join("; ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let initial: Vec<_> = ExperimentStatus::ALL
            .iter()
            .filter(|s| s.is_initial())
            .collect();
        let terminal: Vec<_> = ExperimentStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(initial.len(), 2);
        assert_eq!(terminal.len(), 4);
        assert!(!ExperimentStatus::Running.is_terminal());
        assert!(!ExperimentStatus::Pending.is_initial());
    }

    #[test]
    fn kind_parses_loose_spellings() {
        assert_eq!(
            "cpu-stress".parse::<ExperimentKind>().unwrap(),
            ExperimentKind::CpuStress
        );
        assert_eq!(
            "CPU_STRESS".parse::<ExperimentKind>().unwrap(),
            ExperimentKind::CpuStress
        );
        assert!("disk_fill".parse::<ExperimentKind>().is_err());
    }

    #[test]
    fn status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ExperimentStatus::RolledBack).unwrap();
        assert_eq!(json, "\"ROLLED_BACK\"");
    }

    #[test]
    fn rule_scope_and_comparison() {
        let rule = SafetyRule::new(
            "mem-ceiling",
            SafetyMetric::MemoryPercent,
            Comparator::Gt,
            90.0,
            RuleAction::Abort,
        )
        .scoped_to(ExperimentKind::CpuStress);

        assert!(rule.applies_to(ExperimentKind::CpuStress));
        assert!(!rule.applies_to(ExperimentKind::NetworkLatency));
        assert!(rule.is_violated(91.0));
        assert!(!rule.is_violated(90.0));
        assert!(rule.describe(91.0).contains("mem-ceiling"));
    }

    #[test]
    fn rule_deserializes_from_toml() {
        let rule: SafetyRule = toml::from_str(
            r#"
id = "load"
metric = "load_average"
comparator = ">="
threshold = 12.0
action = "WARN"
scope = { kind = "CPU_STRESS" }
"#,
        )
        .unwrap();
        assert_eq!(rule.comparator, Comparator::Ge);
        assert_eq!(rule.action, RuleAction::Warn);
        assert_eq!(rule.scope, RuleScope::Kind(ExperimentKind::CpuStress));
    }

    #[test]
    fn blocking_marks_unsafe() {
        let mut status = SafetyStatus::safe();
        status.warn("cpu is warm");
        assert!(status.safe);
        status.block("memory too high");
        assert!(!status.safe);
        assert_eq!(status.message(), "memory too high");
    }

    #[test]
    fn experiment_parameters() {
        let exp = Experiment::new("burn", ExperimentKind::CpuStress, TargetScope::new("staging"))
            .with_parameter("cpu_percent", 80)
            .with_parameter("ratio", 0.5);
        assert_eq!(exp.param_u64("cpu_percent"), Some(80));
        assert_eq!(exp.param_f64("ratio"), Some(0.5));
        assert_eq!(exp.param_u64("missing"), None);
        assert_eq!(exp.status, ExperimentStatus::Draft);
    }
}
