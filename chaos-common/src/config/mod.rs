//! Configuration for the chaos orchestrator.
//!
//! Resolution order: built-in defaults, then the TOML file (explicit path or
//! the per-user config directory), then `CHAOS_*` environment overrides.
//! Durations are written in humantime syntax (`"5s"`, `"250ms"`).

pub mod env;

pub use env::{EnvError, EnvParser};

use crate::types::{Comparator, RuleAction, SafetyMetric, SafetyRule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("invalid environment overrides: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Env(Vec<EnvError>),
}

impl ConfigError {
    pub fn code(&self) -> crate::errors::ErrorCode {
        use crate::errors::ErrorCode;
        match self {
            Self::NotFound(_) => ErrorCode::ConfigNotFound,
            Self::Read { .. } | Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::Invalid(_) => ErrorCode::ConfigValidationError,
            Self::Env(_) => ErrorCode::ConfigEnvError,
        }
    }
}

/// Preflight ceilings and sweep cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Current CPU above this blocks a start.
    pub cpu_block_percent: f64,
    /// Current CPU above this produces a preflight warning.
    pub cpu_warn_percent: f64,
    pub memory_block_percent: f64,
    pub disk_warn_percent: f64,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Wait after a failed sweep before trying again.
    #[serde(with = "humantime_serde")]
    pub sweep_error_backoff: Duration,
    /// Optional file of `[[rules]]` watched for hot reload.
    pub rules_file: Option<PathBuf>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            cpu_block_percent: 85.0,
            cpu_warn_percent: 70.0,
            memory_block_percent: 90.0,
            disk_warn_percent: 95.0,
            sweep_interval: Duration::from_secs(10),
            sweep_error_backoff: Duration::from_secs(30),
            rules_file: None,
        }
    }
}

/// Timing knobs shared by all executors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Execute-loop tick: telemetry sample, metrics, safety check.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Pause after teardown before the final telemetry sample.
    #[serde(with = "humantime_serde")]
    pub stabilization_delay: Duration,
    /// How long workers get to exit after SIGTERM.
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// How long to wait for SIGKILL to take effect.
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,
    /// Stress worker binary; defaults to `chaos-wkr` next to the daemon.
    pub worker_program: Option<PathBuf>,
    /// Finished runs whose executor stays in memory for impact assessment
    /// and rollback. Older ones are evicted.
    pub retained_runs: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            stabilization_delay: Duration::from_secs(10),
            grace_period: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(3),
            worker_program: None,
            retained_runs: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosConfig {
    pub safety: SafetyConfig,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub rules: Vec<SafetyRule>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            safety: SafetyConfig::default(),
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
            rules: default_rules(),
        }
    }
}

/// Rules active when the config names none: a hard memory ceiling.
pub fn default_rules() -> Vec<SafetyRule> {
    vec![SafetyRule::new(
        "memory-ceiling",
        SafetyMetric::MemoryPercent,
        Comparator::Gt,
        95.0,
        RuleAction::Abort,
    )]
}

/// A standalone rules file, as hot-reloaded by the daemon.
#[derive(Debug, Clone, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<SafetyRule>,
}

impl ChaosConfig {
    /// Per-user default path (`~/.config/chaos/config.toml` on Linux).
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "chaos", "chaos")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load configuration, apply environment overrides, and validate.
    ///
    /// An explicit `path` must exist; without one the default path is used
    /// if present, otherwise built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                Self::from_file(p)?
            }
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            },
        };

        let mut parser = EnvParser::new();
        config.apply_env(&mut parser);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        info!(path = %path.display(), rules = config.rules.len(), "Loaded chaos config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Apply `CHAOS_*` overrides on top of the current values.
    pub fn apply_env(&mut self, parser: &mut EnvParser) {
        if let Some(v) = parser.get_f64_range("CPU_BLOCK_PERCENT", 0.0, 100.0) {
            self.safety.cpu_block_percent = v;
        }
        if let Some(v) = parser.get_f64_range("CPU_WARN_PERCENT", 0.0, 100.0) {
            self.safety.cpu_warn_percent = v;
        }
        if let Some(v) = parser.get_f64_range("MEMORY_BLOCK_PERCENT", 0.0, 100.0) {
            self.safety.memory_block_percent = v;
        }
        if let Some(v) = parser.get_duration("SWEEP_INTERVAL") {
            self.safety.sweep_interval = v;
        }
        if let Some(v) = parser.get_path("RULES_FILE") {
            self.safety.rules_file = Some(v);
        }
        if let Some(v) = parser.get_duration("POLL_INTERVAL") {
            self.executor.poll_interval = v;
        }
        if let Some(v) = parser.get_duration("STABILIZATION_DELAY") {
            self.executor.stabilization_delay = v;
        }
        if let Some(v) = parser.get_duration("GRACE_PERIOD") {
            self.executor.grace_period = v;
        }
        if let Some(v) = parser.get_path("WORKER_PROGRAM") {
            self.executor.worker_program = Some(v);
        }
        if let Some(v) = parser.get_duration("SCHEDULER_INTERVAL") {
            self.scheduler.interval = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let s = &self.safety;

        for (name, value) in [
            ("safety.cpu_block_percent", s.cpu_block_percent),
            ("safety.cpu_warn_percent", s.cpu_warn_percent),
            ("safety.memory_block_percent", s.memory_block_percent),
            ("safety.disk_warn_percent", s.disk_warn_percent),
        ] {
            if !(0.0..=100.0).contains(&value) {
                problems.push(format!("{name} must be within 0..=100, got {value}"));
            }
        }
        if s.cpu_warn_percent > s.cpu_block_percent {
            problems.push(format!(
                "safety.cpu_warn_percent ({}) exceeds cpu_block_percent ({})",
                s.cpu_warn_percent, s.cpu_block_percent
            ));
        }
        for (name, value) in [
            ("safety.sweep_interval", s.sweep_interval),
            ("executor.poll_interval", self.executor.poll_interval),
            ("scheduler.interval", self.scheduler.interval),
        ] {
            if value.is_zero() {
                problems.push(format!("{name} must be non-zero"));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                problems.push(format!("duplicate safety rule id '{}'", rule.id));
            }
            if !rule.threshold.is_finite() {
                problems.push(format!("rule '{}' has a non-finite threshold", rule.id));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// Parse a standalone rules file (`[[rules]]` tables only).
pub fn load_rules_file(path: &Path) -> Result<Vec<SafetyRule>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: RulesFile = toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(parsed.rules)
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
