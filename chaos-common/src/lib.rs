//! Shared types and utilities for the chaos experiment orchestrator.
//!
//! Everything the daemon, the stress worker and the telemetry crate agree
//! on lives here: experiment records, safety rules, the error taxonomy,
//! configuration loading and logging setup.

pub mod config;
pub mod errors;
pub mod logging;
pub mod testing;
pub mod types;

pub use config::{
    ChaosConfig, ConfigError, EnvError, EnvParser, ExecutorConfig, SafetyConfig, SchedulerConfig,
    default_rules, load_rules_file,
};
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry, ExperimentError, InterruptReason};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use types::{
    Comparator, Experiment, ExperimentId, ExperimentKind, ExperimentStatus, RuleAction,
    RuleScope, SafetyMetric, SafetyRule, SafetyStatus, StatusTransition, TargetScope,
    TriggeredRule,
};
