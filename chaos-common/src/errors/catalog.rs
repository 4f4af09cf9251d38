//! Error catalog for the chaos orchestrator.
//!
//! Every failure the core can report maps to a stable code in the
//! `CHAOS-Exxx` format, with remediation steps for the operator.
//!
//! | Range      | Category    | Description                              |
//! |------------|-------------|------------------------------------------|
//! | E001-E099  | Config      | Configuration and environment errors     |
//! | E100-E199  | Validation  | Experiment definition errors             |
//! | E200-E299  | Safety      | Preflight blocks and live violations     |
//! | E300-E399  | Worker      | Stress worker spawn and teardown         |
//! | E400-E499  | Lifecycle   | State machine and command errors         |
//! | E500-E599  | Internal    | Store and unexpected failures            |

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // Config (E001-E099)
    ConfigNotFound,
    ConfigParseError,
    ConfigValidationError,
    ConfigEnvError,

    // Validation (E100-E199)
    ValidationFailed,
    UnknownExperimentKind,

    // Safety (E200-E299)
    SafetyBlocked,
    SafetyViolation,
    TelemetryUnavailable,

    // Worker (E300-E399)
    WorkerSpawnFailed,
    TeardownIncomplete,

    // Lifecycle (E400-E499)
    InvalidStateTransition,
    ExperimentNotFound,
    ExperimentInterrupted,

    // Internal (E500-E599)
    StoreError,
    InternalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Config,
    Validation,
    Safety,
    Worker,
    Lifecycle,
    Internal,
}

/// Catalog entry for an error code.
#[derive(Debug, Clone, Copy)]
pub struct ErrorEntry {
    pub code: &'static str,
    pub category: ErrorCategory,
    pub message: &'static str,
    pub remediation: &'static [&'static str],
}

impl ErrorCode {
    pub fn entry(&self) -> ErrorEntry {
        use ErrorCategory::*;
        match self {
            Self::ConfigNotFound => ErrorEntry {
                code: "CHAOS-E001",
                category: Config,
                message: "Configuration file not found",
                remediation: &["Pass --config with an existing file or remove the flag to use defaults"],
            },
            Self::ConfigParseError => ErrorEntry {
                code: "CHAOS-E002",
                category: Config,
                message: "Configuration file is not valid TOML",
                remediation: &["Check the file for syntax errors", "Durations use humantime syntax such as \"5s\""],
            },
            Self::ConfigValidationError => ErrorEntry {
                code: "CHAOS-E003",
                category: Config,
                message: "Configuration contains invalid values",
                remediation: &["Percent thresholds must lie in 0..=100", "Intervals must be non-zero"],
            },
            Self::ConfigEnvError => ErrorEntry {
                code: "CHAOS-E004",
                category: Config,
                message: "Environment variable has an invalid value",
                remediation: &["Unset or correct the CHAOS_* variable named in the error"],
            },
            Self::ValidationFailed => ErrorEntry {
                code: "CHAOS-E100",
                category: Validation,
                message: "Experiment parameters are out of range",
                remediation: &["Fix the listed parameters; the experiment was not started"],
            },
            Self::UnknownExperimentKind => ErrorEntry {
                code: "CHAOS-E101",
                category: Validation,
                message: "No executor is registered for this experiment kind",
                remediation: &["Use a supported kind such as CPU_STRESS"],
            },
            Self::SafetyBlocked => ErrorEntry {
                code: "CHAOS-E200",
                category: Safety,
                message: "Preflight found the environment unsafe",
                remediation: &["Wait for resource usage to drop and start again"],
            },
            Self::SafetyViolation => ErrorEntry {
                code: "CHAOS-E201",
                category: Safety,
                message: "A safety rule tripped while the experiment was running",
                remediation: &["Inspect the triggered rule and the experiment metrics", "Issue a rollback if residual effects remain"],
            },
            Self::TelemetryUnavailable => ErrorEntry {
                code: "CHAOS-E202",
                category: Safety,
                message: "System telemetry could not be sampled",
                remediation: &["Check that /proc is readable", "Safety evaluation fails closed while telemetry is down"],
            },
            Self::WorkerSpawnFailed => ErrorEntry {
                code: "CHAOS-E300",
                category: Worker,
                message: "Stress workers could not be started",
                remediation: &["Check that the chaos-wkr binary is installed next to chaosd", "Check process limits (ulimit -u)"],
            },
            Self::TeardownIncomplete => ErrorEntry {
                code: "CHAOS-E301",
                category: Worker,
                message: "A stress worker survived graceful and forced termination",
                remediation: &["Kill the listed pids manually", "This is a live resource leak; page the on-call engineer"],
            },
            Self::InvalidStateTransition => ErrorEntry {
                code: "CHAOS-E400",
                category: Lifecycle,
                message: "Command is not valid in the experiment's current state",
                remediation: &["Check the experiment status before issuing the command"],
            },
            Self::ExperimentNotFound => ErrorEntry {
                code: "CHAOS-E401",
                category: Lifecycle,
                message: "Experiment does not exist",
                remediation: &["Check the experiment id"],
            },
            Self::ExperimentInterrupted => ErrorEntry {
                code: "CHAOS-E402",
                category: Lifecycle,
                message: "Experiment was interrupted before completing",
                remediation: &["See the interrupt reason; workers were torn down"],
            },
            Self::StoreError => ErrorEntry {
                code: "CHAOS-E500",
                category: Internal,
                message: "Experiment store operation failed",
                remediation: &["Check the persistence backend"],
            },
            Self::InternalError => ErrorEntry {
                code: "CHAOS-E501",
                category: Internal,
                message: "Unexpected internal error",
                remediation: &["Collect chaosd logs and file a bug"],
            },
        }
    }

    pub fn code_string(&self) -> &'static str {
        self.entry().code
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry().code)
    }
}
