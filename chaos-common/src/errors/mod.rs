//! Error taxonomy for experiment lifecycle operations.
//!
//! `ExperimentError` is what every command on the core returns; each
//! variant maps onto a catalog entry so callers can surface a stable code.

pub mod catalog;

pub use catalog::{ErrorCategory, ErrorCode, ErrorEntry};

use crate::types::{ExperimentId, ExperimentKind, ExperimentStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why an in-flight experiment was asked to stop early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum InterruptReason {
    /// Operator stop command.
    Stop,
    /// Rollback command issued while running.
    Rollback,
    /// Background safety sweep found an ABORT violation.
    SafetyAbort {
        rule_id: Option<String>,
        message: String,
    },
    /// Orchestrator is shutting down.
    Shutdown,
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => f.write_str("stop requested"),
            Self::Rollback => f.write_str("rollback requested"),
            Self::SafetyAbort { message, .. } => write!(f, "safety abort: {message}"),
            Self::Shutdown => f.write_str("orchestrator shutdown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExperimentError {
    /// Bad configuration; the experiment never starts.
    #[error("invalid experiment parameters: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },

    /// Preflight found the environment unsafe.
    #[error("preflight blocked experiment {id}: {}", .blockers.join("; "))]
    SafetyBlocked {
        id: ExperimentId,
        blockers: Vec<String>,
    },

    /// A safety rule tripped mid-run.
    #[error("SafetyViolation: {message}")]
    SafetyViolation {
        rule_id: Option<String>,
        message: String,
    },

    /// Injection workers failed to start (fatal only when none started).
    #[error("failed to start stress workers: {started}/{requested} started ({reason})")]
    WorkerSpawn {
        requested: usize,
        started: usize,
        reason: String,
    },

    #[error("cannot {operation} experiment {id} in state {from}")]
    InvalidStateTransition {
        id: ExperimentId,
        operation: String,
        from: ExperimentStatus,
    },

    /// Workers resisted both graceful and forced termination.
    #[error("TeardownIncomplete: {} worker(s) still alive (pids {:?})", .pids.len(), .pids)]
    TeardownIncomplete { pids: Vec<u32> },

    #[error("experiment {0} not found")]
    NotFound(ExperimentId),

    #[error("no executor registered for experiment kind {0}")]
    UnknownKind(ExperimentKind),

    #[error("experiment interrupted: {0}")]
    Interrupted(InterruptReason),

    #[error("telemetry unavailable: {0}")]
    Telemetry(String),

    #[error("experiment store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExperimentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::ValidationFailed,
            Self::SafetyBlocked { .. } => ErrorCode::SafetyBlocked,
            Self::SafetyViolation { .. } => ErrorCode::SafetyViolation,
            Self::WorkerSpawn { .. } => ErrorCode::WorkerSpawnFailed,
            Self::InvalidStateTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::TeardownIncomplete { .. } => ErrorCode::TeardownIncomplete,
            Self::NotFound(_) => ErrorCode::ExperimentNotFound,
            Self::UnknownKind(_) => ErrorCode::UnknownExperimentKind,
            Self::Interrupted(_) => ErrorCode::ExperimentInterrupted,
            Self::Telemetry(_) => ErrorCode::TelemetryUnavailable,
            Self::Store(_) => ErrorCode::StoreError,
            Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Conditions that represent a live resource leak and must page a human.
    pub fn is_alarm(&self) -> bool {
        matches!(self, Self::TeardownIncomplete { .. })
    }

    pub fn invalid_transition(
        id: &ExperimentId,
        operation: impl Into<String>,
        from: ExperimentStatus,
    ) -> Self {
        Self::InvalidStateTransition {
            id: id.clone(),
            operation: operation.into(),
            from,
        }
    }

    /// Error-list entry with the catalog code prefixed, as recorded on
    /// the experiment.
    pub fn to_record(&self) -> String {
        format!("[{}] {}", self.code(), self)
    }
}
