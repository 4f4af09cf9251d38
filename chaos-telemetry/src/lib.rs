//! Host telemetry for the chaos orchestrator.
//!
//! `collect` holds the raw /proc and filesystem parsers; `source` exposes
//! them behind the async [`TelemetrySource`] trait that safety evaluation
//! samples from, plus a scripted source for deterministic tests.

pub mod collect;
pub mod source;

pub use chaos_common::{LogConfig, init_logging};
pub use source::{
    ProcTelemetrySource, ScriptedTelemetrySource, TelemetryError, TelemetrySample, TelemetrySource,
};
