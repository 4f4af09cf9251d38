//! Chaos experiment orchestration core.
//!
//! The [`Orchestrator`] drives experiments through the executor contract,
//! the [`ExperimentStateMachine`] owns their lifecycle status, and the
//! [`SafetyController`] can interrupt any running experiment through the
//! shared [`ControlBoard`]. Stress load is produced by separate worker
//! processes managed by a [`WorkerPool`].

pub mod control;
pub mod events;
pub mod executor;
pub mod experiment_file;
pub mod hooks;
pub mod metrics;
pub mod metrics_sink;
pub mod mock;
pub mod orchestrator;
pub mod rules_watch;
pub mod safety;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod worker_pool;

pub use control::{ControlBoard, StopSignal};
pub use events::EventBus;
pub use executor::{
    CpuStressExecutor, ExecutionContext, ExecutorDeps, ExecutorRegistry, ExperimentExecutor,
};
pub use hooks::{LoggingHook, NotificationHook};
pub use metrics::{ChaosMetrics, GLOBAL_REGISTRY};
pub use metrics_sink::{InMemoryMetricsSink, MetricSample, MetricsSink, TracingMetricsSink};
pub use orchestrator::{Orchestrator, OrchestratorDeps};
pub use safety::{SafetyController, SafetySweep};
pub use scheduler::Scheduler;
pub use state_machine::ExperimentStateMachine;
pub use store::{ExperimentStore, InMemoryStore};
pub use worker_pool::{ProcessLauncher, WorkerLauncher, WorkerPool};
