//! Drives experiments through their executor contract.
//!
//! `start` runs the synchronous part (validation, preflight, setup) and
//! returns once the experiment is RUNNING; execution continues on its own
//! task. Whatever happens during execution, cleanup runs before the
//! terminal status is written, and every run ends in a terminal status with
//! either a result or recorded errors.

use crate::control::ControlBoard;
use crate::events::EventBus;
use crate::executor::{
    CleanupResult, ExecutionContext, ExecutionResult, ExecutorDeps, ExecutorRegistry,
    ExperimentExecutor, ImpactReport, ValidationReport,
};
use crate::hooks::NotificationHook;
use crate::metrics::ChaosMetrics;
use crate::metrics_sink::MetricsSink;
use crate::safety::{SafetyController, SafetySweep};
use crate::state_machine::ExperimentStateMachine;
use crate::store::ExperimentStore;
use crate::worker_pool::WorkerLauncher;
use chaos_common::{
    ChaosConfig, Experiment, ExperimentError, ExperimentId, ExperimentKind, ExperimentStatus,
    InterruptReason, SafetyStatus,
};
use chaos_telemetry::TelemetrySource;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Everything the orchestrator needs, constructed by the caller.
pub struct OrchestratorDeps {
    pub store: Arc<dyn ExperimentStore>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub metrics_sink: Arc<dyn MetricsSink>,
    pub hook: Arc<dyn NotificationHook>,
    pub events: EventBus,
    pub metrics: ChaosMetrics,
    pub registry: ExecutorRegistry,
    pub config: ChaosConfig,
    pub hardware_concurrency: usize,
}

struct RunEntry {
    executor: Arc<dyn ExperimentExecutor>,
    done: watch::Receiver<Option<ExperimentStatus>>,
}

/// Runs started by this process. Finished runs are kept, oldest first, up
/// to a cap; evicting one drops its executor and with it the worker pool.
#[derive(Default)]
struct RunTable {
    entries: HashMap<ExperimentId, RunEntry>,
    finished: VecDeque<ExperimentId>,
}

impl RunTable {
    fn insert(&mut self, id: ExperimentId, entry: RunEntry) {
        self.finished.retain(|f| f != &id);
        self.entries.insert(id, entry);
    }

    fn mark_finished(&mut self, id: &ExperimentId, keep: usize) -> Vec<ExperimentId> {
        if self.entries.contains_key(id) && !self.finished.contains(id) {
            self.finished.push_back(id.clone());
        }
        let mut evicted = Vec::new();
        while self.finished.len() > keep {
            if let Some(oldest) = self.finished.pop_front() {
                self.entries.remove(&oldest);
                evicted.push(oldest);
            }
        }
        evicted
    }
}

struct Inner {
    state: ExperimentStateMachine,
    safety: Arc<SafetyController>,
    control: ControlBoard,
    metrics_sink: Arc<dyn MetricsSink>,
    hook: Arc<dyn NotificationHook>,
    events: EventBus,
    metrics: ChaosMetrics,
    registry: ExecutorRegistry,
    executor_deps: ExecutorDeps,
    runs: Mutex<RunTable>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let safety = Arc::new(SafetyController::new(
            deps.telemetry.clone(),
            deps.config.rules.clone(),
            deps.config.safety.clone(),
            deps.metrics.clone(),
        ));
        let executor_deps = ExecutorDeps {
            config: deps.config.executor.clone(),
            telemetry: deps.telemetry,
            launcher: deps.launcher,
            hardware_concurrency: deps.hardware_concurrency,
        };
        Self {
            inner: Arc::new(Inner {
                state: ExperimentStateMachine::new(deps.store),
                safety,
                control: ControlBoard::new(),
                metrics_sink: deps.metrics_sink,
                hook: deps.hook,
                events: deps.events,
                metrics: deps.metrics,
                registry: deps.registry,
                executor_deps,
                runs: Mutex::new(RunTable::default()),
            }),
        }
    }

    pub fn safety(&self) -> &Arc<SafetyController> {
        &self.inner.safety
    }

    pub fn control(&self) -> &ControlBoard {
        &self.inner.control
    }

    pub fn store(&self) -> &Arc<dyn ExperimentStore> {
        self.inner.state.store()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn metrics(&self) -> &ChaosMetrics {
        &self.inner.metrics
    }

    /// Background sweep over every RUNNING experiment of this orchestrator.
    pub fn safety_sweep(&self) -> SafetySweep {
        SafetySweep {
            controller: self.inner.safety.clone(),
            store: self.store().clone(),
            control: self.inner.control.clone(),
            hook: self.inner.hook.clone(),
            events: self.inner.events.clone(),
        }
    }

    /// Persist a new experiment record.
    pub async fn submit(&self, experiment: Experiment) -> Result<ExperimentId, ExperimentError> {
        let id = experiment.id.clone();
        self.store().insert(experiment).await?;
        Ok(id)
    }

    pub async fn status(&self, id: &ExperimentId) -> Result<Experiment, ExperimentError> {
        self.store().load_experiment(id).await
    }

    pub async fn schedule(
        &self,
        id: &ExperimentId,
        at: DateTime<Utc>,
    ) -> Result<Experiment, ExperimentError> {
        let experiment = self.inner.state.schedule(id, at).await?;
        self.inner
            .events
            .emit_status(id, experiment.kind, ExperimentStatus::Scheduled);
        info!(experiment_id = %id, %at, "experiment scheduled");
        Ok(experiment)
    }

    /// Validate, preflight and set up `id`, then hand it to a run task.
    /// Returns once the experiment is RUNNING.
    pub async fn start(&self, id: &ExperimentId) -> Result<(), ExperimentError> {
        let inner = &self.inner;
        let experiment = self.store().load_experiment(id).await?;
        if !experiment.status.is_initial() {
            return Err(ExperimentError::invalid_transition(
                id,
                "start",
                experiment.status,
            ));
        }

        let executor = inner.registry.build(&experiment, &inner.executor_deps)?;
        executor.validate_parameters().into_result()?;

        let origin = inner.state.start(id).await?;
        inner
            .events
            .emit_status(id, experiment.kind, ExperimentStatus::Pending);

        let preflight = executor.preflight_check(&inner.safety).await;
        for warning in &preflight.warnings {
            warn!(experiment_id = %id, "preflight warning: {}", warning);
        }
        if !preflight.safe {
            inner.state.revert_start(id, origin).await?;
            warn!(experiment_id = %id, "preflight blocked: {}", preflight.message());
            inner.events.emit(
                "preflight_blocked",
                &json!({ "experiment_id": id, "blockers": preflight.blockers }),
            );
            return Err(ExperimentError::SafetyBlocked {
                id: id.clone(),
                blockers: preflight.blockers,
            });
        }

        if let Err(e) = executor.setup().await {
            self.fail_before_run(&experiment, executor.as_ref(), &e).await;
            return Err(e);
        }

        let stop = inner.control.register(id);
        if let Err(e) = inner.state.update_status(id, ExperimentStatus::Running).await {
            inner.control.unregister(id);
            self.fail_before_run(&experiment, executor.as_ref(), &e).await;
            return Err(e);
        }
        inner.metrics.run_started();
        inner
            .events
            .emit_status(id, experiment.kind, ExperimentStatus::Running);
        info!(experiment_id = %id, name = %experiment.name, kind = %experiment.kind, "experiment running");

        let (done_tx, done_rx) = watch::channel(None);
        if let Ok(mut runs) = inner.runs.lock() {
            runs.insert(
                id.clone(),
                RunEntry {
                    executor: executor.clone(),
                    done: done_rx,
                },
            );
        }

        let ctx = ExecutionContext {
            safety: inner.safety.clone(),
            metrics: inner.metrics_sink.clone(),
            stop,
        };
        let run = self.clone();
        let id = id.clone();
        let kind = experiment.kind;
        tokio::spawn(async move {
            let terminal = run.drive(&id, kind, executor, ctx).await;
            let _ = done_tx.send(Some(terminal));
            run.retire(&id);
        });
        Ok(())
    }

    fn retire(&self, id: &ExperimentId) {
        let keep = self.inner.executor_deps.config.retained_runs;
        let evicted = match self.inner.runs.lock() {
            Ok(mut runs) => runs.mark_finished(id, keep),
            Err(_) => return,
        };
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted finished runs");
        }
    }

    /// Runs whose executor is still held, active or finished.
    pub fn retained_runs(&self) -> usize {
        self.inner.runs.lock().map(|runs| runs.entries.len()).unwrap_or(0)
    }

    /// Setup failed while PENDING: clean up, record, and fail the record.
    async fn fail_before_run(
        &self,
        experiment: &Experiment,
        executor: &dyn ExperimentExecutor,
        err: &ExperimentError,
    ) {
        let inner = &self.inner;
        let id = &experiment.id;
        error!(experiment_id = %id, "experiment setup failed: {}", err);
        if let Err(e) = executor.cleanup().await {
            self.report_cleanup_error(id, &e).await;
        }
        if let Err(e) = inner.state.add_error(id, err.to_record()).await {
            warn!(experiment_id = %id, "Failed to record setup error: {}", e);
        }
        match inner.state.update_status(id, ExperimentStatus::Failed).await {
            Ok(_) => {
                inner.metrics.record_outcome(experiment.kind, ExperimentStatus::Failed);
                inner
                    .events
                    .emit_status(id, experiment.kind, ExperimentStatus::Failed);
            }
            Err(e) => error!(experiment_id = %id, "Failed to mark experiment failed: {}", e),
        }
    }

    async fn drive(
        &self,
        id: &ExperimentId,
        kind: ExperimentKind,
        executor: Arc<dyn ExperimentExecutor>,
        ctx: ExecutionContext,
    ) -> ExperimentStatus {
        let inner = &self.inner;

        let exec = executor.clone();
        let outcome = match tokio::spawn(async move { exec.execute(ctx).await }).await {
            Ok(result) => result,
            Err(join) => Err(ExperimentError::Internal(format!(
                "executor task failed: {join}"
            ))),
        };

        let rollback = matches!(
            outcome,
            Err(ExperimentError::Interrupted(InterruptReason::Rollback))
        );
        let cleanup = self.run_cleanup(id, executor, rollback).await;
        inner.control.unregister(id);

        let terminal = self.finish(id, kind, outcome, cleanup).await;
        inner.metrics.run_ended();
        inner.metrics.record_outcome(kind, terminal);
        terminal
    }

    /// Cleanup (or rollback) on its own task so a panic still lands here.
    async fn run_cleanup(
        &self,
        id: &ExperimentId,
        executor: Arc<dyn ExperimentExecutor>,
        rollback: bool,
    ) -> Result<CleanupResult, ExperimentError> {
        let task = tokio::spawn(async move {
            if rollback {
                executor.rollback().await
            } else {
                executor.cleanup().await
            }
        });
        let result = match task.await {
            Ok(result) => result,
            Err(join) => Err(ExperimentError::Internal(format!(
                "cleanup task failed: {join}"
            ))),
        };
        if let Err(e) = &result {
            self.report_cleanup_error(id, e).await;
        }
        result
    }

    async fn report_cleanup_error(&self, id: &ExperimentId, err: &ExperimentError) {
        let inner = &self.inner;
        if let ExperimentError::TeardownIncomplete { pids } = err {
            inner.metrics.teardown_alarm();
            inner.hook.teardown_alarm(id, pids).await;
            inner.events.emit(
                "teardown_alarm",
                &json!({ "experiment_id": id, "pids": pids }),
            );
        }
        error!(experiment_id = %id, code = %err.code(), "cleanup failed: {}", err);
    }

    /// Record the result and errors, then write the terminal status.
    async fn finish(
        &self,
        id: &ExperimentId,
        kind: ExperimentKind,
        outcome: Result<ExecutionResult, ExperimentError>,
        cleanup: Result<CleanupResult, ExperimentError>,
    ) -> ExperimentStatus {
        let inner = &self.inner;
        let state = &inner.state;

        let mut errors = Vec::new();
        let terminal = match &outcome {
            Ok(_) => ExperimentStatus::Completed,
            Err(ExperimentError::Interrupted(InterruptReason::Stop))
            | Err(ExperimentError::Interrupted(InterruptReason::Shutdown)) => ExperimentStatus::Stopped,
            Err(ExperimentError::Interrupted(InterruptReason::Rollback)) => ExperimentStatus::RolledBack,
            Err(ExperimentError::Interrupted(InterruptReason::SafetyAbort { rule_id, message })) => {
                errors.push(
                    ExperimentError::SafetyViolation {
                        rule_id: rule_id.clone(),
                        message: message.clone(),
                    }
                    .to_record(),
                );
                ExperimentStatus::Failed
            }
            Err(e) => {
                if let ExperimentError::SafetyViolation { rule_id, message } = e {
                    inner.events.emit(
                        "safety_abort",
                        &json!({ "experiment_id": id, "source": "tick", "rule_id": rule_id, "message": message }),
                    );
                }
                errors.push(e.to_record());
                ExperimentStatus::Failed
            }
        };
        // Leaked workers mean the run did not end cleanly.
        let terminal = match (&cleanup, terminal) {
            (Err(e), status) => {
                errors.push(e.to_record());
                if status == ExperimentStatus::Completed {
                    ExperimentStatus::Failed
                } else {
                    status
                }
            }
            (Ok(_), status) => status,
        };

        let payload = json!({
            "execution": outcome.as_ref().ok(),
            "cleanup": cleanup.as_ref().ok(),
        });
        if let Err(e) = state.record_result(id, payload).await {
            warn!(experiment_id = %id, "Failed to record result: {}", e);
        }
        for message in errors {
            if let Err(e) = state.add_error(id, message).await {
                warn!(experiment_id = %id, "Failed to record error: {}", e);
            }
        }

        match state.update_status(id, terminal).await {
            Ok(_) => {
                inner.events.emit_status(id, kind, terminal);
                info!(experiment_id = %id, status = %terminal, "experiment finished");
                terminal
            }
            Err(e) => {
                error!(experiment_id = %id, "Failed to write terminal status {}: {}", terminal, e);
                state.status(id).await.unwrap_or(terminal)
            }
        }
    }

    /// Ask a RUNNING experiment to stop; see [`Orchestrator::wait`].
    pub async fn stop(&self, id: &ExperimentId) -> Result<(), ExperimentError> {
        self.interrupt(id, "stop", InterruptReason::Stop).await
    }

    /// Roll back a RUNNING (via its run task) or FAILED experiment.
    pub async fn rollback(&self, id: &ExperimentId) -> Result<(), ExperimentError> {
        let inner = &self.inner;
        let experiment = self.store().load_experiment(id).await?;
        match experiment.status {
            ExperimentStatus::Running => {
                self.interrupt(id, "rollback", InterruptReason::Rollback).await
            }
            ExperimentStatus::Failed => {
                let executor = match self.retained_executor(id) {
                    Some(executor) => executor,
                    None => inner.registry.build(&experiment, &inner.executor_deps)?,
                };
                if let Err(e) = executor.rollback().await {
                    self.report_cleanup_error(id, &e).await;
                    return Err(e);
                }
                inner.state.rollback(id).await?;
                inner.metrics.record_outcome(experiment.kind, ExperimentStatus::RolledBack);
                inner
                    .events
                    .emit_status(id, experiment.kind, ExperimentStatus::RolledBack);
                info!(experiment_id = %id, "failed experiment rolled back");
                Ok(())
            }
            other => Err(ExperimentError::invalid_transition(id, "rollback", other)),
        }
    }

    async fn interrupt(
        &self,
        id: &ExperimentId,
        operation: &str,
        reason: InterruptReason,
    ) -> Result<(), ExperimentError> {
        let status = self.inner.state.status(id).await?;
        if status != ExperimentStatus::Running || !self.inner.control.is_registered(id) {
            return Err(ExperimentError::invalid_transition(id, operation, status));
        }
        if !self.inner.control.signal(id, reason.clone()) {
            info!(experiment_id = %id, %reason, "experiment already interrupted");
        }
        Ok(())
    }

    /// Impact estimate from the run's executor, or a fresh one when the
    /// experiment has not run in this process.
    pub async fn impact_assessment(
        &self,
        id: &ExperimentId,
    ) -> Result<ImpactReport, ExperimentError> {
        let executor = match self.retained_executor(id) {
            Some(executor) => executor,
            None => {
                let experiment = self.store().load_experiment(id).await?;
                self.inner
                    .registry
                    .build(&experiment, &self.inner.executor_deps)?
            }
        };
        executor.impact_assessment().await
    }

    /// Resolve once `id` reaches a terminal status.
    pub async fn wait(&self, id: &ExperimentId) -> Result<ExperimentStatus, ExperimentError> {
        let done = self
            .inner
            .runs
            .lock()
            .ok()
            .and_then(|runs| runs.entries.get(id).map(|r| r.done.clone()));
        let Some(mut done) = done else {
            return self.inner.state.status(id).await;
        };
        match done.wait_for(Option::is_some).await {
            Ok(status) => Ok((*status).unwrap_or(ExperimentStatus::Failed)),
            Err(_) => self.inner.state.status(id).await,
        }
    }

    /// Interrupt every running experiment and wait for each to finish.
    pub async fn shutdown(&self) {
        let signalled = self.inner.control.signal_all(InterruptReason::Shutdown);
        info!(signalled, "orchestrator shutting down");
        let ids: Vec<ExperimentId> = self
            .inner
            .runs
            .lock()
            .map(|runs| runs.entries.keys().cloned().collect())
            .unwrap_or_default();
        join_all(ids.iter().map(|id| self.wait(id))).await;
    }

    /// Parameter check for `experiment` without changing anything.
    pub fn validate(&self, experiment: &Experiment) -> Result<ValidationReport, ExperimentError> {
        let executor = self
            .inner
            .registry
            .build(experiment, &self.inner.executor_deps)?;
        Ok(executor.validate_parameters())
    }

    /// Preflight `experiment` without changing anything.
    pub async fn preflight(&self, experiment: &Experiment) -> Result<SafetyStatus, ExperimentError> {
        let executor = self
            .inner
            .registry
            .build(experiment, &self.inner.executor_deps)?;
        Ok(executor.preflight_check(&self.inner.safety).await)
    }

    fn retained_executor(&self, id: &ExperimentId) -> Option<Arc<dyn ExperimentExecutor>> {
        self.inner
            .runs
            .lock()
            .ok()
            .and_then(|runs| runs.entries.get(id).map(|r| r.executor.clone()))
    }
}
