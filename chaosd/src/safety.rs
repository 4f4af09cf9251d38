//! Safety evaluation and the background safety sweep.
//!
//! Evaluation is pure apart from the trigger counters: it turns a telemetry
//! sample plus the current rule set into a [`SafetyStatus`]. Acting on an
//! unsafe status is the caller's job. The sweep only *signals* running
//! experiments through the [`ControlBoard`]; teardown happens on the
//! experiment's own task.

use crate::control::ControlBoard;
use crate::events::EventBus;
use crate::hooks::NotificationHook;
use crate::metrics::ChaosMetrics;
use crate::store::ExperimentStore;
use chaos_common::{
    Experiment, ExperimentError, ExperimentKind, ExperimentStatus, InterruptReason, RuleAction,
    SafetyConfig, SafetyRule, SafetyStatus, TriggeredRule,
};
use chaos_telemetry::{TelemetrySample, TelemetrySource};
use futures::future::join_all;
use serde_json::json;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct SafetyController {
    telemetry: Arc<dyn TelemetrySource>,
    rules: RwLock<Arc<Vec<SafetyRule>>>,
    config: SafetyConfig,
    metrics: ChaosMetrics,
}

impl SafetyController {
    pub fn new(
        telemetry: Arc<dyn TelemetrySource>,
        rules: Vec<SafetyRule>,
        config: SafetyConfig,
        metrics: ChaosMetrics,
    ) -> Self {
        Self {
            telemetry,
            rules: RwLock::new(Arc::new(rules)),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    /// Snapshot of the active rule set; stable for one evaluation.
    pub fn rules(&self) -> Arc<Vec<SafetyRule>> {
        match self.rules.read() {
            Ok(rules) => rules.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new rule set. In-flight evaluations keep their snapshot.
    pub fn replace_rules(&self, rules: Vec<SafetyRule>) {
        let count = rules.len();
        match self.rules.write() {
            Ok(mut current) => *current = Arc::new(rules),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(rules),
        }
        info!(rules = count, "safety rules replaced");
    }

    pub async fn sample(&self) -> Result<TelemetrySample, ExperimentError> {
        self.telemetry
            .sample_now()
            .await
            .map_err(|e| ExperimentError::Telemetry(e.to_string()))
    }

    /// Built-in ceilings plus every applicable rule.
    pub fn evaluate_preflight(&self, kind: ExperimentKind, sample: &TelemetrySample) -> SafetyStatus {
        let mut status = SafetyStatus::safe();
        let cfg = &self.config;

        if sample.cpu_percent > cfg.cpu_block_percent {
            status.block(format!(
                "CPU usage {:.1}% exceeds the {:.0}% preflight ceiling",
                sample.cpu_percent, cfg.cpu_block_percent
            ));
        } else if sample.cpu_percent > cfg.cpu_warn_percent {
            status.warn(format!(
                "CPU usage {:.1}% is above {:.0}%",
                sample.cpu_percent, cfg.cpu_warn_percent
            ));
        }
        if sample.memory_percent > cfg.memory_block_percent {
            status.block(format!(
                "memory usage {:.1}% exceeds the {:.0}% preflight ceiling",
                sample.memory_percent, cfg.memory_block_percent
            ));
        }
        if sample.disk_percent > cfg.disk_warn_percent {
            status.warn(format!(
                "disk usage {:.1}% is above {:.0}%",
                sample.disk_percent, cfg.disk_warn_percent
            ));
        }

        self.apply_rules(kind, sample, &mut status);
        status
    }

    /// Rules only; used on every execution tick and by the sweep.
    pub fn evaluate_rules(&self, kind: ExperimentKind, sample: &TelemetrySample) -> SafetyStatus {
        let mut status = SafetyStatus::safe();
        self.apply_rules(kind, sample, &mut status);
        status
    }

    fn apply_rules(&self, kind: ExperimentKind, sample: &TelemetrySample, status: &mut SafetyStatus) {
        let rules = self.rules();
        for rule in rules.iter().filter(|r| r.applies_to(kind)) {
            let observed = sample.value(rule.metric);
            if !rule.is_violated(observed) {
                continue;
            }
            self.metrics.safety_triggered(&rule.id, rule.action);
            let message = rule.describe(observed);
            match rule.action {
                RuleAction::Warn => {
                    debug!(rule_id = %rule.id, observed, "safety rule warning");
                    status.warn(message);
                }
                RuleAction::Abort => {
                    warn!(rule_id = %rule.id, observed, threshold = rule.threshold, "safety rule violated");
                    status.block(message);
                    if status.triggered_rule.is_none() {
                        status.triggered_rule = Some(TriggeredRule {
                            rule_id: rule.id.clone(),
                            metric: rule.metric,
                            observed,
                            threshold: rule.threshold,
                            action: rule.action,
                        });
                    }
                }
            }
        }
    }

    /// Preflight for `experiment` against fresh telemetry. Fails closed.
    pub async fn preflight_check(&self, experiment: &Experiment) -> SafetyStatus {
        match self.sample().await {
            Ok(sample) => self.evaluate_preflight(experiment.kind, &sample),
            Err(e) => fail_closed(&e),
        }
    }

    /// Mid-run check for `experiment`. Fails closed.
    pub async fn check_safety(&self, experiment: &Experiment) -> SafetyStatus {
        match self.sample().await {
            Ok(sample) => self.evaluate_rules(experiment.kind, &sample),
            Err(e) => fail_closed(&e),
        }
    }

    /// Evaluate every RUNNING experiment against one shared sample and signal
    /// an abort to each unsafe one. Returns how many aborts were delivered.
    pub async fn check_all_experiments(
        &self,
        store: &dyn ExperimentStore,
        control: &ControlBoard,
        hook: &dyn NotificationHook,
        events: &EventBus,
    ) -> Result<usize, ExperimentError> {
        let running = store.list_by_status(ExperimentStatus::Running).await?;
        if running.is_empty() {
            return Ok(0);
        }

        let sample = self.sample().await;
        let statuses: Vec<SafetyStatus> = running
            .iter()
            .map(|exp| match &sample {
                Ok(sample) => self.evaluate_rules(exp.kind, sample),
                Err(e) => fail_closed(e),
            })
            .collect();

        let mut unsafe_runs = Vec::new();
        for (experiment, status) in running.iter().zip(statuses) {
            if status.safe {
                continue;
            }
            let reason = InterruptReason::SafetyAbort {
                rule_id: status.triggered_rule.as_ref().map(|r| r.rule_id.clone()),
                message: status.message(),
            };
            if control.signal(&experiment.id, reason) {
                warn!(experiment_id = %experiment.id, "safety sweep aborting experiment: {}", status.message());
                unsafe_runs.push((experiment, status));
            }
        }

        join_all(
            unsafe_runs
                .iter()
                .map(|(experiment, status)| hook.safety_abort(experiment, status)),
        )
        .await;
        for (experiment, status) in &unsafe_runs {
            events.emit(
                "safety_abort",
                &json!({
                    "experiment_id": experiment.id,
                    "source": "sweep",
                    "blockers": status.blockers,
                    "triggered_rule": status.triggered_rule,
                }),
            );
        }
        Ok(unsafe_runs.len())
    }
}

/// Unsafe status for a failed telemetry read.
pub fn fail_closed(err: &ExperimentError) -> SafetyStatus {
    let mut status = SafetyStatus::safe();
    status.block(err.to_string());
    status
}

/// Periodic [`SafetyController::check_all_experiments`] driver.
pub struct SafetySweep {
    pub controller: Arc<SafetyController>,
    pub store: Arc<dyn ExperimentStore>,
    pub control: ControlBoard,
    pub hook: Arc<dyn NotificationHook>,
    pub events: EventBus,
}

impl SafetySweep {
    /// Run until `shutdown` flips to true. A failed cycle waits the error
    /// backoff instead of the regular interval.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.controller.config().sweep_interval;
            let backoff = self.controller.config().sweep_error_backoff;
            info!("Safety sweep started (interval: {:?})", interval);

            loop {
                let wait = match self.run_once().await {
                    Ok(aborted) => {
                        if aborted > 0 {
                            info!(aborted, "safety sweep aborted experiments");
                        }
                        interval
                    }
                    Err(e) => {
                        warn!("Safety sweep cycle failed: {e}; backing off {:?}", backoff);
                        backoff
                    }
                };
                if wait_or_shutdown(wait, &mut shutdown).await {
                    info!("Safety sweep stopping");
                    break;
                }
            }
        })
    }

    pub async fn run_once(&self) -> Result<usize, ExperimentError> {
        self.controller
            .check_all_experiments(
                self.store.as_ref(),
                &self.control,
                self.hook.as_ref(),
                &self.events,
            )
            .await
    }
}

/// Sleep for `wait`; true when shutdown was requested first.
pub(crate) async fn wait_or_shutdown(wait: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(wait) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingHook;
    use crate::store::InMemoryStore;
    use chaos_common::{Comparator, ExperimentId, SafetyMetric, StatusTransition, TargetScope};
    use chaos_telemetry::ScriptedTelemetrySource;
    use chrono::Utc;

    fn controller(source: ScriptedTelemetrySource, rules: Vec<SafetyRule>) -> SafetyController {
        SafetyController::new(
            Arc::new(source),
            rules,
            SafetyConfig::default(),
            ChaosMetrics::standalone().unwrap(),
        )
    }

    fn memory_abort(threshold: f64) -> SafetyRule {
        SafetyRule::new(
            "mem-abort",
            SafetyMetric::MemoryPercent,
            Comparator::Gt,
            threshold,
            RuleAction::Abort,
        )
    }

    fn experiment() -> Experiment {
        Experiment::new("burn", ExperimentKind::CpuStress, TargetScope::new("staging"))
    }

    #[tokio::test]
    async fn idle_host_passes_preflight() {
        let ctl = controller(ScriptedTelemetrySource::constant(10.0, 30.0), vec![]);
        let status = ctl.preflight_check(&experiment()).await;
        assert!(status.safe);
        assert!(status.warnings.is_empty());
    }

    #[tokio::test]
    async fn preflight_ceilings() {
        let ctl = controller(ScriptedTelemetrySource::constant(0.0, 0.0), vec![]);

        let hot = ctl.evaluate_preflight(ExperimentKind::CpuStress, &TelemetrySample::new(90.0, 20.0));
        assert!(!hot.safe);
        assert!(hot.blockers[0].contains("CPU usage 90.0%"));

        let warm = ctl.evaluate_preflight(ExperimentKind::CpuStress, &TelemetrySample::new(75.0, 20.0));
        assert!(warm.safe);
        assert_eq!(warm.warnings.len(), 1);

        let full = ctl.evaluate_preflight(
            ExperimentKind::CpuStress,
            &TelemetrySample::new(10.0, 95.0).with_disk(97.0),
        );
        assert!(!full.safe);
        assert_eq!(full.blockers.len(), 1);
        assert_eq!(full.warnings.len(), 1);
    }

    #[tokio::test]
    async fn abort_rule_sets_triggered_rule() {
        let ctl = controller(ScriptedTelemetrySource::constant(0.0, 0.0), vec![memory_abort(80.0)]);
        let status = ctl.evaluate_rules(ExperimentKind::CpuStress, &TelemetrySample::new(20.0, 85.0));
        assert!(!status.safe);
        let rule = status.triggered_rule.expect("triggered rule");
        assert_eq!(rule.rule_id, "mem-abort");
        assert_eq!(rule.observed, 85.0);
        assert_eq!(ctl.metrics.trigger_count("mem-abort", RuleAction::Abort), 1);
    }

    #[tokio::test]
    async fn warn_rules_do_not_block() {
        let rule = SafetyRule::new(
            "load-warn",
            SafetyMetric::LoadAverage,
            Comparator::Ge,
            4.0,
            RuleAction::Warn,
        );
        let ctl = controller(ScriptedTelemetrySource::constant(0.0, 0.0), vec![rule]);
        let status = ctl.evaluate_rules(
            ExperimentKind::CpuStress,
            &TelemetrySample::new(50.0, 50.0).with_load(6.0),
        );
        assert!(status.safe);
        assert_eq!(status.warnings.len(), 1);
        assert!(status.triggered_rule.is_none());
    }

    #[tokio::test]
    async fn scoped_rules_skip_other_kinds() {
        let rule = memory_abort(50.0).scoped_to(ExperimentKind::NetworkLatency);
        let ctl = controller(ScriptedTelemetrySource::constant(0.0, 0.0), vec![rule]);
        let status = ctl.evaluate_rules(ExperimentKind::CpuStress, &TelemetrySample::new(10.0, 90.0));
        assert!(status.safe);
    }

    #[tokio::test]
    async fn telemetry_failure_fails_closed() {
        let source = ScriptedTelemetrySource::from_results([Err("proc unreadable".to_string())]);
        let ctl = controller(source, vec![]);
        let status = ctl.check_safety(&experiment()).await;
        assert!(!status.safe);
        assert!(status.blockers[0].starts_with("telemetry unavailable"));
    }

    #[tokio::test]
    async fn replace_rules_keeps_old_snapshots() {
        let ctl = controller(ScriptedTelemetrySource::constant(0.0, 0.0), vec![memory_abort(80.0)]);
        let before = ctl.rules();
        ctl.replace_rules(vec![]);
        assert_eq!(before.len(), 1);
        assert!(ctl.rules().is_empty());
    }

    #[tokio::test]
    async fn sweep_signals_unsafe_running_experiments() {
        let store = InMemoryStore::new();
        let exp = experiment();
        let id = exp.id.clone();
        store.insert(exp).await.unwrap();
        for (from, to) in [
            (ExperimentStatus::Draft, ExperimentStatus::Pending),
            (ExperimentStatus::Pending, ExperimentStatus::Running),
        ] {
            store
                .save_status(&id, StatusTransition { from, to, at: Utc::now() })
                .await
                .unwrap();
        }

        let control = ControlBoard::new();
        let signal = control.register(&id);
        let hook = RecordingHook::new();
        let events = EventBus::default();
        let mut rx = events.subscribe();

        let ctl = controller(ScriptedTelemetrySource::constant(20.0, 97.0), vec![memory_abort(95.0)]);
        let aborted = ctl
            .check_all_experiments(&store, &control, &hook, &events)
            .await
            .unwrap();

        assert_eq!(aborted, 1);
        assert!(matches!(
            signal.current(),
            Some(InterruptReason::SafetyAbort { rule_id: Some(ref r), .. }) if r == "mem-abort"
        ));
        assert_eq!(hook.aborts().len(), 1);
        let event: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(event["event"], "safety_abort");

        // Already signalled: a second sweep does not notify again.
        let again = ctl
            .check_all_experiments(&store, &control, &hook, &events)
            .await
            .unwrap();
        assert_eq!(again, 0);
        assert_eq!(hook.aborts().len(), 1);
    }

    async fn insert_running(store: &InMemoryStore, name: &str) -> ExperimentId {
        let exp = Experiment::new(name, ExperimentKind::CpuStress, TargetScope::new("staging"));
        let id = exp.id.clone();
        store.insert(exp).await.unwrap();
        for (from, to) in [
            (ExperimentStatus::Draft, ExperimentStatus::Pending),
            (ExperimentStatus::Pending, ExperimentStatus::Running),
        ] {
            store
                .save_status(&id, StatusTransition { from, to, at: Utc::now() })
                .await
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn sweep_reads_telemetry_once_per_cycle() {
        let store = InMemoryStore::new();
        let control = ControlBoard::new();
        let mut signals = Vec::new();
        for name in ["a", "b", "c"] {
            let id = insert_running(&store, name).await;
            signals.push(control.register(&id));
        }

        let source = Arc::new(ScriptedTelemetrySource::constant(20.0, 97.0));
        let ctl = SafetyController::new(
            source.clone(),
            vec![memory_abort(95.0)],
            SafetyConfig::default(),
            ChaosMetrics::standalone().unwrap(),
        );
        let hook = RecordingHook::new();
        let aborted = ctl
            .check_all_experiments(&store, &control, &hook, &EventBus::default())
            .await
            .unwrap();

        assert_eq!(aborted, 3);
        assert_eq!(source.calls(), 1);
        assert_eq!(hook.aborts().len(), 3);
        assert!(signals.iter().all(|s| s.current().is_some()));
    }

    #[tokio::test]
    async fn sweep_fails_closed_for_every_run() {
        let store = InMemoryStore::new();
        let control = ControlBoard::new();
        let a = control.register(&insert_running(&store, "a").await);
        let b = control.register(&insert_running(&store, "b").await);

        let source = ScriptedTelemetrySource::from_results([Err("proc unreadable".to_string())]);
        let ctl = controller(source, vec![]);
        let aborted = ctl
            .check_all_experiments(&store, &control, &RecordingHook::new(), &EventBus::default())
            .await
            .unwrap();

        assert_eq!(aborted, 2);
        for signal in [a, b] {
            assert!(matches!(
                signal.current(),
                Some(InterruptReason::SafetyAbort { rule_id: None, .. })
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_stops_on_shutdown() {
        let sweep = SafetySweep {
            controller: Arc::new(controller(ScriptedTelemetrySource::constant(0.0, 0.0), vec![])),
            store: Arc::new(InMemoryStore::new()),
            control: ControlBoard::new(),
            hook: Arc::new(RecordingHook::new()),
            events: EventBus::default(),
        };
        let (tx, rx) = watch::channel(false);
        let handle = sweep.start(rx);
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
