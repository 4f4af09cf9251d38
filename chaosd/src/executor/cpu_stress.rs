//! CPU stress: a pool of duty-cycle workers pushing host CPU toward a
//! target utilisation for a bounded time.

use super::{
    BlastRadius, CleanupResult, ExecutionContext, ExecutionResult, ExecutorDeps,
    ExperimentExecutor, ImpactReport, PerformanceImpact, SetupResult, ValidationReport,
};
use crate::metrics_sink::MetricSample;
use crate::safety::{SafetyController, fail_closed};
use crate::worker_pool::WorkerPool;
use async_trait::async_trait;
use chaos_common::{Experiment, ExperimentError, ExperimentKind, SafetyStatus};
use chaos_telemetry::TelemetrySample;
use chrono::Utc;
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const MIN_CPU_PERCENT: f64 = 10.0;
pub const MAX_CPU_PERCENT: f64 = 95.0;
pub const MIN_DURATION_SECS: u64 = 10;
pub const MAX_DURATION_SECS: u64 = 3600;

const DEFAULT_CPU_PERCENT: f64 = 80.0;
const DEFAULT_DURATION_SECS: u64 = 60;
/// Extra lifetime granted to workers beyond the planned run and teardown.
const WORKER_RUNTIME_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct CpuStressParams {
    pub cpu_percent: f64,
    pub duration_secs: u64,
    pub workers: Option<usize>,
}

impl CpuStressParams {
    /// Read parameters with defaults. Values of the wrong JSON type are
    /// reported as errors and replaced by the default.
    pub fn from_experiment(experiment: &Experiment) -> (Self, Vec<String>) {
        let mut errors = Vec::new();
        let params = &experiment.parameters;

        let cpu_percent = match params.get("cpu_percent") {
            None => DEFAULT_CPU_PERCENT,
            Some(v) => v.as_f64().unwrap_or_else(|| {
                errors.push(format!("cpu_percent must be a number (got {v})"));
                DEFAULT_CPU_PERCENT
            }),
        };
        let duration_secs = match params.get("duration_secs") {
            None => DEFAULT_DURATION_SECS,
            Some(v) => v.as_u64().unwrap_or_else(|| {
                errors.push(format!(
                    "duration_secs must be a whole number of seconds (got {v})"
                ));
                DEFAULT_DURATION_SECS
            }),
        };
        let workers = match params.get("workers") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_u64() {
                Some(n) => Some(n as usize),
                None => {
                    errors.push(format!("workers must be a whole number (got {v})"));
                    None
                }
            },
        };

        (
            Self {
                cpu_percent,
                duration_secs,
                workers,
            },
            errors,
        )
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Explicit worker count, else one per core minus one (at least one).
    pub fn resolve_workers(&self, hardware_concurrency: usize) -> usize {
        self.workers
            .unwrap_or_else(|| hardware_concurrency.saturating_sub(1).max(1))
    }
}

#[derive(Debug, Default)]
struct RunState {
    original_cpu: Option<f64>,
    baseline: Option<TelemetrySample>,
    peak_cpu: Option<f64>,
    workers_planned: Option<usize>,
    workers_started: bool,
    stabilized: bool,
}

pub struct CpuStressExecutor {
    experiment: Experiment,
    params: CpuStressParams,
    param_errors: Vec<String>,
    deps: ExecutorDeps,
    pool: tokio::sync::Mutex<WorkerPool>,
    state: Mutex<RunState>,
}

impl CpuStressExecutor {
    pub fn new(experiment: Experiment, deps: ExecutorDeps) -> Self {
        let (params, param_errors) = CpuStressParams::from_experiment(&experiment);
        let pool = WorkerPool::new(deps.launcher.clone());
        Self {
            experiment,
            params,
            param_errors,
            deps,
            pool: tokio::sync::Mutex::new(pool),
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn params(&self) -> &CpuStressParams {
        &self.params
    }

    /// Workers currently alive in this executor's pool.
    pub async fn live_workers(&self) -> usize {
        self.pool.lock().await.live_count()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut RunState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    fn workers_planned(&self) -> usize {
        self.with_state(|s| s.workers_planned)
            .unwrap_or_else(|| self.params.resolve_workers(self.deps.hardware_concurrency))
    }

    fn note_peak(&self, cpu_percent: f64) {
        self.with_state(|s| {
            s.peak_cpu = Some(s.peak_cpu.map_or(cpu_percent, |p| p.max(cpu_percent)));
        });
    }

    async fn final_sample(&self) -> Option<TelemetrySample> {
        match self.deps.telemetry.sample_now().await {
            Ok(sample) => Some(sample),
            Err(e) => {
                warn!(experiment_id = %self.experiment.id, "final telemetry sample failed: {}", e);
                None
            }
        }
    }

    /// Stop all workers; failures are left for `cleanup` to report.
    async fn teardown(&self) {
        let cfg = &self.deps.config;
        let mut pool = self.pool.lock().await;
        if let Err(e) = pool.stop_all(cfg.grace_period, cfg.kill_timeout).await {
            error!(experiment_id = %self.experiment.id, "worker teardown failed: {}", e);
        }
    }

    async fn abort(&self, err: ExperimentError) -> Result<ExecutionResult, ExperimentError> {
        warn!(experiment_id = %self.experiment.id, "cpu stress interrupted: {}", err);
        self.teardown().await;
        Err(err)
    }
}

#[async_trait]
impl ExperimentExecutor for CpuStressExecutor {
    fn kind(&self) -> ExperimentKind {
        ExperimentKind::CpuStress
    }

    fn validate_parameters(&self) -> ValidationReport {
        let mut errors = self.param_errors.clone();
        let p = &self.params;

        if !(MIN_CPU_PERCENT..=MAX_CPU_PERCENT).contains(&p.cpu_percent) {
            errors.push(format!(
                "cpu_percent must be between {MIN_CPU_PERCENT} and {MAX_CPU_PERCENT} (got {})",
                p.cpu_percent
            ));
        }
        if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&p.duration_secs) {
            errors.push(format!(
                "duration_secs must be between {MIN_DURATION_SECS} and {MAX_DURATION_SECS} (got {})",
                p.duration_secs
            ));
        }
        match p.workers {
            Some(0) => errors.push("workers must be at least 1".to_string()),
            Some(n) if n > 2 * self.deps.hardware_concurrency => errors.push(format!(
                "workers must not exceed {} (twice the {} available cores, got {n})",
                2 * self.deps.hardware_concurrency,
                self.deps.hardware_concurrency
            )),
            _ => {}
        }

        ValidationReport::from_errors(errors)
    }

    async fn preflight_check(&self, safety: &SafetyController) -> SafetyStatus {
        let sample = match safety.sample().await {
            Ok(sample) => sample,
            Err(e) => return fail_closed(&e),
        };
        let mut status = safety.evaluate_preflight(self.kind(), &sample);
        self.with_state(|s| s.original_cpu = Some(sample.cpu_percent));

        if self.params.cpu_percent + sample.cpu_percent > 100.0 {
            status.warn(format!(
                "requested {:.0}% load on top of current {:.1}% CPU exceeds 100%",
                self.params.cpu_percent, sample.cpu_percent
            ));
        }
        debug!(
            experiment_id = %self.experiment.id,
            original_cpu = sample.cpu_percent,
            safe = status.safe,
            "cpu stress preflight"
        );
        status
    }

    async fn setup(&self) -> Result<SetupResult, ExperimentError> {
        let baseline = self
            .deps
            .telemetry
            .sample_now()
            .await
            .map_err(|e| ExperimentError::Telemetry(e.to_string()))?;
        let workers_planned = self.params.resolve_workers(self.deps.hardware_concurrency);
        self.with_state(|s| {
            s.baseline = Some(baseline);
            s.workers_planned = Some(workers_planned);
            s.original_cpu.get_or_insert(baseline.cpu_percent);
        });
        info!(
            experiment_id = %self.experiment.id,
            workers_planned,
            baseline_cpu = baseline.cpu_percent,
            "cpu stress setup complete"
        );
        Ok(SetupResult {
            setup_complete: true,
            workers_planned,
            baseline,
        })
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<ExecutionResult, ExperimentError> {
        let cfg = &self.deps.config;
        let id = &self.experiment.id;
        let duration = self.params.duration();
        let poll = cfg.poll_interval.max(Duration::from_millis(1));
        let planned_ticks = (duration.as_secs_f64() / poll.as_secs_f64()).ceil().max(1.0) as u64;

        let workers = self.workers_planned();
        let per_worker = self.params.cpu_percent / workers as f64;
        let max_runtime = duration + cfg.grace_period + cfg.kill_timeout + WORKER_RUNTIME_SLACK;

        let start_time = Utc::now();
        let started = Instant::now();
        let workers_used = self.pool.lock().await.start(workers, per_worker, max_runtime)?;
        self.with_state(|s| s.workers_started = true);
        info!(
            experiment_id = %id,
            workers_used,
            per_worker_percent = per_worker,
            planned_ticks,
            "cpu stress running"
        );

        let mut stop = ctx.stop;
        let mut ticks = 0u64;
        for tick in 0..planned_ticks {
            if let Some(reason) = stop.current() {
                return self.abort(ExperimentError::Interrupted(reason)).await;
            }

            let sample = match ctx.safety.sample().await {
                Ok(sample) => sample,
                Err(e) => {
                    return self
                        .abort(ExperimentError::SafetyViolation {
                            rule_id: None,
                            message: e.to_string(),
                        })
                        .await;
                }
            };
            ticks += 1;
            self.note_peak(sample.cpu_percent);
            ctx.metrics.record(
                id,
                MetricSample {
                    timestamp: sample.timestamp,
                    tick,
                    elapsed_secs: started.elapsed().as_secs_f64(),
                    cpu_percent: sample.cpu_percent,
                    memory_percent: sample.memory_percent,
                    load_average: sample.load_average,
                    active_workers: self.pool.lock().await.live_count(),
                },
            );

            let status = ctx.safety.evaluate_rules(self.kind(), &sample);
            if !status.safe {
                return self
                    .abort(ExperimentError::SafetyViolation {
                        rule_id: status.triggered_rule.map(|r| r.rule_id),
                        message: status.blockers.join("; "),
                    })
                    .await;
            }

            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                reason = stop.triggered() => {
                    return self.abort(ExperimentError::Interrupted(reason)).await;
                }
            }
        }

        self.teardown().await;
        let final_metrics = self.final_sample().await;
        let result = ExecutionResult {
            success: true,
            duration_secs: started.elapsed().as_secs_f64(),
            start_time,
            end_time: Utc::now(),
            ticks,
            final_metrics,
            workers_used,
            target_cpu_percent: self.params.cpu_percent,
        };
        info!(experiment_id = %id, ticks, "cpu stress finished");
        Ok(result)
    }

    async fn cleanup(&self) -> Result<CleanupResult, ExperimentError> {
        let cfg = &self.deps.config;
        let terminated = {
            let mut pool = self.pool.lock().await;
            pool.stop_all(cfg.grace_period, cfg.kill_timeout).await?;
            pool.terminated_total()
        };

        let stabilize = self.with_state(|s| {
            let first = s.workers_started && !s.stabilized;
            s.stabilized = true;
            first
        });
        if stabilize {
            debug!(delay = ?cfg.stabilization_delay, "waiting for host to stabilize");
            tokio::time::sleep(cfg.stabilization_delay).await;
        }

        let final_metrics = self.final_sample().await;
        info!(experiment_id = %self.experiment.id, workers_terminated = terminated, "cpu stress cleanup complete");
        Ok(CleanupResult {
            cleanup_complete: true,
            workers_terminated: terminated,
            final_metrics,
            completed_at: Utc::now(),
        })
    }

    async fn rollback(&self) -> Result<CleanupResult, ExperimentError> {
        self.cleanup().await
    }

    async fn impact_assessment(&self) -> Result<ImpactReport, ExperimentError> {
        let (baseline, peak) = self.with_state(|s| {
            (
                s.baseline.map(|b| b.cpu_percent).or(s.original_cpu),
                s.peak_cpu,
            )
        });
        let (baseline, peak) = match (baseline, peak) {
            (Some(b), Some(p)) => (b, p),
            (baseline, _) => {
                let current = self
                    .deps
                    .telemetry
                    .sample_now()
                    .await
                    .map_err(|e| ExperimentError::Telemetry(e.to_string()))?
                    .cpu_percent;
                (baseline.unwrap_or(current), current)
            }
        };

        let increase = (peak - baseline).max(0.0);
        let mut affected_resources = vec![
            "cpu".to_string(),
            format!("environment:{}", self.experiment.target.environment),
        ];
        affected_resources.extend(
            self.experiment
                .target
                .selector
                .iter()
                .map(|(k, v)| format!("{k}={v}")),
        );

        Ok(ImpactReport {
            blast_radius: BlastRadius {
                scope: "system-wide".to_string(),
                affected_resources,
                severity: if increase > 50.0 { "medium" } else { "low" }.to_string(),
            },
            performance_impact: PerformanceImpact {
                cpu_usage_increase: increase,
                estimated_response_time_impact: increase * 0.02,
                system_load_factor: peak / 100.0,
            },
            risk_level: if self.params.cpu_percent > 80.0 { "medium" } else { "low" }.to_string(),
        })
    }
}
