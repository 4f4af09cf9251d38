//! Starts SCHEDULED experiments once their start time arrives.

use crate::orchestrator::Orchestrator;
use crate::safety::wait_or_shutdown;
use chaos_common::{ExperimentError, ExperimentId, ExperimentStatus, SchedulerConfig};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Scheduler {
    orchestrator: Orchestrator,
    interval: Duration,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, config: &SchedulerConfig) -> Self {
        Self {
            orchestrator,
            interval: config.interval,
        }
    }

    /// Start every SCHEDULED experiment due at `now`. An experiment with no
    /// start time is due immediately. Blocked starts revert to SCHEDULED and
    /// are retried on the next pass.
    pub async fn run_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(ExperimentId, Result<(), ExperimentError>)>, ExperimentError> {
        let scheduled = self
            .orchestrator
            .store()
            .list_by_status(ExperimentStatus::Scheduled)
            .await?;

        let mut outcomes = Vec::new();
        for experiment in scheduled
            .into_iter()
            .filter(|e| e.scheduled_for.is_none_or(|at| at <= now))
        {
            let result = self.orchestrator.start(&experiment.id).await;
            match &result {
                Ok(()) => info!(experiment_id = %experiment.id, "scheduled experiment started"),
                Err(e) => warn!(experiment_id = %experiment.id, "scheduled start failed: {}", e),
            }
            outcomes.push((experiment.id, result));
        }
        Ok(outcomes)
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("Scheduler started (interval: {:?})", self.interval);
            loop {
                match self.run_due(Utc::now()).await {
                    Ok(outcomes) => debug!(started = outcomes.len(), "scheduler pass"),
                    Err(e) => warn!("Scheduler pass failed: {e}"),
                }
                if wait_or_shutdown(self.interval, &mut shutdown).await {
                    info!("Scheduler stopping");
                    break;
                }
            }
        })
    }
}
