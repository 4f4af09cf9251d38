//! Outbound notification seam.
//!
//! Safety aborts and teardown alarms are the two conditions an operator must
//! hear about. The daemon logs them; deployments wire a pager or chat hook
//! by implementing [`NotificationHook`].

use async_trait::async_trait;
use chaos_common::{Experiment, ExperimentId, SafetyStatus};
use tracing::error;

#[async_trait]
pub trait NotificationHook: Send + Sync {
    /// The safety sweep aborted a running experiment.
    async fn safety_abort(&self, experiment: &Experiment, status: &SafetyStatus);

    /// Workers survived forced termination.
    async fn teardown_alarm(&self, id: &ExperimentId, pids: &[u32]);
}

/// Writes notifications to the error log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

#[async_trait]
impl NotificationHook for LoggingHook {
    async fn safety_abort(&self, experiment: &Experiment, status: &SafetyStatus) {
        error!(
            experiment_id = %experiment.id,
            name = %experiment.name,
            rule_id = status.triggered_rule.as_ref().map(|r| r.rule_id.as_str()),
            "SAFETY ABORT: {}",
            status.message()
        );
    }

    async fn teardown_alarm(&self, id: &ExperimentId, pids: &[u32]) {
        error!(
            experiment_id = %id,
            ?pids,
            "ALARM: stress workers survived termination and are still consuming resources"
        );
    }
}
