//! Experiment lifecycle.
//!
//! The only writer of `Experiment::status`. Every change goes through
//! [`transition_allowed`] and is persisted as a compare-and-set, so a
//! rejected command leaves the record untouched.
//!
//! ```text
//! DRAFT ──schedule──▶ SCHEDULED
//!   │                    │
//!   └──────start─────────┴──▶ PENDING ──preflight ok──▶ RUNNING ──▶ COMPLETED
//!        ▲  (preflight blocked)  │                         │──▶ FAILED ──rollback──▶ ROLLED_BACK
//!        └───────────────────────┘                         │──▶ STOPPED
//!                                └──setup failed──▶ FAILED └──▶ ROLLED_BACK
//! ```

use crate::store::ExperimentStore;
use chaos_common::{Experiment, ExperimentError, ExperimentId, ExperimentStatus, StatusTransition};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use ExperimentStatus::*;

/// Whether the lifecycle permits `from -> to`.
pub fn transition_allowed(from: ExperimentStatus, to: ExperimentStatus) -> bool {
    matches!(
        (from, to),
        (Draft, Scheduled)
            | (Draft | Scheduled, Pending)
            | (Pending, Draft | Scheduled)
            | (Pending, Running)
            | (Pending, Failed)
            | (Running, Completed | Failed | Stopped | RolledBack)
            | (Failed, RolledBack)
    )
}

#[derive(Clone)]
pub struct ExperimentStateMachine {
    store: Arc<dyn ExperimentStore>,
}

impl ExperimentStateMachine {
    pub fn new(store: Arc<dyn ExperimentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ExperimentStore> {
        &self.store
    }

    pub async fn status(&self, id: &ExperimentId) -> Result<ExperimentStatus, ExperimentError> {
        Ok(self.store.load_experiment(id).await?.status)
    }

    /// DRAFT|SCHEDULED -> PENDING. Returns the status the start came from.
    pub async fn start(&self, id: &ExperimentId) -> Result<ExperimentStatus, ExperimentError> {
        let current = self.status(id).await?;
        if !current.is_initial() {
            return Err(ExperimentError::invalid_transition(id, "start", current));
        }
        self.persist(id, current, Pending).await?;
        Ok(current)
    }

    /// PENDING -> DRAFT|SCHEDULED after a blocked preflight.
    pub async fn revert_start(
        &self,
        id: &ExperimentId,
        to: ExperimentStatus,
    ) -> Result<Experiment, ExperimentError> {
        if !to.is_initial() {
            return Err(ExperimentError::Internal(format!(
                "cannot revert a start to non-initial state {to}"
            )));
        }
        self.transition(id, "revert start of", to).await
    }

    /// DRAFT -> SCHEDULED, recording when the scheduler should start it.
    pub async fn schedule(
        &self,
        id: &ExperimentId,
        at: DateTime<Utc>,
    ) -> Result<Experiment, ExperimentError> {
        let current = self.status(id).await?;
        if current != Draft {
            return Err(ExperimentError::invalid_transition(id, "schedule", current));
        }
        self.store.save_schedule(id, at).await?;
        self.transition(id, "schedule", Scheduled).await
    }

    pub async fn stop(&self, id: &ExperimentId) -> Result<Experiment, ExperimentError> {
        self.transition(id, "stop", Stopped).await
    }

    /// RUNNING|FAILED -> ROLLED_BACK.
    pub async fn rollback(&self, id: &ExperimentId) -> Result<Experiment, ExperimentError> {
        self.transition(id, "rollback", RolledBack).await
    }

    pub async fn update_status(
        &self,
        id: &ExperimentId,
        to: ExperimentStatus,
    ) -> Result<Experiment, ExperimentError> {
        self.transition(id, format!("move to {to}"), to).await
    }

    /// Attach the run result. Rejected once the experiment is terminal.
    pub async fn record_result(
        &self,
        id: &ExperimentId,
        payload: Value,
    ) -> Result<(), ExperimentError> {
        self.require_live(id, "record a result for").await?;
        self.store.save_result(id, payload).await
    }

    /// Append to the error list. Rejected once the experiment is terminal.
    pub async fn add_error(
        &self,
        id: &ExperimentId,
        message: impl Into<String>,
    ) -> Result<(), ExperimentError> {
        self.require_live(id, "record an error for").await?;
        self.store.append_error(id, message.into()).await
    }

    async fn require_live(&self, id: &ExperimentId, operation: &str) -> Result<(), ExperimentError> {
        let current = self.status(id).await?;
        if current.is_terminal() {
            return Err(ExperimentError::invalid_transition(id, operation, current));
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: &ExperimentId,
        operation: impl Into<String>,
        to: ExperimentStatus,
    ) -> Result<Experiment, ExperimentError> {
        let current = self.status(id).await?;
        if !transition_allowed(current, to) {
            return Err(ExperimentError::invalid_transition(id, operation, current));
        }
        self.persist(id, current, to).await?;
        self.store.load_experiment(id).await
    }

    async fn persist(
        &self,
        id: &ExperimentId,
        from: ExperimentStatus,
        to: ExperimentStatus,
    ) -> Result<(), ExperimentError> {
        let transition = StatusTransition {
            from,
            to,
            at: Utc::now(),
        };
        self.store.save_status(id, transition).await?;
        if to.is_terminal() {
            info!(%id, %from, %to, "experiment reached terminal status");
        } else {
            debug!(%id, %from, %to, "experiment status changed");
        }
        Ok(())
    }
}
