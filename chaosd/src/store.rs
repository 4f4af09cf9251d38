//! Persistence seam for experiment records.
//!
//! The daemon keeps records in memory; a durable backend implements the
//! same trait. `save_status` is a compare-and-set on the previous status so
//! two writers racing on one record cannot both win.

use async_trait::async_trait;
use chaos_common::{Experiment, ExperimentError, ExperimentId, ExperimentStatus, StatusTransition};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn load_experiment(&self, id: &ExperimentId) -> Result<Experiment, ExperimentError>;

    /// Apply `transition` if the record is still in `transition.from`.
    async fn save_status(
        &self,
        id: &ExperimentId,
        transition: StatusTransition,
    ) -> Result<(), ExperimentError>;

    async fn save_result(&self, id: &ExperimentId, result: Value) -> Result<(), ExperimentError>;

    async fn append_error(&self, id: &ExperimentId, message: String) -> Result<(), ExperimentError>;

    async fn save_schedule(
        &self,
        id: &ExperimentId,
        at: DateTime<Utc>,
    ) -> Result<(), ExperimentError>;

    async fn insert(&self, experiment: Experiment) -> Result<(), ExperimentError>;

    async fn list_by_status(
        &self,
        status: ExperimentStatus,
    ) -> Result<Vec<Experiment>, ExperimentError>;
}

#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<ExperimentId, Experiment>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> ExperimentError {
        ExperimentError::Store("record lock poisoned".to_string())
    }

    fn with_record<T>(
        &self,
        id: &ExperimentId,
        f: impl FnOnce(&mut Experiment) -> Result<T, ExperimentError>,
    ) -> Result<T, ExperimentError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| ExperimentError::NotFound(id.clone()))?;
        f(record)
    }
}

#[async_trait]
impl ExperimentStore for InMemoryStore {
    async fn load_experiment(&self, id: &ExperimentId) -> Result<Experiment, ExperimentError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| ExperimentError::NotFound(id.clone()))
    }

    async fn save_status(
        &self,
        id: &ExperimentId,
        transition: StatusTransition,
    ) -> Result<(), ExperimentError> {
        self.with_record(id, |record| {
            if record.status != transition.from {
                return Err(ExperimentError::invalid_transition(
                    id,
                    format!("move to {}", transition.to),
                    record.status,
                ));
            }
            debug!(%id, from = %transition.from, to = %transition.to, "persisting status");
            record.apply_transition(transition);
            Ok(())
        })
    }

    async fn save_result(&self, id: &ExperimentId, result: Value) -> Result<(), ExperimentError> {
        self.with_record(id, |record| {
            record.result = Some(result);
            Ok(())
        })
    }

    async fn append_error(&self, id: &ExperimentId, message: String) -> Result<(), ExperimentError> {
        self.with_record(id, |record| {
            record.errors.push(message);
            Ok(())
        })
    }

    async fn save_schedule(
        &self,
        id: &ExperimentId,
        at: DateTime<Utc>,
    ) -> Result<(), ExperimentError> {
        self.with_record(id, |record| {
            record.scheduled_for = Some(at);
            Ok(())
        })
    }

    async fn insert(&self, experiment: Experiment) -> Result<(), ExperimentError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        records.insert(experiment.id.clone(), experiment);
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: ExperimentStatus,
    ) -> Result<Vec<Experiment>, ExperimentError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        let mut matching: Vec<Experiment> = records
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_common::{ExperimentKind, TargetScope};

    fn draft() -> Experiment {
        Experiment::new("burn", ExperimentKind::CpuStress, TargetScope::new("staging"))
            .with_id("exp-1")
    }

    #[tokio::test]
    async fn save_status_is_compare_and_set() {
        let store = InMemoryStore::new();
        store.insert(draft()).await.unwrap();
        let id = ExperimentId::new("exp-1");

        let to_pending = StatusTransition {
            from: ExperimentStatus::Draft,
            to: ExperimentStatus::Pending,
            at: Utc::now(),
        };
        store.save_status(&id, to_pending.clone()).await.unwrap();

        // Replaying the same transition must fail: the record moved on.
        let err = store.save_status(&id, to_pending).await.unwrap_err();
        assert!(matches!(err, ExperimentError::InvalidStateTransition { .. }));

        let record = store.load_experiment(&id).await.unwrap();
        assert_eq!(record.status, ExperimentStatus::Pending);
        assert_eq!(record.transitions.len(), 1);
    }

    #[tokio::test]
    async fn running_and_terminal_stamp_timestamps() {
        let store = InMemoryStore::new();
        store.insert(draft()).await.unwrap();
        let id = ExperimentId::new("exp-1");

        for (from, to) in [
            (ExperimentStatus::Draft, ExperimentStatus::Pending),
            (ExperimentStatus::Pending, ExperimentStatus::Running),
            (ExperimentStatus::Running, ExperimentStatus::Completed),
        ] {
            store
                .save_status(&id, StatusTransition { from, to, at: Utc::now() })
                .await
                .unwrap();
        }

        let record = store.load_experiment(&id).await.unwrap();
        assert!(record.started_at.is_some());
        assert!(record.ended_at.is_some());
        assert!(record.ended_at >= record.started_at);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .append_error(&ExperimentId::new("nope"), "x".into())
            .await
            .unwrap_err();
        assert_eq!(err, ExperimentError::NotFound(ExperimentId::new("nope")));
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let store = InMemoryStore::new();
        store.insert(draft()).await.unwrap();
        let mut scheduled = draft().with_id("exp-2");
        scheduled.status = ExperimentStatus::Scheduled;
        store.insert(scheduled).await.unwrap();

        let drafts = store.list_by_status(ExperimentStatus::Draft).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].id.as_str(), "exp-1");
        assert_eq!(store.len(), 2);
    }
}
