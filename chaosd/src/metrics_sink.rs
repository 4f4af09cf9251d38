//! Per-tick experiment metrics.
//!
//! The executor records one [`MetricSample`] per poll tick. The sink is
//! synchronous and must not block: samples are small and frequent.

use chaos_common::ExperimentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub tick: u64,
    pub elapsed_secs: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub load_average: f64,
    pub active_workers: usize,
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, id: &ExperimentId, sample: MetricSample);
}

/// Keeps every sample in memory, keyed by experiment.
#[derive(Default)]
pub struct InMemoryMetricsSink {
    samples: Mutex<HashMap<ExperimentId, Vec<MetricSample>>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ExperimentId) -> Vec<MetricSample> {
        self.samples
            .lock()
            .ok()
            .and_then(|s| s.get(id).cloned())
            .unwrap_or_default()
    }

    pub fn count(&self, id: &ExperimentId) -> usize {
        self.samples
            .lock()
            .map(|s| s.get(id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, id: &ExperimentId, sample: MetricSample) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.entry(id.clone()).or_default().push(sample);
        }
    }
}

/// Emits each sample as a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, id: &ExperimentId, sample: MetricSample) {
        info!(
            target: "chaosd::metrics",
            experiment_id = %id,
            tick = sample.tick,
            elapsed_secs = sample.elapsed_secs,
            cpu_percent = sample.cpu_percent,
            memory_percent = sample.memory_percent,
            load_average = sample.load_average,
            active_workers = sample.active_workers,
            "experiment sample"
        );
    }
}
