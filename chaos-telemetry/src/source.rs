//! The telemetry seam consumed by safety evaluation and executors.

use crate::collect::{CpuError, CpuStats, DiskError, DiskUsage, LoadAverage, MemoryError, MemoryInfo};
use async_trait::async_trait;
use chaos_common::SafetyMetric;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("telemetry collection task failed: {0}")]
    Join(String),

    /// Injected by scripted sources.
    #[error("{0}")]
    Unavailable(String),
}

/// One point-in-time reading of host resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    /// One-minute load average.
    pub load_average: f64,
}

impl TelemetrySample {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            disk_percent: 0.0,
            load_average: 0.0,
        }
    }

    pub fn with_disk(mut self, disk_percent: f64) -> Self {
        self.disk_percent = disk_percent;
        self
    }

    pub fn with_load(mut self, load_average: f64) -> Self {
        self.load_average = load_average;
        self
    }

    /// Value a safety rule on `metric` compares against.
    pub fn value(&self, metric: SafetyMetric) -> f64 {
        match metric {
            SafetyMetric::CpuPercent => self.cpu_percent,
            SafetyMetric::MemoryPercent => self.memory_percent,
            SafetyMetric::DiskPercent => self.disk_percent,
            SafetyMetric::LoadAverage => self.load_average,
        }
    }
}

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn sample_now(&self) -> Result<TelemetrySample, TelemetryError>;
}

/// Reads /proc on the local host.
///
/// CPU usage is always measured over at least `min_window`: the first call
/// sleeps through one, later calls diff against the previous call's
/// counters, and a call arriving inside the window of the previous one gets
/// that sample back instead of a near-empty delta.
pub struct ProcTelemetrySource {
    disk_path: PathBuf,
    min_window: Duration,
    last: Mutex<Option<CpuReading>>,
}

#[derive(Clone, Copy)]
struct CpuReading {
    stats: CpuStats,
    at: Instant,
    sample: TelemetrySample,
}

impl Default for ProcTelemetrySource {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcTelemetrySource {
    pub fn new() -> Self {
        Self {
            disk_path: PathBuf::from("/"),
            min_window: Duration::from_millis(500),
            last: Mutex::new(None),
        }
    }

    /// Filesystem whose usage is reported as `disk_percent`.
    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = path.into();
        self
    }

    /// Shortest interval CPU usage is measured over.
    pub fn with_min_window(mut self, window: Duration) -> Self {
        self.min_window = window.max(Duration::from_millis(10));
        self
    }

    fn last_reading(&self) -> Option<CpuReading> {
        self.last.lock().ok().and_then(|guard| *guard)
    }

    fn store_reading(&self, reading: CpuReading) {
        if let Ok(mut guard) = self.last.lock() {
            *guard = Some(reading);
        }
    }
}

#[async_trait]
impl TelemetrySource for ProcTelemetrySource {
    async fn sample_now(&self) -> Result<TelemetrySample, TelemetryError> {
        let prev = match self.last_reading() {
            Some(last) if last.at.elapsed() < self.min_window => {
                trace!("reusing sample still inside its measurement window");
                return Ok(last.sample);
            }
            Some(last) => last.stats,
            None => {
                let first = CpuStats::read_from_proc()?;
                tokio::time::sleep(self.min_window).await;
                first
            }
        };
        let curr = CpuStats::read_from_proc()?;
        let read_at = Instant::now();

        let memory = MemoryInfo::read_from_proc()?;
        let load = LoadAverage::read_from_proc()?;

        let disk_path = self.disk_path.clone();
        let disk = tokio::task::spawn_blocking(move || DiskUsage::for_path(&disk_path))
            .await
            .map_err(|e| TelemetryError::Join(e.to_string()))??;

        let sample = TelemetrySample {
            timestamp: Utc::now(),
            cpu_percent: CpuStats::percent_between(&prev, &curr),
            memory_percent: memory.used_percent(),
            disk_percent: disk.used_percent(),
            load_average: load.one_min,
        };
        self.store_reading(CpuReading {
            stats: curr,
            at: read_at,
            sample,
        });
        trace!(?sample, "sampled host telemetry");
        Ok(sample)
    }
}

/// Replays a fixed script of samples, one per call.
///
/// Once the script is exhausted the last entry repeats. Entries may be
/// errors, to exercise fail-closed paths.
pub struct ScriptedTelemetrySource {
    script: Mutex<Vec<Result<TelemetrySample, String>>>,
    cursor: Mutex<usize>,
}

impl ScriptedTelemetrySource {
    pub fn new(samples: impl IntoIterator<Item = TelemetrySample>) -> Self {
        Self::from_results(samples.into_iter().map(Ok))
    }

    pub fn from_results(results: impl IntoIterator<Item = Result<TelemetrySample, String>>) -> Self {
        Self {
            script: Mutex::new(results.into_iter().collect()),
            cursor: Mutex::new(0),
        }
    }

    /// A host that stays at the same usage forever.
    pub fn constant(cpu_percent: f64, memory_percent: f64) -> Self {
        Self::new([TelemetrySample::new(cpu_percent, memory_percent)])
    }

    /// Replace the remaining script, restarting from its first entry.
    pub fn set_script(&self, samples: impl IntoIterator<Item = TelemetrySample>) {
        self.set_script_results(samples.into_iter().map(Ok));
    }

    /// Like [`Self::set_script`], with failing reads mixed in.
    pub fn set_script_results(
        &self,
        results: impl IntoIterator<Item = Result<TelemetrySample, String>>,
    ) {
        if let (Ok(mut script), Ok(mut cursor)) = (self.script.lock(), self.cursor.lock()) {
            *script = results.into_iter().collect();
            *cursor = 0;
        }
    }

    /// Samples served since the script was last set.
    pub fn calls(&self) -> usize {
        self.cursor.lock().map(|c| *c).unwrap_or(0)
    }
}

#[async_trait]
impl TelemetrySource for ScriptedTelemetrySource {
    async fn sample_now(&self) -> Result<TelemetrySample, TelemetryError> {
        let script = self
            .script
            .lock()
            .map_err(|_| TelemetryError::Unavailable("script lock poisoned".to_string()))?;
        let mut cursor = self
            .cursor
            .lock()
            .map_err(|_| TelemetryError::Unavailable("cursor lock poisoned".to_string()))?;

        let Some(last) = script.len().checked_sub(1) else {
            return Err(TelemetryError::Unavailable("empty telemetry script".to_string()));
        };
        let entry = script[(*cursor).min(last)].clone();
        *cursor += 1;
        debug!(call = *cursor, "scripted telemetry sample");

        entry
            .map(|mut sample| {
                sample.timestamp = Utc::now();
                sample
            })
            .map_err(TelemetryError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_source_repeats_last_entry() {
        let source = ScriptedTelemetrySource::new([
            TelemetrySample::new(10.0, 20.0),
            TelemetrySample::new(50.0, 60.0),
        ]);

        assert_eq!(source.sample_now().await.unwrap().cpu_percent, 10.0);
        assert_eq!(source.sample_now().await.unwrap().cpu_percent, 50.0);
        assert_eq!(source.sample_now().await.unwrap().cpu_percent, 50.0);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn scripted_errors_surface() {
        let source = ScriptedTelemetrySource::from_results([Err("proc unreadable".to_string())]);
        let err = source.sample_now().await.unwrap_err();
        assert_eq!(err.to_string(), "proc unreadable");
    }

    #[tokio::test]
    async fn empty_script_is_unavailable() {
        let source = ScriptedTelemetrySource::new([]);
        assert!(source.sample_now().await.is_err());
    }

    #[test]
    fn value_selects_metric() {
        let sample = TelemetrySample::new(12.0, 34.0).with_disk(56.0).with_load(7.5);
        assert_eq!(sample.value(SafetyMetric::CpuPercent), 12.0);
        assert_eq!(sample.value(SafetyMetric::MemoryPercent), 34.0);
        assert_eq!(sample.value(SafetyMetric::DiskPercent), 56.0);
        assert_eq!(sample.value(SafetyMetric::LoadAverage), 7.5);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn proc_source_reports_percentages() {
        let source = ProcTelemetrySource::new().with_min_window(Duration::from_millis(50));
        let sample = source.sample_now().await.unwrap();
        assert!((0.0..=100.0).contains(&sample.cpu_percent));
        assert!((0.0..=100.0).contains(&sample.memory_percent));
        assert!((0.0..=100.0).contains(&sample.disk_percent));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn back_to_back_samples_keep_a_full_window() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let spinning = Arc::new(AtomicBool::new(true));
        let spinner = {
            let spinning = spinning.clone();
            std::thread::spawn(move || {
                while spinning.load(Ordering::Relaxed) {
                    std::hint::spin_loop();
                }
            })
        };

        let source = ProcTelemetrySource::new().with_min_window(Duration::from_millis(300));
        let first = source.sample_now().await.unwrap();
        assert!(first.cpu_percent > 0.0, "busy host read as idle");

        for _ in 0..4 {
            let again = source.sample_now().await.unwrap();
            assert_eq!(again.cpu_percent, first.cpu_percent);
        }

        tokio::time::sleep(Duration::from_millis(350)).await;
        let later = source.sample_now().await.unwrap();
        assert!(later.cpu_percent > 0.0, "busy host read as idle");
        assert!(later.timestamp > first.timestamp);

        spinning.store(false, Ordering::Relaxed);
        spinner.join().unwrap();
    }
}
