//! CPU utilisation from /proc/stat and load from /proc/loadavg.
//!
//! Utilisation is a rate, so a percentage needs two `CpuStats` readings
//! taken some interval apart.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CpuError {
    #[error("failed to read /proc/stat: {0}")]
    ReadStat(#[from] std::io::Error),

    #[error("failed to parse /proc/stat: {0}")]
    Parse(String),

    #[error("failed to read /proc/loadavg: {0}")]
    ReadLoadAvg(String),
}

/// Aggregate CPU counters from the `cpu ` line of /proc/stat, in jiffies.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CpuStats {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuStats {
    pub fn read_from_proc() -> Result<Self, CpuError> {
        let content = std::fs::read_to_string("/proc/stat")?;
        Self::parse(&content)
    }

    /// Parse the aggregate line; per-core `cpuN` lines are ignored.
    pub fn parse(content: &str) -> Result<Self, CpuError> {
        let line = content
            .lines()
            .find(|l| l.starts_with("cpu "))
            .ok_or_else(|| CpuError::Parse("no aggregate cpu line found".to_string()))?;

        let fields: Vec<&str> = line.split_whitespace().skip(1).collect();
        if fields.len() < 4 {
            return Err(CpuError::Parse(format!(
                "cpu line too short: expected at least 4 counters, got {}",
                fields.len()
            )));
        }

        let field = |idx: usize| -> u64 { fields.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        Ok(Self {
            user: field(0),
            nice: field(1),
            system: field(2),
            idle: field(3),
            iowait: field(4),
            irq: field(5),
            softirq: field(6),
            steal: field(7),
        })
    }

    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// Non-idle time (idle and iowait excluded).
    pub fn active(&self) -> u64 {
        self.total()
            .saturating_sub(self.idle)
            .saturating_sub(self.iowait)
    }

    /// Busy percentage between two readings, 0.0 when no time elapsed.
    pub fn percent_between(prev: &CpuStats, curr: &CpuStats) -> f64 {
        let total = curr.total().saturating_sub(prev.total());
        if total == 0 {
            return 0.0;
        }
        let active = curr.active().saturating_sub(prev.active());
        (active as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadAverage {
    pub one_min: f64,
    pub five_min: f64,
    pub fifteen_min: f64,
}

impl LoadAverage {
    pub fn read_from_proc() -> Result<Self, CpuError> {
        let content = std::fs::read_to_string("/proc/loadavg")
            .map_err(|e| CpuError::ReadLoadAvg(e.to_string()))?;
        Self::parse(&content)
    }

    /// Format: `0.45 0.52 0.48 2/512 12345`.
    pub fn parse(content: &str) -> Result<Self, CpuError> {
        let parts: Vec<&str> = content.split_whitespace().collect();
        if parts.len() < 3 {
            return Err(CpuError::Parse(format!(
                "loadavg too short: expected at least 3 fields, got {}",
                parts.len()
            )));
        }
        let parse = |idx: usize, label: &str| -> Result<f64, CpuError> {
            parts[idx]
                .parse()
                .map_err(|_| CpuError::Parse(format!("invalid {label} load: {}", parts[idx])))
        };

        Ok(Self {
            one_min: parse(0, "1min")?,
            five_min: parse(1, "5min")?,
            fifteen_min: parse(2, "15min")?,
        })
    }
}

/// Logical CPUs available to this process.
pub fn hardware_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
