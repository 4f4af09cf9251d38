//! Memory usage from /proc/meminfo.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to read /proc/meminfo: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse /proc/meminfo: missing required field '{0}'")]
    MissingField(String),
}

/// Fields of /proc/meminfo, in kB.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryInfo {
    pub total_kb: u64,
    pub free_kb: u64,
    /// Kernel estimate of memory available for new allocations.
    pub available_kb: u64,
    pub swap_total_kb: u64,
    pub swap_free_kb: u64,
}

impl MemoryInfo {
    pub fn read_from_proc() -> Result<Self, MemoryError> {
        let content = std::fs::read_to_string("/proc/meminfo")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, MemoryError> {
        let map: HashMap<&str, u64> = content
            .lines()
            .filter_map(|line| {
                let (key, value) = line.split_once(':')?;
                let kb = value.trim().trim_end_matches("kB").trim().parse().ok()?;
                Some((key, kb))
            })
            .collect();

        let required = |name: &str| {
            map.get(name)
                .copied()
                .ok_or_else(|| MemoryError::MissingField(name.to_string()))
        };
        let total_kb = required("MemTotal")?;
        let free_kb = required("MemFree")?;

        // Kernels before 3.14 lack MemAvailable.
        let available_kb = map.get("MemAvailable").copied().unwrap_or_else(|| {
            let estimate = free_kb
                + map.get("Buffers").copied().unwrap_or(0)
                + map.get("Cached").copied().unwrap_or(0);
            debug!(estimate, "MemAvailable missing, estimating from free + buffers + cached");
            estimate
        });

        Ok(Self {
            total_kb,
            free_kb,
            available_kb,
            swap_total_kb: map.get("SwapTotal").copied().unwrap_or(0),
            swap_free_kb: map.get("SwapFree").copied().unwrap_or(0),
        })
    }

    pub fn used_kb(&self) -> u64 {
        self.total_kb.saturating_sub(self.available_kb)
    }

    /// Percentage in use (0-100).
    pub fn used_percent(&self) -> f64 {
        if self.total_kb == 0 {
            return 0.0;
        }
        self.used_kb() as f64 / self.total_kb as f64 * 100.0
    }
}
