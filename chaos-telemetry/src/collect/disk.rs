//! Filesystem usage via `df -Pk`.
//!
//! Shelling out keeps the crate free of `statvfs` FFI; POSIX output mode
//! guarantees one line per filesystem.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiskError {
    #[error("failed to run df: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("df exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("failed to parse df output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiskUsage {
    pub filesystem: String,
    pub mount_point: String,
    pub total_kb: u64,
    pub used_kb: u64,
    pub available_kb: u64,
}

impl DiskUsage {
    pub fn for_path(path: &Path) -> Result<Self, DiskError> {
        let output = Command::new("df").arg("-Pk").arg(path).output()?;
        if !output.status.success() {
            return Err(DiskError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Self::parse(&String::from_utf8_lossy(&output.stdout))
    }

    /// Parse `df -Pk` output; the first data line is used.
    ///
    /// ```text
    /// Filesystem     1024-blocks     Used Available Capacity Mounted on
    /// /dev/nvme0n1p2   490617784 98117480 367478604      22% /
    /// ```
    pub fn parse(output: &str) -> Result<Self, DiskError> {
        let line = output
            .lines()
            .skip(1)
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| DiskError::Parse("no filesystem line".to_string()))?;

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 {
            return Err(DiskError::Parse(format!("short line: '{line}'")));
        }
        let number = |idx: usize| -> Result<u64, DiskError> {
            parts[idx]
                .parse()
                .map_err(|_| DiskError::Parse(format!("invalid number '{}'", parts[idx])))
        };

        Ok(Self {
            filesystem: parts[0].to_string(),
            total_kb: number(1)?,
            used_kb: number(2)?,
            available_kb: number(3)?,
            // Mount points may contain spaces.
            mount_point: parts[5..].join(" "),
        })
    }

    /// Percentage in use, computed as df does: used / (used + available).
    pub fn used_percent(&self) -> f64 {
        let denominator = self.used_kb + self.available_kb;
        if denominator == 0 {
            return 0.0;
        }
        self.used_kb as f64 / denominator as f64 * 100.0
    }
}
