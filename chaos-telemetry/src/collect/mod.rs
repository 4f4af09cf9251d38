//! Raw /proc and filesystem collectors.

pub mod cpu;
pub mod disk;
pub mod memory;

pub use cpu::{CpuError, CpuStats, LoadAverage, hardware_concurrency};
pub use disk::{DiskError, DiskUsage};
pub use memory::{MemoryError, MemoryInfo};
