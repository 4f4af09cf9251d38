mod common;

use chaos_telemetry::collect::{CpuStats, DiskUsage, LoadAverage, MemoryInfo};
use common::{fixture, init_test_logging};
use tracing::info;

#[test]
fn test_cpu_percent_between_fixtures() {
    init_test_logging();
    info!(test = "test_cpu_percent_between_fixtures", phase = "setup");

    let idle = CpuStats::parse(fixture("proc_stat_idle.txt")).expect("idle parse");
    let busy = CpuStats::parse(fixture("proc_stat_busy.txt")).expect("busy parse");

    // 3000 user + 1000 system active over 5000 total jiffies.
    let percent = CpuStats::percent_between(&idle, &busy);
    info!(test = "test_cpu_percent_between_fixtures", phase = "assert", percent);
    assert!((percent - 80.0).abs() < 0.01, "got {percent}");
}

#[test]
fn test_cpu_percent_never_negative_on_counter_reset() {
    init_test_logging();
    let idle = CpuStats::parse(fixture("proc_stat_idle.txt")).expect("idle parse");
    let busy = CpuStats::parse(fixture("proc_stat_busy.txt")).expect("busy parse");

    let percent = CpuStats::percent_between(&busy, &idle);
    assert_eq!(percent, 0.0);
}

#[test]
fn test_meminfo_fixture() {
    init_test_logging();
    info!(test = "test_meminfo_fixture", phase = "setup");

    let info = MemoryInfo::parse(fixture("proc_meminfo_sample.txt")).expect("meminfo parse");
    info!(
        test = "test_meminfo_fixture",
        phase = "assert",
        used_percent = info.used_percent()
    );
    assert_eq!(info.total_kb, 16_384_000);
    assert_eq!(info.available_kb, 4_096_000);
    assert!((info.used_percent() - 75.0).abs() < 0.01);
}

#[test]
fn test_loadavg_fixture() {
    init_test_logging();
    let load = LoadAverage::parse(fixture("proc_loadavg_sample.txt")).expect("loadavg parse");
    assert_eq!(load.one_min, 3.52);
    assert_eq!(load.five_min, 2.10);
}

#[test]
fn test_df_fixture() {
    init_test_logging();
    info!(test = "test_df_fixture", phase = "setup");

    let usage = DiskUsage::parse(fixture("df_sample.txt")).expect("df parse");
    info!(
        test = "test_df_fixture",
        phase = "assert",
        used_percent = usage.used_percent()
    );
    assert_eq!(usage.mount_point, "/");
    assert!(usage.used_percent() > 94.0 && usage.used_percent() < 95.0);
}
