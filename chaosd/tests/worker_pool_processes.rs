//! Worker pool teardown against real child processes.
#![cfg(target_os = "linux")]

mod common;

use chaos_common::{ExecutorConfig, ExperimentError};
use chaosd::worker_pool::StopReport;
use chaosd::{ProcessLauncher, WorkerPool};
use std::sync::Arc;
use std::time::Duration;

const SIGTERM_MASK: u64 = 1 << 14;

/// Alive and not a zombie.
fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

fn ignores_term(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("SigIgn:"))
                .and_then(|mask| u64::from_str_radix(mask.trim(), 16).ok())
        })
        .is_some_and(|mask| mask & SIGTERM_MASK != 0)
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn sleeper() -> Arc<ProcessLauncher> {
    Arc::new(ProcessLauncher::raw("sleep", ["30"]))
}

#[tokio::test]
async fn graceful_stop_reaps_every_worker() {
    common::init_test_logging();
    test_log!("TEST START: graceful_stop_reaps_every_worker");
    let mut pool = WorkerPool::new(sleeper());
    assert_eq!(pool.start(3, 10.0, Duration::from_secs(60)).unwrap(), 3);
    let pids = pool.pids();
    assert!(pids.iter().all(|pid| *pid > 0 && is_running(*pid)));

    let report = pool
        .stop_all(Duration::from_secs(5), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(report, StopReport { terminated: 3, forced: 0 });
    assert!(pids.iter().all(|pid| !is_running(*pid)));
    test_log!("TEST PASS: graceful_stop_reaps_every_worker");
}

#[tokio::test]
async fn term_ignoring_worker_is_killed() {
    common::init_test_logging();
    let launcher = Arc::new(ProcessLauncher::raw(
        "sh",
        ["-c", "trap '' TERM; exec sleep 30"],
    ));
    let mut pool = WorkerPool::new(launcher);
    pool.start(1, 10.0, Duration::from_secs(60)).unwrap();
    let pid = pool.pids()[0];
    assert!(wait_until(|| ignores_term(pid)).await, "worker never ignored TERM");

    let report = pool
        .stop_all(Duration::from_millis(300), Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(report, StopReport { terminated: 1, forced: 1 });
    assert!(!is_running(pid));
}

#[tokio::test]
async fn stop_all_twice_is_a_no_op() {
    common::init_test_logging();
    let mut pool = WorkerPool::new(sleeper());
    pool.start(2, 10.0, Duration::from_secs(60)).unwrap();

    pool.stop_all(Duration::from_secs(5), Duration::from_secs(2))
        .await
        .unwrap();
    let again = pool
        .stop_all(Duration::from_secs(5), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(again, StopReport::default());
    assert_eq!(pool.terminated_total(), 2);
    assert_eq!(pool.live_count(), 0);
}

#[tokio::test]
async fn dropping_the_pool_kills_workers() {
    common::init_test_logging();
    let mut pool = WorkerPool::new(sleeper());
    pool.start(2, 10.0, Duration::from_secs(60)).unwrap();
    let pids = pool.pids();
    drop(pool);

    assert!(
        wait_until(|| pids.iter().all(|pid| !is_running(*pid))).await,
        "workers outlived their pool"
    );
}

#[tokio::test]
async fn missing_program_fails_to_start() {
    common::init_test_logging();
    let launcher = Arc::new(ProcessLauncher::raw("/nonexistent/chaos-wkr", Vec::<String>::new()));
    let mut pool = WorkerPool::new(launcher);
    let err = pool.start(2, 10.0, Duration::from_secs(60)).unwrap_err();
    assert!(matches!(
        err,
        ExperimentError::WorkerSpawn { requested: 2, started: 0, .. }
    ));
}

#[tokio::test]
async fn stress_workers_run_until_stopped() {
    common::init_test_logging();
    test_log!("TEST START: stress_workers_run_until_stopped");
    let config = ExecutorConfig {
        worker_program: Some(common::chaos_wkr_binary()),
        ..ExecutorConfig::default()
    };
    let launcher = Arc::new(ProcessLauncher::from_config(&config));
    let mut pool = WorkerPool::new(launcher);
    assert_eq!(pool.start(2, 20.0, Duration::from_secs(60)).unwrap(), 2);
    let pids = pool.pids();

    // Past the first one-second duty window: the arguments were accepted.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(pids.iter().all(|pid| is_running(*pid)), "stress worker exited early");

    let report = pool
        .stop_all(Duration::from_secs(5), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(report, StopReport { terminated: 2, forced: 0 });
    assert!(pids.iter().all(|pid| !std::path::Path::new(&format!("/proc/{pid}")).exists()));
    test_log!("TEST PASS: stress_workers_run_until_stopped");
}
