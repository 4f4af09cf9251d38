//! Stress worker processes and their teardown.
//!
//! Workers are separate OS processes (`chaos-wkr stress`) so a runaway
//! busy loop can always be reclaimed by a signal. Teardown escalates:
//! SIGTERM, wait out the grace period, SIGKILL the survivors, wait again.
//! Anything still alive after that is kept in a leaked list and reported as
//! `TeardownIncomplete` on every later stop attempt until it finally exits.

use async_trait::async_trait;
use chaos_common::{ExecutorConfig, ExperimentError};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const WORKER_BINARY: &str = "chaos-wkr";
const DEFAULT_POLL_STEP: Duration = Duration::from_millis(50);

/// A running worker as seen by the pool.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    fn pid(&self) -> u32;

    /// Ask the worker to exit. False when the signal could not be sent.
    async fn signal_term(&mut self) -> bool;

    fn force_kill(&mut self) -> io::Result<()>;

    /// Non-blocking exit check; reaps the process when it has exited.
    fn has_exited(&mut self) -> io::Result<bool>;
}

/// Starts worker processes at a given intensity.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, intensity: f64, max_runtime: Duration)
    -> io::Result<Box<dyn WorkerProcess>>;
}

// ── OS processes ─────────────────────────────────────────────────────────

enum LaunchArgs {
    Stress,
    Raw(Vec<String>),
}

/// Launches real child processes.
pub struct ProcessLauncher {
    program: PathBuf,
    args: LaunchArgs,
}

impl ProcessLauncher {
    /// `chaos-wkr` from config, else next to the current executable, else PATH.
    pub fn from_config(config: &ExecutorConfig) -> Self {
        let program = config
            .worker_program
            .clone()
            .unwrap_or_else(default_worker_program);
        Self {
            program,
            args: LaunchArgs::Stress,
        }
    }

    /// Launch `program args..` verbatim, ignoring intensity and runtime.
    pub fn raw(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: LaunchArgs::Raw(args.into_iter().map(Into::into).collect()),
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

fn default_worker_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(WORKER_BINARY))
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        intensity: f64,
        max_runtime: Duration,
    ) -> io::Result<Box<dyn WorkerProcess>> {
        let mut cmd = Command::new(&self.program);
        match &self.args {
            LaunchArgs::Stress => {
                cmd.arg("stress")
                    .arg("--percent")
                    .arg(format!("{intensity:.2}"))
                    .arg("--max-runtime")
                    .arg(humantime::format_duration(max_runtime).to_string());
            }
            LaunchArgs::Raw(args) => {
                cmd.args(args);
            }
        }
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().unwrap_or(0);
        debug!(pid, program = %self.program.display(), intensity, "spawned worker");
        Ok(Box::new(ChildProcess { child, pid }))
    }
}

struct ChildProcess {
    child: Child,
    pid: u32,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn signal_term(&mut self) -> bool {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return true;
        }
        send_term(self.pid).await
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }
}

async fn send_term(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Failed to send TERM signal to process {}: {}", pid, e);
            false
        }
    }
}

// ── Pool ─────────────────────────────────────────────────────────────────

pub struct WorkerHandle {
    process: Box<dyn WorkerProcess>,
    pub target_percent: f64,
    pub spawned_at: Instant,
    pub index: usize,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.process.pid()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Workers that exited during this stop.
    pub terminated: usize,
    /// Of those, how many needed SIGKILL.
    pub forced: usize,
}

pub struct WorkerPool {
    launcher: Arc<dyn WorkerLauncher>,
    handles: Vec<WorkerHandle>,
    leaked: Vec<WorkerHandle>,
    terminated_total: usize,
    poll_step: Duration,
}

impl WorkerPool {
    pub fn new(launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            handles: Vec::new(),
            leaked: Vec::new(),
            terminated_total: 0,
            poll_step: DEFAULT_POLL_STEP,
        }
    }

    pub fn with_poll_step(mut self, step: Duration) -> Self {
        self.poll_step = step.max(Duration::from_millis(1));
        self
    }

    /// Spawn `count` workers. Partial failure is tolerated; zero started
    /// workers is an error.
    pub fn start(
        &mut self,
        count: usize,
        intensity: f64,
        max_runtime: Duration,
    ) -> Result<usize, ExperimentError> {
        let mut started = 0;
        let mut last_error = None;
        for index in 0..count {
            match self.launcher.launch(intensity, max_runtime) {
                Ok(process) => {
                    self.handles.push(WorkerHandle {
                        process,
                        target_percent: intensity,
                        spawned_at: Instant::now(),
                        index,
                    });
                    started += 1;
                }
                Err(e) => {
                    warn!(index, "Failed to spawn stress worker: {}", e);
                    last_error = Some(e.to_string());
                }
            }
        }

        if started == 0 && count > 0 {
            return Err(ExperimentError::WorkerSpawn {
                requested: count,
                started,
                reason: last_error.unwrap_or_else(|| "unknown".to_string()),
            });
        }
        info!(requested = count, started, intensity, "stress workers started");
        Ok(started)
    }

    /// Workers currently tracked, leaked ones included.
    pub fn live_count(&self) -> usize {
        self.handles.len() + self.leaked.len()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.handles
            .iter()
            .chain(self.leaked.iter())
            .map(WorkerHandle::pid)
            .collect()
    }

    pub fn terminated_total(&self) -> usize {
        self.terminated_total
    }

    /// Terminate every worker. Safe to call repeatedly; with nothing left to
    /// stop it returns an empty report.
    pub async fn stop_all(
        &mut self,
        grace: Duration,
        kill_timeout: Duration,
    ) -> Result<StopReport, ExperimentError> {
        let mut pending: Vec<WorkerHandle> =
            self.handles.drain(..).chain(self.leaked.drain(..)).collect();
        if pending.is_empty() {
            return Ok(StopReport::default());
        }

        let total = pending.len();
        for handle in pending.iter_mut() {
            if !handle.process.signal_term().await {
                debug!(pid = handle.pid(), "TERM not delivered; will escalate");
            }
        }
        let survivors = wait_for_exit(pending, grace, self.poll_step).await;
        let after_grace = survivors.len();

        let survivors = if survivors.is_empty() {
            survivors
        } else {
            warn!(
                count = survivors.len(),
                "workers ignored TERM within grace period; sending KILL"
            );
            let mut survivors = survivors;
            for handle in survivors.iter_mut() {
                if let Err(e) = handle.process.force_kill() {
                    warn!(pid = handle.pid(), "Failed to kill worker: {}", e);
                }
            }
            wait_for_exit(survivors, kill_timeout, self.poll_step).await
        };

        let report = StopReport {
            terminated: total - survivors.len(),
            forced: after_grace - survivors.len(),
        };
        self.terminated_total += report.terminated;

        if survivors.is_empty() {
            debug!(?report, "all workers stopped");
            return Ok(report);
        }

        let pids: Vec<u32> = survivors.iter().map(WorkerHandle::pid).collect();
        error!(?pids, "workers survived KILL; teardown incomplete");
        self.leaked = survivors;
        Err(ExperimentError::TeardownIncomplete { pids })
    }
}

/// Poll until every handle has exited or `timeout` passes; returns the
/// survivors.
async fn wait_for_exit(
    mut handles: Vec<WorkerHandle>,
    timeout: Duration,
    poll_step: Duration,
) -> Vec<WorkerHandle> {
    let deadline = Instant::now() + timeout;
    loop {
        handles.retain_mut(|handle| match handle.process.has_exited() {
            Ok(exited) => !exited,
            Err(e) => {
                warn!(pid = handle.pid(), "Failed to poll worker: {}", e);
                true
            }
        });
        let now = Instant::now();
        if handles.is_empty() || now >= deadline {
            return handles;
        }
        tokio::time::sleep(poll_step.min(deadline - now)).await;
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.handles.iter_mut().chain(self.leaked.iter_mut()) {
            if let Err(e) = handle.process.force_kill() {
                debug!(pid = handle.process.pid(), "kill on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBehavior, MockLauncher};

    fn pool(launcher: &Arc<MockLauncher>) -> WorkerPool {
        WorkerPool::new(launcher.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_cooperative_workers() {
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher);

        assert_eq!(pool.start(4, 20.0, Duration::from_secs(60)).unwrap(), 4);
        assert_eq!(launcher.live_count(), 4);
        assert_eq!(launcher.intensities(), vec![20.0; 4]);

        let report = pool
            .stop_all(Duration::from_secs(5), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(report, StopReport { terminated: 4, forced: 0 });
        assert_eq!(launcher.live_count(), 0);
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_is_idempotent() {
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher);
        pool.start(2, 40.0, Duration::from_secs(60)).unwrap();

        pool.stop_all(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        let second = pool
            .stop_all(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second, StopReport::default());
        assert_eq!(pool.terminated_total(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn escalates_to_kill_after_grace() {
        let launcher = Arc::new(MockLauncher::with_behavior(MockBehavior {
            ignores_term: true,
            ..MockBehavior::default()
        }));
        let mut pool = pool(&launcher);
        pool.start(3, 30.0, Duration::from_secs(60)).unwrap();

        let started = Instant::now();
        let report = pool
            .stop_all(Duration::from_secs(5), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(report, StopReport { terminated: 3, forced: 3 });
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(launcher.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unkillable_workers_raise_teardown_incomplete() {
        let launcher = Arc::new(MockLauncher::with_behavior(MockBehavior {
            ignores_term: true,
            ignores_kill: true,
            ..MockBehavior::default()
        }));
        let mut pool = pool(&launcher);
        pool.start(2, 30.0, Duration::from_secs(60)).unwrap();

        let err = pool
            .stop_all(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            ExperimentError::TeardownIncomplete { pids } => assert_eq!(pids.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(pool.live_count(), 2);

        // The leak is reported again rather than forgotten.
        assert!(
            pool.stop_all(Duration::from_secs(1), Duration::from_secs(1))
                .await
                .is_err()
        );

        launcher.set_behavior(MockBehavior::default());
        let report = pool
            .stop_all(Duration::from_secs(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.terminated, 2);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn partial_spawn_failure_is_tolerated() {
        let launcher = Arc::new(MockLauncher::with_behavior(MockBehavior {
            fail_spawn_after: Some(2),
            ..MockBehavior::default()
        }));
        let mut pool = pool(&launcher);
        assert_eq!(pool.start(4, 25.0, Duration::from_secs(60)).unwrap(), 2);
    }

    #[test]
    fn zero_started_workers_is_an_error() {
        let launcher = Arc::new(MockLauncher::with_behavior(MockBehavior {
            fail_spawn_after: Some(0),
            ..MockBehavior::default()
        }));
        let mut pool = pool(&launcher);
        let err = pool.start(3, 25.0, Duration::from_secs(60)).unwrap_err();
        assert!(matches!(
            err,
            ExperimentError::WorkerSpawn { requested: 3, started: 0, .. }
        ));
    }

    #[test]
    fn pool_can_be_held_across_await_points() {
        fn shareable<T: Send + Sync + ?Sized>() {}
        shareable::<dyn WorkerProcess>();
        shareable::<WorkerPool>();
        shareable::<tokio::sync::Mutex<WorkerPool>>();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_future_is_send() {
        fn spawnable<F: std::future::Future + Send>(future: F) -> F {
            future
        }
        let launcher = Arc::new(MockLauncher::new());
        let mut pool = pool(&launcher);
        pool.start(2, 20.0, Duration::from_secs(60)).unwrap();

        let report = tokio::spawn(async move {
            spawnable(pool.stop_all(Duration::from_secs(1), Duration::from_secs(1))).await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(report.terminated, 2);
    }

    #[test]
    fn drop_kills_remaining_workers() {
        let launcher = Arc::new(MockLauncher::new());
        {
            let mut pool = pool(&launcher);
            pool.start(2, 50.0, Duration::from_secs(60)).unwrap();
            assert_eq!(launcher.live_count(), 2);
        }
        assert_eq!(launcher.live_count(), 0);
    }
}
