//! In-process doubles for worker processes and notification hooks.
//!
//! Used by unit and integration tests so lifecycle scenarios run under
//! paused time without spawning real processes.

use crate::hooks::NotificationHook;
use crate::worker_pool::{WorkerLauncher, WorkerProcess};
use async_trait::async_trait;
use chaos_common::{Experiment, ExperimentId, SafetyStatus};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FIRST_FAKE_PID: u32 = 40_000;

/// How fake workers react to signals. Read at signal time, so changing it
/// affects already spawned workers.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockBehavior {
    pub ignores_term: bool,
    pub ignores_kill: bool,
    /// Launches after this many successful spawns fail.
    pub fail_spawn_after: Option<usize>,
}

#[derive(Debug, Clone)]
struct FakeWorker {
    pid: u32,
    intensity: f64,
    alive: bool,
    term_signals: usize,
}

#[derive(Default)]
struct MockState {
    behavior: MockBehavior,
    workers: Vec<FakeWorker>,
}

#[derive(Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let launcher = Self::new();
        launcher.set_behavior(behavior);
        launcher
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.with_state(|state| state.behavior = behavior);
    }

    /// Total workers ever spawned.
    pub fn spawned(&self) -> usize {
        self.with_state(|state| state.workers.len())
    }

    pub fn live_count(&self) -> usize {
        self.with_state(|state| state.workers.iter().filter(|w| w.alive).count())
    }

    pub fn intensities(&self) -> Vec<f64> {
        self.with_state(|state| state.workers.iter().map(|w| w.intensity).collect())
    }

    pub fn term_signals(&self) -> usize {
        self.with_state(|state| state.workers.iter().map(|w| w.term_signals).sum())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl WorkerLauncher for MockLauncher {
    fn launch(
        &self,
        intensity: f64,
        _max_runtime: Duration,
    ) -> io::Result<Box<dyn WorkerProcess>> {
        let pid = self.with_state(|state| {
            if let Some(limit) = state.behavior.fail_spawn_after
                && state.workers.len() >= limit
            {
                return Err(io::Error::other("mock spawn failure"));
            }
            let pid = FIRST_FAKE_PID + state.workers.len() as u32;
            state.workers.push(FakeWorker {
                pid,
                intensity,
                alive: true,
                term_signals: 0,
            });
            Ok(pid)
        })?;
        Ok(Box::new(FakeProcess {
            pid,
            launcher: self.clone(),
        }))
    }
}

struct FakeProcess {
    pid: u32,
    launcher: MockLauncher,
}

impl FakeProcess {
    fn update<T>(&self, f: impl FnOnce(MockBehavior, &mut FakeWorker) -> T) -> Option<T> {
        self.launcher.with_state(|state| {
            let behavior = state.behavior;
            state
                .workers
                .iter_mut()
                .find(|w| w.pid == self.pid)
                .map(|worker| f(behavior, worker))
        })
    }
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn signal_term(&mut self) -> bool {
        self.update(|behavior, worker| {
            worker.term_signals += 1;
            if !behavior.ignores_term {
                worker.alive = false;
            }
        })
        .is_some()
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.update(|behavior, worker| {
            if !behavior.ignores_kill {
                worker.alive = false;
            }
        });
        Ok(())
    }

    fn has_exited(&mut self) -> io::Result<bool> {
        Ok(self.update(|_, worker| !worker.alive).unwrap_or(true))
    }
}

/// Records every notification it receives.
#[derive(Default)]
pub struct RecordingHook {
    aborts: Mutex<Vec<(ExperimentId, String)>>,
    alarms: Mutex<Vec<(ExperimentId, Vec<u32>)>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aborts(&self) -> Vec<(ExperimentId, String)> {
        self.aborts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn alarms(&self) -> Vec<(ExperimentId, Vec<u32>)> {
        self.alarms.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationHook for RecordingHook {
    async fn safety_abort(&self, experiment: &Experiment, status: &SafetyStatus) {
        if let Ok(mut aborts) = self.aborts.lock() {
            aborts.push((experiment.id.clone(), status.message()));
        }
    }

    async fn teardown_alarm(&self, id: &ExperimentId, pids: &[u32]) {
        if let Ok(mut alarms) = self.alarms.lock() {
            alarms.push((id.clone(), pids.to_vec()));
        }
    }
}
