//! Duty-cycle CPU burner.
//!
//! Each window is split into a busy phase of `percent` of the window and a
//! sleeping remainder, which holds one core near the requested utilisation.

use std::hint::black_box;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum DutyCycleError {
    #[error("percent must be within (0, 100], got {0}")]
    Percent(f64),

    #[error("window must be non-zero")]
    Window,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DutyCycle {
    percent: f64,
    window: Duration,
}

impl DutyCycle {
    /// One-second windows at `percent` utilisation.
    pub fn new(percent: f64) -> Result<Self, DutyCycleError> {
        if !(percent > 0.0 && percent <= 100.0) {
            return Err(DutyCycleError::Percent(percent));
        }
        Ok(Self {
            percent,
            window: Duration::from_secs(1),
        })
    }

    pub fn with_window(mut self, window: Duration) -> Result<Self, DutyCycleError> {
        if window.is_zero() {
            return Err(DutyCycleError::Window);
        }
        self.window = window;
        Ok(self)
    }

    pub fn percent(&self) -> f64 {
        self.percent
    }

    pub fn busy_time(&self) -> Duration {
        self.window.mul_f64(self.percent / 100.0)
    }

    pub fn idle_time(&self) -> Duration {
        self.window.saturating_sub(self.busy_time())
    }
}

/// When the burner should give up on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopConditions {
    pub deadline: Option<Instant>,
    /// Parent pid at launch; a change means the orchestrator is gone.
    pub parent: Option<u32>,
}

impl StopConditions {
    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.deadline = Some(Instant::now() + max_runtime);
        self
    }

    pub fn watching_parent(mut self) -> Self {
        self.parent = Some(std::os::unix::process::parent_id());
        self
    }

    fn should_stop(&self, now: Instant) -> Option<ExitReason> {
        if let Some(deadline) = self.deadline
            && now >= deadline
        {
            return Some(ExitReason::MaxRuntime);
        }
        if let Some(parent) = self.parent {
            let current = std::os::unix::process::parent_id();
            if current != parent {
                return Some(ExitReason::Orphaned);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    MaxRuntime,
    Orphaned,
}

#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub windows: u64,
    pub busy: Duration,
    pub elapsed: Duration,
    pub reason: ExitReason,
}

impl RunSummary {
    /// Fraction of wall time spent spinning, as a percentage.
    pub fn observed_percent(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        self.busy.as_secs_f64() / self.elapsed.as_secs_f64() * 100.0
    }
}

/// Burn until a stop condition fires. Without conditions this never
/// returns; the process is expected to be signalled.
pub fn run(cycle: DutyCycle, stop: StopConditions) -> RunSummary {
    debug!(busy = ?cycle.busy_time(), idle = ?cycle.idle_time(), "duty cycle starting");
    let started = Instant::now();
    let mut busy = Duration::ZERO;
    let mut windows = 0u64;

    loop {
        let window_start = Instant::now();
        if let Some(reason) = stop.should_stop(window_start) {
            let summary = RunSummary {
                windows,
                busy,
                elapsed: started.elapsed(),
                reason,
            };
            debug!(?summary, "duty cycle finished");
            return summary;
        }

        let busy_until = window_start + cycle.busy_time();
        let mut counter = 0u64;
        while Instant::now() < busy_until {
            counter = black_box(counter.wrapping_add(1));
        }
        busy += window_start.elapsed();

        let window_end = window_start + cycle.window;
        let now = Instant::now();
        if window_end > now {
            let remaining = window_end - now;
            // Never sleep past the deadline.
            let sleep_for = match stop.deadline {
                Some(deadline) if deadline > now => remaining.min(deadline - now),
                Some(_) => Duration::ZERO,
                None => remaining,
            };
            std::thread::sleep(sleep_for);
        }
        windows += 1;
    }
}
