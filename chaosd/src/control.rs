//! Per-experiment interrupt channels.
//!
//! Stop, rollback, the safety sweep and shutdown all converge here: each
//! sends an [`InterruptReason`] to the running experiment, and the executor
//! races its tick sleep against [`StopSignal::triggered`]. The first reason
//! wins; later signals are ignored so the terminal status reflects what
//! actually interrupted the run.

use chaos_common::{ExperimentId, InterruptReason};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

#[derive(Clone, Default)]
pub struct ControlBoard {
    channels: Arc<Mutex<HashMap<ExperimentId, watch::Sender<Option<InterruptReason>>>>>,
}

impl ControlBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for `id`, replacing any previous one.
    pub fn register(&self, id: &ExperimentId) -> StopSignal {
        let (tx, rx) = watch::channel(None);
        if let Ok(mut channels) = self.channels.lock() {
            channels.insert(id.clone(), tx);
        }
        StopSignal {
            rx,
            _keepalive: None,
        }
    }

    pub fn unregister(&self, id: &ExperimentId) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(id);
        }
    }

    pub fn is_registered(&self, id: &ExperimentId) -> bool {
        self.channels
            .lock()
            .map(|c| c.contains_key(id))
            .unwrap_or(false)
    }

    /// Deliver `reason` to `id`. Returns false when the experiment has no
    /// channel or was already interrupted.
    pub fn signal(&self, id: &ExperimentId, reason: InterruptReason) -> bool {
        let Ok(channels) = self.channels.lock() else {
            return false;
        };
        let Some(tx) = channels.get(id) else {
            return false;
        };
        let delivered = tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.clone());
            true
        });
        debug!(%id, %reason, delivered, "interrupt signal");
        delivered
    }

    /// Signal every registered experiment; returns how many accepted.
    pub fn signal_all(&self, reason: InterruptReason) -> usize {
        let ids: Vec<ExperimentId> = self
            .channels
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        ids.iter()
            .filter(|id| self.signal(id, reason.clone()))
            .count()
    }

    pub fn registered(&self) -> Vec<ExperimentId> {
        self.channels
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Receiving end held by an executing experiment.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<Option<InterruptReason>>,
    _keepalive: Option<Arc<watch::Sender<Option<InterruptReason>>>>,
}

impl StopSignal {
    /// A signal that never fires, for executors driven outside an orchestrator.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn current(&self) -> Option<InterruptReason> {
        self.rx.borrow().clone()
    }

    /// Resolve once an interrupt arrives. Pending forever if the board
    /// drops the channel without signalling.
    pub async fn triggered(&mut self) -> InterruptReason {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_signal_wins() {
        let board = ControlBoard::new();
        let id = ExperimentId::new("exp-1");
        let mut signal = board.register(&id);

        assert!(board.signal(&id, InterruptReason::Stop));
        assert!(!board.signal(&id, InterruptReason::Rollback));

        assert_eq!(signal.triggered().await, InterruptReason::Stop);
        assert_eq!(signal.current(), Some(InterruptReason::Stop));
    }

    #[tokio::test]
    async fn unregistered_experiments_cannot_be_signalled() {
        let board = ControlBoard::new();
        let id = ExperimentId::new("exp-1");
        assert!(!board.signal(&id, InterruptReason::Stop));

        let _signal = board.register(&id);
        board.unregister(&id);
        assert!(!board.is_registered(&id));
        assert!(!board.signal(&id, InterruptReason::Stop));
    }

    #[tokio::test]
    async fn triggered_wakes_a_waiting_task() {
        let board = ControlBoard::new();
        let id = ExperimentId::new("exp-1");
        let mut signal = board.register(&id);

        let waiter = tokio::spawn(async move { signal.triggered().await });
        tokio::task::yield_now().await;
        board.signal(&id, InterruptReason::Shutdown);

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter task");
        assert_eq!(reason, InterruptReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_channel_never_fires() {
        let board = ControlBoard::new();
        let id = ExperimentId::new("exp-1");
        let mut signal = board.register(&id);
        board.unregister(&id);

        let result = tokio::time::timeout(Duration::from_secs(5), signal.triggered()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn signal_all_counts_deliveries() {
        let board = ControlBoard::new();
        let _a = board.register(&ExperimentId::new("a"));
        let _b = board.register(&ExperimentId::new("b"));
        board.signal(&ExperimentId::new("a"), InterruptReason::Stop);

        assert_eq!(board.signal_all(InterruptReason::Shutdown), 1);
        assert_eq!(board.registered().len(), 2);
    }
}
