//! Lifecycle event broadcast (JSON lines).
//!
//! In-process stand-in for a pub/sub channel: subscribers such as a log
//! tailer or a future API layer receive every lifecycle event as one JSON
//! object per line.

use chaos_common::{ExperimentId, ExperimentKind, ExperimentStatus};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl EventBus {
    /// Buffer is clamped to at least `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(DEFAULT_BUFFER));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                // No subscribers is not an error.
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize event {}: {}", event, err),
        }
    }

    /// `experiment_<status>` event for a status change.
    pub fn emit_status(&self, id: &ExperimentId, kind: ExperimentKind, status: ExperimentStatus) {
        let event = format!("experiment_{}", status.as_str().to_ascii_lowercase());
        self.emit(
            &event,
            &json!({ "experiment_id": id, "kind": kind, "status": status }),
        );
    }
}
