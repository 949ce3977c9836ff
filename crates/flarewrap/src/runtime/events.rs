//! Pipeline event definitions and bus.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::pipeline::PipelineState;

/// Pipeline event types.
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// A run entered a new state.
    StateChanged {
        machine: String,
        run_id: String,
        state: PipelineState,
        timestamp: i64,
    },
    /// A rootfs artifact is in place.
    RootfsReady {
        machine: String,
        path: PathBuf,
        timestamp: i64,
    },
    /// A machine's rootfs was torn down.
    Released { machine: String, timestamp: i64 },
    /// A VM process was spawned.
    Launched { machine: String, pid: u32, timestamp: i64 },
}

/// Event bus for pipeline events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: PipelineEvent) {
        // Ignore SendError (no subscribers)
        let _ = self.sender.send(event);
    }
}
