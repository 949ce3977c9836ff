//! Pipeline state machine.

use std::fmt;

use flarewrap_common::{FlarewrapError, FlarewrapResult, RunId};
use serde::{Deserialize, Serialize};

use crate::runtime::{EventBus, PipelineEvent};

/// A non-terminal pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Nothing acquired yet.
    Idle,
    /// Connecting to the content store and pulling the image.
    Pulling,
    /// Creating the snapshot.
    SnapshotReady,
    /// Mounting the snapshot.
    Mounted,
    /// Building the block image and copying into it.
    Materializing,
    /// Unmounting, moving the artifact into place, cleaning scratch.
    Finalizing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "checking preconditions"),
            Self::Pulling => write!(f, "pulling"),
            Self::SnapshotReady => write!(f, "preparing snapshot"),
            Self::Mounted => write!(f, "mounting snapshot"),
            Self::Materializing => write!(f, "materializing rootfs"),
            Self::Finalizing => write!(f, "finalizing"),
        }
    }
}

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "state", content = "stage")]
pub enum PipelineState {
    /// Working through a stage.
    Running(Stage),
    /// Finished; the artifact is in place.
    Done,
    /// Gave up in a stage after unwinding.
    Failed(Stage),
}

impl PipelineState {
    /// Initial state.
    pub const IDLE: Self = Self::Running(Stage::Idle);

    /// The stage the run is in or failed in.
    #[must_use]
    pub const fn stage(self) -> Option<Stage> {
        match self {
            Self::Running(stage) | Self::Failed(stage) => Some(stage),
            Self::Done => None,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    /// The only state a successful step may lead to.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Running(Stage::Idle) => Some(Self::Running(Stage::Pulling)),
            Self::Running(Stage::Pulling) => Some(Self::Running(Stage::SnapshotReady)),
            Self::Running(Stage::SnapshotReady) => Some(Self::Running(Stage::Mounted)),
            Self::Running(Stage::Mounted) => Some(Self::Running(Stage::Materializing)),
            Self::Running(Stage::Materializing) => Some(Self::Running(Stage::Finalizing)),
            Self::Running(Stage::Finalizing) => Some(Self::Done),
            Self::Done | Self::Failed(_) => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running(stage) => write!(f, "{stage}"),
            Self::Done => write!(f, "done"),
            Self::Failed(stage) => write!(f, "failed while {stage}"),
        }
    }
}

/// Drives one run through [`PipelineState`] and announces every move.
#[derive(Debug)]
pub(crate) struct StateTracker {
    state: PipelineState,
    machine: String,
    run_id: RunId,
    events: EventBus,
}

impl StateTracker {
    pub(crate) fn new(machine: &str, run_id: RunId, events: EventBus) -> Self {
        Self {
            state: PipelineState::IDLE,
            machine: machine.to_string(),
            run_id,
            events,
        }
    }

    pub(crate) const fn state(&self) -> PipelineState {
        self.state
    }

    /// Current stage; `Finalizing` once done.
    pub(crate) fn stage(&self) -> Stage {
        self.state.stage().unwrap_or(Stage::Finalizing)
    }

    /// Move to `to`, which must be the successor of the current state.
    pub(crate) fn advance(&mut self, to: PipelineState) -> FlarewrapResult<()> {
        if self.state.next() != Some(to) {
            return Err(FlarewrapError::Internal {
                message: format!("invalid pipeline transition {} -> {}", self.state, to),
            });
        }
        self.enter(to);
        Ok(())
    }

    /// Absorb into `Failed` at the current stage.
    pub(crate) fn fail(&mut self) -> Stage {
        let stage = self.stage();
        self.enter(PipelineState::Failed(stage));
        stage
    }

    fn enter(&mut self, to: PipelineState) {
        tracing::info!(machine = %self.machine, run_id = %self.run_id, state = %to, "Pipeline state changed");
        self.state = to;
        self.events.publish(PipelineEvent::StateChanged {
            machine: self.machine.clone(),
            run_id: self.run_id.to_string(),
            state: to,
            timestamp: chrono::Utc::now().timestamp(),
        });
    }
}
