//! Rootfs pipeline: the state machine, the per-machine lock and the
//! orchestration that turns an image into a rootfs artifact.

mod lock;
mod rootfs;
mod state;

pub use lock::MachineLock;
pub use rootfs::{PipelineError, RootfsArtifact, RootfsPipeline, RunOptions};
pub use state::{PipelineState, Stage};
