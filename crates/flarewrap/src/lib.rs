//! # Flarewrap
//!
//! Flarewrap turns OCI container images into root filesystems for
//! Firecracker-style microVMs.
//!
//! ## Features
//!
//! - **Rootfs pipeline**: pull, snapshot, mount and copy-out with a full
//!   unwind on every failure path
//! - **Two strategies**: a standalone formatted block image, or the
//!   snapshot kept mounted as a live directory
//! - **Host backends**: mount, loop device and mkfs behind traits
//! - **Launch**: boots the result with Firecracker
//!
//! ## Usage
//!
//! ```no_run
//! use flarewrap::pipeline::RunOptions;
//! use flarewrap::runtime::{Flarewrap, FlarewrapConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let app = Flarewrap::new(FlarewrapConfig::default().with_working_dir("./working"))?;
//!
//! let image = app.new_image("docker.io/library/alpine:latest", "alpine")?;
//! let machine = app.new_machine(1, 512, 5120, "default", &image)?;
//!
//! let rootfs = app.start(&machine, RunOptions::default()).await?;
//! println!("rootfs at {}", rootfs.path().display());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod filesystem;
pub mod host;
pub mod launch;
pub mod pipeline;
pub mod runtime;

pub use pipeline::{PipelineError, RootfsArtifact, RootfsPipeline, RunOptions};
pub use runtime::Flarewrap;
