//! Toolkit runtime: configuration, machines, events and the facade.

mod app;
mod config;
pub mod events;
mod machine;
mod state;

pub use app::Flarewrap;
pub use config::{FlarewrapConfig, Strategy};
pub use events::{EventBus, PipelineEvent};
pub use machine::{Machine, StorageType};
pub use state::{MachineRecord, MachineStore};
