#![doc = "bucket-mirror-core: core logic library for bucket-mirror."]

//! Configuration, the sync primitive contract and its AWS CLI implementation,
//! the sync coordinator, the status record, log sinks and scheduler
//! registration. The CLI crate only wires these together.

pub mod aws_cli;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod disk;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod status;

pub use config::{load_configuration, SyncConfiguration};
pub use coordinator::{RunOptions, RunRecord, SyncCoordinator};
