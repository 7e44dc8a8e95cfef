//! `br`: cluster backup and restore orchestrator.
//!
//! Drives the node agents of a meta/storage cluster through a coordinated
//! snapshot, has every node push its checkpoint to a backup backend, publishes
//! a manifest, and restores a published backup onto a cluster.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod manifest;
pub mod registry;
pub mod settings;

pub use br_agent::transport;

#[cfg(test)]
mod testing;

pub use config::{BackupConfig, NodeInfo, RestoreConfig};
pub use coordinator::{cleanup_backup, MappingPolicy, RestoreCoordinator, SnapshotCoordinator};
pub use error::{BrError, Result};
pub use manifest::BackupManifest;
pub use settings::Settings;
