//! Node agent for the `br` backup/restore tool.
//!
//! Runs beside a meta or storage service and exposes the snapshot and restore
//! control endpoints the orchestrator drives. Checkpoints are pushed to and
//! pulled from the backup backend by the node itself.

pub mod api;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod node;
pub mod protocol;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use node::NodeController;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
