//! Utility modules for the node agent.

pub mod errors;
pub mod logger;

pub use errors::{AgentError, Result};
