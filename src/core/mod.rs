// Infrastructure shared by the graph, resilience and agent layers

pub mod config;
pub mod errors;

pub use config::{AgentConfig, ExecutionDefaults, RunbookConfig};
pub use errors::{Result, RunbookError};
