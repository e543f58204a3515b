use std::time::Duration;

use thiserror::Error;
use triad_core::types::Agent;
use triad_core::TriadError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{agent} CLI not found: '{executable}' is not on PATH")]
    NotFound { agent: Agent, executable: String },

    #[error("{agent} timed out after {after:?}")]
    Timeout { agent: Agent, after: Duration },

    #[error("failed to start {agent}: {source}")]
    Process {
        agent: Agent,
        #[source]
        source: std::io::Error,
    },

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Core(#[from] TriadError),
}
