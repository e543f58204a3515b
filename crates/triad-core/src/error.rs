use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriadError {
    #[error("not initialized: run 'triad init'")]
    NotInitialized,

    #[error("invalid name '{0}': must be 1-64 chars of lowercase alphanumerics, '.', '_' or '-'")]
    InvalidName(String),

    #[error("timed out after {waited:?} waiting for lock '{name}'")]
    LockTimeout { name: String, waited: Duration },

    #[error("file locks are not supported on this platform")]
    LockUnsupported,

    #[error("event of {size} bytes exceeds the {limit} byte limit")]
    EventTooLarge { size: usize, limit: usize },

    #[error("invalid event type '{0}'")]
    InvalidEventType(String),

    #[error("unknown projection: {0}")]
    UnknownProjection(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("worker id '{id}' is longer than {max} characters")]
    WorkerIdTooLong { id: String, max: usize },

    #[error("worker already registered: {0}")]
    WorkerExists(String),

    #[error("worker limit reached: {live} of {max} workers running")]
    WorkerLimit { live: usize, max: usize },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {id} is {status}, expected {expected}")]
    InvalidTaskState {
        id: String,
        status: String,
        expected: String,
    },

    #[error("task {id} is assigned to {owner}, not {worker}")]
    TaskNotOwned {
        id: String,
        owner: String,
        worker: String,
    },

    #[error("task {id} has used all {max} retries")]
    RetriesExhausted { id: String, max: u32 },

    #[error("context not found: {0}")]
    ContextNotFound(i64),

    #[error("unknown priority: {0}")]
    InvalidPriority(String),

    #[error("unknown task status: {0}")]
    InvalidStatus(String),

    #[error("unknown agent: {0}")]
    InvalidAgent(String),

    #[error("unknown vote: {0}")]
    InvalidVote(String),

    #[error("consensus session not found: {0}")]
    SessionNotFound(String),

    #[error("agent '{0}' cannot vote on its own implementation")]
    SelfVote(String),

    #[error("session file not found for id: {0}")]
    SessionFileNotFound(String),

    #[error("home directory not found: set HOME environment variable")]
    HomeNotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, TriadError>;
