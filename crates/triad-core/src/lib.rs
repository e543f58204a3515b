pub mod config;
pub mod consensus;
mod db;
pub mod error;
pub mod event;
pub mod event_store;
pub mod io;
pub mod lock;
pub mod paths;
pub mod projection;
pub mod queue;
pub mod rag;
pub mod session_trim;
pub mod supervisor;
pub mod types;
pub mod worker;

pub use error::{Result, TriadError};
