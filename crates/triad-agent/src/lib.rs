//! `triad-agent` drives the claude, codex and gemini CLIs for triad.
//!
//! # Architecture
//!
//! ```text
//! invoke()            ← spawns the agent CLI with its model flags, bounded
//!     │                 by a timeout; kill_on_drop reaps it on cancel
//!     ▼
//! Envelope            ← uniform result: status, decision, confidence,
//!     │                 reasoning excerpt, trace id
//!     ├──▶ ConsensusVerifier   asks every non-implementer, records votes
//!     │                        in the consensus database and evaluates
//!     └──▶ run_worker          claims queued tasks and executes them,
//!                              heartbeating into the worker registry
//!
//! Conversation        ← multi-turn gemini runs: history quoted into each
//!                       prompt, `--resume` with the CLI's session id
//! ```
//!
//! Everything durable (queue, registry, events, consensus sessions) lives in
//! `triad-core`; this crate only adds the subprocess side.

pub mod conversation;
pub mod decision;
pub mod envelope;
pub mod error;
pub mod process;
pub mod verifier;
pub mod worker;

pub use conversation::{Conversation, ConversationStore};
pub use decision::{confidence, extract_decision};
pub use envelope::{Envelope, EnvelopeStatus};
pub use error::AgentError;
pub use process::{invoke, invoke_args, Invocation};
pub use verifier::{CliDelegate, ConsensusVerifier, Delegate, Verification};
pub use worker::{run_worker, WorkerOptions, WorkerSummary};

pub type Result<T> = std::result::Result<T, AgentError>;
