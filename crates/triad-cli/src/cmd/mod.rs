pub mod config;
pub mod consensus;
pub mod delegate;
pub mod event;
pub mod init;
pub mod lock;
pub mod projection;
pub mod queue;
pub mod rag;
pub mod session;
pub mod supervisor;
pub mod worker;

use anyhow::Context;
use std::path::Path;
use triad_core::config::Config;

/// Load config for commands that need an initialized project.
pub(crate) fn load_config(root: &Path) -> anyhow::Result<Config> {
    Config::load(root).with_context(|| format!("failed to load config under {}", root.display()))
}
