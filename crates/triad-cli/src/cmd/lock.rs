use crate::output::{fmt_opt_time, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use triad_core::config::Config;
use triad_core::lock::{LockManager, LockStatus};

#[derive(Subcommand)]
pub enum LockSubcommand {
    /// Run a command while holding a named lock
    Acquire {
        name: String,
        /// Seconds to wait for the lock (default: locks.default_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
        /// Command and arguments to run under the lock
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Show whether a lock is held and by whom
    Status { name: String },

    /// List every known lock
    List,
}

pub fn run(root: &Path, subcmd: LockSubcommand, json: bool) -> anyhow::Result<()> {
    let locks = LockManager::for_root(root);
    match subcmd {
        LockSubcommand::Acquire {
            name,
            timeout,
            command,
        } => {
            let timeout = match timeout {
                Some(secs) => Duration::from_secs(secs),
                None => Config::load_or_default(root)?.locks.default_timeout(),
            };
            acquire(&locks, &name, timeout, &command)
        }
        LockSubcommand::Status { name } => {
            let status = locks.status(&name)?;
            if json {
                print_json(&status)
            } else {
                print_rows(&[status]);
                Ok(())
            }
        }
        LockSubcommand::List => {
            let all = locks.list()?;
            if json {
                print_json(&all)
            } else if all.is_empty() {
                println!("No locks.");
                Ok(())
            } else {
                print_rows(&all);
                Ok(())
            }
        }
    }
}

fn acquire(
    locks: &LockManager,
    name: &str,
    timeout: Duration,
    command: &[String],
) -> anyhow::Result<()> {
    let (program, args) = command
        .split_first()
        .context("no command given to run under the lock")?;
    let guard = locks.acquire(name, timeout)?;
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run '{program}'"))?;
    drop(guard);
    if !status.success() {
        anyhow::bail!("'{program}' exited with {status}");
    }
    Ok(())
}

fn print_rows(statuses: &[LockStatus]) {
    let rows = statuses
        .iter()
        .map(|s| {
            vec![
                s.name.clone(),
                if s.locked { "held" } else { "free" }.to_string(),
                s.holder
                    .as_ref()
                    .map(|h| h.pid.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                fmt_opt_time(s.holder.as_ref().map(|h| &h.acquired_at)),
            ]
        })
        .collect();
    print_table(&["NAME", "STATE", "PID", "SINCE"], rows);
}
