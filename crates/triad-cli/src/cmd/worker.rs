use crate::cmd::load_config;
use crate::output::{fmt_time, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use std::time::Duration;
use triad_agent::{run_worker, WorkerOptions};
use triad_core::event::kinds;
use triad_core::event_store::EventStore;
use triad_core::supervisor::{Supervisor, WorkerStatus};
use triad_core::types::Agent;
use triad_core::worker::{WorkerRecord, WorkerRegistry};

#[derive(Subcommand)]
pub enum WorkerSubcommand {
    /// Register a worker record
    Register {
        /// Worker id (default: generated)
        #[arg(long)]
        id: Option<String>,
        /// Process id to track (default: this process)
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long)]
        agent: Option<Agent>,
    },

    /// Refresh a worker's heartbeat
    Heartbeat {
        id: String,
        /// Also record task progress
        #[arg(long)]
        progress: bool,
    },

    /// List workers with their health
    List,

    /// Claim and execute queued tasks until stopped
    Run {
        /// Worker id; reuses a record created by `supervisor spawn`
        #[arg(long, env = "TRIAD_WORKER_ID")]
        id: Option<String>,
        #[arg(long, env = "TRIAD_AGENT", default_value = "claude")]
        agent: Agent,
        /// Execute at most one task
        #[arg(long)]
        once: bool,
        /// Exit when no task is ready instead of polling
        #[arg(long)]
        drain: bool,
        /// Per-task timeout in seconds (default: supervisor.task_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },
}

pub fn run(root: &Path, subcmd: WorkerSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        WorkerSubcommand::Register { id, pid, agent } => register(root, id, pid, agent, json),
        WorkerSubcommand::Heartbeat { id, progress } => heartbeat(root, &id, progress, json),
        WorkerSubcommand::List => list(root, json),
        WorkerSubcommand::Run {
            id,
            agent,
            once,
            drain,
            timeout,
        } => {
            let options = WorkerOptions {
                worker_id: id,
                once,
                drain,
                task_timeout: timeout.map(Duration::from_secs),
                ..WorkerOptions::new(root, agent)
            };
            run_loop(options, json)
        }
    }
}

fn registry(root: &Path) -> anyhow::Result<(WorkerRegistry, EventStore)> {
    let config = load_config(root)?;
    Ok((
        WorkerRegistry::new(root, config.locks.default_timeout()),
        EventStore::open(root, &config),
    ))
}

fn register(
    root: &Path,
    id: Option<String>,
    pid: Option<u32>,
    agent: Option<Agent>,
    json: bool,
) -> anyhow::Result<()> {
    let (registry, events) = registry(root)?;
    let id = id.unwrap_or_else(|| {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("w-{}", &suffix[..8])
    });
    let pid = pid.unwrap_or_else(std::process::id);
    let record = registry
        .register(WorkerRecord::new(&id, pid, agent))
        .with_context(|| format!("failed to register worker '{id}'"))?;
    events.append(
        kinds::WORKER_REGISTERED,
        serde_json::json!({ "worker_id": id, "pid": pid, "agent": agent }),
        Some(id.clone()),
    )?;
    if json {
        print_json(&record)
    } else {
        println!("Registered worker {id} (pid {pid})");
        Ok(())
    }
}

fn heartbeat(root: &Path, id: &str, progress: bool, json: bool) -> anyhow::Result<()> {
    let (registry, _) = registry(root)?;
    let record = if progress {
        registry.progress(id)?
    } else {
        registry.heartbeat(id)?
    };
    if json {
        print_json(&record)
    } else {
        println!("{id}: heartbeat at {}", fmt_time(&record.last_heartbeat));
        Ok(())
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let state = Supervisor::new(root, &config).snapshot()?;
    if json {
        return print_json(&state.workers);
    }
    if state.workers.is_empty() {
        println!("No workers.");
    } else {
        print_workers(&state.workers);
    }
    for path in &state.unreadable {
        eprintln!("warning: unreadable worker file {}", path.display());
    }
    Ok(())
}

pub(crate) fn print_workers(workers: &[WorkerStatus]) {
    let rows = workers
        .iter()
        .map(|w| {
            let r = &w.record;
            vec![
                r.id.clone(),
                r.pid.to_string(),
                r.agent.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
                r.state.to_string(),
                w.health.to_string(),
                r.current_task.clone().unwrap_or_else(|| "-".into()),
                fmt_time(&r.last_heartbeat),
                format!("{}/{}", r.tasks_completed, r.tasks_failed),
            ]
        })
        .collect();
    print_table(
        &["ID", "PID", "AGENT", "STATE", "HEALTH", "TASK", "HEARTBEAT", "DONE/FAILED"],
        rows,
    );
}

fn run_loop(options: WorkerOptions, json: bool) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(run_worker(options))?;
    if json {
        print_json(&summary)
    } else {
        println!(
            "Worker {} finished: {} completed, {} failed{}",
            summary.worker_id,
            summary.completed,
            summary.failed,
            if summary.interrupted { " (interrupted)" } else { "" }
        );
        Ok(())
    }
}
