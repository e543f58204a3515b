use crate::cmd::load_config;
use crate::cmd::worker::print_workers;
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use triad_core::config::Config;
use triad_core::supervisor::{SupervisorState, SweepReport, Supervisor};
use triad_core::types::Agent;
use triad_core::TriadError;

#[derive(Subcommand)]
pub enum SupervisorSubcommand {
    /// Show every worker's health and the queue depth
    Status,

    /// Recover unhealthy workers and orphaned tasks once
    Sweep,

    /// Start worker processes running `triad worker run`
    Spawn {
        /// How many workers to start
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long)]
        agent: Option<Agent>,
    },

    /// Sweep on an interval, keeping a target number of workers alive
    Watch {
        /// Workers to keep running (default: none are spawned)
        #[arg(long, default_value_t = 0)]
        workers: usize,
        #[arg(long)]
        agent: Option<Agent>,
        /// Seconds between sweeps (default: supervisor.heartbeat_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
        /// Mark workers Stopping when the watch ends
        #[arg(long)]
        stop_workers: bool,
    },
}

pub fn run(root: &Path, subcmd: SupervisorSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let supervisor = Supervisor::new(root, &config);
    match subcmd {
        SupervisorSubcommand::Status => status(&supervisor, json),
        SupervisorSubcommand::Sweep => {
            let report = supervisor.sweep().context("sweep failed")?;
            supervisor.write_state()?;
            if json {
                print_json(&report)
            } else {
                print_sweep(&report);
                Ok(())
            }
        }
        SupervisorSubcommand::Spawn { count, agent } => spawn(&supervisor, count, agent, json),
        SupervisorSubcommand::Watch {
            workers,
            agent,
            interval,
            stop_workers,
        } => {
            let every = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.supervisor.heartbeat_interval());
            watch(&supervisor, &config, workers, agent, every, stop_workers)
        }
    }
}

fn status(supervisor: &Supervisor, json: bool) -> anyhow::Result<()> {
    let state = supervisor.write_state()?;
    if json {
        return print_json(&state);
    }
    print_state(&state);
    Ok(())
}

fn print_state(state: &SupervisorState) {
    println!(
        "{} of {} workers live, {} tasks pending",
        state.live_workers(),
        state.max_workers,
        state.queue_depth
    );
    if !state.workers.is_empty() {
        println!();
        print_workers(&state.workers);
    }
    for path in &state.unreadable {
        eprintln!("warning: unreadable worker file {}", path.display());
    }
}

fn print_sweep(report: &SweepReport) {
    println!(
        "Checked {} workers: {} recovered, {} cleared, {} orphaned tasks requeued",
        report.checked,
        report.recovered.len(),
        report.removed.len(),
        report.orphans.len()
    );
    if report.recovered.is_empty() {
        return;
    }
    let rows = report
        .recovered
        .iter()
        .map(|r| {
            vec![
                r.worker_id.clone(),
                r.pid.to_string(),
                r.health.to_string(),
                r.task.clone().unwrap_or_else(|| "-".into()),
                r.task_outcome
                    .map(|o| format!("{o:?}").to_lowercase())
                    .unwrap_or_else(|| "-".into()),
                if r.terminated { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    print_table(&["WORKER", "PID", "HEALTH", "TASK", "TASK OUTCOME", "SIGTERM"], rows);
}

/// Arguments that make a spawned process run the worker loop. Root, id and
/// agent travel through the environment.
fn worker_command() -> anyhow::Result<(String, Vec<String>)> {
    let exe = std::env::current_exe().context("cannot locate the triad executable")?;
    Ok((
        exe.to_string_lossy().into_owned(),
        vec!["worker".to_string(), "run".to_string()],
    ))
}

fn spawn(
    supervisor: &Supervisor,
    count: usize,
    agent: Option<Agent>,
    json: bool,
) -> anyhow::Result<()> {
    let (program, args) = worker_command()?;
    let mut spawned = Vec::new();
    for _ in 0..count {
        let record = supervisor.spawn_worker(&program, &args, agent)?;
        if !json {
            println!("Spawned worker {} (pid {})", record.id, record.pid);
        }
        spawned.push(record);
    }
    if json {
        print_json(&spawned)?;
    }
    Ok(())
}

fn watch(
    supervisor: &Supervisor,
    config: &Config,
    target: usize,
    agent: Option<Agent>,
    every: Duration,
    stop_workers: bool,
) -> anyhow::Result<()> {
    let (program, args) = worker_command()?;
    let target = target.min(config.supervisor.max_workers);
    let rt = tokio::runtime::Runtime::new()?;
    info!(target, ?every, "supervisor watching");

    rt.block_on(async {
        loop {
            match supervisor.sweep() {
                Ok(report) if !report.recovered.is_empty() || !report.orphans.is_empty() => {
                    info!(
                        recovered = report.recovered.len(),
                        orphans = report.orphans.len(),
                        "sweep recovered work"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "sweep failed"),
            }

            let state = supervisor.write_state()?;
            for _ in state.live_workers()..target {
                match supervisor.spawn_worker(&program, &args, agent) {
                    Ok(record) => info!(worker = %record.id, pid = record.pid, "topped up"),
                    Err(TriadError::WorkerLimit { .. }) => break,
                    Err(e) => {
                        warn!(error = %e, "could not spawn worker");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(every) => {}
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        anyhow::Ok(())
    })?;

    if stop_workers {
        let stopped = supervisor.request_stop()?;
        info!(count = stopped.len(), "asked workers to stop");
    }
    info!("supervisor stopped");
    Ok(())
}
