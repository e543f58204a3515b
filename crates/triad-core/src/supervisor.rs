//! Supervision of worker processes: health snapshots, recovery sweeps and
//! spawning within the configured worker limit.

use crate::config::Config;
use crate::error::{Result, TriadError};
use crate::event::kinds;
use crate::event_store::EventStore;
use crate::io::atomic_write;
use crate::paths;
use crate::queue::QueueDb;
use crate::types::{Agent, TaskStatus};
use crate::worker::{
    assess, HealthPolicy, ProcessProbe, SystemProbe, WorkerHealth, WorkerRecord, WorkerRegistry,
    WorkerState,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};

const SOURCE: &str = "supervisor";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub record: WorkerRecord,
    pub health: WorkerHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorState {
    pub pid: u32,
    pub generated_at: DateTime<Utc>,
    pub max_workers: usize,
    pub workers: Vec<WorkerStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unreadable: Vec<PathBuf>,
    pub queue_depth: u64,
}

impl SupervisorState {
    pub fn live_workers(&self) -> usize {
        self.workers.iter().filter(|w| is_live(w)).count()
    }
}

fn is_live(w: &WorkerStatus) -> bool {
    !matches!(w.health, WorkerHealth::Dead | WorkerHealth::Exited)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Requeued,
    Failed,
    /// The task was gone or no longer running.
    Missing,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recovery {
    pub worker_id: String,
    pub pid: u32,
    pub health: WorkerHealth,
    pub task: Option<String>,
    pub task_outcome: Option<TaskOutcome>,
    pub terminated: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub recovered: Vec<Recovery>,
    /// Records of cleanly exited workers that were cleared.
    pub removed: Vec<String>,
    /// Running tasks no worker claims, returned to the queue after the task
    /// timeout.
    pub orphans: Vec<String>,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor<P = SystemProbe> {
    root: PathBuf,
    config: Config,
    registry: WorkerRegistry,
    events: EventStore,
    probe: P,
    /// Children spawned by this process, kept so they can be reaped.
    children: Mutex<HashMap<u32, Child>>,
}

impl Supervisor {
    pub fn new(root: &Path, config: &Config) -> Self {
        Self::with_probe(root, config, SystemProbe)
    }
}

impl<P: ProcessProbe> Supervisor<P> {
    pub fn with_probe(root: &Path, config: &Config, probe: P) -> Self {
        Self {
            root: root.to_path_buf(),
            config: config.clone(),
            registry: WorkerRegistry::new(root, config.locks.default_timeout()),
            events: EventStore::open(root, config),
            probe,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    fn policy(&self) -> HealthPolicy {
        HealthPolicy::from(&self.config.supervisor)
    }

    fn open_queue(&self) -> Result<QueueDb> {
        QueueDb::open(&paths::queue_db_path(&self.root), &self.config.queue)
    }

    fn queue_depth(&self) -> Result<u64> {
        if !paths::queue_db_path(&self.root).exists() {
            return Ok(0);
        }
        self.open_queue()?.depth()
    }

    pub fn snapshot(&self) -> Result<SupervisorState> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Result<SupervisorState> {
        let policy = self.policy();
        let (records, unreadable) = self.registry.list()?;
        let workers = records
            .into_iter()
            .map(|record| {
                let health = assess(&record, now, &policy, &self.probe);
                WorkerStatus { record, health }
            })
            .collect();
        Ok(SupervisorState {
            pid: std::process::id(),
            generated_at: now,
            max_workers: self.config.supervisor.max_workers,
            workers,
            unreadable,
            queue_depth: self.queue_depth()?,
        })
    }

    /// Snapshot and persist to `.triad/state/supervisor.json`.
    pub fn write_state(&self) -> Result<SupervisorState> {
        let state = self.snapshot()?;
        let data = serde_json::to_vec_pretty(&state)?;
        atomic_write(&paths::supervisor_state_path(&self.root), &data)?;
        Ok(state)
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now())
    }

    /// Recover every unhealthy worker and return orphaned tasks to the queue.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        self.reap_children();
        let state = self.snapshot_at(now)?;
        let mut report = SweepReport {
            checked: state.workers.len(),
            ..SweepReport::default()
        };
        let mut queue: Option<QueueDb> = None;
        let mut claimed: HashSet<String> = HashSet::new();

        for WorkerStatus { record, health } in state.workers {
            match health {
                WorkerHealth::Healthy => {
                    if let Some(task) = record.current_task {
                        claimed.insert(task);
                    }
                }
                WorkerHealth::Exited => {
                    self.forget(&record.id)?;
                    debug!(worker = %record.id, "cleared exited worker");
                    report.removed.push(record.id);
                }
                _ => {
                    let recovery = self.recover(&record, health, &mut queue)?;
                    report.recovered.push(recovery);
                }
            }
        }

        report.orphans = self.requeue_orphans(now, &claimed, &mut queue)?;
        Ok(report)
    }

    fn recover(
        &self,
        record: &WorkerRecord,
        health: WorkerHealth,
        queue: &mut Option<QueueDb>,
    ) -> Result<Recovery> {
        let reason = format!("worker {} {health}", record.id);
        let task_outcome = match &record.current_task {
            Some(task_id) => {
                let owner = Some(record.id.as_str());
                Some(self.requeue_task(task_id, &reason, &record.id, owner, queue)?)
            }
            None => None,
        };

        let mut terminated = false;
        if self.config.supervisor.kill_unhealthy && self.probe.is_alive(record.pid) {
            match self.probe.terminate(record.pid) {
                Ok(()) => terminated = true,
                Err(e) => warn!(worker = %record.id, pid = record.pid, error = %e, "terminate failed"),
            }
        }

        self.forget(&record.id)?;
        self.events.append(
            kinds::WORKER_RECOVERED,
            json!({
                "worker_id": record.id,
                "pid": record.pid,
                "health": health,
                "task_id": record.current_task,
                "task_outcome": task_outcome,
                "terminated": terminated,
            }),
            Some(SOURCE.to_string()),
        )?;
        info!(worker = %record.id, %health, terminated, "recovered worker");

        Ok(Recovery {
            worker_id: record.id.clone(),
            pid: record.pid,
            health,
            task: record.current_task.clone(),
            task_outcome,
            terminated,
        })
    }

    fn requeue_task(
        &self,
        task_id: &str,
        reason: &str,
        worker_id: &str,
        owner: Option<&str>,
        queue: &mut Option<QueueDb>,
    ) -> Result<TaskOutcome> {
        let db = match queue {
            Some(db) => db,
            None => queue.insert(self.open_queue()?),
        };
        let task = match db.requeue(task_id, owner, reason) {
            Ok(task) => task,
            Err(
                TriadError::TaskNotFound(_)
                | TriadError::InvalidTaskState { .. }
                | TriadError::TaskNotOwned { .. },
            ) => {
                warn!(task = task_id, worker = worker_id, "task no longer held by worker, nothing to requeue");
                return Ok(TaskOutcome::Missing);
            }
            Err(e) => return Err(e),
        };
        let outcome = if task.status == TaskStatus::Pending {
            TaskOutcome::Requeued
        } else {
            TaskOutcome::Failed
        };
        let kind = match outcome {
            TaskOutcome::Requeued => kinds::TASK_REQUEUED,
            _ => kinds::TASK_FAILED,
        };
        self.events.append(
            kind,
            json!({
                "task_id": task_id,
                "worker_id": worker_id,
                "reason": reason,
                "retry_count": task.retry_count,
            }),
            Some(SOURCE.to_string()),
        )?;
        Ok(outcome)
    }

    fn requeue_orphans(
        &self,
        now: DateTime<Utc>,
        claimed: &HashSet<String>,
        queue: &mut Option<QueueDb>,
    ) -> Result<Vec<String>> {
        if queue.is_none() && !paths::queue_db_path(&self.root).exists() {
            return Ok(Vec::new());
        }
        let db = match queue {
            Some(db) => db,
            None => queue.insert(self.open_queue()?),
        };
        let timeout = chrono::Duration::from_std(self.config.supervisor.task_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let running = db.list(Some(TaskStatus::Running), None, 10_000)?;

        let mut orphans = Vec::new();
        for task in running {
            if claimed.contains(&task.task_id) {
                continue;
            }
            let started = task.started_at.unwrap_or(task.updated_at);
            if now.signed_duration_since(started) <= timeout {
                continue;
            }
            let owner = task.assigned_agent.as_deref();
            let outcome = self.requeue_task(&task.task_id, "orphaned", SOURCE, owner, queue)?;
            if outcome != TaskOutcome::Missing {
                orphans.push(task.task_id);
            }
        }
        Ok(orphans)
    }

    fn forget(&self, id: &str) -> Result<()> {
        match self.registry.remove(id) {
            Ok(()) | Err(TriadError::WorkerNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Collect exit statuses of children that have finished.
    fn reap_children(&self) {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children.retain(|pid, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid, %status, "reaped worker process");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid, error = %e, "could not poll worker process");
                false
            }
        });
    }

    /// Start `program` as a worker. Its id and the project root are passed
    /// as `TRIAD_WORKER_ID` and `TRIAD_ROOT`; output goes to
    /// `.triad/state/<id>.log`.
    pub fn spawn_worker(
        &self,
        program: &str,
        args: &[String],
        agent: Option<Agent>,
    ) -> Result<WorkerRecord> {
        self.reap_children();
        let max = self.config.supervisor.max_workers;
        let live = self.snapshot()?.live_workers();
        if live >= max {
            return Err(TriadError::WorkerLimit { live, max });
        }

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("w-{}", &suffix[..8]);
        let log_path = self.root.join(paths::STATE_DIR).join(format!("{id}.log"));
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::File::create(&log_path)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.root)
            .env("TRIAD_ROOT", &self.root)
            .env("TRIAD_WORKER_ID", &id)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        if let Some(agent) = agent {
            cmd.env("TRIAD_AGENT", agent.as_str());
        }
        let child = cmd.spawn()?;
        let pid = child.id();
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid, child);

        // The worker may have registered itself already.
        let record = match self.registry.register(WorkerRecord::new(&id, pid, agent)) {
            Ok(r) => r,
            Err(TriadError::WorkerExists(_)) => self.registry.update(&id, |r| r.pid = pid)?,
            Err(e) => return Err(e),
        };
        self.events.append(
            kinds::WORKER_SPAWNED,
            json!({
                "worker_id": id,
                "pid": pid,
                "program": program,
                "args": args,
                "agent": agent,
            }),
            Some(SOURCE.to_string()),
        )?;
        info!(worker = %id, pid, program, "spawned worker");
        Ok(record)
    }

    /// Ask every live worker to stop by marking it Stopping.
    pub fn request_stop(&self) -> Result<Vec<String>> {
        let (records, _) = self.registry.list()?;
        let mut stopped = Vec::new();
        for r in records {
            if matches!(r.state, WorkerState::Exited | WorkerState::Stopping) {
                continue;
            }
            self.registry.set_state(&r.id, WorkerState::Stopping)?;
            stopped.push(r.id);
        }
        Ok(stopped)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
