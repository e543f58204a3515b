use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use triad_core::config::{Config, QueueConfig};
use triad_core::event::kinds;
use triad_core::event_store::EventStore;
use triad_core::io::atomic_write;
use triad_core::paths;
use triad_core::queue::{QueueDb, Task};
use triad_core::types::Agent;
use triad_core::worker::{WorkerRecord, WorkerRegistry, WorkerState};
use triad_core::TriadError;

use crate::process::invoke;
use crate::{AgentError, Result};

// ─── Options ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub root: PathBuf,
    /// Reuse a record created by the supervisor; generated when `None`.
    pub worker_id: Option<String>,
    pub agent: Agent,
    /// Process at most one task, then exit.
    pub once: bool,
    /// Exit as soon as the queue has nothing ready instead of polling.
    pub drain: bool,
    /// Overrides `supervisor.task_timeout_secs`.
    pub task_timeout: Option<Duration>,
}

impl WorkerOptions {
    pub fn new(root: impl Into<PathBuf>, agent: Agent) -> Self {
        Self {
            root: root.into(),
            worker_id: None,
            agent,
            once: false,
            drain: false,
            task_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub completed: u64,
    pub failed: u64,
    pub interrupted: bool,
}

enum Outcome {
    Completed,
    Failed,
    Interrupted,
}

// ─── Store access ─────────────────────────────────────────────────────────

/// Handles to the on-disk stores a worker touches. All of them block on
/// SQLite or flock, so every call goes through [`Stores::run`].
#[derive(Debug, Clone)]
struct Stores {
    id: String,
    registry: WorkerRegistry,
    events: EventStore,
    queue_path: PathBuf,
    queue_config: QueueConfig,
}

impl Stores {
    /// Run `f` on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Stores) -> Result<T> + Send + 'static,
    {
        let stores = self.clone();
        tokio::task::spawn_blocking(move || f(&stores)).await?
    }

    fn queue(&self) -> Result<QueueDb> {
        Ok(QueueDb::open(&self.queue_path, &self.queue_config)?)
    }

    fn emit(&self, kind: &str, payload: serde_json::Value) -> Result<()> {
        self.events.append(kind, payload, Some(self.id.clone()))?;
        Ok(())
    }
}

// ─── Worker loop ──────────────────────────────────────────────────────────

/// Register, then claim and execute queued tasks through the agent CLI
/// until told to stop.
///
/// Stops on ctrl-c, when the registry record is set to Stopping, after one
/// task with `once`, or when the queue runs dry with `drain`. The record is
/// left in the Exited state for the supervisor to clear.
pub async fn run_worker(options: WorkerOptions) -> Result<WorkerSummary> {
    let root = options.root.clone();
    let config = Config::load(&root)?;
    let id = options.worker_id.clone().unwrap_or_else(|| {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("w-{}", &suffix[..8])
    });
    let stores = Stores {
        id: id.clone(),
        registry: WorkerRegistry::new(&root, config.locks.default_timeout()),
        events: EventStore::open(&root, &config),
        queue_path: paths::queue_db_path(&root),
        queue_config: config.queue.clone(),
    };

    let agent = options.agent;
    stores
        .run(move |s| {
            register(&s.registry, &s.id, agent)?;
            s.emit(
                kinds::WORKER_REGISTERED,
                json!({ "worker_id": s.id, "pid": std::process::id(), "agent": agent }),
            )
        })
        .await?;
    info!(worker = %id, %agent, "worker started");

    let heartbeat = spawn_heartbeat(stores.clone(), config.supervisor.heartbeat_interval());
    let result = work(&options, &config, &stores).await;
    heartbeat.abort();

    // Always leave a terminal record, even when the loop failed.
    let exited = stores
        .run(|s| Ok(s.registry.set_state(&s.id, WorkerState::Exited)?))
        .await;
    if let Err(e) = exited {
        warn!(worker = %id, error = %e, "could not mark worker exited");
    }
    let summary = result?;
    let payload = json!({
        "worker_id": id,
        "completed": summary.completed,
        "failed": summary.failed,
        "interrupted": summary.interrupted,
    });
    stores.run(move |s| s.emit(kinds::WORKER_EXITED, payload)).await?;
    info!(worker = %id, completed = summary.completed, failed = summary.failed, "worker exited");
    Ok(summary)
}

fn register(registry: &WorkerRegistry, id: &str, agent: Agent) -> Result<WorkerRecord> {
    let pid = std::process::id();
    let adopt = |r: &mut WorkerRecord| {
        r.pid = pid;
        r.agent = Some(agent);
        r.state = WorkerState::Idle;
    };
    match registry.get(id) {
        Ok(_) => Ok(registry.update(id, adopt)?),
        Err(TriadError::WorkerNotFound(_)) => {
            let mut record = WorkerRecord::new(id, pid, Some(agent));
            record.state = WorkerState::Idle;
            match registry.register(record) {
                Ok(r) => Ok(r),
                // The supervisor registered us in the meantime.
                Err(TriadError::WorkerExists(_)) => Ok(registry.update(id, adopt)?),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn spawn_heartbeat(stores: Stores, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match stores.run(|s| Ok(s.registry.heartbeat(&s.id)?)).await {
                Ok(_) => debug!(worker = %stores.id, "heartbeat"),
                Err(e) => warn!(worker = %stores.id, error = %e, "heartbeat failed"),
            }
        }
    })
}

async fn work(options: &WorkerOptions, config: &Config, stores: &Stores) -> Result<WorkerSummary> {
    let id = stores.id.as_str();
    let mut summary = WorkerSummary {
        worker_id: id.to_string(),
        ..WorkerSummary::default()
    };

    loop {
        let state = stores.run(|s| Ok(s.registry.get(&s.id)?.state)).await?;
        if state == WorkerState::Stopping {
            info!(worker = %id, "stop requested");
            break;
        }

        let claimed = stores.run(|s| Ok(s.queue()?.claim_next(&s.id)?)).await?;
        let Some(task) = claimed else {
            if options.once || options.drain {
                break;
            }
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(config.supervisor.poll_interval()) => false,
                _ = tokio::signal::ctrl_c() => true,
            };
            if interrupted {
                summary.interrupted = true;
                break;
            }
            continue;
        };

        match execute(options, config, stores, task).await? {
            Outcome::Completed => summary.completed += 1,
            Outcome::Failed => summary.failed += 1,
            Outcome::Interrupted => {
                summary.interrupted = true;
                break;
            }
        }
        if options.once {
            break;
        }
    }
    Ok(summary)
}

async fn execute(
    options: &WorkerOptions,
    config: &Config,
    stores: &Stores,
    task: Task,
) -> Result<Outcome> {
    let id = stores.id.as_str();
    let task_id = task.task_id.clone();
    let started = json!({ "task_id": task.task_id, "worker_id": id, "priority": task.priority });
    let tid = task_id.clone();
    stores
        .run(move |s| {
            s.registry.assign(&s.id, &tid)?;
            s.emit(kinds::TASK_STARTED, started)
        })
        .await?;
    info!(worker = %id, task = %task_id, "executing task");

    let command = config.consensus.command_for(options.agent);
    let timeout = options
        .task_timeout
        .unwrap_or_else(|| config.supervisor.task_timeout());
    let run = invoke(
        options.agent,
        &command,
        &task.description,
        timeout,
        Some(&options.root),
    );

    let result = tokio::select! {
        res = run => res,
        _ = tokio::signal::ctrl_c() => {
            let tid = task_id.clone();
            stores
                .run(move |s| {
                    let reason = "worker interrupted";
                    s.queue()?.requeue(&tid, Some(s.id.as_str()), reason)?;
                    s.registry.release(&s.id, false)?;
                    s.emit(
                        kinds::TASK_REQUEUED,
                        json!({ "task_id": tid, "worker_id": s.id, "reason": reason }),
                    )
                })
                .await?;
            return Ok(Outcome::Interrupted);
        }
    };

    let (success, output, error) = match result {
        Ok(inv) => {
            let error = (!inv.success()).then(|| match inv.exit_code {
                Some(code) => format!("exited with code {code}"),
                None => "terminated by signal".to_string(),
            });
            (inv.success(), inv.output, error)
        }
        Err(
            e @ (AgentError::Timeout { .. }
            | AgentError::NotFound { .. }
            | AgentError::Process { .. }
            | AgentError::Io(_)),
        ) => (false, String::new(), Some(e.to_string())),
        Err(e) => return Err(e),
    };

    let root = options.root.clone();
    let finished = json!({ "task_id": task_id, "worker_id": id, "error": error });
    let tid = task_id.clone();
    stores
        .run(move |s| {
            save_output(&root, &tid, &output)?;
            s.queue()?.complete(&tid, Some(s.id.as_str()), success)?;
            s.registry.release(&s.id, success)?;
            let kind = if success {
                kinds::TASK_COMPLETED
            } else {
                kinds::TASK_FAILED
            };
            s.emit(kind, finished)
        })
        .await?;

    match &error {
        None => info!(worker = %id, task = %task_id, "task completed"),
        Some(e) => warn!(worker = %id, task = %task_id, error = %e, "task failed"),
    }
    Ok(if success {
        Outcome::Completed
    } else {
        Outcome::Failed
    })
}

/// Keep the agent's output at `.triad/state/executions/<task>.log`.
fn save_output(root: &Path, task_id: &str, output: &str) -> Result<()> {
    let path = paths::triad_dir(root)
        .join("state")
        .join("executions")
        .join(format!("{task_id}.log"));
    atomic_write(&path, output.as_bytes())?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use triad_core::config::AgentCommand;
    use triad_core::queue::NewTask;
    use triad_core::types::{Priority, TaskStatus};

    fn project(script_body: &str) -> (TempDir, Config) {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("agent.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = Config::new("demo");
        cfg.consensus.agents.insert(
            Agent::Codex,
            AgentCommand {
                executable: script.to_string_lossy().into_owned(),
                model: "m".into(),
            },
        );
        cfg.save(dir.path()).unwrap();
        (dir, cfg)
    }

    fn add_task(dir: &TempDir, cfg: &Config, desc: &str) -> String {
        let q = QueueDb::open(&paths::queue_db_path(dir.path()), &cfg.queue).unwrap();
        q.add(NewTask::new(desc, Priority::P1)).unwrap().task_id
    }

    #[tokio::test]
    async fn once_completes_one_task() {
        let (dir, cfg) = project("echo done");
        let first = add_task(&dir, &cfg, "first");
        let second = add_task(&dir, &cfg, "second");

        let mut opts = WorkerOptions::new(dir.path(), Agent::Codex);
        opts.once = true;
        opts.worker_id = Some("w-test".into());
        let summary = run_worker(opts).await.unwrap();
        assert_eq!(summary.completed, 1);

        let q = QueueDb::open(&paths::queue_db_path(dir.path()), &cfg.queue).unwrap();
        let done = q.get(&first).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.assigned_agent.as_deref(), Some("w-test"));
        assert_eq!(q.get(&second).unwrap().status, TaskStatus::Pending);

        let registry = WorkerRegistry::new(dir.path(), Duration::from_secs(5));
        let record = registry.get("w-test").unwrap();
        assert_eq!(record.state, WorkerState::Exited);
        assert_eq!(record.tasks_completed, 1);

        let log = paths::triad_dir(dir.path()).join("state/executions").join(format!("{first}.log"));
        assert_eq!(std::fs::read_to_string(log).unwrap(), "done");

        let events = EventStore::open(dir.path(), &cfg);
        assert_eq!(events.filter(kinds::TASK_STARTED).unwrap().len(), 1);
        assert_eq!(events.filter(kinds::TASK_COMPLETED).unwrap().len(), 1);
        assert_eq!(events.filter(kinds::WORKER_EXITED).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drain_processes_queue_and_records_failures() {
        let (dir, cfg) = project("echo broken >&2\nexit 3");
        add_task(&dir, &cfg, "a");
        add_task(&dir, &cfg, "b");

        let mut opts = WorkerOptions::new(dir.path(), Agent::Codex);
        opts.drain = true;
        let summary = run_worker(opts).await.unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.completed, 0);

        let events = EventStore::open(dir.path(), &cfg);
        let failed = events.filter(kinds::TASK_FAILED).unwrap();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].payload_str("error"), Some("exited with code 3"));
    }

    #[tokio::test]
    async fn unlaunchable_agent_fails_task() {
        let (dir, mut cfg) = project("echo unused");
        let broken = dir.path().join("broken.sh");
        std::fs::write(&broken, "#!/nonexistent/interpreter\n").unwrap();
        std::fs::set_permissions(&broken, std::fs::Permissions::from_mode(0o755)).unwrap();
        cfg.consensus.agents.insert(
            Agent::Codex,
            AgentCommand {
                executable: broken.to_string_lossy().into_owned(),
                model: "m".into(),
            },
        );
        cfg.save(dir.path()).unwrap();
        let id = add_task(&dir, &cfg, "a");

        let mut opts = WorkerOptions::new(dir.path(), Agent::Codex);
        opts.once = true;
        let summary = run_worker(opts).await.unwrap();
        assert_eq!(summary.failed, 1);

        let q = QueueDb::open(&paths::queue_db_path(dir.path()), &cfg.queue).unwrap();
        assert_eq!(q.get(&id).unwrap().status, TaskStatus::Failed);
        let events = EventStore::open(dir.path(), &cfg);
        let failed = events.filter(kinds::TASK_FAILED).unwrap();
        assert!(failed[0]
            .payload_str("error")
            .is_some_and(|e| e.starts_with("failed to start codex")));
    }

    #[tokio::test]
    async fn adopts_supervisor_record() {
        let (dir, cfg) = project("echo ok");
        let registry = WorkerRegistry::new(dir.path(), cfg.locks.default_timeout());
        registry.register(WorkerRecord::new("w-sup", 1, None)).unwrap();

        let mut opts = WorkerOptions::new(dir.path(), Agent::Codex);
        opts.worker_id = Some("w-sup".into());
        opts.drain = true;
        run_worker(opts).await.unwrap();

        let record = registry.get("w-sup").unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.agent, Some(Agent::Codex));
        assert_eq!(record.state, WorkerState::Exited);
    }

    #[tokio::test]
    async fn requires_init() {
        let dir = TempDir::new().unwrap();
        let err = run_worker(WorkerOptions::new(dir.path(), Agent::Claude))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Core(TriadError::NotInitialized)));
    }
}
