use crate::config::SupervisorConfig;
use crate::error::{Result, TriadError};
use crate::io;
use crate::lock::LockManager;
use crate::paths;
use crate::types::Agent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

// ---------------------------------------------------------------------------
// WorkerState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Idle,
    Busy,
    Stopping,
    Exited,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Stopping => "stopping",
            WorkerState::Exited => "exited",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkerRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<Agent>,
    pub state: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub last_progress: DateTime<Utc>,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
}

impl WorkerRecord {
    pub fn new(id: impl Into<String>, pid: u32, agent: Option<Agent>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            pid,
            agent,
            state: WorkerState::Starting,
            current_task: None,
            started_at: now,
            last_heartbeat: now,
            last_progress: now,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Healthy,
    /// Alive but no heartbeat within the timeout.
    Stale,
    /// Heartbeating while busy, but no task progress within the timeout.
    Zombie,
    /// Process no longer exists.
    Dead,
    /// Worker shut down cleanly and left its record behind.
    Exited,
}

impl WorkerHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerHealth::Healthy => "healthy",
            WorkerHealth::Stale => "stale",
            WorkerHealth::Zombie => "zombie",
            WorkerHealth::Dead => "dead",
            WorkerHealth::Exited => "exited",
        }
    }

    pub fn is_healthy(self) -> bool {
        self == WorkerHealth::Healthy
    }
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub heartbeat_timeout: Duration,
    pub progress_timeout: Duration,
}

impl From<&SupervisorConfig> for HealthPolicy {
    fn from(cfg: &SupervisorConfig) -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(cfg.heartbeat_timeout_secs),
            progress_timeout: Duration::from_secs(cfg.progress_timeout_secs),
        }
    }
}

/// Process liveness and signalling, abstracted so tests need no real PIDs.
pub trait ProcessProbe {
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to shut down (SIGTERM on unix).
    fn terminate(&self, pid: u32) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

#[cfg(unix)]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // SAFETY: signal 0 performs only the existence and permission check.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        // EPERM: the process exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn terminate(&self, pid: u32) -> std::io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        // SAFETY: plain kill(2) on a positive pid.
        if pid > 0 && unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
impl ProcessProbe for SystemProbe {
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }

    fn terminate(&self, _pid: u32) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
    }
}

fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Classify a worker. Checks run in order: exited, dead, stale, zombie.
pub fn assess(
    record: &WorkerRecord,
    now: DateTime<Utc>,
    policy: &HealthPolicy,
    probe: &dyn ProcessProbe,
) -> WorkerHealth {
    if record.state == WorkerState::Exited {
        return WorkerHealth::Exited;
    }
    if !probe.is_alive(record.pid) {
        return WorkerHealth::Dead;
    }
    if elapsed(now, record.last_heartbeat) > policy.heartbeat_timeout {
        return WorkerHealth::Stale;
    }
    if record.state == WorkerState::Busy
        && elapsed(now, record.last_progress) > policy.progress_timeout
    {
        return WorkerHealth::Zombie;
    }
    WorkerHealth::Healthy
}

// ---------------------------------------------------------------------------
// WorkerRegistry
// ---------------------------------------------------------------------------

const WORKER_LOCK_PREFIX: &str = "worker.";

/// Longest worker id whose `worker.<id>` lock name is still a valid name.
pub const MAX_WORKER_ID: usize = paths::MAX_NAME_LEN - WORKER_LOCK_PREFIX.len();

pub fn validate_worker_id(id: &str) -> Result<()> {
    paths::validate_name(id)?;
    if id.len() > MAX_WORKER_ID {
        return Err(TriadError::WorkerIdTooLong {
            id: id.to_string(),
            max: MAX_WORKER_ID,
        });
    }
    Ok(())
}

/// One JSON file per worker under `.triad/workers/`. Every read-modify-write
/// holds the `worker.<id>` lock.
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    root: PathBuf,
    locks: LockManager,
    lock_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(root: &Path, lock_timeout: Duration) -> Self {
        Self {
            root: root.to_path_buf(),
            locks: LockManager::for_root(root),
            lock_timeout,
        }
    }

    fn lock_name(id: &str) -> String {
        format!("{WORKER_LOCK_PREFIX}{id}")
    }

    pub fn register(&self, record: WorkerRecord) -> Result<WorkerRecord> {
        validate_worker_id(&record.id)?;
        let _guard = self.locks.acquire(&Self::lock_name(&record.id), self.lock_timeout)?;
        if paths::worker_path(&self.root, &record.id).exists() {
            return Err(TriadError::WorkerExists(record.id));
        }
        self.write(&record)?;
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<WorkerRecord> {
        paths::validate_name(id)?;
        let path = paths::worker_path(&self.root, id);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TriadError::WorkerNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    /// Locked read-modify-write of one record.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut WorkerRecord)) -> Result<WorkerRecord> {
        let _guard = self.locks.acquire(&Self::lock_name(id), self.lock_timeout)?;
        let mut record = self.get(id)?;
        f(&mut record);
        self.write(&record)?;
        Ok(record)
    }

    pub fn heartbeat(&self, id: &str) -> Result<WorkerRecord> {
        self.update(id, |r| r.last_heartbeat = Utc::now())
    }

    pub fn progress(&self, id: &str) -> Result<WorkerRecord> {
        self.update(id, |r| {
            let now = Utc::now();
            r.last_progress = now;
            r.last_heartbeat = now;
        })
    }

    pub fn assign(&self, id: &str, task_id: &str) -> Result<WorkerRecord> {
        self.update(id, |r| {
            let now = Utc::now();
            r.state = WorkerState::Busy;
            r.current_task = Some(task_id.to_string());
            r.last_progress = now;
            r.last_heartbeat = now;
        })
    }

    pub fn release(&self, id: &str, success: bool) -> Result<WorkerRecord> {
        self.update(id, |r| {
            let now = Utc::now();
            r.state = WorkerState::Idle;
            r.current_task = None;
            r.last_progress = now;
            r.last_heartbeat = now;
            if success {
                r.tasks_completed += 1;
            } else {
                r.tasks_failed += 1;
            }
        })
    }

    pub fn set_state(&self, id: &str, state: WorkerState) -> Result<WorkerRecord> {
        self.update(id, |r| r.state = state)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        paths::validate_name(id)?;
        let _guard = self.locks.acquire(&Self::lock_name(id), self.lock_timeout)?;
        match std::fs::remove_file(paths::worker_path(&self.root, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TriadError::WorkerNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All readable records sorted by id, plus the paths that could not be
    /// parsed.
    pub fn list(&self) -> Result<(Vec<WorkerRecord>, Vec<PathBuf>)> {
        let dir = paths::workers_dir(&self.root);
        if !dir.exists() {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut records = Vec::new();
        let mut unreadable = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(TriadError::from)
                .and_then(|d| serde_json::from_str::<WorkerRecord>(&d).map_err(TriadError::from));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable worker file");
                    unreadable.push(path);
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        unreadable.sort();
        Ok((records, unreadable))
    }

    fn write(&self, record: &WorkerRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)?;
        io::atomic_write(&paths::worker_path(&self.root, &record.id), &data)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
