//! Rebuildable read models over the event log.
//!
//! A snapshot stores the projected state together with the byte offset of the
//! log it reflects, so `update` only replays what was appended since. The
//! snapshot is disposable: deleting it (as `EventStore::repair` does) just
//! means the next update replays from the start.

use crate::error::{Result, TriadError};
use crate::event::{kinds, Event};
use crate::event_store::EventStore;
use crate::io;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub trait Projection: Default + Serialize + DeserializeOwned {
    const NAME: &'static str;

    fn apply(&mut self, event: &Event);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<P> {
    pub name: String,
    pub offset: u64,
    pub events_applied: u64,
    pub updated_at: DateTime<Utc>,
    pub state: P,
}

impl<P: Projection> Snapshot<P> {
    fn empty() -> Self {
        Self {
            name: P::NAME.to_string(),
            offset: 0,
            events_applied: 0,
            updated_at: Utc::now(),
            state: P::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectionStore
// ---------------------------------------------------------------------------

pub struct ProjectionStore<'a> {
    root: PathBuf,
    events: &'a EventStore,
}

impl<'a> ProjectionStore<'a> {
    pub fn new(root: &Path, events: &'a EventStore) -> Self {
        Self {
            root: root.to_path_buf(),
            events,
        }
    }

    /// Persisted snapshot, or an empty one when missing or unreadable.
    pub fn load<P: Projection>(&self) -> Result<Snapshot<P>> {
        let path = paths::projection_path(&self.root, P::NAME);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Snapshot::empty()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&data) {
            Ok(snap) => Ok(snap),
            Err(e) => {
                warn!(projection = P::NAME, error = %e, "discarding unreadable snapshot");
                Ok(Snapshot::empty())
            }
        }
    }

    /// Apply events appended since the snapshot and persist it. The event
    /// log lock is held throughout so a repair cannot shift offsets between
    /// the read and the save.
    pub fn update<P: Projection>(&self) -> Result<Snapshot<P>> {
        let _guard = self.events.lock()?;
        let snap = self.load::<P>()?;
        if self.events.len()? < snap.offset {
            info!(projection = P::NAME, "event log shrank since snapshot, rebuilding");
            return self.advance(Snapshot::empty());
        }
        self.advance(snap)
    }

    /// Replay the whole log into fresh state and persist it.
    pub fn rebuild<P: Projection>(&self) -> Result<Snapshot<P>> {
        let _guard = self.events.lock()?;
        self.advance(Snapshot::empty())
    }

    fn advance<P: Projection>(&self, mut snap: Snapshot<P>) -> Result<Snapshot<P>> {
        let (log, next) = self.events.read_from(snap.offset)?;
        for event in &log.events {
            snap.state.apply(event);
        }
        snap.events_applied += log.events.len() as u64;
        snap.offset = next;
        snap.updated_at = Utc::now();
        self.save(&snap)?;
        Ok(snap)
    }

    fn save<P: Projection>(&self, snap: &Snapshot<P>) -> Result<()> {
        let path = paths::projection_path(&self.root, P::NAME);
        let data = serde_json::to_vec_pretty(snap)?;
        io::atomic_write(&path, &data)
    }
}

// ---------------------------------------------------------------------------
// Dispatch by name
// ---------------------------------------------------------------------------

pub const BUILTIN: &[&str] = &[TaskBoard::NAME, WorkerActivity::NAME, EventCounts::NAME];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Read the persisted snapshot as is.
    None,
    Update,
    Rebuild,
}

fn refresh<P: Projection>(store: &ProjectionStore<'_>, mode: Refresh) -> Result<serde_json::Value> {
    let snap = match mode {
        Refresh::None => store.load::<P>()?,
        Refresh::Update => store.update::<P>()?,
        Refresh::Rebuild => store.rebuild::<P>()?,
    };
    Ok(serde_json::to_value(snap)?)
}

/// Run a built-in projection chosen at runtime and return its snapshot as JSON.
pub fn refresh_named(
    store: &ProjectionStore<'_>,
    name: &str,
    mode: Refresh,
) -> Result<serde_json::Value> {
    match name {
        TaskBoard::NAME => refresh::<TaskBoard>(store, mode),
        WorkerActivity::NAME => refresh::<WorkerActivity>(store, mode),
        EventCounts::NAME => refresh::<EventCounts>(store, mode),
        other => Err(TriadError::UnknownProjection(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// TaskBoard
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Latest known status of every task seen in `task.*` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBoard {
    pub tasks: BTreeMap<String, TaskEntry>,
    pub counts: BTreeMap<String, u64>,
}

impl Projection for TaskBoard {
    const NAME: &'static str = "task_board";

    fn apply(&mut self, event: &Event) {
        let status = match event.event_type.as_str() {
            kinds::TASK_QUEUED | kinds::TASK_RETRIED | kinds::TASK_REQUEUED => "pending",
            kinds::TASK_STARTED => "running",
            kinds::TASK_COMPLETED => "completed",
            kinds::TASK_FAILED => "failed",
            _ => return,
        };
        let Some(task_id) = event.payload_str("task_id") else {
            return;
        };

        let entry = self
            .tasks
            .entry(task_id.to_string())
            .or_insert_with(|| TaskEntry {
                status: String::new(),
                worker: None,
                attempts: 0,
                updated_at: event.timestamp,
            });
        if !entry.status.is_empty() {
            if let Some(n) = self.counts.get_mut(&entry.status) {
                *n = n.saturating_sub(1);
            }
        }
        if status == "running" {
            entry.attempts += 1;
        }
        if let Some(worker) = event.payload_str("worker_id") {
            entry.worker = Some(worker.to_string());
        }
        entry.status = status.to_string();
        entry.updated_at = event.timestamp;
        *self.counts.entry(status.to_string()).or_insert(0) += 1;
        self.counts.retain(|_, n| *n > 0);
    }
}

// ---------------------------------------------------------------------------
// WorkerActivity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub spawned_at: Option<DateTime<Utc>>,
    pub heartbeats: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub recoveries: u64,
    pub exited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerActivity {
    pub workers: BTreeMap<String, WorkerStats>,
}

impl Projection for WorkerActivity {
    const NAME: &'static str = "worker_activity";

    fn apply(&mut self, event: &Event) {
        if !(event.is_a("worker") || event.is_a("task")) {
            return;
        }
        let Some(worker_id) = event.payload_str("worker_id") else {
            return;
        };
        let stats = self.workers.entry(worker_id.to_string()).or_default();
        match event.event_type.as_str() {
            kinds::WORKER_SPAWNED | kinds::WORKER_REGISTERED => {
                stats.spawned_at.get_or_insert(event.timestamp);
            }
            kinds::WORKER_HEARTBEAT => stats.heartbeats += 1,
            kinds::WORKER_EXITED => stats.exited_at = Some(event.timestamp),
            kinds::WORKER_RECOVERED => stats.recoveries += 1,
            kinds::TASK_COMPLETED => stats.tasks_completed += 1,
            kinds::TASK_FAILED => stats.tasks_failed += 1,
            _ => {}
        }
        stats.last_seen = Some(event.timestamp);
    }
}

// ---------------------------------------------------------------------------
// EventCounts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCounts {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
}

impl Projection for EventCounts {
    const NAME: &'static str = "event_counts";

    fn apply(&mut self, event: &Event) {
        self.total += 1;
        *self.by_type.entry(event.event_type.clone()).or_insert(0) += 1;
        self.first_at.get_or_insert(event.timestamp);
        self.last_at = Some(event.timestamp);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;
    use tempfile::TempDir;

    fn seed(events: &EventStore) {
        events.append(kinds::WORKER_REGISTERED, json!({"worker_id": "w1"}), None).unwrap();
        events.append(kinds::TASK_QUEUED, json!({"task_id": "t1"}), None).unwrap();
        events.append(kinds::TASK_QUEUED, json!({"task_id": "t2"}), None).unwrap();
        events
            .append(kinds::TASK_STARTED, json!({"task_id": "t1", "worker_id": "w1"}), None)
            .unwrap();
        events.append(kinds::WORKER_HEARTBEAT, json!({"worker_id": "w1"}), None).unwrap();
        events
            .append(kinds::TASK_COMPLETED, json!({"task_id": "t1", "worker_id": "w1"}), None)
            .unwrap();
    }

    #[test]
    fn task_board_tracks_latest_status() {
        let dir = TempDir::new().unwrap();
        let events = EventStore::open(dir.path(), &Config::new("t"));
        seed(&events);
        let store = ProjectionStore::new(dir.path(), &events);

        let snap = store.update::<TaskBoard>().unwrap();
        assert_eq!(snap.events_applied, 6);
        assert_eq!(snap.state.tasks["t1"].status, "completed");
        assert_eq!(snap.state.tasks["t1"].attempts, 1);
        assert_eq!(snap.state.tasks["t1"].worker.as_deref(), Some("w1"));
        assert_eq!(snap.state.tasks["t2"].status, "pending");
        assert_eq!(snap.state.counts.get("completed"), Some(&1));
        assert_eq!(snap.state.counts.get("pending"), Some(&1));
        assert!(snap.state.counts.get("running").is_none());
    }

    #[test]
    fn incremental_update_matches_rebuild() {
        let dir = TempDir::new().unwrap();
        let events = EventStore::open(dir.path(), &Config::new("t"));
        let store = ProjectionStore::new(dir.path(), &events);

        events.append(kinds::TASK_QUEUED, json!({"task_id": "a"}), None).unwrap();
        store.update::<TaskBoard>().unwrap();
        store.update::<WorkerActivity>().unwrap();
        seed(&events);
        let incremental = store.update::<TaskBoard>().unwrap();
        let workers = store.update::<WorkerActivity>().unwrap();

        let rebuilt = store.rebuild::<TaskBoard>().unwrap();
        assert_eq!(incremental.state, rebuilt.state);
        assert_eq!(incremental.offset, rebuilt.offset);
        assert_eq!(workers.state, store.rebuild::<WorkerActivity>().unwrap().state);
    }

    #[test]
    fn update_is_idempotent_without_new_events() {
        let dir = TempDir::new().unwrap();
        let events = EventStore::open(dir.path(), &Config::new("t"));
        seed(&events);
        let store = ProjectionStore::new(dir.path(), &events);
        let a = store.update::<EventCounts>().unwrap();
        let b = store.update::<EventCounts>().unwrap();
        assert_eq!(a.state, b.state);
        assert_eq!(b.events_applied, 6);
        assert_eq!(b.state.by_type[kinds::TASK_QUEUED], 2);
    }

    #[test]
    fn corrupt_snapshot_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let events = EventStore::open(dir.path(), &Config::new("t"));
        seed(&events);
        let path = paths::projection_path(dir.path(), EventCounts::NAME);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let store = ProjectionStore::new(dir.path(), &events);
        assert_eq!(store.load::<EventCounts>().unwrap().offset, 0);
        assert_eq!(store.update::<EventCounts>().unwrap().state.total, 6);
    }

    #[test]
    fn shrunken_log_triggers_rebuild() {
        let dir = TempDir::new().unwrap();
        let events = EventStore::open(dir.path(), &Config::new("t"));
        seed(&events);
        let store = ProjectionStore::new(dir.path(), &events);
        store.update::<EventCounts>().unwrap();

        // Replace the log with something shorter without touching snapshots.
        std::fs::remove_file(events.path()).unwrap();
        events.append("x.y", json!({}), None).unwrap();

        let snap = store.update::<EventCounts>().unwrap();
        assert_eq!(snap.state.total, 1);
        assert_eq!(snap.state.by_type["x.y"], 1);
    }

    #[test]
    fn update_waits_for_log_lock() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::new("t");
        cfg.events.lock_timeout_secs = 0;
        let events = EventStore::open(dir.path(), &cfg);
        seed(&events);
        let store = ProjectionStore::new(dir.path(), &events);

        let held = events.lock().unwrap();
        assert!(matches!(
            store.update::<EventCounts>(),
            Err(TriadError::LockTimeout { .. })
        ));
        assert!(matches!(
            store.rebuild::<EventCounts>(),
            Err(TriadError::LockTimeout { .. })
        ));
        assert!(!paths::projection_path(dir.path(), EventCounts::NAME).exists());

        drop(held);
        assert_eq!(store.update::<EventCounts>().unwrap().state.total, 6);
    }

    #[test]
    fn worker_activity_counts() {
        let dir = TempDir::new().unwrap();
        let events = EventStore::open(dir.path(), &Config::new("t"));
        seed(&events);
        events.append(kinds::WORKER_RECOVERED, json!({"worker_id": "w1"}), None).unwrap();
        let store = ProjectionStore::new(dir.path(), &events);
        let w = &store.update::<WorkerActivity>().unwrap().state.workers["w1"];
        assert_eq!(w.heartbeats, 1);
        assert_eq!(w.tasks_completed, 1);
        assert_eq!(w.recoveries, 1);
        assert!(w.spawned_at.is_some());
    }

    #[test]
    fn refresh_by_name() {
        let dir = TempDir::new().unwrap();
        let events = EventStore::open(dir.path(), &Config::new("t"));
        seed(&events);
        let store = ProjectionStore::new(dir.path(), &events);
        let v = refresh_named(&store, "event_counts", Refresh::Rebuild).unwrap();
        assert_eq!(v["state"]["total"], 6);
        assert!(matches!(
            refresh_named(&store, "nope", Refresh::Update),
            Err(TriadError::UnknownProjection(_))
        ));
    }
}
