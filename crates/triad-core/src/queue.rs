//! SQLite-backed priority task queue.
//!
//! Ordering is (priority, created_at): P0 before P3, older before newer.
//! Pending tasks age upward one level per boost pass once they have waited
//! past the configured thresholds. Every state change is recorded in
//! `task_history`.

use crate::config::{BoostThresholds, QueueConfig};
use crate::db::{self, parse_opt_ts, parse_ts, ts};
use crate::error::{Result, TriadError};
use crate::types::{Category, Priority, TaskStatus};
use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::types::{ToSql, Type};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    priority INTEGER NOT NULL,
    original_priority INTEGER NOT NULL,
    description TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'other',
    status TEXT NOT NULL DEFAULT 'pending',
    assigned_agent TEXT,
    verifier_agent TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    boost_count INTEGER NOT NULL DEFAULT 0,
    batch_id TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    dependencies TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS batches (
    batch_id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    priority INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
);

CREATE TABLE IF NOT EXISTS queue_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    total_tasks INTEGER,
    pending_tasks INTEGER,
    running_tasks INTEGER,
    completed_tasks INTEGER,
    failed_tasks INTEGER,
    p0_count INTEGER,
    p1_count INTEGER,
    p2_count INTEGER,
    p3_count INTEGER,
    avg_wait_time_seconds REAL,
    boosted_tasks INTEGER
);

CREATE TABLE IF NOT EXISTS task_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    action TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    timestamp TEXT NOT NULL,
    FOREIGN KEY (task_id) REFERENCES tasks(task_id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority, created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_category ON tasks(category);
CREATE INDEX IF NOT EXISTS idx_tasks_batch ON tasks(batch_id);
CREATE INDEX IF NOT EXISTS idx_history_task ON task_history(task_id);
";

const TASK_COLUMNS: &str = "task_id, priority, original_priority, description, category, status, \
    assigned_agent, verifier_agent, created_at, updated_at, started_at, completed_at, \
    boost_count, batch_id, metadata, retry_count, max_retries, dependencies, tags";

const BATCH_HEADER: &str = "Complete ALL of the following tasks. Number your responses clearly.";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub priority: Priority,
    pub original_priority: Priority,
    pub description: String,
    pub category: Category,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub verifier_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub boost_count: u32,
    pub batch_id: Option<String>,
    pub metadata: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    /// Explicit id, used when importing. Generated when `None`.
    pub id: Option<String>,
    pub description: String,
    pub priority: Priority,
    pub category: Category,
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: Option<Value>,
    pub verifier_agent: Option<String>,
}

impl NewTask {
    pub fn new(description: impl Into<String>, priority: Priority) -> Self {
        Self {
            description: description.into(),
            priority,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub batch_id: String,
    pub category: Category,
    pub priority: Priority,
    pub task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub action: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub blocked: u64,
    /// Pending tasks per priority.
    pub pending_by_priority: BTreeMap<String, u64>,
    pub boosted: u64,
    pub avg_wait_seconds: f64,
    pub oldest_pending_hours: f64,
}

// ---------------------------------------------------------------------------
// QueueDb
// ---------------------------------------------------------------------------

pub struct QueueDb {
    conn: Connection,
    boost: BoostThresholds,
    batch_size_limit: usize,
    max_retries: u32,
}

impl QueueDb {
    pub fn open(path: &Path, config: &QueueConfig) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            boost: config.boost.clone(),
            batch_size_limit: config.batch_size_limit.max(1),
            max_retries: config.max_retries,
        })
    }

    pub fn add(&self, new: NewTask) -> Result<Task> {
        let id = new.id.unwrap_or_else(generate_task_id);
        let now = ts(Utc::now());
        self.conn.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
                 (?1, ?2, ?2, ?3, ?4, 'pending', NULL, ?5, ?6, ?6, NULL, NULL, 0, NULL, ?7, 0, ?8, ?9, ?10)"
            ),
            params![
                id,
                new.priority.value(),
                new.description,
                new.category.as_str(),
                new.verifier_agent,
                now,
                serde_json::to_string(&new.metadata.unwrap_or_else(|| Value::Object(Default::default())))?,
                self.max_retries,
                serde_json::to_string(&new.dependencies)?,
                serde_json::to_string(&new.tags)?,
            ],
        )?;
        record_history(&self.conn, &id, "created", None, Some(new.priority.label()))?;
        self.get(&id)
    }

    pub fn get(&self, id: &str) -> Result<Task> {
        get_task(&self.conn, id)?.ok_or_else(|| TriadError::TaskNotFound(id.to_string()))
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        Ok(get_task(&self.conn, id)?.is_some())
    }

    pub fn delete(&mut self, id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM task_history WHERE task_id = ?1", params![id])?;
        let n = tx.execute("DELETE FROM tasks WHERE task_id = ?1", params![id])?;
        if n == 0 {
            return Err(TriadError::TaskNotFound(id.to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list(
        &self,
        status: Option<TaskStatus>,
        priority: Option<Priority>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(s) = status {
            clauses.push("status = ?");
            values.push(Box::new(s.as_str()));
        }
        if let Some(p) = priority {
            clauses.push("priority = ?");
            values.push(Box::new(p.value()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        values.push(Box::new(limit as i64));
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks {where_sql} ORDER BY priority ASC, created_at ASC, rowid ASC LIMIT ?"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Number of pending tasks.
    pub fn depth(&self) -> Result<u64> {
        count(&self.conn, "SELECT COUNT(*) FROM tasks WHERE status = 'pending'")
    }

    /// Apply age boosts, then peek at the task `claim_next` would take.
    pub fn next(&self) -> Result<Option<Task>> {
        boost_pending(&self.conn, &self.boost, Utc::now())?;
        first_ready(&self.conn)
    }

    /// Atomically select the next ready task and mark it running for `agent`.
    /// Two processes racing here never get the same task.
    pub fn claim_next(&mut self, agent: &str) -> Result<Option<Task>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        boost_pending(&tx, &self.boost, Utc::now())?;
        let Some(task) = first_ready(&tx)? else {
            tx.commit()?;
            return Ok(None);
        };
        mark_started(&tx, &task.task_id, agent)?;
        tx.commit()?;
        debug!(task = %task.task_id, agent, "claimed task");
        self.get(&task.task_id).map(Some)
    }

    pub fn start(&self, id: &str, agent: Option<&str>) -> Result<Task> {
        let tx = self.immediate()?;
        if mark_started(&tx, id, agent.unwrap_or(""))? == 0 {
            return Err(rejected(&tx, id, TaskStatus::Pending, None));
        }
        tx.commit()?;
        self.get(id)
    }

    /// Record the outcome of a running task. With `worker` set, only the
    /// worker the task is assigned to may finish it; `None` skips the owner
    /// check for operator use.
    pub fn complete(&self, id: &str, worker: Option<&str>, success: bool) -> Result<Task> {
        let status = if success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        let tx = self.immediate()?;
        let changed = tx.execute(
            "UPDATE tasks SET status = ?2, completed_at = ?3, updated_at = ?3 \
             WHERE task_id = ?1 AND status = 'running' AND (?4 IS NULL OR assigned_agent = ?4)",
            params![id, status.as_str(), ts(Utc::now()), worker],
        )?;
        if changed == 0 {
            return Err(rejected(&tx, id, TaskStatus::Running, worker));
        }
        record_history(
            &tx,
            id,
            if success { "completed" } else { "failed" },
            Some(TaskStatus::Running.as_str()),
            Some(status.as_str()),
        )?;
        tx.commit()?;
        self.get(id)
    }

    /// Put a failed task back in the queue.
    pub fn retry(&self, id: &str) -> Result<Task> {
        let tx = self.immediate()?;
        let task = checked(&tx, id, TaskStatus::Failed, None)?;
        if task.retry_count >= task.max_retries {
            return Err(TriadError::RetriesExhausted {
                id: id.to_string(),
                max: task.max_retries,
            });
        }
        if reset_to_pending(&tx, id, TaskStatus::Failed, None)? == 0 {
            return Err(rejected(&tx, id, TaskStatus::Failed, None));
        }
        record_history(
            &tx,
            id,
            "retry",
            Some(TaskStatus::Failed.as_str()),
            Some(TaskStatus::Pending.as_str()),
        )?;
        tx.commit()?;
        self.get(id)
    }

    /// Return a running task whose worker went away. Consumes one retry; once
    /// the budget is spent the task is marked failed instead. With `owner`
    /// set, a task that has since been claimed by someone else is left alone.
    pub fn requeue(&self, id: &str, owner: Option<&str>, reason: &str) -> Result<Task> {
        let tx = self.immediate()?;
        let task = checked(&tx, id, TaskStatus::Running, owner)?;
        let changed = if task.retry_count >= task.max_retries {
            let changed = tx.execute(
                "UPDATE tasks SET status = 'failed', completed_at = ?2, updated_at = ?2 \
                 WHERE task_id = ?1 AND status = 'running'",
                params![id, ts(Utc::now())],
            )?;
            record_history(&tx, id, "requeue_exhausted", Some(reason), Some("failed"))?;
            warn!(task = id, reason, "retry budget exhausted, marking failed");
            changed
        } else {
            let changed = reset_to_pending(&tx, id, TaskStatus::Running, owner)?;
            record_history(&tx, id, "requeued", Some(reason), Some("pending"))?;
            changed
        };
        if changed == 0 {
            return Err(rejected(&tx, id, TaskStatus::Running, owner));
        }
        tx.commit()?;
        self.get(id)
    }

    /// Take the database write lock up front so a read-check-update sequence
    /// cannot interleave with another process.
    fn immediate(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    pub fn set_priority(&self, id: &str, priority: Priority) -> Result<Task> {
        let task = self.get(id)?;
        self.conn.execute(
            "UPDATE tasks SET priority = ?2, updated_at = ?3 WHERE task_id = ?1",
            params![id, priority.value(), ts(Utc::now())],
        )?;
        record_history(
            &self.conn,
            id,
            "priority_change",
            Some(task.priority.label()),
            Some(priority.label()),
        )?;
        self.get(id)
    }

    pub fn apply_age_boosts(&self) -> Result<usize> {
        self.apply_age_boosts_at(Utc::now())
    }

    /// Promote pending tasks that have waited long enough, one level each.
    /// Age is measured from creation.
    pub fn apply_age_boosts_at(&self, now: DateTime<Utc>) -> Result<usize> {
        boost_pending(&self.conn, &self.boost, now)
    }

    pub fn history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT action, old_value, new_value, timestamp FROM task_history \
             WHERE task_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(HistoryEntry {
                action: row.get(0)?,
                old_value: row.get(1)?,
                new_value: row.get(2)?,
                timestamp: parse_ts(row, 3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, n) = row?;
            let n = n as u64;
            stats.total += n;
            match status.as_str() {
                "pending" => stats.pending = n,
                "running" => stats.running = n,
                "completed" => stats.completed = n,
                "failed" => stats.failed = n,
                "blocked" => stats.blocked = n,
                _ => {}
            }
        }

        for p in Priority::all() {
            let n = self.conn.query_row(
                "SELECT COUNT(*) FROM tasks WHERE priority = ?1 AND status = 'pending'",
                params![p.value()],
                |r| r.get::<_, i64>(0),
            )?;
            stats.pending_by_priority.insert(p.as_str().to_string(), n as u64);
        }

        stats.boosted = count(&self.conn, "SELECT COUNT(*) FROM tasks WHERE boost_count > 0")?;

        let avg: Option<f64> = self.conn.query_row(
            "SELECT AVG((julianday(started_at) - julianday(created_at)) * 86400.0) \
             FROM tasks WHERE started_at IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        stats.avg_wait_seconds = round2(avg.unwrap_or(0.0));

        let oldest: Option<String> = self.conn.query_row(
            "SELECT MIN(created_at) FROM tasks WHERE status = 'pending'",
            [],
            |r| r.get(0),
        )?;
        if let Some(Ok(oldest)) = oldest.map(|s| DateTime::parse_from_rfc3339(&s)) {
            let age = Utc::now().signed_duration_since(oldest.with_timezone(&Utc));
            stats.oldest_pending_hours = round2(age.num_seconds() as f64 / 3600.0);
        }
        Ok(stats)
    }

    pub fn save_metrics_snapshot(&self) -> Result<QueueStats> {
        let s = self.stats()?;
        let by = |p: Priority| s.pending_by_priority.get(p.as_str()).copied().unwrap_or(0) as i64;
        self.conn.execute(
            "INSERT INTO queue_metrics (timestamp, total_tasks, pending_tasks, running_tasks, \
             completed_tasks, failed_tasks, p0_count, p1_count, p2_count, p3_count, \
             avg_wait_time_seconds, boosted_tasks) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                ts(Utc::now()),
                s.total as i64,
                s.pending as i64,
                s.running as i64,
                s.completed as i64,
                s.failed as i64,
                by(Priority::P0),
                by(Priority::P1),
                by(Priority::P2),
                by(Priority::P3),
                s.avg_wait_seconds,
                s.boosted as i64,
            ],
        )?;
        Ok(s)
    }

    pub fn metrics_snapshots(&self) -> Result<u64> {
        count(&self.conn, "SELECT COUNT(*) FROM queue_metrics")
    }

    // -----------------------------------------------------------------------
    // Batching
    // -----------------------------------------------------------------------

    /// Group pending tasks by (priority, category) into batches of at most
    /// `batch_size_limit`, stamping each task's `batch_id`. Batches come out
    /// most urgent first.
    pub fn create_batches(&mut self) -> Result<Vec<Batch>> {
        let tx = self.conn.transaction()?;
        let mut batches = Vec::new();
        for priority in Priority::all() {
            for category in Category::all() {
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT task_id FROM tasks WHERE status = 'pending' AND priority = ?1 \
                         AND category = ?2 ORDER BY created_at ASC, rowid ASC",
                    )?;
                    let rows = stmt.query_map(params![priority.value(), category.as_str()], |r| {
                        r.get::<_, String>(0)
                    })?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                for chunk in ids.chunks(self.batch_size_limit) {
                    let batch = Batch {
                        batch_id: generate_batch_id(),
                        category: *category,
                        priority: *priority,
                        task_ids: chunk.to_vec(),
                        created_at: Utc::now(),
                    };
                    tx.execute(
                        "INSERT OR REPLACE INTO batches (batch_id, category, priority, created_at, status) \
                         VALUES (?1, ?2, ?3, ?4, 'pending')",
                        params![
                            batch.batch_id,
                            category.as_str(),
                            priority.value(),
                            ts(batch.created_at)
                        ],
                    )?;
                    for id in chunk {
                        tx.execute(
                            "UPDATE tasks SET batch_id = ?2 WHERE task_id = ?1",
                            params![id, batch.batch_id],
                        )?;
                    }
                    batches.push(batch);
                }
            }
        }
        tx.commit()?;
        Ok(batches)
    }

    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        Ok(self.create_batches()?.into_iter().next())
    }

    /// Write the batch as a numbered task list that `import_tasks` reads back.
    pub fn export_batch(&self, batch: &Batch, dir: &Path) -> Result<PathBuf> {
        let mut lines = vec![format!("{BATCH_HEADER}\n")];
        for (i, id) in batch.task_ids.iter().enumerate() {
            let task = self.get(id)?;
            lines.push(format!("**Task {} [{}]:** {}\n", i + 1, id, task.description));
        }
        let path = dir.join(format!("{}.txt", batch.batch_id));
        crate::io::atomic_write(&path, lines.join("\n").as_bytes())?;
        Ok(path)
    }

    /// Parse `**Task N [id]:** description` lines into new P2 tasks. Ids that
    /// already exist in the queue are skipped.
    pub fn import_tasks(&self, path: &Path) -> Result<Vec<Task>> {
        let content = std::fs::read_to_string(path)?;
        let mut imported = Vec::new();
        for caps in import_re().captures_iter(&content) {
            let id = caps[1].trim().to_string();
            if self.exists(&id)? {
                warn!(task = %id, "skipping import of existing task");
                continue;
            }
            imported.push(self.add(NewTask {
                id: Some(id),
                ..NewTask::new(caps[2].trim(), Priority::P2)
            })?);
        }
        Ok(imported)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*Task \d+ \[([^\]]+)\]:\*\* (.+)").expect("static regex"))
}

fn short_hex() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn generate_task_id() -> String {
    format!("task_{}_{}", Utc::now().timestamp(), short_hex())
}

fn generate_batch_id() -> String {
    format!("batch_{}_{}", Utc::now().timestamp(), short_hex())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    Ok(conn.query_row(sql, [], |r| r.get::<_, i64>(0))? as u64)
}

fn expect_status(task: &Task, expected: TaskStatus) -> Result<()> {
    if task.status == expected {
        Ok(())
    } else {
        Err(TriadError::InvalidTaskState {
            id: task.task_id.clone(),
            status: task.status.to_string(),
            expected: expected.to_string(),
        })
    }
}

fn conversion(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion(idx, e.to_string()))
}

fn priority_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Priority> {
    let v: i64 = row.get(idx)?;
    Priority::from_value(v).ok_or_else(|| conversion(idx, format!("priority out of range: {v}")))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let category: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(Task {
        task_id: row.get(0)?,
        priority: priority_col(row, 1)?,
        original_priority: priority_col(row, 2)?,
        description: row.get(3)?,
        category: category.parse().unwrap_or_default(),
        status: status.parse().map_err(|_| conversion(5, status.clone()))?,
        assigned_agent: row.get(6)?,
        verifier_agent: row.get(7)?,
        created_at: parse_ts(row, 8)?,
        updated_at: parse_ts(row, 9)?,
        started_at: parse_opt_ts(row, 10)?,
        completed_at: parse_opt_ts(row, 11)?,
        boost_count: row.get(12)?,
        batch_id: row.get(13)?,
        metadata: json_col(row, 14)?,
        retry_count: row.get(15)?,
        max_retries: row.get(16)?,
        dependencies: json_col(row, 17)?,
        tags: json_col(row, 18)?,
    })
}

fn get_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
            params![id],
            task_from_row,
        )
        .optional()?)
}

fn record_history(
    conn: &Connection,
    id: &str,
    action: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO task_history (task_id, action, old_value, new_value, timestamp) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, action, old_value, new_value, ts(Utc::now())],
    )?;
    Ok(())
}

/// Returns the number of rows moved to running; zero when the task was not
/// pending.
fn mark_started(conn: &Connection, id: &str, agent: &str) -> Result<usize> {
    let now = ts(Utc::now());
    let agent = (!agent.is_empty()).then_some(agent);
    let changed = conn.execute(
        "UPDATE tasks SET status = 'running', started_at = ?2, updated_at = ?2, \
         assigned_agent = COALESCE(?3, assigned_agent) WHERE task_id = ?1 AND status = 'pending'",
        params![id, now, agent],
    )?;
    if changed > 0 {
        record_history(conn, id, "started", Some("pending"), Some("running"))?;
    }
    Ok(changed)
}

fn reset_to_pending(conn: &Connection, id: &str, from: TaskStatus, owner: Option<&str>) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE tasks SET status = 'pending', retry_count = retry_count + 1, started_at = NULL, \
         completed_at = NULL, assigned_agent = NULL, updated_at = ?2 \
         WHERE task_id = ?1 AND status = ?3 AND (?4 IS NULL OR assigned_agent = ?4)",
        params![id, ts(Utc::now()), from.as_str(), owner],
    )?)
}

/// Load a task and verify it is in `expected` state and, when `owner` is
/// given, assigned to that owner.
fn checked(conn: &Connection, id: &str, expected: TaskStatus, owner: Option<&str>) -> Result<Task> {
    let task = get_task(conn, id)?.ok_or_else(|| TriadError::TaskNotFound(id.to_string()))?;
    expect_status(&task, expected)?;
    if let Some(worker) = owner {
        if task.assigned_agent.as_deref() != Some(worker) {
            return Err(TriadError::TaskNotOwned {
                id: id.to_string(),
                owner: task.assigned_agent.unwrap_or_else(|| "nobody".to_string()),
                worker: worker.to_string(),
            });
        }
    }
    Ok(task)
}

/// Explain why a guarded update touched no rows.
fn rejected(conn: &Connection, id: &str, expected: TaskStatus, owner: Option<&str>) -> TriadError {
    match checked(conn, id, expected, owner) {
        Err(e) => e,
        Ok(task) => TriadError::InvalidTaskState {
            id: id.to_string(),
            status: task.status.to_string(),
            expected: expected.to_string(),
        },
    }
}

/// A dependency is satisfied only once it exists and has completed.
fn dependencies_met(conn: &Connection, task: &Task) -> Result<bool> {
    for dep in &task.dependencies {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE task_id = ?1",
                params![dep],
                |r| r.get(0),
            )
            .optional()?;
        if status.as_deref() != Some(TaskStatus::Completed.as_str()) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn pending(conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' ORDER BY priority ASC, created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map([], task_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn first_ready(conn: &Connection) -> Result<Option<Task>> {
    for task in pending(conn)? {
        if dependencies_met(conn, &task)? {
            return Ok(Some(task));
        }
    }
    Ok(None)
}

fn boost_pending(conn: &Connection, thresholds: &BoostThresholds, now: DateTime<Utc>) -> Result<usize> {
    let mut boosted = 0;
    for task in pending(conn)? {
        let hours = match task.priority {
            Priority::P3 => thresholds.p3_to_p2_hours,
            Priority::P2 => thresholds.p2_to_p1_hours,
            Priority::P1 => thresholds.p1_to_p0_hours,
            Priority::P0 => continue,
        };
        let age = now.signed_duration_since(task.created_at);
        if age < chrono::Duration::hours(hours as i64) {
            continue;
        }
        let Some(promoted) = task.priority.promoted() else {
            continue;
        };
        conn.execute(
            "UPDATE tasks SET priority = ?2, boost_count = boost_count + 1, updated_at = ?3 \
             WHERE task_id = ?1",
            params![task.task_id, promoted.value(), ts(Utc::now())],
        )?;
        record_history(
            conn,
            &task.task_id,
            "priority_boost",
            Some(task.priority.label()),
            Some(promoted.label()),
        )?;
        boosted += 1;
    }
    Ok(boosted)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
