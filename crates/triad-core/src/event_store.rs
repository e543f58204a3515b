//! Append-only JSON-lines event log.
//!
//! Writers serialize on the `events` lock. Readers take no lock: they only
//! consume lines terminated by `\n`, so a line that is still being written
//! (or was torn by a crash) is never half-parsed. Lines that fail to parse
//! are skipped and reported, never fatal.

use crate::config::Config;
use crate::error::{Result, TriadError};
use crate::event::Event;
use crate::io;
use crate::lock::{LockGuard, LockManager};
use crate::paths;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// A line that could not be parsed as an event.
#[derive(Debug, Clone, Serialize)]
pub struct CorruptLine {
    /// 1-based line number within the range that was read.
    pub line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    pub events: Vec<Event>,
    pub corrupt: Vec<CorruptLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub total_lines: usize,
    pub valid: usize,
    pub corrupt: Vec<CorruptLine>,
    /// Bytes after the last newline.
    pub torn_tail: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty() && !self.torn_tail
    }
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EventStore {
    root: PathBuf,
    path: PathBuf,
    locks: LockManager,
    max_event_bytes: usize,
    lock_timeout: Duration,
}

impl EventStore {
    pub fn open(root: &Path, config: &Config) -> Self {
        Self {
            root: root.to_path_buf(),
            path: paths::event_log_path(root),
            locks: LockManager::for_root(root),
            max_event_bytes: config.events.max_event_bytes,
            lock_timeout: config.events.lock_timeout(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hold the log's writer lock. Appends and repairs wait until the guard
    /// is dropped.
    pub fn lock(&self) -> Result<LockGuard> {
        self.locks.acquire(paths::EVENTS_LOCK, self.lock_timeout)
    }

    /// Build and append a new event.
    pub fn append(
        &self,
        event_type: &str,
        payload: Value,
        source: Option<String>,
    ) -> Result<Event> {
        let event = Event::new(event_type, payload, source)?;
        self.append_event(&event)?;
        Ok(event)
    }

    pub fn append_event(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_vec(event)?;
        if line.len() > self.max_event_bytes {
            return Err(TriadError::EventTooLarge {
                size: line.len(),
                limit: self.max_event_bytes,
            });
        }
        let _guard = self.lock()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        if io::has_torn_tail(&mut file)? {
            warn!(path = %self.path.display(), "event log has a torn tail, isolating it");
            io::append_line(&mut file, b"")?;
        }
        io::append_line(&mut file, &line)
    }

    pub fn read_all(&self) -> Result<EventLog> {
        Ok(self.read_from(0)?.0)
    }

    /// Read complete lines starting at byte `offset`. Returns the parsed log
    /// and the offset just past the last complete line consumed.
    pub fn read_from(&self, offset: u64) -> Result<(EventLog, u64)> {
        let (bytes, consumed) = match self.read_complete(offset)? {
            Some(v) => v,
            None => return Ok((EventLog::default(), offset)),
        };
        let log = parse_lines(&bytes);
        Ok((log, offset + consumed))
    }

    /// Length of the log in bytes, 0 if missing.
    pub fn len(&self) -> Result<u64> {
        match std::fs::metadata(&self.path) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Events whose type equals `prefix` or sits under it (`task` matches
    /// `task.completed`).
    pub fn filter(&self, prefix: &str) -> Result<Vec<Event>> {
        Ok(self
            .read_all()?
            .events
            .into_iter()
            .filter(|e| e.is_a(prefix))
            .collect())
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.read_all()?.events.len())
    }

    pub fn validate(&self) -> Result<IntegrityReport> {
        let raw = match read_file(&self.path)? {
            Some(raw) => raw,
            None => {
                return Ok(IntegrityReport {
                    total_lines: 0,
                    valid: 0,
                    corrupt: Vec::new(),
                    torn_tail: false,
                    backup: None,
                })
            }
        };
        Ok(integrity(&raw).0)
    }

    /// Rewrite the log with only its valid events. The original is copied to
    /// `events.jsonl.bak-<timestamp>` first and projection snapshots are
    /// removed, since their byte offsets no longer line up.
    pub fn repair(&self) -> Result<IntegrityReport> {
        let _guard = self.lock()?;
        let raw = match read_file(&self.path)? {
            Some(raw) => raw,
            None => return self.validate(),
        };
        let (mut report, events) = integrity(&raw);
        if report.is_clean() {
            return Ok(report);
        }

        let backup = self.path.with_file_name(format!(
            "{}.bak-{}",
            paths::EVENT_LOG_FILE,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        std::fs::copy(&self.path, &backup)?;

        let mut out = Vec::with_capacity(raw.len());
        for event in &events {
            out.extend(serde_json::to_vec(event)?);
            out.push(b'\n');
        }
        io::atomic_write(&self.path, &out)?;
        self.invalidate_projections()?;

        info!(
            dropped = report.corrupt.len(),
            kept = events.len(),
            backup = %backup.display(),
            "event log repaired"
        );
        report.backup = Some(backup);
        Ok(report)
    }

    fn invalidate_projections(&self) -> Result<()> {
        let dir = paths::projections_dir(&self.root);
        if !dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Bytes from `offset` up to and including the last `\n`, and how many
    /// bytes that is. `None` if the log does not exist.
    fn read_complete(&self, offset: u64) -> Result<Option<(Vec<u8>, u64)>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if offset >= len {
            return Ok(Some((Vec::new(), 0)));
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity((len - offset) as usize);
        file.read_to_end(&mut buf)?;
        let end = buf.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        buf.truncate(end);
        Ok(Some((buf, end as u64)))
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_line(line: &[u8]) -> std::result::Result<Event, String> {
    let text = std::str::from_utf8(line).map_err(|e| format!("invalid utf-8: {e}"))?;
    serde_json::from_str(text).map_err(|e| e.to_string())
}

/// Parse newline-terminated lines. Blank lines are ignored.
fn parse_lines(bytes: &[u8]) -> EventLog {
    let mut log = EventLog::default();
    for (i, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match parse_line(line) {
            Ok(event) => log.events.push(event),
            Err(reason) => {
                warn!(line = i + 1, %reason, "skipping corrupt event line");
                log.corrupt.push(CorruptLine { line: i + 1, reason });
            }
        }
    }
    log
}

/// Classify every line of a whole log, including an unterminated tail.
fn integrity(raw: &[u8]) -> (IntegrityReport, Vec<Event>) {
    let torn_tail = !raw.is_empty() && raw.last() != Some(&b'\n');
    let mut total_lines = 0;
    let mut events = Vec::new();
    let mut corrupt = Vec::new();
    for (i, line) in raw.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        total_lines += 1;
        match parse_line(line) {
            Ok(event) => events.push(event),
            Err(reason) => corrupt.push(CorruptLine { line: i + 1, reason }),
        }
    }
    let report = IntegrityReport {
        total_lines,
        valid: events.len(),
        corrupt,
        torn_tail,
        backup: None,
    };
    (report, events)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> EventStore {
        EventStore::open(dir.path(), &Config::new("test"))
    }

    fn raw_append(store: &EventStore, bytes: &[u8]) {
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(store.path())
            .unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let log = s.read_all().unwrap();
        assert!(log.events.is_empty());
        assert!(log.corrupt.is_empty());
        assert_eq!(s.count().unwrap(), 0);
        assert!(s.validate().unwrap().is_clean());
    }

    #[test]
    fn append_preserves_order() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        for i in 0..5 {
            s.append("task.queued", json!({ "n": i }), None).unwrap();
        }
        let events = s.read_all().unwrap().events;
        let ns: Vec<i64> = events
            .iter()
            .map(|e| e.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn corrupt_lines_are_skipped_and_reported() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.append("a.one", json!({}), None).unwrap();
        raw_append(&s, b"{not json}\n");
        raw_append(&s, b"{\"type\":\"no.id\"}\n");
        raw_append(&s, &[0xff, 0xfe, b'\n']);
        s.append("a.two", json!({}), None).unwrap();

        let log = s.read_all().unwrap();
        assert_eq!(log.events.len(), 2);
        let lines: Vec<usize> = log.corrupt.iter().map(|c| c.line).collect();
        assert_eq!(lines, vec![2, 3, 4]);
    }

    #[test]
    fn torn_tail_is_isolated_on_next_append() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.append("a.one", json!({}), None).unwrap();
        raw_append(&s, b"{\"id\":\"trunc");

        // The torn fragment is not visible to readers.
        assert_eq!(s.read_all().unwrap().events.len(), 1);
        assert!(s.validate().unwrap().torn_tail);

        s.append("a.two", json!({}), None).unwrap();
        let log = s.read_all().unwrap();
        assert_eq!(log.events.len(), 2);
        assert_eq!(log.events[1].event_type, "a.two");
        assert_eq!(log.corrupt.len(), 1);
    }

    #[test]
    fn read_from_resumes_at_offset() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.append("a.one", json!({}), None).unwrap();
        let (first, off) = s.read_from(0).unwrap();
        assert_eq!(first.events.len(), 1);
        assert_eq!(off, s.len().unwrap());

        s.append("a.two", json!({}), None).unwrap();
        raw_append(&s, b"{\"partial\":");
        let (second, off2) = s.read_from(off).unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].event_type, "a.two");
        assert!(off2 < s.len().unwrap());

        let (nothing, off3) = s.read_from(off2).unwrap();
        assert!(nothing.events.is_empty());
        assert_eq!(off3, off2);
    }

    #[test]
    fn oversized_event_rejected() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::new("test");
        cfg.events.max_event_bytes = 200;
        let s = EventStore::open(dir.path(), &cfg);
        let err = s
            .append("a.big", json!({ "blob": "x".repeat(500) }), None)
            .unwrap_err();
        assert!(matches!(err, TriadError::EventTooLarge { limit: 200, .. }));
        assert!(!s.path().exists());
    }

    #[test]
    fn filter_by_prefix() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.append("task.queued", json!({}), None).unwrap();
        s.append("worker.heartbeat", json!({}), None).unwrap();
        s.append("task.completed", json!({}), None).unwrap();
        assert_eq!(s.filter("task").unwrap().len(), 2);
        assert_eq!(s.filter("worker.heartbeat").unwrap().len(), 1);
        assert!(s.filter("tas").unwrap().is_empty());
    }

    #[test]
    fn repair_drops_corrupt_lines_and_keeps_backup() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.append("a.one", json!({}), None).unwrap();
        raw_append(&s, b"garbage\n");
        s.append("a.two", json!({}), None).unwrap();
        raw_append(&s, b"{\"torn");

        let snapshot = paths::projection_path(dir.path(), "event_counts");
        std::fs::create_dir_all(snapshot.parent().unwrap()).unwrap();
        std::fs::write(&snapshot, "{}").unwrap();

        let report = s.repair().unwrap();
        assert_eq!(report.valid, 2);
        assert_eq!(report.corrupt.len(), 2);
        assert!(report.torn_tail);
        let backup = report.backup.unwrap();
        assert!(backup.exists());
        assert!(std::fs::read_to_string(&backup).unwrap().contains("garbage"));
        assert!(!snapshot.exists());

        let after = s.validate().unwrap();
        assert!(after.is_clean());
        assert_eq!(after.valid, 2);
    }

    #[test]
    fn repair_clean_log_is_noop() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.append("a.one", json!({}), None).unwrap();
        let report = s.repair().unwrap();
        assert!(report.is_clean());
        assert!(report.backup.is_none());
    }

    #[test]
    fn concurrent_appenders_never_interleave() {
        let dir = TempDir::new().unwrap();
        let root = Arc::new(dir.path().to_path_buf());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let root = Arc::clone(&root);
                std::thread::spawn(move || {
                    let s = EventStore::open(&root, &Config::new("test"));
                    for i in 0..25 {
                        s.append("load.write", json!({ "t": t, "i": i, "pad": "y".repeat(512) }), None)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = store(&dir);
        let log = s.read_all().unwrap();
        assert_eq!(log.events.len(), 100);
        assert!(log.corrupt.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn read_only_log_fails_without_damage() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.append("a.one", json!({}), None).unwrap();
        let before = std::fs::read(s.path()).unwrap();

        std::fs::set_permissions(s.path(), std::fs::Permissions::from_mode(0o444)).unwrap();
        let result = s.append("a.two", json!({}), None);
        std::fs::set_permissions(s.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        // Root ignores file modes; only assert when the write was refused.
        if result.is_err() {
            assert_eq!(std::fs::read(s.path()).unwrap(), before);
        }
    }
}
