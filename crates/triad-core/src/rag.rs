//! Full-text context store for retrieval-augmented prompts.
//!
//! Contexts live in a plain table mirrored into an external-content FTS5
//! index by triggers. Files are tracked by SHA-256 so re-ingesting an
//! unchanged tree does no work.

use crate::config::RagConfig;
use crate::db::{self, parse_opt_ts, parse_ts, ts};
use crate::error::{Result, TriadError};
use crate::paths;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS contexts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    content TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS contexts_fts USING fts5(
    content,
    summary,
    tags,
    content='contexts',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS contexts_ai AFTER INSERT ON contexts BEGIN
    INSERT INTO contexts_fts(rowid, content, summary, tags)
    VALUES (new.id, new.content, new.summary, new.tags);
END;

CREATE TRIGGER IF NOT EXISTS contexts_ad AFTER DELETE ON contexts BEGIN
    INSERT INTO contexts_fts(contexts_fts, rowid, content, summary, tags)
    VALUES ('delete', old.id, old.content, old.summary, old.tags);
END;

CREATE TRIGGER IF NOT EXISTS contexts_au AFTER UPDATE ON contexts BEGIN
    INSERT INTO contexts_fts(contexts_fts, rowid, content, summary, tags)
    VALUES ('delete', old.id, old.content, old.summary, old.tags);
    INSERT INTO contexts_fts(rowid, content, summary, tags)
    VALUES (new.id, new.content, new.summary, new.tags);
END;

CREATE TABLE IF NOT EXISTS indexed_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filepath TEXT UNIQUE NOT NULL,
    content_hash TEXT NOT NULL,
    file_size INTEGER,
    context_id INTEGER,
    indexed_at TEXT NOT NULL,
    FOREIGN KEY (context_id) REFERENCES contexts(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_contexts_source ON contexts(source);
";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Context {
    pub id: i64,
    pub source: String,
    pub content: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub source: String,
    pub summary: String,
    pub snippet: String,
    /// bm25 score; lower is more relevant.
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Unsupported,
    Empty,
    TooLarge,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Indexed { context_id: i64 },
    Unchanged,
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub scanned: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    /// Stopped early at `max_files`.
    pub truncated: bool,
    pub errors: Vec<IngestError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestError {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagStats {
    pub contexts: u64,
    pub indexed_files: u64,
    pub indexed_bytes: u64,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// RagStore
// ---------------------------------------------------------------------------

pub struct RagStore {
    conn: Connection,
    config: RagConfig,
}

impl RagStore {
    pub fn open(path: &Path, config: &RagConfig) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            config: config.clone(),
        })
    }

    pub fn add_context(
        &self,
        source: &str,
        content: &str,
        summary: Option<&str>,
        tags: &[String],
    ) -> Result<i64> {
        insert_context(&self.conn, source, content, summary.unwrap_or(""), tags)
    }

    pub fn get(&self, id: i64) -> Result<Context> {
        self.conn
            .query_row(
                "SELECT id, source, content, summary, tags, created_at, updated_at \
                 FROM contexts WHERE id = ?1",
                params![id],
                context_from_row,
            )
            .optional()?
            .ok_or(TriadError::ContextNotFound(id))
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        let n = self.conn.execute("DELETE FROM contexts WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(TriadError::ContextNotFound(id));
        }
        Ok(())
    }

    /// Ranked full-text search. The query is split into words and each word
    /// is quoted, so FTS operators in user input are matched literally. Any
    /// word may match; more matching words rank higher.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let Some(fts_query) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.source, c.summary, \
                    snippet(contexts_fts, 0, '[', ']', '...', 16) AS snippet, \
                    bm25(contexts_fts) AS score \
             FROM contexts_fts \
             JOIN contexts c ON c.id = contexts_fts.rowid \
             WHERE contexts_fts MATCH ?1 \
             ORDER BY score \
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![fts_query, limit as i64], |row| {
            Ok(SearchHit {
                id: row.get(0)?,
                source: row.get(1)?,
                summary: row.get(2)?,
                snippet: row.get(3)?,
                score: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn should_index(&self, path: &Path) -> bool {
        should_index(path, &self.config)
    }

    /// Index one file, replacing the context of an earlier version.
    pub fn ingest_file(&mut self, path: &Path) -> Result<IngestOutcome> {
        let key = path.to_string_lossy().into_owned();
        if !self.should_index(path) {
            return self.reject(&key, SkipReason::Unsupported);
        }
        let size = std::fs::metadata(path)?.len();
        if size == 0 {
            return self.reject(&key, SkipReason::Empty);
        }
        if size > self.config.max_file_bytes {
            return self.reject(&key, SkipReason::TooLarge);
        }

        let bytes = std::fs::read(path)?;
        let hash = hex::encode(Sha256::digest(&bytes));

        let previous: Option<(String, Option<i64>)> = self
            .conn
            .query_row(
                "SELECT content_hash, context_id FROM indexed_files WHERE filepath = ?1",
                params![key],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        if let Some((old_hash, Some(_))) = &previous {
            if *old_hash == hash {
                return Ok(IngestOutcome::Unchanged);
            }
        }

        let Ok(content) = String::from_utf8(bytes) else {
            return self.reject(&key, SkipReason::Binary);
        };

        let tx = self.conn.transaction()?;
        if let Some((_, Some(old_id))) = previous {
            tx.execute("DELETE FROM contexts WHERE id = ?1", params![old_id])?;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.clone());
        let mut tags = vec!["file".to_string()];
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            tags.push(ext.to_string());
        }
        let context_id = insert_context(&tx, &key, &content, &format!("file: {name}"), &tags)?;
        tx.execute(
            "INSERT INTO indexed_files (filepath, content_hash, file_size, context_id, indexed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(filepath) DO UPDATE SET content_hash = excluded.content_hash, \
             file_size = excluded.file_size, context_id = excluded.context_id, \
             indexed_at = excluded.indexed_at",
            params![key, hash, size as i64, context_id, ts(Utc::now())],
        )?;
        tx.commit()?;
        debug!(path = %key, context_id, "indexed");
        Ok(IngestOutcome::Indexed { context_id })
    }

    /// Skip a file, dropping whatever an earlier version of it left in the
    /// index.
    fn reject(&mut self, key: &str, reason: SkipReason) -> Result<IngestOutcome> {
        let tx = self.conn.transaction()?;
        let previous: Option<Option<i64>> = tx
            .query_row(
                "SELECT context_id FROM indexed_files WHERE filepath = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(context_id) = previous {
            if let Some(id) = context_id {
                tx.execute("DELETE FROM contexts WHERE id = ?1", params![id])?;
            }
            tx.execute("DELETE FROM indexed_files WHERE filepath = ?1", params![key])?;
            debug!(path = key, ?reason, "dropped stale index entry");
        }
        tx.commit()?;
        Ok(skipped(reason))
    }

    /// Walk `dir` in sorted order, pruning excluded directories, and ingest
    /// up to `max_files` indexable files. Per-file errors are collected, not
    /// fatal.
    pub fn ingest_directory(&mut self, dir: &Path) -> Result<IngestReport> {
        let excluded = self.config.excluded_dirs.clone();
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| {
                if e.depth() == 0 || !e.file_type().is_dir() {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                name != paths::TRIAD_DIR && !excluded.iter().any(|x| *x == name)
            });

        let mut report = IngestReport::default();
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    report.errors.push(IngestError {
                        path: e.path().map(Path::to_path_buf).unwrap_or_default(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.should_index(entry.path()) {
                continue;
            }
            if report.scanned >= self.config.max_files {
                report.truncated = true;
                break;
            }
            report.scanned += 1;
            match self.ingest_file(entry.path()) {
                Ok(IngestOutcome::Indexed { .. }) => report.indexed += 1,
                Ok(IngestOutcome::Unchanged) => report.unchanged += 1,
                Ok(IngestOutcome::Skipped { .. }) => report.skipped += 1,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "ingest failed");
                    report.errors.push(IngestError {
                        path: entry.path().to_path_buf(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    pub fn stats(&self) -> Result<RagStats> {
        let contexts: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM contexts", [], |r| r.get(0))?;
        let (files, bytes): (i64, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), SUM(file_size) FROM indexed_files",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let last = self.conn.query_row(
            "SELECT MAX(indexed_at) FROM indexed_files",
            [],
            |r| parse_opt_ts(r, 0),
        )?;
        Ok(RagStats {
            contexts: contexts as u64,
            indexed_files: files as u64,
            indexed_bytes: bytes.unwrap_or(0) as u64,
            last_indexed_at: last,
        })
    }

    /// Regenerate the FTS index from the contexts table.
    pub fn rebuild_index(&self) -> Result<()> {
        self.conn
            .execute("INSERT INTO contexts_fts(contexts_fts) VALUES ('rebuild')", [])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn skipped(reason: SkipReason) -> IngestOutcome {
    IngestOutcome::Skipped { reason }
}

fn insert_context(
    conn: &Connection,
    source: &str,
    content: &str,
    summary: &str,
    tags: &[String],
) -> Result<i64> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO contexts (source, content, summary, tags, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![source, content, summary, tags.join(","), now],
    )?;
    Ok(conn.last_insert_rowid())
}

fn context_from_row(row: &Row<'_>) -> rusqlite::Result<Context> {
    let tags: String = row.get(4)?;
    Ok(Context {
        id: row.get(0)?,
        source: row.get(1)?,
        content: row.get(2)?,
        summary: row.get(3)?,
        tags: tags
            .split(',')
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
        created_at: parse_ts(row, 5)?,
        updated_at: parse_ts(row, 6)?,
    })
}

/// Quote each word of a free-text query for FTS5 MATCH. `None` when the
/// query has no searchable words.
fn fts_query(query: &str) -> Option<String> {
    let words: Vec<String> = query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\""))
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" OR "))
    }
}

/// Lowercase hex SHA-256 of a file's content.
pub fn file_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Indexable by extension or by exact special file name (`Makefile`...).
pub fn should_index(path: &Path, config: &RagConfig) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if config.special_files.iter().any(|s| s == name) {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| config.extensions.iter().any(|x| x.eq_ignore_ascii_case(ext)))
}

/// Crontab line for re-ingesting every `interval_minutes`.
pub fn cron_schedule(interval_minutes: u32) -> String {
    let m = interval_minutes.max(1);
    if m < 60 {
        format!("*/{m} * * * *")
    } else if m == 60 {
        "0 * * * *".to_string()
    } else if m < 1440 {
        format!("0 */{} * * *", m / 60)
    } else {
        "0 0 * * *".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> RagStore {
        RagStore::open(&dir.path().join("rag.db"), &RagConfig::default()).unwrap()
    }

    #[test]
    fn add_get_search() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let id = s
            .add_context("notes", "The supervisor reaps zombie workers", Some("ops"), &["ops".into()])
            .unwrap();
        s.add_context("notes", "Projections rebuild from the event log", None, &[])
            .unwrap();

        let ctx = s.get(id).unwrap();
        assert_eq!(ctx.tags, vec!["ops".to_string()]);

        let hits = s.search("zombie", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!(hits[0].snippet.contains("[zombie]"));
    }

    #[test]
    fn search_ranks_more_matches_first() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.add_context("a", "lock timeout", None, &[]).unwrap();
        let both = s.add_context("b", "lock timeout deadlock lock", None, &[]).unwrap();
        s.add_context("c", "unrelated text", None, &[]).unwrap();
        let hits = s.search("deadlock lock", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, both);
    }

    #[test]
    fn fts_syntax_is_neutralized() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.add_context("a", "alpha beta", None, &[]).unwrap();
        for q in ["alpha AND", "\"alpha", "alpha*) OR (", "NEAR(alpha", "content:alpha"] {
            assert!(s.search(q, 10).is_ok(), "{q}");
        }
        assert!(s.search("   ***  ", 10).unwrap().is_empty());
    }

    #[test]
    fn delete_removes_from_index() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let id = s.add_context("a", "ephemeral", None, &[]).unwrap();
        s.delete(id).unwrap();
        assert!(s.search("ephemeral", 10).unwrap().is_empty());
        assert!(matches!(s.get(id), Err(TriadError::ContextNotFound(_))));
    }

    #[test]
    fn hash_is_sha256_hex() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("f.txt");
        std::fs::write(&p, b"This is test content").unwrap();
        let h = file_hash(&p).unwrap();
        assert_eq!(h.len(), 64);
        assert_eq!(h, hex::encode(Sha256::digest(b"This is test content")));
    }

    #[test]
    fn extension_filter() {
        let cfg = RagConfig::default();
        for ok in ["a.py", "b.md", "c.SQL", "Makefile", "dir/Dockerfile", "x.yaml"] {
            assert!(should_index(Path::new(ok), &cfg), "{ok}");
        }
        for no in ["a.exe", "b.png", "noext", "makefile", "c.mp3"] {
            assert!(!should_index(Path::new(no), &cfg), "{no}");
        }
    }

    #[test]
    fn ingest_detects_changes() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        let f = dir.path().join("notes.md");
        std::fs::write(&f, "original content").unwrap();

        let first = s.ingest_file(&f).unwrap();
        assert!(matches!(first, IngestOutcome::Indexed { .. }));
        assert_eq!(s.ingest_file(&f).unwrap(), IngestOutcome::Unchanged);

        std::fs::write(&f, "modified content").unwrap();
        assert!(matches!(s.ingest_file(&f).unwrap(), IngestOutcome::Indexed { .. }));
        assert!(s.search("original", 10).unwrap().is_empty());
        assert_eq!(s.search("modified", 10).unwrap().len(), 1);
        assert_eq!(s.stats().unwrap().contexts, 1);
    }

    #[test]
    fn file_that_becomes_unindexable_leaves_index() {
        let dir = TempDir::new().unwrap();
        let mut s = store(&dir);
        let f = dir.path().join("notes.md");
        std::fs::write(&f, "searchable words").unwrap();
        assert!(matches!(s.ingest_file(&f).unwrap(), IngestOutcome::Indexed { .. }));

        std::fs::write(&f, [0xff, 0xfe, 0x00, 0x01]).unwrap();
        assert_eq!(s.ingest_file(&f).unwrap(), skipped(SkipReason::Binary));
        assert!(s.search("searchable", 10).unwrap().is_empty());
        let stats = s.stats().unwrap();
        assert_eq!(stats.contexts, 0);
        assert_eq!(stats.indexed_files, 0);

        std::fs::write(&f, "").unwrap();
        assert_eq!(s.ingest_file(&f).unwrap(), skipped(SkipReason::Empty));
        std::fs::write(&f, "searchable again").unwrap();
        assert!(matches!(s.ingest_file(&f).unwrap(), IngestOutcome::Indexed { .. }));
        assert_eq!(s.search("searchable", 10).unwrap().len(), 1);
    }

    #[test]
    fn ingest_skips_empty_large_and_unsupported() {
        let dir = TempDir::new().unwrap();
        let cfg = RagConfig {
            max_file_bytes: 10,
            ..RagConfig::default()
        };
        let mut s = RagStore::open(&dir.path().join("rag.db"), &cfg).unwrap();
        let empty = dir.path().join("empty.py");
        let big = dir.path().join("big.py");
        let image = dir.path().join("pic.png");
        std::fs::write(&empty, "").unwrap();
        std::fs::write(&big, "x".repeat(11)).unwrap();
        std::fs::write(&image, "data").unwrap();

        assert_eq!(s.ingest_file(&empty).unwrap(), skipped(SkipReason::Empty));
        assert_eq!(s.ingest_file(&big).unwrap(), skipped(SkipReason::TooLarge));
        assert_eq!(s.ingest_file(&image).unwrap(), skipped(SkipReason::Unsupported));
    }

    #[test]
    fn directory_walk_prunes_and_limits() {
        let dir = TempDir::new().unwrap();
        let tree = dir.path().join("tree");
        for sub in ["src", ".git", "node_modules/pkg", "__pycache__", "venv"] {
            std::fs::create_dir_all(tree.join(sub)).unwrap();
        }
        std::fs::write(tree.join("src/a.py"), "print(1)").unwrap();
        std::fs::write(tree.join("src/b.py"), "print(2)").unwrap();
        std::fs::write(tree.join("Makefile"), "all:").unwrap();
        std::fs::write(tree.join(".git/config.json"), "{}").unwrap();
        std::fs::write(tree.join("node_modules/pkg/index.js"), "x").unwrap();
        std::fs::write(tree.join("__pycache__/c.py"), "x").unwrap();
        std::fs::write(tree.join("venv/d.py"), "x").unwrap();

        let mut s = store(&dir);
        let report = s.ingest_directory(&tree).unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.indexed, 3);
        assert!(!report.truncated);

        let again = s.ingest_directory(&tree).unwrap();
        assert_eq!(again.unchanged, 3);

        let capped = RagConfig {
            max_files: 2,
            ..RagConfig::default()
        };
        let mut limited = RagStore::open(&dir.path().join("limited.db"), &capped).unwrap();
        let report = limited.ingest_directory(&tree).unwrap();
        assert_eq!(report.indexed, 2);
        assert!(report.truncated);
    }

    #[test]
    fn rebuild_keeps_results() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.add_context("a", "persistent words", None, &[]).unwrap();
        s.rebuild_index().unwrap();
        assert_eq!(s.search("persistent", 5).unwrap().len(), 1);
    }

    #[test]
    fn cron_expressions() {
        assert_eq!(cron_schedule(15), "*/15 * * * *");
        assert_eq!(cron_schedule(60), "0 * * * *");
        assert_eq!(cron_schedule(180), "0 */3 * * *");
        assert_eq!(cron_schedule(1440), "0 0 * * *");
        assert_eq!(cron_schedule(0), "*/1 * * * *");
    }
}
