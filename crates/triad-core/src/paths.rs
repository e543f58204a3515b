use crate::error::{Result, TriadError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const TRIAD_DIR: &str = ".triad";
pub const EVENTS_DIR: &str = ".triad/events";
pub const PROJECTIONS_DIR: &str = ".triad/projections";
pub const LOCKS_DIR: &str = ".triad/locks";
pub const WORKERS_DIR: &str = ".triad/workers";
pub const STATE_DIR: &str = ".triad/state";
pub const DB_DIR: &str = ".triad/db";
pub const BATCHES_DIR: &str = ".triad/batches";
pub const REPORTS_DIR: &str = ".triad/reports/consensus";

pub const CONFIG_FILE: &str = ".triad/config.yaml";
pub const EVENT_LOG_FILE: &str = "events.jsonl";
pub const SUPERVISOR_STATE_FILE: &str = "supervisor.json";

pub const QUEUE_DB: &str = "queue.db";
pub const RAG_DB: &str = "rag.db";
pub const CONSENSUS_DB: &str = "consensus.db";

/// Lock guarding appends and rewrites of the event log.
pub const EVENTS_LOCK: &str = "events";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn triad_dir(root: &Path) -> PathBuf {
    root.join(TRIAD_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn events_dir(root: &Path) -> PathBuf {
    root.join(EVENTS_DIR)
}

pub fn event_log_path(root: &Path) -> PathBuf {
    events_dir(root).join(EVENT_LOG_FILE)
}

pub fn projections_dir(root: &Path) -> PathBuf {
    root.join(PROJECTIONS_DIR)
}

pub fn projection_path(root: &Path, name: &str) -> PathBuf {
    projections_dir(root).join(format!("{name}.json"))
}

pub fn locks_dir(root: &Path) -> PathBuf {
    root.join(LOCKS_DIR)
}

pub fn workers_dir(root: &Path) -> PathBuf {
    root.join(WORKERS_DIR)
}

pub fn worker_path(root: &Path, id: &str) -> PathBuf {
    workers_dir(root).join(format!("{id}.json"))
}

pub fn supervisor_state_path(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join(SUPERVISOR_STATE_FILE)
}

pub fn queue_db_path(root: &Path) -> PathBuf {
    root.join(DB_DIR).join(QUEUE_DB)
}

pub fn rag_db_path(root: &Path) -> PathBuf {
    root.join(DB_DIR).join(RAG_DB)
}

pub fn consensus_db_path(root: &Path) -> PathBuf {
    root.join(DB_DIR).join(CONSENSUS_DB)
}

pub fn batches_dir(root: &Path) -> PathBuf {
    root.join(BATCHES_DIR)
}

pub fn reports_dir(root: &Path) -> PathBuf {
    root.join(REPORTS_DIR)
}

/// Every directory `triad init` creates.
pub fn all_dirs(root: &Path) -> Vec<PathBuf> {
    [
        TRIAD_DIR,
        EVENTS_DIR,
        PROJECTIONS_DIR,
        LOCKS_DIR,
        WORKERS_DIR,
        STATE_DIR,
        DB_DIR,
        BATCHES_DIR,
        REPORTS_DIR,
    ]
    .iter()
    .map(|d| root.join(d))
    .collect()
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._\-]*$").expect("static regex"))
}

pub const MAX_NAME_LEN: usize = 64;

/// Validate a name used as a file stem (locks, workers, projections).
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name_re().is_match(name) {
        return Err(TriadError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["events", "worker.w1", "a", "queue_claim", "w-2.lock-x"] {
            validate_name(name).unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
    }

    #[test]
    fn invalid_names() {
        for name in ["", ".hidden", "-dash", "has space", "UPPER", "a/b", "../up"] {
            assert!(validate_name(name).is_err(), "expected invalid: {name}");
        }
        assert!(validate_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/proj/.triad/config.yaml")
        );
        assert_eq!(
            event_log_path(root),
            PathBuf::from("/tmp/proj/.triad/events/events.jsonl")
        );
        assert_eq!(
            worker_path(root, "w1"),
            PathBuf::from("/tmp/proj/.triad/workers/w1.json")
        );
        assert_eq!(
            queue_db_path(root),
            PathBuf::from("/tmp/proj/.triad/db/queue.db")
        );
    }
}
