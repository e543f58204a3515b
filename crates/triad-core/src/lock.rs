//! Named, cross-process mutual exclusion over `flock(2)`.
//!
//! Each lock is a file `.triad/locks/<name>.lock`. Holding the exclusive
//! flock on it is holding the lock; the file content only records who holds
//! it for diagnostics. The kernel drops the flock when the holder's file
//! descriptor closes, including on crash, so a dead holder never wedges
//! later acquirers.

use crate::error::{Result, TriadError};
use crate::paths;
use crate::worker::{ProcessProbe, SystemProbe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(100);
const LOCK_EXT: &str = "lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub name: String,
    pub locked: bool,
    pub holder: Option<LockHolder>,
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Holds a lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    file: File,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        #[cfg(unix)]
        {
            let _ = sys::flock(&self.file, libc::LOCK_UN);
        }
        debug!(lock = %self.name, "released");
    }
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: locks_dir.into(),
        }
    }

    pub fn for_root(root: &Path) -> Self {
        Self::new(paths::locks_dir(root))
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{LOCK_EXT}"))
    }

    fn open(&self, name: &str) -> Result<File> {
        paths::validate_name(name)?;
        std::fs::create_dir_all(&self.dir)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path(name))?;
        Ok(file)
    }

    /// Block until the lock is held or `timeout` elapses. Polls with a backoff
    /// that starts at 10 ms and doubles up to 100 ms. A zero timeout makes a
    /// single attempt.
    pub fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let file = self.open(name)?;
        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if try_exclusive(&file)? {
                break;
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(TriadError::LockTimeout {
                    name: name.to_string(),
                    waited,
                });
            }
            debug!(lock = name, ?waited, "waiting for lock");
            std::thread::sleep(backoff.min(timeout - waited));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        let mut guard = LockGuard {
            name: name.to_string(),
            file,
        };
        record_holder(&mut guard.file)?;
        debug!(lock = name, "acquired");
        Ok(guard)
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>> {
        match self.acquire(name, Duration::ZERO) {
            Ok(guard) => Ok(Some(guard)),
            Err(TriadError::LockTimeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Run `f` while holding `name`.
    pub fn with_lock<T>(
        &self,
        name: &str,
        timeout: Duration,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let _guard = self.acquire(name, timeout)?;
        f()
    }

    /// Current holder, or `None` when the lock is free.
    pub fn holder(&self, name: &str) -> Result<Option<LockHolder>> {
        Ok(self.status(name)?.holder)
    }

    /// Judged from the holder record alone: taking even a shared flock here
    /// would make a concurrent `try_acquire` fail. Guards clear the record on
    /// release, and a record whose pid is gone is stale.
    pub fn status(&self, name: &str) -> Result<LockStatus> {
        paths::validate_name(name)?;
        let data = match std::fs::read_to_string(self.lock_path(name)) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let data = data.trim();
        let (locked, holder) = if data.is_empty() {
            (false, None)
        } else {
            match serde_json::from_str::<LockHolder>(data) {
                Ok(h) if SystemProbe.is_alive(h.pid) => (true, Some(h)),
                Ok(h) => {
                    debug!(lock = name, pid = h.pid, "ignoring stale holder record");
                    (false, None)
                }
                // A new holder is midway through writing its record.
                Err(_) => (true, None),
            }
        };
        Ok(LockStatus {
            name: name.to_string(),
            locked,
            holder,
        })
    }

    /// Status of every lock file that exists, sorted by name.
    pub fn list(&self) -> Result<Vec<LockStatus>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        names.iter().map(|n| self.status(n)).collect()
    }
}

fn record_holder(file: &mut File) -> Result<()> {
    let holder = LockHolder {
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    let data = serde_json::to_vec(&holder)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&data)?;
    file.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    /// Returns `Ok(false)` when a non-blocking request would block.
    pub fn flock(file: &File, op: libc::c_int) -> io::Result<bool> {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::Interrupted {
            Ok(false)
        } else {
            Err(err)
        }
    }
}

#[cfg(unix)]
fn try_exclusive(file: &File) -> Result<bool> {
    Ok(sys::flock(file, libc::LOCK_EX | libc::LOCK_NB)?)
}

#[cfg(not(unix))]
fn try_exclusive(_file: &File) -> Result<bool> {
    Err(TriadError::LockUnsupported)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
