//! Cross-agent verification sessions.
//!
//! A session is opened for a task by its implementer. The other agents vote;
//! `min_approvals` approvals pass it and as many rejections fail it. Every
//! action is written to an audit table.

use crate::db::{self, parse_opt_ts, parse_ts, ts};
use crate::error::{Result, TriadError};
use crate::io::atomic_write;
use crate::paths;
use crate::types::Agent;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS consensus_sessions (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    implementer TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    completed_at TEXT,
    final_result TEXT NOT NULL DEFAULT 'PENDING'
        CHECK(final_result IN ('PASS', 'FAIL', 'INCONCLUSIVE', 'PENDING')),
    approvals INTEGER NOT NULL DEFAULT 0,
    rejections INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS consensus_votes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES consensus_sessions(id),
    agent TEXT NOT NULL CHECK(agent IN ('claude', 'codex', 'gemini')),
    vote TEXT NOT NULL CHECK(vote IN ('APPROVE', 'REJECT', 'ABSTAIN', 'TIMEOUT', 'ERROR')),
    reason TEXT NOT NULL DEFAULT '',
    evidence TEXT NOT NULL DEFAULT '',
    duration_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, agent)
);

CREATE TABLE IF NOT EXISTS verification_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES consensus_sessions(id),
    action TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_task ON consensus_sessions(task_id);
CREATE INDEX IF NOT EXISTS idx_sessions_result ON consensus_sessions(final_result);
CREATE INDEX IF NOT EXISTS idx_votes_session ON consensus_votes(session_id);
";

const SESSION_COLUMNS: &str = "id, task_id, description, implementer, scope, created_at, \
     completed_at, final_result, approvals, rejections";

// ---------------------------------------------------------------------------
// Vote / ConsensusResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Vote {
    Approve,
    Reject,
    Abstain,
    Timeout,
    Error,
}

impl Vote {
    pub fn as_str(self) -> &'static str {
        match self {
            Vote::Approve => "APPROVE",
            Vote::Reject => "REJECT",
            Vote::Abstain => "ABSTAIN",
            Vote::Timeout => "TIMEOUT",
            Vote::Error => "ERROR",
        }
    }

    /// Timeouts and errors mean the agent never gave an opinion.
    pub fn is_failure(self) -> bool {
        matches!(self, Vote::Timeout | Vote::Error)
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vote {
    type Err = TriadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "APPROVE" => Ok(Vote::Approve),
            "REJECT" => Ok(Vote::Reject),
            "ABSTAIN" => Ok(Vote::Abstain),
            "TIMEOUT" => Ok(Vote::Timeout),
            "ERROR" => Ok(Vote::Error),
            _ => Err(TriadError::InvalidVote(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusResult {
    Pass,
    Fail,
    Inconclusive,
    Pending,
}

impl ConsensusResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsensusResult::Pass => "PASS",
            ConsensusResult::Fail => "FAIL",
            ConsensusResult::Inconclusive => "INCONCLUSIVE",
            ConsensusResult::Pending => "PENDING",
        }
    }

    pub fn is_final(self) -> bool {
        self != ConsensusResult::Pending
    }
}

impl fmt::Display for ConsensusResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsensusResult {
    type Err = TriadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PASS" => Ok(ConsensusResult::Pass),
            "FAIL" => Ok(ConsensusResult::Fail),
            "INCONCLUSIVE" => Ok(ConsensusResult::Inconclusive),
            "PENDING" => Ok(ConsensusResult::Pending),
            _ => Err(TriadError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub task_id: String,
    pub description: String,
    pub implementer: Agent,
    pub scope: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_result: ConsensusResult,
    pub approvals: u32,
    pub rejections: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteRecord {
    pub session_id: String,
    pub agent: Agent,
    pub vote: Vote,
    pub reason: String,
    pub evidence: String,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub session_id: String,
    pub action: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Evaluation {
    pub session_id: String,
    pub result: ConsensusResult,
    pub approvals: u32,
    pub rejections: u32,
    /// Votes that were TIMEOUT or ERROR.
    pub failures: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsensusMetrics {
    pub days: u32,
    pub total_sessions: u64,
    pub passed: u64,
    pub failed: u64,
    pub inconclusive: u64,
    pub pending: u64,
    pub avg_approvals: f64,
    /// Percentage of sessions that passed, one decimal.
    pub pass_rate: f64,
}

/// The structured request every verifier receives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub scope: String,
    pub change_summary: String,
    pub expected_behavior: String,
    pub repro_steps: String,
    pub evidence_to_check: String,
    pub risk_notes: String,
}

impl VerificationRequest {
    pub fn to_prompt(&self) -> String {
        format!(
            "VERIFY:\n\
             - Scope: {}\n\
             - Change summary: {}\n\
             - Expected behavior: {}\n\
             - Repro steps: {}\n\
             - Evidence to check: {}\n\
             - Risk notes: {}\n\
             \n\
             Review the above and respond with:\n\
             - APPROVE if all criteria are met\n\
             - REJECT if any issues found (list all issues)\n\
             - ABSTAIN if unable to verify\n\
             \n\
             Include your reasoning and any evidence checked.",
            self.scope,
            self.change_summary,
            self.expected_behavior,
            self.repro_steps,
            self.evidence_to_check,
            self.risk_notes,
        )
    }
}

// ---------------------------------------------------------------------------
// ConsensusDb
// ---------------------------------------------------------------------------

pub struct ConsensusDb {
    conn: Connection,
    min_approvals: u32,
}

impl ConsensusDb {
    pub fn open(path: &Path, min_approvals: u32) -> Result<Self> {
        let conn = db::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            min_approvals,
        })
    }

    pub fn min_approvals(&self) -> u32 {
        self.min_approvals
    }

    pub fn create_session(
        &mut self,
        task_id: &str,
        description: &str,
        implementer: Agent,
        scope: &str,
    ) -> Result<String> {
        let now = Utc::now();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("CS-{}-{task_id}-{}", now.format("%Y%m%d%H%M%S"), &suffix[..8]);

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO consensus_sessions (id, task_id, description, implementer, scope, \
             created_at, final_result) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING')",
            params![id, task_id, description, implementer.as_str(), scope, ts(now)],
        )?;
        audit(
            &tx,
            &id,
            "SESSION_CREATED",
            &format!("task: {task_id}, implementer: {implementer}"),
        )?;
        tx.commit()?;
        info!(session = %id, task = task_id, "consensus session created");
        Ok(id)
    }

    /// Record or replace `agent`'s vote. The implementer may not vote.
    pub fn record_vote(
        &mut self,
        session_id: &str,
        agent: Agent,
        vote: Vote,
        reason: &str,
        evidence: &str,
        duration_ms: u64,
    ) -> Result<()> {
        let session = self.get_session(session_id)?;
        if session.implementer == agent {
            return Err(TriadError::SelfVote(agent.to_string()));
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO consensus_votes \
             (session_id, agent, vote, reason, evidence, duration_ms, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(session_id, agent) DO UPDATE SET vote = excluded.vote, \
             reason = excluded.reason, evidence = excluded.evidence, \
             duration_ms = excluded.duration_ms, created_at = excluded.created_at",
            params![
                session_id,
                agent.as_str(),
                vote.as_str(),
                reason,
                evidence,
                duration_ms as i64,
                ts(Utc::now())
            ],
        )?;
        tx.execute(
            "UPDATE consensus_sessions SET \
             approvals = (SELECT COUNT(*) FROM consensus_votes \
                          WHERE session_id = ?1 AND vote = 'APPROVE'), \
             rejections = (SELECT COUNT(*) FROM consensus_votes \
                           WHERE session_id = ?1 AND vote = 'REJECT') \
             WHERE id = ?1",
            params![session_id],
        )?;
        audit(
            &tx,
            session_id,
            "VOTE_RECORDED",
            &format!("agent: {agent}, vote: {vote}"),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn evaluate(&mut self, session_id: &str) -> Result<Evaluation> {
        self.get_session(session_id)?;

        let tx = self.conn.transaction()?;
        let (mut approvals, mut rejections, mut failures, mut total) = (0u32, 0u32, 0u32, 0u32);
        {
            let mut stmt = tx.prepare(
                "SELECT vote, COUNT(*) FROM consensus_votes WHERE session_id = ?1 GROUP BY vote",
            )?;
            let rows = stmt.query_map(params![session_id], |r| {
                Ok((parse_col::<Vote>(r, 0)?, r.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (vote, count) = row?;
                let count = count as u32;
                total += count;
                match vote {
                    Vote::Approve => approvals += count,
                    Vote::Reject => rejections += count,
                    v if v.is_failure() => failures += count,
                    _ => {}
                }
            }
        }

        let result = decide(approvals, rejections, failures, total, self.min_approvals);
        let completed_at = result.is_final().then(|| ts(Utc::now()));
        tx.execute(
            "UPDATE consensus_sessions SET final_result = ?1, completed_at = ?2, \
             approvals = ?3, rejections = ?4 WHERE id = ?5",
            params![result.as_str(), completed_at, approvals, rejections, session_id],
        )?;
        audit(
            &tx,
            session_id,
            "CONSENSUS_EVALUATED",
            &format!("result: {result}, approvals: {approvals}, rejections: {rejections}"),
        )?;
        tx.commit()?;

        Ok(Evaluation {
            session_id: session_id.to_string(),
            result,
            approvals,
            rejections,
            failures,
            total,
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        self.conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM consensus_sessions WHERE id = ?1"),
                params![session_id],
                session_from_row,
            )
            .optional()?
            .ok_or_else(|| TriadError::SessionNotFound(session_id.to_string()))
    }

    pub fn list_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM consensus_sessions \
             ORDER BY created_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], session_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn votes(&self, session_id: &str) -> Result<Vec<VoteRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, agent, vote, reason, evidence, duration_ms, created_at \
             FROM consensus_votes WHERE session_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![session_id], |r| {
            Ok(VoteRecord {
                session_id: r.get(0)?,
                agent: parse_col(r, 1)?,
                vote: parse_col(r, 2)?,
                reason: r.get(3)?,
                evidence: r.get(4)?,
                duration_ms: r.get::<_, i64>(5)? as u64,
                created_at: parse_ts(r, 6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn history(&self, session_id: &str) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, action, details, created_at FROM verification_history \
             WHERE session_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![session_id], |r| {
            Ok(AuditEntry {
                session_id: r.get(0)?,
                action: r.get(1)?,
                details: r.get(2)?,
                created_at: parse_ts(r, 3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Outcome counts for sessions created in the last `days` days.
    pub fn metrics(&self, days: u32) -> Result<ConsensusMetrics> {
        let since = ts(Utc::now() - Duration::days(i64::from(days)));
        let (total, passed, failed, inconclusive, pending, avg): (
            i64,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<f64>,
        ) = self.conn.query_row(
            "SELECT COUNT(*), \
                    SUM(CASE WHEN final_result = 'PASS' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN final_result = 'FAIL' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN final_result = 'INCONCLUSIVE' THEN 1 ELSE 0 END), \
                    SUM(CASE WHEN final_result = 'PENDING' THEN 1 ELSE 0 END), \
                    AVG(approvals) \
             FROM consensus_sessions WHERE created_at >= ?1",
            params![since],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?)),
        )?;

        let passed = passed.unwrap_or(0) as u64;
        let pass_rate = if total > 0 {
            (1000.0 * passed as f64 / total as f64).round() / 10.0
        } else {
            0.0
        };
        Ok(ConsensusMetrics {
            days,
            total_sessions: total as u64,
            passed,
            failed: failed.unwrap_or(0) as u64,
            inconclusive: inconclusive.unwrap_or(0) as u64,
            pending: pending.unwrap_or(0) as u64,
            avg_approvals: avg.unwrap_or(0.0),
            pass_rate,
        })
    }

    pub fn report(&self, session_id: &str) -> Result<Report> {
        Ok(Report {
            session: self.get_session(session_id)?,
            votes: self.votes(session_id)?,
            history: self.history(session_id)?,
            min_approvals: self.min_approvals,
            generated_at: Utc::now(),
        })
    }
}

/// Approvals win before rejections; failed votes only make the outcome
/// inconclusive once at least two votes are in.
fn decide(
    approvals: u32,
    rejections: u32,
    failures: u32,
    total: u32,
    min_approvals: u32,
) -> ConsensusResult {
    if approvals >= min_approvals {
        ConsensusResult::Pass
    } else if rejections >= min_approvals {
        ConsensusResult::Fail
    } else if total >= 2 && failures > 0 {
        ConsensusResult::Inconclusive
    } else {
        ConsensusResult::Pending
    }
}

fn audit(conn: &Connection, session_id: &str, action: &str, details: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO verification_history (session_id, action, details, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![session_id, action, details, ts(Utc::now())],
    )?;
    Ok(())
}

fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = TriadError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        task_id: row.get(1)?,
        description: row.get(2)?,
        implementer: parse_col(row, 3)?,
        scope: row.get(4)?,
        created_at: parse_ts(row, 5)?,
        completed_at: parse_opt_ts(row, 6)?,
        final_result: parse_col(row, 7)?,
        approvals: row.get(8)?,
        rejections: row.get(9)?,
    })
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    #[default]
    Text,
    Markdown,
    Json,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Text => "txt",
            ReportFormat::Markdown => "md",
            ReportFormat::Json => "json",
        }
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" => Ok(ReportFormat::Text),
            "markdown" | "md" => Ok(ReportFormat::Markdown),
            "json" => Ok(ReportFormat::Json),
            other => Err(format!("unknown report format: {other} (text, markdown, json)")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub session: Session,
    pub votes: Vec<VoteRecord>,
    pub history: Vec<AuditEntry>,
    #[serde(skip)]
    pub min_approvals: u32,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    pub fn render(&self, format: ReportFormat) -> Result<String> {
        Ok(match format {
            ReportFormat::Text => self.render_text(),
            ReportFormat::Markdown => self.render_markdown(),
            ReportFormat::Json => serde_json::to_string_pretty(self)?,
        })
    }

    fn completed(&self) -> String {
        self.session
            .completed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "N/A".to_string())
    }

    fn render_text(&self) -> String {
        let s = &self.session;
        let rule = "=".repeat(80);
        let thin = "-".repeat(80);
        let mut out = String::new();
        let _ = writeln!(out, "{rule}\nCONSENSUS VERIFICATION REPORT\n{rule}\n");
        let _ = writeln!(out, "Session ID: {}", s.id);
        let _ = writeln!(out, "Generated:  {}\n", self.generated_at.to_rfc3339());
        let _ = writeln!(out, "{thin}\nSESSION\n{thin}");
        let _ = writeln!(out, "Task ID:      {}", s.task_id);
        let _ = writeln!(out, "Description:  {}", s.description);
        let _ = writeln!(out, "Implementer:  {}", s.implementer);
        let _ = writeln!(out, "Scope:        {}", s.scope);
        let _ = writeln!(out, "Final Result: {}", s.final_result);
        let _ = writeln!(out, "Approvals:    {}", s.approvals);
        let _ = writeln!(out, "Rejections:   {}", s.rejections);
        let _ = writeln!(out, "Created:      {}", s.created_at.to_rfc3339());
        let _ = writeln!(out, "Completed:    {}\n", self.completed());

        let _ = writeln!(out, "{thin}\nVOTES\n{thin}");
        if self.votes.is_empty() {
            let _ = writeln!(out, "No votes recorded.");
        }
        for v in &self.votes {
            let _ = writeln!(out, "Agent: {}", v.agent);
            let _ = writeln!(out, "  Vote: {}", v.vote);
            let _ = writeln!(out, "  Reason: {}", truncate(&v.reason, 100));
            let _ = writeln!(out, "  Duration: {}ms", v.duration_ms);
            let _ = writeln!(out, "  Time: {}\n", v.created_at.to_rfc3339());
        }

        let _ = writeln!(out, "\n{thin}\nAUDIT TRAIL\n{thin}");
        if self.history.is_empty() {
            let _ = writeln!(out, "No history recorded.");
        }
        for h in &self.history {
            let _ = writeln!(out, "[{}] {}: {}", h.created_at.to_rfc3339(), h.action, h.details);
        }
        let _ = writeln!(out, "\n{rule}\nEND OF REPORT\n{rule}");
        out
    }

    fn render_markdown(&self) -> String {
        let s = &self.session;
        let mut out = String::new();
        let _ = writeln!(out, "# Consensus Verification Report\n");
        let _ = writeln!(out, "**Session ID:** `{}`", s.id);
        let _ = writeln!(out, "**Generated:** {}\n", self.generated_at.to_rfc3339());
        let _ = writeln!(out, "## Session\n");
        let _ = writeln!(out, "| Field | Value |\n|-------|-------|");
        let _ = writeln!(out, "| Task ID | {} |", s.task_id);
        let _ = writeln!(out, "| Description | {} |", cell(&s.description, 200));
        let _ = writeln!(out, "| Implementer | {} |", s.implementer);
        let _ = writeln!(out, "| Scope | {} |", cell(&s.scope, 200));
        let _ = writeln!(out, "| Final Result | **{}** |", s.final_result);
        let _ = writeln!(out, "| Approvals | {} |", s.approvals);
        let _ = writeln!(out, "| Rejections | {} |", s.rejections);
        let _ = writeln!(out, "| Created | {} |", s.created_at.to_rfc3339());
        let _ = writeln!(out, "| Completed | {} |\n", self.completed());

        let _ = writeln!(out, "## Votes\n");
        let _ = writeln!(
            out,
            "| Agent | Vote | Reason | Duration (ms) | Timestamp |\n\
             |-------|------|--------|---------------|-----------|"
        );
        for v in &self.votes {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                v.agent,
                v.vote,
                cell(&v.reason, 50),
                v.duration_ms,
                v.created_at.to_rfc3339()
            );
        }

        let _ = writeln!(out, "\n## Audit Trail\n");
        let _ = writeln!(out, "| Action | Details | Timestamp |\n|--------|---------|-----------|");
        for h in &self.history {
            let _ = writeln!(
                out,
                "| {} | {} | {} |",
                h.action,
                cell(&h.details, 50),
                h.created_at.to_rfc3339()
            );
        }

        let _ = writeln!(out, "\n## Outcome\n");
        let summary = match s.final_result {
            ConsensusResult::Pass => format!(
                "Verification **PASSED** with {} approvals (minimum {}).",
                s.approvals, self.min_approvals
            ),
            ConsensusResult::Fail => {
                format!("Verification **FAILED** with {} rejections.", s.rejections)
            }
            ConsensusResult::Inconclusive => {
                "Verification was **INCONCLUSIVE**. Manual review is required.".to_string()
            }
            ConsensusResult::Pending => "Verification is still **PENDING**.".to_string(),
        };
        let _ = writeln!(out, "{summary}");
        out
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Single-line, pipe-safe table cell.
fn cell(s: &str, max: usize) -> String {
    truncate(s, max).replace('\n', " ").replace('|', "\\|")
}

/// Render and write `.triad/reports/consensus/<session>.<ext>`.
pub fn save_report(root: &Path, report: &Report, format: ReportFormat) -> Result<PathBuf> {
    let body = report.render(format)?;
    let path = paths::reports_dir(root).join(format!(
        "{}.{}",
        report.session.id,
        format.extension()
    ));
    atomic_write(&path, body.as_bytes())?;
    info!(path = %path.display(), "report saved");
    Ok(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn db(dir: &TempDir) -> ConsensusDb {
        ConsensusDb::open(&dir.path().join("consensus.db"), 2).unwrap()
    }

    #[test]
    fn session_id_format() {
        let dir = TempDir::new().unwrap();
        let mut d = db(&dir);
        let id = d.create_session("T-1", "add login", Agent::Claude, "auth").unwrap();
        let re = regex::Regex::new(r"^CS-\d{14}-T-1-[0-9a-f]{8}$").unwrap();
        assert!(re.is_match(&id), "{id}");
        let s = d.get_session(&id).unwrap();
        assert_eq!(s.final_result, ConsensusResult::Pending);
        assert_eq!(s.implementer, Agent::Claude);
    }

    #[test]
    fn implementer_cannot_vote() {
        let dir = TempDir::new().unwrap();
        let mut d = db(&dir);
        let id = d.create_session("T", "", Agent::Codex, "").unwrap();
        let err = d.record_vote(&id, Agent::Codex, Vote::Approve, "", "", 0).unwrap_err();
        assert!(matches!(err, TriadError::SelfVote(_)));
    }

    #[test]
    fn vote_on_unknown_session() {
        let dir = TempDir::new().unwrap();
        let mut d = db(&dir);
        let err = d
            .record_vote("CS-nope", Agent::Gemini, Vote::Approve, "", "", 0)
            .unwrap_err();
        assert!(matches!(err, TriadError::SessionNotFound(_)));
        assert!(matches!(d.evaluate("CS-nope"), Err(TriadError::SessionNotFound(_))));
    }

    #[test]
    fn two_approvals_pass() {
        let dir = TempDir::new().unwrap();
        let mut d = db(&dir);
        let id = d.create_session("T", "", Agent::Claude, "").unwrap();
        d.record_vote(&id, Agent::Codex, Vote::Approve, "ok", "", 10).unwrap();
        assert_eq!(d.evaluate(&id).unwrap().result, ConsensusResult::Pending);
        d.record_vote(&id, Agent::Gemini, Vote::Approve, "ok", "", 12).unwrap();

        let eval = d.evaluate(&id).unwrap();
        assert_eq!(eval.result, ConsensusResult::Pass);
        assert_eq!(eval.approvals, 2);
        let s = d.get_session(&id).unwrap();
        assert_eq!(s.final_result, ConsensusResult::Pass);
        assert!(s.completed_at.is_some());
    }

    #[test]
    fn two_rejections_fail() {
        let dir = TempDir::new().unwrap();
        let mut d = db(&dir);
        let id = d.create_session("T", "", Agent::Gemini, "").unwrap();
        d.record_vote(&id, Agent::Claude, Vote::Reject, "bug", "", 0).unwrap();
        d.record_vote(&id, Agent::Codex, Vote::Reject, "bug", "", 0).unwrap();
        assert_eq!(d.evaluate(&id).unwrap().result, ConsensusResult::Fail);
        assert_eq!(d.get_session(&id).unwrap().rejections, 2);
    }

    #[test]
    fn timeout_makes_split_inconclusive() {
        let dir = TempDir::new().unwrap();
        let mut d = db(&dir);
        let id = d.create_session("T", "", Agent::Claude, "").unwrap();
        d.record_vote(&id, Agent::Codex, Vote::Approve, "", "", 0).unwrap();
        d.record_vote(&id, Agent::Gemini, Vote::Timeout, "", "", 0).unwrap();
        let eval = d.evaluate(&id).unwrap();
        assert_eq!(eval.result, ConsensusResult::Inconclusive);
        assert_eq!(eval.failures, 1);
    }

    #[test]
    fn revote_replaces_previous() {
        let dir = TempDir::new().unwrap();
        let mut d = db(&dir);
        let id = d.create_session("T", "", Agent::Claude, "").unwrap();
        d.record_vote(&id, Agent::Codex, Vote::Reject, "first", "", 0).unwrap();
        d.record_vote(&id, Agent::Codex, Vote::Approve, "second", "", 0).unwrap();
        let votes = d.votes(&id).unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].vote, Vote::Approve);
        assert_eq!(votes[0].reason, "second");
        let s = d.get_session(&id).unwrap();
        assert_eq!((s.approvals, s.rejections), (1, 0));
    }

    #[test]
    fn history_records_every_action() {
        let dir = TempDir::new().unwrap();
        let mut d = db(&dir);
        let id = d.create_session("T", "", Agent::Claude, "").unwrap();
        d.record_vote(&id, Agent::Codex, Vote::Approve, "", "", 0).unwrap();
        d.evaluate(&id).unwrap();
        let actions: Vec<String> = d.history(&id).unwrap().into_iter().map(|h| h.action).collect();
        assert_eq!(actions, ["SESSION_CREATED", "VOTE_RECORDED", "CONSENSUS_EVALUATED"]);
    }

    #[test]
    fn metrics_pass_rate() {
        let dir = TempDir::new().unwrap();
        let mut d = db(&dir);
        for approve in [true, true, false] {
            let id = d.create_session("T", "", Agent::Claude, "").unwrap();
            let vote = if approve { Vote::Approve } else { Vote::Reject };
            d.record_vote(&id, Agent::Codex, vote, "", "", 0).unwrap();
            d.record_vote(&id, Agent::Gemini, vote, "", "", 0).unwrap();
            d.evaluate(&id).unwrap();
        }
        let m = d.metrics(30).unwrap();
        assert_eq!(m.total_sessions, 3);
        assert_eq!(m.passed, 2);
        assert_eq!(m.failed, 1);
        assert!((m.pass_rate - 66.7).abs() < 1e-9);

        let empty = ConsensusDb::open(&dir.path().join("empty.db"), 2).unwrap();
        assert_eq!(empty.metrics(7).unwrap().pass_rate, 0.0);
    }

    #[test]
    fn verify_prompt_block() {
        let req = VerificationRequest {
            scope: "auth".into(),
            change_summary: "added login".into(),
            ..Default::default()
        };
        let p = req.to_prompt();
        assert!(p.starts_with("VERIFY:\n- Scope: auth\n- Change summary: added login"));
        assert!(p.contains("- APPROVE if all criteria are met"));
    }

    #[test]
    fn reports_render_and_save() {
        let dir = TempDir::new().unwrap();
        let mut d = db(&dir);
        let id = d.create_session("T", "login | flow", Agent::Claude, "").unwrap();
        d.record_vote(&id, Agent::Codex, Vote::Approve, "looks right", "", 5).unwrap();
        d.record_vote(&id, Agent::Gemini, Vote::Approve, "fine", "", 7).unwrap();
        d.evaluate(&id).unwrap();
        let report = d.report(&id).unwrap();

        let text = report.render(ReportFormat::Text).unwrap();
        assert!(text.contains("Final Result: PASS"));
        assert!(text.contains("Agent: codex"));

        let md = report.render(ReportFormat::Markdown).unwrap();
        assert!(md.contains("| Final Result | **PASS** |"));
        assert!(md.contains("login \\| flow"));
        assert!(md.contains("minimum 2"));

        let json: serde_json::Value =
            serde_json::from_str(&report.render(ReportFormat::Json).unwrap()).unwrap();
        assert_eq!(json["session"]["final_result"], "PASS");
        assert_eq!(json["votes"].as_array().unwrap().len(), 2);

        for (fmt, ext) in [
            (ReportFormat::Text, "txt"),
            (ReportFormat::Markdown, "md"),
            (ReportFormat::Json, "json"),
        ] {
            let path = save_report(dir.path(), &report, fmt).unwrap();
            assert_eq!(path.extension().unwrap(), ext);
            assert!(path.starts_with(paths::reports_dir(dir.path())));
        }
    }

    #[test]
    fn parse_votes_and_formats() {
        assert_eq!("approve".parse::<Vote>().unwrap(), Vote::Approve);
        assert!("maybe".parse::<Vote>().is_err());
        assert_eq!("md".parse::<ReportFormat>().unwrap(), ReportFormat::Markdown);
        assert!("pdf".parse::<ReportFormat>().is_err());
    }
}
