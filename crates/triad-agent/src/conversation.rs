//! Multi-turn gemini conversations.
//!
//! A named conversation keeps its turns in
//! `.triad/state/conversations/<name>.json`. Each new prompt quotes the
//! recent turns ahead of itself, and the session id the gemini CLI reports
//! is handed back on the next run with `--resume`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use triad_core::config::AgentCommand;
use triad_core::io::atomic_write;
use triad_core::paths;
use triad_core::types::Agent;

use crate::process::{build_args, invoke_args, Invocation};
use crate::Result;

/// Turns quoted back into the next prompt.
const CONTEXT_TURNS: usize = 10;
/// Each quoted turn is cut to this many characters.
const CONTEXT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Conversation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub name: String,
    /// Session id to pass as `--resume`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resume_id: None,
            turns: Vec::new(),
        }
    }

    /// `prompt` preceded by the last ten turns, or `prompt` alone when there
    /// is no history yet.
    pub fn prompt_with_context(&self, prompt: &str) -> String {
        if self.turns.is_empty() {
            return prompt.to_string();
        }
        let mut parts = vec!["[Conversation History]".to_string()];
        let start = self.turns.len().saturating_sub(CONTEXT_TURNS);
        for turn in &self.turns[start..] {
            let content: String = turn.content.chars().take(CONTEXT_CHARS).collect();
            parts.push(format!("{}: {content}", turn.role.label()));
        }
        parts.push(format!("\nUser: {prompt}"));
        parts.push("\nAssistant:".to_string());
        parts.join("\n\n")
    }

    /// gemini argv for the next turn. The prompt stays the last, positional
    /// argument.
    pub fn args(&self, command: &AgentCommand, prompt: &str, include_context: bool) -> Vec<String> {
        let text = if include_context {
            self.prompt_with_context(prompt)
        } else {
            prompt.to_string()
        };
        let mut args = build_args(Agent::Gemini, command, &text);
        if let Some(id) = &self.resume_id {
            let at = args.len().saturating_sub(1);
            args.splice(at..at, ["--resume".to_string(), id.clone()]);
        }
        args
    }

    pub fn record(&mut self, prompt: &str, reply: &str) {
        let now = Utc::now();
        self.turns.push(Turn {
            role: Role::User,
            content: prompt.to_string(),
            timestamp: now,
        });
        self.turns.push(Turn {
            role: Role::Assistant,
            content: reply.to_string(),
            timestamp: now,
        });
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.resume_id = None;
    }

    /// Run one turn through the gemini CLI.
    ///
    /// A successful run is appended to the history and any session id in the
    /// reply replaces `resume_id`. A failed run leaves the conversation as it
    /// was; the caller decides what to do with the exit code.
    pub async fn send(
        &mut self,
        command: &AgentCommand,
        prompt: &str,
        include_context: bool,
        timeout: Duration,
        cwd: Option<&Path>,
    ) -> Result<Invocation> {
        let args = self.args(command, prompt, include_context);
        let inv = invoke_args(Agent::Gemini, command, &args, timeout, cwd).await?;
        if inv.success() {
            if let Some(id) = extract_session_id(&inv.output) {
                debug!(conversation = %self.name, session = %id, "gemini session id");
                self.resume_id = Some(id);
            }
            self.record(prompt, &inv.output);
        }
        Ok(inv)
    }
}

/// Session id from a `Session ID: <id>` line in gemini output.
pub fn extract_session_id(output: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Session ID: ([A-Za-z0-9-]+)").expect("static regex"))
        .captures(output)
        .map(|c| c[1].to_string())
}

// ─── Store ────────────────────────────────────────────────────────────────

/// Conversation files under `.triad/state/conversations/`, readable by the
/// owner only.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: paths::triad_dir(root).join("state").join("conversations"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Saved conversation, or an empty one when missing or unreadable.
    pub fn load(&self, name: &str) -> Result<Conversation> {
        paths::validate_name(name)?;
        let path = self.path(name);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Conversation::new(name))
            }
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<Conversation>(&data) {
            Ok(mut conv) => {
                conv.name = name.to_string();
                Ok(conv)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable conversation");
                Ok(Conversation::new(name))
            }
        }
    }

    pub fn save(&self, conv: &Conversation) -> Result<()> {
        paths::validate_name(&conv.name)?;
        std::fs::create_dir_all(&self.dir)?;
        restrict(&self.dir, 0o700)?;
        let path = self.path(&conv.name);
        let data = serde_json::to_vec_pretty(conv).map_err(std::io::Error::from)?;
        atomic_write(&path, &data)?;
        restrict(&path, 0o600)
    }

    /// Delete the saved history. Returns false when there was none.
    pub fn clear(&self, name: &str) -> Result<bool> {
        paths::validate_name(name)?;
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Names of saved conversations, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gemini(exe: &str) -> AgentCommand {
        AgentCommand {
            executable: exe.into(),
            model: "gemini-2.5-pro".into(),
        }
    }

    #[test]
    fn first_prompt_is_sent_bare() {
        let conv = Conversation::new("c");
        assert_eq!(conv.prompt_with_context("Hello"), "Hello");
        assert_eq!(
            conv.args(&gemini("gemini"), "Hello", true),
            ["-m", "gemini-2.5-pro", "--approval-mode", "yolo", "Hello"]
        );
    }

    #[test]
    fn context_quotes_last_ten_turns_truncated() {
        let mut conv = Conversation::new("c");
        for i in 0..6 {
            conv.record(&format!("q{i}"), &"a".repeat(600));
        }
        let prompt = conv.prompt_with_context("next");
        assert!(prompt.starts_with("[Conversation History]\n\nUser: q1\n\n"));
        assert!(!prompt.contains("q0"));
        assert!(prompt.contains(&format!("Assistant: {}\n", "a".repeat(500))));
        assert!(!prompt.contains(&"a".repeat(501)));
        assert!(prompt.ends_with("\n\nUser: next\n\n\nAssistant:"));
    }

    #[test]
    fn resume_id_precedes_prompt() {
        let mut conv = Conversation::new("c");
        conv.resume_id = Some("test-session-123".into());
        let args = conv.args(&gemini("gemini"), "Hello", false);
        assert_eq!(
            args,
            [
                "-m",
                "gemini-2.5-pro",
                "--approval-mode",
                "yolo",
                "--resume",
                "test-session-123",
                "Hello"
            ]
        );
    }

    #[test]
    fn session_id_extraction() {
        assert_eq!(
            extract_session_id("done\nSession ID: abc-123\n").as_deref(),
            Some("abc-123")
        );
        assert_eq!(extract_session_id("no id here"), None);
    }

    #[test]
    fn store_round_trip_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::new(dir.path());
        assert!(store.load("review").unwrap().turns.is_empty());
        assert!(store.list().unwrap().is_empty());

        let mut conv = store.load("review").unwrap();
        conv.record("Hello", "Hi there");
        conv.resume_id = Some("s-1".into());
        store.save(&conv).unwrap();

        let loaded = store.load("review").unwrap();
        assert_eq!(loaded, conv);
        assert_eq!(store.list().unwrap(), ["review"]);

        assert!(store.clear("review").unwrap());
        assert!(!store.clear("review").unwrap());
        assert!(store.load("review").unwrap().turns.is_empty());
    }

    #[test]
    fn unreadable_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::new(dir.path());
        std::fs::create_dir_all(store.path("x").parent().unwrap()).unwrap();
        std::fs::write(store.path("x"), "not json").unwrap();
        assert_eq!(store.load("x").unwrap(), Conversation::new("x"));
    }

    #[test]
    fn bad_names_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::new(dir.path());
        assert!(store.load("../escape").is_err());
        assert!(store.save(&Conversation::new("Bad Name")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = ConversationStore::new(dir.path());
        store.save(&Conversation::new("private")).unwrap();
        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(store.path("private").as_path()), 0o600);
        assert_eq!(mode(store.path("private").parent().unwrap()), 0o700);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn send_records_turns_and_resumes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("gemini.sh");
        let argv_log = dir.path().join("argv.log");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nprintf '%s\\n' \"$@\" >> {}\necho 'reply text'\necho 'Session ID: sess-42'\n",
                argv_log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let command = gemini(&script.to_string_lossy());

        let mut conv = Conversation::new("c");
        let inv = conv
            .send(&command, "first", true, Duration::from_secs(10), None)
            .await
            .unwrap();
        assert!(inv.success());
        assert_eq!(conv.resume_id.as_deref(), Some("sess-42"));
        assert_eq!(conv.turns.len(), 2);
        assert_eq!(conv.turns[0].content, "first");
        assert_eq!(conv.turns[1].role, Role::Assistant);

        conv.send(&command, "second", true, Duration::from_secs(10), None)
            .await
            .unwrap();
        let argv = std::fs::read_to_string(&argv_log).unwrap();
        assert!(argv.contains("--resume\nsess-42\n"));
        assert!(argv.contains("[Conversation History]"));
        assert_eq!(conv.turns.len(), 4);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_send_leaves_history_alone() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("gemini.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'Connection refused' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut conv = Conversation::new("c");
        let inv = conv
            .send(&gemini(&script.to_string_lossy()), "Hello", true, Duration::from_secs(10), None)
            .await
            .unwrap();
        assert!(!inv.success());
        assert_eq!(inv.output, "Connection refused");
        assert!(conv.turns.is_empty());
        assert!(conv.resume_id.is_none());
    }
}
