use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use triad_core::config::ConsensusConfig;
use triad_core::consensus::{ConsensusDb, Evaluation, VerificationRequest, Vote};
use triad_core::event::kinds;
use triad_core::event_store::EventStore;
use triad_core::types::Agent;

use crate::envelope::Envelope;
use crate::process::invoke;
use crate::Result;

const VOTE_REASON_CHARS: usize = 500;

// ─── Delegate ─────────────────────────────────────────────────────────────

/// Something that can put a question to an agent and report back.
pub trait Delegate {
    fn ask<'a>(
        &'a self,
        agent: Agent,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Envelope> + Send + 'a>>;
}

/// Delegate backed by the real agent CLIs.
#[derive(Debug, Clone)]
pub struct CliDelegate {
    config: ConsensusConfig,
    timeout: Duration,
    cwd: Option<PathBuf>,
}

impl CliDelegate {
    pub fn new(config: &ConsensusConfig) -> Self {
        Self {
            config: config.clone(),
            timeout: config.timeout(),
            cwd: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

impl Delegate for CliDelegate {
    fn ask<'a>(
        &'a self,
        agent: Agent,
        prompt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Envelope> + Send + 'a>> {
        Box::pin(async move {
            let command = self.config.command_for(agent);
            let started = Instant::now();
            match invoke(agent, &command, prompt, self.timeout, self.cwd.as_deref()).await {
                Ok(inv) => Envelope::from_invocation(&inv),
                Err(e) => {
                    warn!(%agent, error = %e, "delegate failed");
                    Envelope::from_error(agent, &e, started.elapsed())
                }
            }
        })
    }
}

// ─── ConsensusVerifier ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub session_id: String,
    pub evaluation: Evaluation,
    pub envelopes: Vec<Envelope>,
}

/// Runs a full verification: opens a session, asks every agent except the
/// implementer, records their votes and evaluates.
pub struct ConsensusVerifier<D> {
    db: ConsensusDb,
    delegate: D,
    events: Option<EventStore>,
}

impl<D: Delegate> ConsensusVerifier<D> {
    pub fn new(db: ConsensusDb, delegate: D) -> Self {
        Self {
            db,
            delegate,
            events: None,
        }
    }

    /// Also append a `consensus.evaluated` event for each verification.
    pub fn with_events(mut self, events: EventStore) -> Self {
        self.events = Some(events);
        self
    }

    pub fn db(&self) -> &ConsensusDb {
        &self.db
    }

    pub async fn verify(
        &mut self,
        task_id: &str,
        description: &str,
        implementer: Agent,
        scope: &str,
        request: Option<&VerificationRequest>,
    ) -> Result<Verification> {
        let session_id = self
            .db
            .create_session(task_id, description, implementer, scope)?;
        info!(session = %session_id, %implementer, "verification started");

        let prompt = match request {
            Some(req) => req.to_prompt(),
            None => default_prompt(task_id, description, scope),
        };

        let mut envelopes = Vec::new();
        for &agent in Agent::all() {
            if agent == implementer {
                continue;
            }
            let envelope = self.delegate.ask(agent, &prompt).await;
            let vote = envelope.vote();
            let reason: String = envelope.reasoning.chars().take(VOTE_REASON_CHARS).collect();
            self.db.record_vote(
                &session_id,
                agent,
                vote,
                &reason,
                &envelope.trace_id,
                envelope.duration_ms,
            )?;
            match vote {
                Vote::Approve => info!(%agent, "approved"),
                other => warn!(%agent, vote = %other, "did not approve"),
            }
            envelopes.push(envelope);
        }

        let evaluation = self.db.evaluate(&session_id)?;
        info!(session = %session_id, result = %evaluation.result, "verification finished");

        if let Some(events) = &self.events {
            events.append(
                kinds::CONSENSUS_EVALUATED,
                json!({
                    "session_id": session_id,
                    "task_id": task_id,
                    "implementer": implementer,
                    "result": evaluation.result,
                    "approvals": evaluation.approvals,
                    "rejections": evaluation.rejections,
                }),
                Some("consensus".to_string()),
            )?;
        }

        Ok(Verification {
            session_id,
            evaluation,
            envelopes,
        })
    }

    /// Verify using a structured request for scope and summary.
    pub async fn verify_request(
        &mut self,
        task_id: &str,
        implementer: Agent,
        request: &VerificationRequest,
    ) -> Result<Verification> {
        let description = request.change_summary.clone();
        let scope = request.scope.clone();
        self.verify(task_id, &description, implementer, &scope, Some(request))
            .await
    }
}

fn default_prompt(task_id: &str, description: &str, scope: &str) -> String {
    format!(
        "Verify the implementation for task {task_id}: {description}\n\
         Scope: {scope}\n\
         Check for correctness, security issues, edge cases.\n\
         Reply with APPROVE or REJECT followed by your findings."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeStatus;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use triad_core::consensus::ConsensusResult;

    /// Replies with a fixed status and text per agent and records prompts.
    struct Scripted {
        replies: HashMap<Agent, (EnvelopeStatus, &'static str)>,
        asked: Mutex<Vec<Agent>>,
    }

    impl Scripted {
        fn new(replies: &[(Agent, EnvelopeStatus, &'static str)]) -> Self {
            Self {
                replies: replies.iter().map(|(a, s, t)| (*a, (*s, *t))).collect(),
                asked: Mutex::new(Vec::new()),
            }
        }
    }

    impl Delegate for Scripted {
        fn ask<'a>(
            &'a self,
            agent: Agent,
            _prompt: &'a str,
        ) -> Pin<Box<dyn Future<Output = Envelope> + Send + 'a>> {
            Box::pin(async move {
                self.asked.lock().unwrap().push(agent);
                let (status, text) = self.replies[&agent];
                let inv = crate::process::Invocation {
                    agent,
                    output: text.to_string(),
                    exit_code: Some(0),
                    duration: Duration::from_millis(3),
                };
                let mut env = Envelope::from_invocation(&inv);
                env.status = status;
                env
            })
        }
    }

    fn db(dir: &TempDir) -> ConsensusDb {
        ConsensusDb::open(&dir.path().join("c.db"), 2).unwrap()
    }

    #[tokio::test]
    async fn implementer_is_not_asked() {
        let dir = TempDir::new().unwrap();
        let delegate = Scripted::new(&[
            (Agent::Codex, EnvelopeStatus::Success, "APPROVE, tests pass"),
            (Agent::Gemini, EnvelopeStatus::Success, "LGTM"),
        ]);
        let mut v = ConsensusVerifier::new(db(&dir), delegate);
        let out = v.verify("T-9", "login", Agent::Claude, "auth", None).await.unwrap();

        assert_eq!(out.evaluation.result, ConsensusResult::Pass);
        assert_eq!(*v.delegate.asked.lock().unwrap(), vec![Agent::Codex, Agent::Gemini]);
        assert_eq!(v.db().votes(&out.session_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejections_fail() {
        let dir = TempDir::new().unwrap();
        let delegate = Scripted::new(&[
            (Agent::Claude, EnvelopeStatus::Success, "REJECT: missing tests"),
            (Agent::Gemini, EnvelopeStatus::Success, "I reject this"),
        ]);
        let mut v = ConsensusVerifier::new(db(&dir), delegate);
        let out = v.verify("T", "x", Agent::Codex, "", None).await.unwrap();
        assert_eq!(out.evaluation.result, ConsensusResult::Fail);
    }

    #[tokio::test]
    async fn timeout_makes_inconclusive_and_logs_event() {
        let dir = TempDir::new().unwrap();
        let delegate = Scripted::new(&[
            (Agent::Claude, EnvelopeStatus::Success, "APPROVE"),
            (Agent::Codex, EnvelopeStatus::Timeout, ""),
        ]);
        let cfg = triad_core::config::Config::new("t");
        let events = EventStore::open(dir.path(), &cfg);
        let mut v = ConsensusVerifier::new(db(&dir), delegate).with_events(events);
        let req = VerificationRequest {
            scope: "api".into(),
            change_summary: "new endpoint".into(),
            ..Default::default()
        };
        let out = v.verify_request("T", Agent::Gemini, &req).await.unwrap();
        assert_eq!(out.evaluation.result, ConsensusResult::Inconclusive);

        let votes = v.db().votes(&out.session_id).unwrap();
        assert!(votes.iter().any(|vr| vr.vote == Vote::Timeout));
        let session = v.db().get_session(&out.session_id).unwrap();
        assert_eq!(session.description, "new endpoint");

        let logged = EventStore::open(dir.path(), &cfg)
            .filter(kinds::CONSENSUS_EVALUATED)
            .unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].payload_str("result"), Some("INCONCLUSIVE"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_delegate_runs_configured_executable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-agent");
        std::fs::write(&script, "#!/bin/sh\necho \"I definitely APPROVE\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = ConsensusConfig::default();
        cfg.agents.insert(
            Agent::Codex,
            triad_core::config::AgentCommand {
                executable: script.to_string_lossy().into_owned(),
                model: "m".into(),
            },
        );
        let env = CliDelegate::new(&cfg).ask(Agent::Codex, "verify").await;
        assert_eq!(env.status, EnvelopeStatus::Success);
        assert_eq!(env.vote(), Vote::Approve);
        assert_eq!(env.confidence, 0.9);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_delegate_times_out() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("slow-agent");
        std::fs::write(&script, "#!/bin/sh\nsleep 5\necho APPROVE\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut cfg = ConsensusConfig::default();
        cfg.agents.insert(
            Agent::Gemini,
            triad_core::config::AgentCommand {
                executable: script.to_string_lossy().into_owned(),
                model: "m".into(),
            },
        );
        let delegate = CliDelegate::new(&cfg).timeout(Duration::from_millis(200));
        let env = delegate.ask(Agent::Gemini, "verify").await;
        assert_eq!(env.status, EnvelopeStatus::Timeout);
        assert_eq!(env.vote(), Vote::Timeout);
    }
}
