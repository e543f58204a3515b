use std::time::Duration;

use serde::{Deserialize, Serialize};
use triad_core::consensus::Vote;
use triad_core::types::Agent;

use crate::decision::{confidence, extract_decision};
use crate::process::Invocation;
use crate::AgentError;

const REASONING_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Success,
    Error,
    Timeout,
}

/// Uniform JSON result of asking one agent something.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub model: Agent,
    pub status: EnvelopeStatus,
    pub decision: Vote,
    pub confidence: f64,
    pub reasoning: String,
    pub output: String,
    pub trace_id: String,
    pub duration_ms: u64,
}

impl Envelope {
    pub fn from_invocation(inv: &Invocation) -> Self {
        let status = if inv.success() {
            EnvelopeStatus::Success
        } else {
            EnvelopeStatus::Error
        };
        Self {
            model: inv.agent,
            status,
            decision: extract_decision(&inv.output),
            confidence: confidence(&inv.output),
            reasoning: inv.output.chars().take(REASONING_CHARS).collect(),
            output: inv.output.clone(),
            trace_id: trace_id(),
            duration_ms: inv.duration.as_millis() as u64,
        }
    }

    pub fn from_error(agent: Agent, err: &AgentError, elapsed: Duration) -> Self {
        let status = match err {
            AgentError::Timeout { .. } => EnvelopeStatus::Timeout,
            _ => EnvelopeStatus::Error,
        };
        Self {
            model: agent,
            status,
            decision: Vote::Abstain,
            confidence: 0.0,
            reasoning: err.to_string(),
            output: String::new(),
            trace_id: trace_id(),
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    /// The vote this envelope casts in a consensus session.
    pub fn vote(&self) -> Vote {
        match self.status {
            EnvelopeStatus::Success => self.decision,
            EnvelopeStatus::Timeout => Vote::Timeout,
            EnvelopeStatus::Error => Vote::Error,
        }
    }
}

fn trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(output: &str, code: Option<i32>) -> Invocation {
        Invocation {
            agent: Agent::Gemini,
            output: output.into(),
            exit_code: code,
            duration: Duration::from_millis(1500),
        }
    }

    #[test]
    fn success_envelope_fields() {
        let env = Envelope::from_invocation(&inv("I definitely APPROVE", Some(0)));
        assert_eq!(env.status, EnvelopeStatus::Success);
        assert_eq!(env.vote(), Vote::Approve);
        assert_eq!(env.confidence, 0.9);
        assert_eq!(env.duration_ms, 1500);

        let json = serde_json::to_value(&env).unwrap();
        for key in ["model", "status", "decision", "confidence", "reasoning", "output", "trace_id", "duration_ms"] {
            assert!(json.get(key).is_some(), "{key}");
        }
        assert_eq!(json["model"], "gemini");
        assert_eq!(json["decision"], "APPROVE");
    }

    #[test]
    fn nonzero_exit_votes_error() {
        let env = Envelope::from_invocation(&inv("APPROVE", Some(2)));
        assert_eq!(env.status, EnvelopeStatus::Error);
        assert_eq!(env.vote(), Vote::Error);
    }

    #[test]
    fn timeout_votes_timeout() {
        let err = AgentError::Timeout {
            agent: Agent::Codex,
            after: Duration::from_secs(3),
        };
        let env = Envelope::from_error(Agent::Codex, &err, Duration::from_secs(3));
        assert_eq!(env.status, EnvelopeStatus::Timeout);
        assert_eq!(env.vote(), Vote::Timeout);
        assert!(env.reasoning.contains("timed out"));
    }

    #[test]
    fn reasoning_is_truncated() {
        let long = "x".repeat(2000);
        let env = Envelope::from_invocation(&inv(&long, Some(0)));
        assert_eq!(env.reasoning.len(), REASONING_CHARS);
        assert_eq!(env.output.len(), 2000);
    }
}
