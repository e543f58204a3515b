use crate::error::TriadError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    Claude,
    Codex,
    Gemini,
}

impl Agent {
    pub fn all() -> &'static [Agent] {
        &[Agent::Claude, Agent::Codex, Agent::Gemini]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Agent::Claude => "claude",
            Agent::Codex => "codex",
            Agent::Gemini => "gemini",
        }
    }

    /// Model passed on the command line when config does not override it.
    pub fn default_model(self) -> &'static str {
        match self {
            Agent::Claude => "sonnet",
            Agent::Codex => "gpt-5.2-codex",
            Agent::Gemini => "gemini-3-pro-preview",
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Agent {
    type Err = TriadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Agent::Claude),
            "codex" => Ok(Agent::Codex),
            "gemini" => Ok(Agent::Gemini),
            _ => Err(TriadError::InvalidAgent(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Task priority. Lower numeric value means more urgent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    #[serde(rename = "P0")]
    P0,
    #[serde(rename = "P1")]
    P1,
    #[default]
    #[serde(rename = "P2")]
    P2,
    #[serde(rename = "P3")]
    P3,
}

impl Priority {
    pub fn all() -> &'static [Priority] {
        &[Priority::P0, Priority::P1, Priority::P2, Priority::P3]
    }

    pub fn value(self) -> i64 {
        self as i64
    }

    pub fn from_value(v: i64) -> Option<Priority> {
        match v {
            0 => Some(Priority::P0),
            1 => Some(Priority::P1),
            2 => Some(Priority::P2),
            3 => Some(Priority::P3),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Priority::P0 => "P0-CRITICAL",
            Priority::P1 => "P1-HIGH",
            Priority::P2 => "P2-MEDIUM",
            Priority::P3 => "P3-LOW",
        }
    }

    /// One level more urgent, or `None` at P0.
    pub fn promoted(self) -> Option<Priority> {
        match self {
            Priority::P0 => None,
            Priority::P1 => Some(Priority::P0),
            Priority::P2 => Some(Priority::P1),
            Priority::P3 => Some(Priority::P2),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = TriadError;

    /// Accepts `P0`, `critical`, `P0-CRITICAL` and the like, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P0" | "CRITICAL" | "P0-CRITICAL" => Ok(Priority::P0),
            "P1" | "HIGH" | "P1-HIGH" => Ok(Priority::P1),
            "P2" | "MEDIUM" | "P2-MEDIUM" => Ok(Priority::P2),
            "P3" | "LOW" | "P3-LOW" => Ok(Priority::P3),
            _ => Err(TriadError::InvalidPriority(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn all() -> &'static [TaskStatus] {
        &[
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Blocked,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TriadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "blocked" => Ok(TaskStatus::Blocked),
            _ => Err(TriadError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Security,
    Backend,
    Frontend,
    Testing,
    Documentation,
    Devops,
    Refactoring,
    Bugfix,
    Feature,
    #[default]
    Other,
}

impl Category {
    /// Batching order.
    pub fn all() -> &'static [Category] {
        &[
            Category::Security,
            Category::Backend,
            Category::Frontend,
            Category::Testing,
            Category::Documentation,
            Category::Devops,
            Category::Refactoring,
            Category::Bugfix,
            Category::Feature,
            Category::Other,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Security => "security",
            Category::Backend => "backend",
            Category::Frontend => "frontend",
            Category::Testing => "testing",
            Category::Documentation => "documentation",
            Category::Devops => "devops",
            Category::Refactoring => "refactoring",
            Category::Bugfix => "bugfix",
            Category::Feature => "feature",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = TriadError;

    /// Unknown categories fold into `Other` so imported tasks never fail on it.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Ok(Category::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .unwrap_or(Category::Other))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parse_aliases() {
        for (input, expected) in [
            ("P0", Priority::P0),
            ("critical", Priority::P0),
            ("p0-critical", Priority::P0),
            ("HIGH", Priority::P1),
            ("P1-HIGH", Priority::P1),
            (" medium ", Priority::P2),
            ("p3", Priority::P3),
            ("Low", Priority::P3),
        ] {
            assert_eq!(input.parse::<Priority>().unwrap(), expected, "{input}");
        }
        assert!("P4".parse::<Priority>().is_err());
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn priority_order_and_promotion() {
        assert!(Priority::P0 < Priority::P3);
        assert_eq!(Priority::P3.promoted(), Some(Priority::P2));
        assert_eq!(Priority::P0.promoted(), None);
        for p in Priority::all() {
            assert_eq!(Priority::from_value(p.value()), Some(*p));
        }
        assert_eq!(Priority::from_value(9), None);
    }

    #[test]
    fn agent_roundtrip() {
        for a in Agent::all() {
            assert_eq!(a.as_str().parse::<Agent>().unwrap(), *a);
        }
        assert_eq!("CLAUDE".parse::<Agent>().unwrap(), Agent::Claude);
        assert!("gpt".parse::<Agent>().is_err());
    }

    #[test]
    fn status_roundtrip() {
        for s in TaskStatus::all() {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), *s);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn unknown_category_is_other() {
        assert_eq!("Security".parse::<Category>().unwrap(), Category::Security);
        assert_eq!("misc".parse::<Category>().unwrap(), Category::Other);
    }

    #[test]
    fn serde_names() {
        assert_eq!(serde_json::to_string(&Priority::P1).unwrap(), "\"P1\"");
        assert_eq!(serde_json::to_string(&Agent::Gemini).unwrap(), "\"gemini\"");
        assert_eq!(
            serde_json::to_string(&TaskStatus::Completed).unwrap(),
            "\"completed\""
        );
    }
}
