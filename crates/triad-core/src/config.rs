use crate::error::{Result, TriadError};
use crate::paths;
use crate::types::Agent;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// EventsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,
    #[serde(default = "default_events_lock_timeout")]
    pub lock_timeout_secs: u64,
}

fn default_max_event_bytes() -> usize {
    1024 * 1024
}

fn default_events_lock_timeout() -> u64 {
    10
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_event_bytes: default_max_event_bytes(),
            lock_timeout_secs: default_events_lock_timeout(),
        }
    }
}

impl EventsConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// LocksConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    #[serde(default = "default_lock_timeout")]
    pub default_timeout_secs: u64,
}

fn default_lock_timeout() -> u64 {
    30
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_lock_timeout(),
        }
    }
}

impl LocksConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// SupervisorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_progress_timeout")]
    pub progress_timeout_secs: u64,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_true")]
    pub kill_unhealthy: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_progress_timeout() -> u64 {
    900
}

fn default_max_workers() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_task_timeout() -> u64 {
    600
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            progress_timeout_secs: default_progress_timeout(),
            max_workers: default_max_workers(),
            kill_unhealthy: default_true(),
            poll_interval_ms: default_poll_interval(),
            task_timeout_secs: default_task_timeout(),
        }
    }
}

impl SupervisorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

/// Hours a pending task waits at one level before it is promoted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostThresholds {
    #[serde(default = "default_p3_to_p2")]
    pub p3_to_p2_hours: u64,
    #[serde(default = "default_p2_to_p1")]
    pub p2_to_p1_hours: u64,
    #[serde(default = "default_p1_to_p0")]
    pub p1_to_p0_hours: u64,
}

fn default_p3_to_p2() -> u64 {
    4
}

fn default_p2_to_p1() -> u64 {
    8
}

fn default_p1_to_p0() -> u64 {
    24
}

impl Default for BoostThresholds {
    fn default() -> Self {
        Self {
            p3_to_p2_hours: default_p3_to_p2(),
            p2_to_p1_hours: default_p2_to_p1(),
            p1_to_p0_hours: default_p1_to_p0(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub boost: BoostThresholds,
    #[serde(default = "default_batch_size_limit")]
    pub batch_size_limit: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_batch_size_limit() -> usize {
    10
}

fn default_max_retries() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            boost: BoostThresholds::default(),
            batch_size_limit: default_batch_size_limit(),
            max_retries: default_max_retries(),
        }
    }
}

// ---------------------------------------------------------------------------
// RagConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_special_files")]
    pub special_files: Vec<String>,
    #[serde(default = "default_excluded_dirs")]
    pub excluded_dirs: Vec<String>,
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_extensions() -> Vec<String> {
    strings(&["sh", "py", "js", "ts", "md", "json", "yaml", "sql"])
}

fn default_special_files() -> Vec<String> {
    strings(&["Makefile", "Dockerfile", "Gemfile"])
}

fn default_excluded_dirs() -> Vec<String> {
    strings(&[".git", "node_modules", "__pycache__", ".venv", "venv", "target"])
}

fn default_max_files() -> usize {
    1000
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            special_files: default_special_files(),
            excluded_dirs: default_excluded_dirs(),
            max_files: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConsensusConfig
// ---------------------------------------------------------------------------

/// How to invoke one agent CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub executable: String,
    pub model: String,
}

impl AgentCommand {
    pub fn default_for(agent: Agent) -> Self {
        Self {
            executable: agent.as_str().to_string(),
            model: agent.default_model().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
    #[serde(default = "default_consensus_timeout")]
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<Agent, AgentCommand>,
}

fn default_min_approvals() -> u32 {
    2
}

fn default_consensus_timeout() -> u64 {
    120
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_approvals: default_min_approvals(),
            timeout_secs: default_consensus_timeout(),
            agents: BTreeMap::new(),
        }
    }
}

impl ConsensusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn command_for(&self, agent: Agent) -> AgentCommand {
        self.agents
            .get(&agent)
            .cloned()
            .unwrap_or_else(|| AgentCommand::default_for(agent))
    }
}

// ---------------------------------------------------------------------------
// ProjectConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    pub project: ProjectConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

fn default_version() -> u32 {
    1
}

impl Config {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: 1,
            project: ProjectConfig {
                name: project_name.into(),
                description: None,
            },
            events: EventsConfig::default(),
            locks: LocksConfig::default(),
            supervisor: SupervisorConfig::default(),
            queue: QueueConfig::default(),
            rag: RagConfig::default(),
            consensus: ConsensusConfig::default(),
        }
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(TriadError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    /// Load the project config, or defaults named after the root directory
    /// when the project has not been initialized.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        match Self::load(root) {
            Ok(cfg) => Ok(cfg),
            Err(TriadError::NotInitialized) => {
                let name = root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "triad".to_string());
                Ok(Self::new(name))
            }
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.events.max_event_bytes == 0 {
            error("events.max_event_bytes must be greater than 0".to_string());
        }
        if self.supervisor.max_workers == 0 {
            error("supervisor.max_workers must be at least 1".to_string());
        }
        if self.queue.batch_size_limit == 0 {
            error("queue.batch_size_limit must be at least 1".to_string());
        }
        if self.consensus.min_approvals == 0 {
            error("consensus.min_approvals must be at least 1".to_string());
        }
        if self.consensus.min_approvals as usize >= Agent::all().len() {
            error(format!(
                "consensus.min_approvals={} can never be reached: only {} agents may vote",
                self.consensus.min_approvals,
                Agent::all().len() - 1
            ));
        }

        let s = &self.supervisor;
        if s.heartbeat_timeout_secs <= s.heartbeat_interval_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "supervisor.heartbeat_timeout_secs ({}) should exceed heartbeat_interval_secs ({}) \
                     or healthy workers will be reported stale",
                    s.heartbeat_timeout_secs, s.heartbeat_interval_secs
                ),
            });
        }

        if s.task_timeout_secs > s.progress_timeout_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "supervisor.task_timeout_secs ({}) exceeds progress_timeout_secs ({}): \
                     long tasks will be recovered as zombies before they time out",
                    s.task_timeout_secs, s.progress_timeout_secs
                ),
            });
        }

        let b = &self.queue.boost;
        if !(b.p1_to_p0_hours >= b.p2_to_p1_hours && b.p2_to_p1_hours >= b.p3_to_p2_hours) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "queue.boost thresholds are not increasing (p3_to_p2 <= p2_to_p1 <= p1_to_p0)"
                    .to_string(),
            });
        }

        if self.rag.extensions.is_empty() && self.rag.special_files.is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "rag.extensions and rag.special_files are both empty: nothing will be indexed"
                    .to_string(),
            });
        }

        for (agent, cmd) in &self.consensus.agents {
            if cmd.executable.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("consensus.agents.{agent} has an empty executable"),
                });
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::new("test-project");
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.project.name, "test-project");
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.queue.max_retries, 3);
        assert_eq!(parsed.consensus.min_approvals, 2);
    }

    #[test]
    fn partial_file_gets_defaults() {
        let yaml = "project:\n  name: p\nsupervisor:\n  max_workers: 5\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.supervisor.max_workers, 5);
        assert_eq!(cfg.supervisor.heartbeat_timeout_secs, 60);
        assert_eq!(cfg.events.max_event_bytes, 1024 * 1024);
        assert_eq!(cfg.queue.boost.p1_to_p0_hours, 24);
        assert!(cfg.rag.excluded_dirs.iter().any(|d| d == "node_modules"));
    }

    #[test]
    fn agent_command_override() {
        let yaml = "project:\n  name: p\nconsensus:\n  agents:\n    gemini:\n      executable: /opt/gemini\n      model: flash\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let g = cfg.consensus.command_for(Agent::Gemini);
        assert_eq!(g.executable, "/opt/gemini");
        assert_eq!(g.model, "flash");
        assert_eq!(
            cfg.consensus.command_for(Agent::Codex),
            AgentCommand::default_for(Agent::Codex)
        );
    }

    #[test]
    fn load_missing_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(TriadError::NotInitialized)
        ));
        let cfg = Config::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.supervisor.max_workers, 3);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::new("proj");
        cfg.queue.batch_size_limit = 4;
        cfg.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.queue.batch_size_limit, 4);
        assert_eq!(loaded.project.name, "proj");
    }

    #[test]
    fn validate_default_config_clean() {
        assert!(Config::new("p").validate().is_empty());
    }

    #[test]
    fn validate_unreachable_quorum() {
        let mut cfg = Config::new("p");
        cfg.consensus.min_approvals = 3;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("min_approvals")));
    }

    #[test]
    fn validate_heartbeat_timeout_warning() {
        let mut cfg = Config::new("p");
        cfg.supervisor.heartbeat_timeout_secs = 5;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
    }
}
