use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;
use triad_core::config::AgentCommand;
use triad_core::types::Agent;

use crate::{AgentError, Result};

// ─── Invocation ───────────────────────────────────────────────────────────

/// Captured result of one agent CLI run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub agent: Agent,
    /// Trimmed stdout, or stderr when stdout was empty.
    pub output: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

impl Invocation {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

// ─── Command builder ──────────────────────────────────────────────────────

/// Argument vector for a non-interactive run of `agent` on `prompt`.
pub fn build_args(agent: Agent, command: &AgentCommand, prompt: &str) -> Vec<String> {
    let model = command.model.clone();
    match agent {
        Agent::Claude => vec!["-p".into(), prompt.into(), "--model".into(), model],
        Agent::Gemini => vec![
            "-m".into(),
            model,
            "--approval-mode".into(),
            "yolo".into(),
            prompt.into(),
        ],
        Agent::Codex => vec![
            "exec".into(),
            "-m".into(),
            model,
            "-s".into(),
            "workspace-write".into(),
            prompt.into(),
        ],
    }
}

fn build_command(command: &AgentCommand, args: &[String], cwd: Option<&Path>) -> Command {
    let mut cmd = Command::new(&command.executable);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Nested agent sessions refuse to start when this is inherited.
    cmd.env_remove("CLAUDECODE");
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd
}

// ─── Public API ───────────────────────────────────────────────────────────

/// Run `agent` on `prompt`, killing it once `timeout` elapses.
///
/// A non-zero exit is not an error here; callers inspect
/// [`Invocation::exit_code`]. Errors are a missing executable, a spawn
/// failure or the timeout.
pub async fn invoke(
    agent: Agent,
    command: &AgentCommand,
    prompt: &str,
    timeout: Duration,
    cwd: Option<&Path>,
) -> Result<Invocation> {
    invoke_args(agent, command, &build_args(agent, command, prompt), timeout, cwd).await
}

/// [`invoke`] with a prebuilt argument vector.
pub async fn invoke_args(
    agent: Agent,
    command: &AgentCommand,
    args: &[String],
    timeout: Duration,
    cwd: Option<&Path>,
) -> Result<Invocation> {
    if which::which(&command.executable).is_err() {
        return Err(AgentError::NotFound {
            agent,
            executable: command.executable.clone(),
        });
    }

    let started = Instant::now();
    let child = build_command(command, args, cwd)
        .spawn()
        .map_err(|source| AgentError::Process { agent, source })?;
    debug!(%agent, pid = child.id(), "agent started");

    // Dropping the future on timeout drops the child, which kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(AgentError::Timeout {
                agent,
                after: timeout,
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let text = if stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).trim().to_string()
    } else {
        stdout
    };

    Ok(Invocation {
        agent,
        output: text,
        exit_code: output.status.code(),
        duration: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(exe: &str, model: &str) -> AgentCommand {
        AgentCommand {
            executable: exe.into(),
            model: model.into(),
        }
    }

    #[test]
    fn per_agent_argv() {
        assert_eq!(
            build_args(Agent::Claude, &cmd("claude", "sonnet"), "hi"),
            ["-p", "hi", "--model", "sonnet"]
        );
        assert_eq!(
            build_args(Agent::Gemini, &cmd("gemini", "g3"), "hi"),
            ["-m", "g3", "--approval-mode", "yolo", "hi"]
        );
        assert_eq!(
            build_args(Agent::Codex, &cmd("codex", "c5"), "hi"),
            ["exec", "-m", "c5", "-s", "workspace-write", "hi"]
        );
    }

    #[tokio::test]
    async fn missing_executable_is_not_found() {
        let err = invoke(
            Agent::Codex,
            &cmd("triad-no-such-cli-xyz", "m"),
            "p",
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::NotFound { agent: Agent::Codex, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unlaunchable_executable_is_process_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("broken.sh");
        std::fs::write(&script, "#!/nonexistent/interpreter\necho hi\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let err = invoke(
            Agent::Gemini,
            &cmd(&script.to_string_lossy(), "m"),
            "p",
            Duration::from_secs(5),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AgentError::Process { agent: Agent::Gemini, .. }));
        assert!(err.to_string().starts_with("failed to start gemini"));
    }
}
