use crate::cmd::load_config;
use crate::output::{fmt_time, print_json, truncate};
use clap::Subcommand;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use triad_agent::{invoke, ConversationStore, Invocation};
use triad_core::types::Agent;

#[derive(Subcommand)]
pub enum DelegateSubcommand {
    /// Run one prompt through an agent CLI and print its reply
    Ask {
        agent: Agent,
        /// Prompt words, joined with spaces
        #[arg(required = true)]
        prompt: Vec<String>,
        /// Keep a multi-turn gemini conversation under this name
        #[arg(long)]
        conversation: Option<String>,
        /// gemini session id to resume, replacing the saved one
        #[arg(long, requires = "conversation")]
        resume: Option<String>,
        /// Do not quote earlier turns into the prompt
        #[arg(long, requires = "conversation")]
        no_context: bool,
        /// Seconds the agent may take (default: consensus.timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show the turns of a conversation
    History { name: String },

    /// Forget a conversation
    Clear { name: String },

    /// List saved conversations
    List,
}

pub fn run(root: &Path, subcmd: DelegateSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let store = ConversationStore::new(root);

    match subcmd {
        DelegateSubcommand::Ask {
            agent,
            prompt,
            conversation,
            resume,
            no_context,
            timeout,
        } => {
            let prompt = prompt.join(" ");
            let command = config.consensus.command_for(agent);
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.consensus.timeout());
            let rt = tokio::runtime::Runtime::new()?;

            let (inv, resume_id) = match conversation {
                None => (rt.block_on(invoke(agent, &command, &prompt, timeout, Some(root)))?, None),
                Some(name) => {
                    if agent != Agent::Gemini {
                        anyhow::bail!("conversations are only supported for gemini, not {agent}");
                    }
                    let mut conv = store.load(&name)?;
                    if resume.is_some() {
                        conv.resume_id = resume;
                    }
                    let inv = rt.block_on(conv.send(&command, &prompt, !no_context, timeout, Some(root)))?;
                    store.save(&conv)?;
                    (inv, conv.resume_id)
                }
            };

            print_reply(&inv, resume_id.as_deref(), json)?;
            if !inv.success() {
                let how = match inv.exit_code {
                    Some(code) => format!("exited with code {code}"),
                    None => "was terminated by a signal".to_string(),
                };
                anyhow::bail!("{agent} {how}");
            }
            Ok(())
        }

        DelegateSubcommand::History { name } => {
            let conv = store.load(&name)?;
            if json {
                return print_json(&conv);
            }
            if conv.turns.is_empty() {
                println!("No history for '{name}'.");
                return Ok(());
            }
            if let Some(id) = &conv.resume_id {
                println!("Resumes gemini session {id}");
            }
            for turn in &conv.turns {
                println!(
                    "[{}] {}: {}",
                    fmt_time(&turn.timestamp),
                    turn.role.label(),
                    truncate(&turn.content.replace('\n', " "), 100)
                );
            }
            Ok(())
        }

        DelegateSubcommand::Clear { name } => {
            let cleared = store.clear(&name)?;
            if json {
                return print_json(&json!({ "name": name, "cleared": cleared }));
            }
            if cleared {
                println!("Cleared conversation '{name}'.");
            } else {
                println!("No conversation named '{name}'.");
            }
            Ok(())
        }

        DelegateSubcommand::List => {
            let names = store.list()?;
            if json {
                return print_json(&names);
            }
            if names.is_empty() {
                println!("No conversations.");
            }
            for name in names {
                let turns = store.load(&name)?.turns.len();
                println!("{name}  ({turns} turns)");
            }
            Ok(())
        }
    }
}

fn print_reply(inv: &Invocation, resume_id: Option<&str>, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&json!({
            "agent": inv.agent,
            "success": inv.success(),
            "exit_code": inv.exit_code,
            "duration_ms": inv.duration.as_millis() as u64,
            "resume_id": resume_id,
            "output": inv.output,
        }));
    }
    println!("{}", inv.output);
    Ok(())
}
