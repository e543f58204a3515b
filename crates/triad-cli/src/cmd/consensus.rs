use crate::cmd::load_config;
use crate::output::{fmt_opt_time, fmt_time, print_json, print_table, truncate};
use anyhow::Context;
use clap::Subcommand;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use triad_agent::{CliDelegate, ConsensusVerifier};
use triad_core::config::Config;
use triad_core::consensus::{
    save_report, ConsensusDb, ConsensusResult, ReportFormat, Session, VerificationRequest, Vote,
};
use triad_core::event_store::EventStore;
use triad_core::paths;
use triad_core::types::Agent;

#[derive(Subcommand)]
pub enum ConsensusSubcommand {
    /// Ask the other two agents to verify a task and record their votes
    Verify {
        task_id: String,
        /// Agent that did the work; it is not asked
        #[arg(long)]
        implementer: Agent,
        /// What changed
        #[arg(long)]
        summary: String,
        #[arg(long, default_value = "")]
        scope: String,
        #[arg(long, default_value = "")]
        expected: String,
        #[arg(long, default_value = "")]
        repro: String,
        #[arg(long, default_value = "")]
        evidence: String,
        #[arg(long, default_value = "")]
        risk: String,
        /// Seconds each verifier may take (default: consensus.timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Open a session without asking anyone
    Create {
        task_id: String,
        #[arg(long)]
        implementer: Agent,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "")]
        scope: String,
    },

    /// Record or replace an agent's vote
    Vote {
        session_id: String,
        agent: Agent,
        vote: Vote,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long, default_value = "")]
        evidence: String,
        #[arg(long, default_value_t = 0)]
        duration_ms: u64,
    },

    /// Tally votes and settle the session result
    Evaluate { session_id: String },

    /// Show a session with its votes, or list recent sessions
    Show {
        session_id: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Render a session report
    Report {
        session_id: String,
        /// text, markdown or json
        #[arg(long, default_value = "text")]
        format: ReportFormat,
        /// Also save under .triad/reports/consensus/
        #[arg(long)]
        save: bool,
    },

    /// Pass rate and vote counts over a window
    Metrics {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
}

fn open(root: &Path, config: &Config) -> anyhow::Result<ConsensusDb> {
    ConsensusDb::open(&paths::consensus_db_path(root), config.consensus.min_approvals)
        .context("failed to open consensus database")
}

pub fn run(root: &Path, subcmd: ConsensusSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let mut db = open(root, &config)?;
    match subcmd {
        ConsensusSubcommand::Verify {
            task_id,
            implementer,
            summary,
            scope,
            expected,
            repro,
            evidence,
            risk,
            timeout,
        } => {
            let request = VerificationRequest {
                scope,
                change_summary: summary,
                expected_behavior: expected,
                repro_steps: repro,
                evidence_to_check: evidence,
                risk_notes: risk,
            };
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.consensus.timeout());
            verify(root, &config, db, &task_id, implementer, &request, timeout, json)
        }
        ConsensusSubcommand::Create {
            task_id,
            implementer,
            description,
            scope,
        } => {
            let id = db.create_session(&task_id, &description, implementer, &scope)?;
            if json {
                print_json(&json!({ "session_id": id }))
            } else {
                println!("{id}");
                Ok(())
            }
        }
        ConsensusSubcommand::Vote {
            session_id,
            agent,
            vote,
            reason,
            evidence,
            duration_ms,
        } => {
            db.record_vote(&session_id, agent, vote, &reason, &evidence, duration_ms)?;
            if json {
                print_json(&json!({ "session_id": session_id, "agent": agent, "vote": vote }))
            } else {
                println!("Recorded {vote} from {agent}");
                Ok(())
            }
        }
        ConsensusSubcommand::Evaluate { session_id } => {
            let eval = db.evaluate(&session_id)?;
            if json {
                print_json(&eval)
            } else {
                println!(
                    "{}: {} ({} approvals, {} rejections, {} failed of {} votes)",
                    eval.session_id,
                    eval.result,
                    eval.approvals,
                    eval.rejections,
                    eval.failures,
                    eval.total
                );
                Ok(())
            }
        }
        ConsensusSubcommand::Show { session_id, limit } => match session_id {
            Some(id) => show(&db, &id, json),
            None => {
                let sessions = db.list_sessions(limit)?;
                if json {
                    print_json(&sessions)
                } else if sessions.is_empty() {
                    println!("No consensus sessions.");
                    Ok(())
                } else {
                    print_sessions(&sessions);
                    Ok(())
                }
            }
        },
        ConsensusSubcommand::Report {
            session_id,
            format,
            save,
        } => {
            let report = db.report(&session_id)?;
            print!("{}", report.render(format)?);
            if save {
                let path = save_report(root, &report, format)?;
                eprintln!("saved {}", path.display());
            }
            Ok(())
        }
        ConsensusSubcommand::Metrics { days } => {
            let m = db.metrics(days)?;
            if json {
                return print_json(&m);
            }
            println!("Last {} days: {} sessions", m.days, m.total_sessions);
            println!(
                "  passed {}  failed {}  inconclusive {}  pending {}",
                m.passed, m.failed, m.inconclusive, m.pending
            );
            println!("  pass rate {:.1}%  avg approvals {:.2}", m.pass_rate, m.avg_approvals);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn verify(
    root: &Path,
    config: &Config,
    db: ConsensusDb,
    task_id: &str,
    implementer: Agent,
    request: &VerificationRequest,
    timeout: Duration,
    json: bool,
) -> anyhow::Result<()> {
    let delegate = CliDelegate::new(&config.consensus)
        .timeout(timeout)
        .cwd(root);
    let mut verifier =
        ConsensusVerifier::new(db, delegate).with_events(EventStore::open(root, config));

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(verifier.verify_request(task_id, implementer, request))?;

    if json {
        print_json(&outcome)?;
    } else {
        for env in &outcome.envelopes {
            println!(
                "{:<7} {:<8} confidence {:.1}  {}ms  {}",
                env.model.as_str(),
                env.vote().as_str(),
                env.confidence,
                env.duration_ms,
                truncate(&env.reasoning.replace('\n', " "), 60)
            );
        }
        println!(
            "{}: {} ({} of {} approvals needed)",
            outcome.session_id,
            outcome.evaluation.result,
            outcome.evaluation.approvals,
            verifier.db().min_approvals()
        );
    }

    if outcome.evaluation.result != ConsensusResult::Pass {
        anyhow::bail!(
            "verification of {task_id} did not pass: {}",
            outcome.evaluation.result
        );
    }
    Ok(())
}

fn show(db: &ConsensusDb, id: &str, json: bool) -> anyhow::Result<()> {
    let session = db.get_session(id)?;
    let votes = db.votes(id)?;
    if json {
        return print_json(&json!({ "session": session, "votes": votes }));
    }
    println!("{}  {}", session.id, session.final_result);
    println!("  task:        {}", session.task_id);
    println!("  implementer: {}", session.implementer);
    if !session.description.is_empty() {
        println!("  description: {}", session.description);
    }
    if !session.scope.is_empty() {
        println!("  scope:       {}", session.scope);
    }
    println!("  created:     {}", fmt_time(&session.created_at));
    println!("  completed:   {}", fmt_opt_time(session.completed_at.as_ref()));
    if !votes.is_empty() {
        println!();
        let rows = votes
            .iter()
            .map(|v| {
                vec![
                    v.agent.to_string(),
                    v.vote.to_string(),
                    format!("{}ms", v.duration_ms),
                    truncate(&v.reason.replace('\n', " "), 60),
                ]
            })
            .collect();
        print_table(&["AGENT", "VOTE", "TOOK", "REASON"], rows);
    }
    Ok(())
}

fn print_sessions(sessions: &[Session]) {
    let rows = sessions
        .iter()
        .map(|s| {
            vec![
                s.id.clone(),
                s.task_id.clone(),
                s.implementer.to_string(),
                s.final_result.to_string(),
                format!("{}/{}", s.approvals, s.rejections),
                fmt_time(&s.created_at),
            ]
        })
        .collect();
    print_table(
        &["SESSION", "TASK", "IMPLEMENTER", "RESULT", "APPROVE/REJECT", "CREATED"],
        rows,
    );
}
