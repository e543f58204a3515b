use crate::cmd::load_config;
use crate::output::{fmt_opt_time, fmt_time, print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use serde_json::json;
use std::io::Read;
use std::path::{Path, PathBuf};
use triad_core::paths;
use triad_core::rag::{cron_schedule, IngestOutcome, RagStore};

#[derive(Subcommand)]
pub enum RagSubcommand {
    /// Store a piece of context
    Add {
        /// Where the context came from
        source: String,
        /// Text to store; read from stdin when omitted
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Index a file or every indexable file under a directory
    Ingest { path: PathBuf },

    /// Full-text search, best matches first
    Search {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Print one stored context
    Show { id: i64 },

    /// Remove one stored context
    Delete { id: i64 },

    /// Counts of stored contexts and indexed files
    Stats,

    /// Print the crontab schedule for re-indexing every N minutes
    Schedule {
        #[arg(long, default_value_t = 60)]
        interval_minutes: u32,
        /// Directory the cron job should ingest (default: the project root)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Rebuild the full-text index from stored contexts
    Rebuild,
}

fn open(root: &Path) -> anyhow::Result<RagStore> {
    let config = load_config(root)?;
    RagStore::open(&paths::rag_db_path(root), &config.rag).context("failed to open context store")
}

pub fn run(root: &Path, subcmd: RagSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        RagSubcommand::Add {
            source,
            content,
            summary,
            tags,
        } => {
            let content = match content {
                Some(c) => c,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read context from stdin")?;
                    buf
                }
            };
            if content.trim().is_empty() {
                anyhow::bail!("refusing to store empty context");
            }
            let id = open(root)?.add_context(&source, &content, summary.as_deref(), &tags)?;
            if json {
                print_json(&json!({ "id": id, "source": source }))
            } else {
                println!("Stored context {id} from {source}");
                Ok(())
            }
        }
        RagSubcommand::Ingest { path } => ingest(root, &path, json),
        RagSubcommand::Search { query, limit } => {
            let query = query.join(" ");
            let hits = open(root)?.search(&query, limit)?;
            if json {
                return print_json(&hits);
            }
            if hits.is_empty() {
                println!("No matches for '{query}'.");
                return Ok(());
            }
            for hit in &hits {
                println!("[{}] {}  ({:.3})", hit.id, hit.source, hit.score);
                if !hit.summary.is_empty() {
                    println!("    {}", hit.summary);
                }
                println!("    {}", hit.snippet.replace('\n', " "));
            }
            Ok(())
        }
        RagSubcommand::Show { id } => {
            let ctx = open(root)?.get(id)?;
            if json {
                return print_json(&ctx);
            }
            println!("[{}] {}", ctx.id, ctx.source);
            if !ctx.summary.is_empty() {
                println!("summary: {}", ctx.summary);
            }
            if !ctx.tags.is_empty() {
                println!("tags:    {}", ctx.tags.join(", "));
            }
            println!("updated: {}", fmt_time(&ctx.updated_at));
            println!();
            println!("{}", ctx.content);
            Ok(())
        }
        RagSubcommand::Delete { id } => {
            open(root)?.delete(id)?;
            if json {
                print_json(&json!({ "id": id, "deleted": true }))
            } else {
                println!("Deleted context {id}");
                Ok(())
            }
        }
        RagSubcommand::Stats => {
            let stats = open(root)?.stats()?;
            if json {
                return print_json(&stats);
            }
            println!("contexts:      {}", stats.contexts);
            println!("indexed files: {}", stats.indexed_files);
            println!("indexed bytes: {}", stats.indexed_bytes);
            println!("last indexed:  {}", fmt_opt_time(stats.last_indexed_at.as_ref()));
            Ok(())
        }
        RagSubcommand::Schedule {
            interval_minutes,
            dir,
        } => {
            let schedule = cron_schedule(interval_minutes);
            let dir = dir.unwrap_or_else(|| root.to_path_buf());
            let line = format!(
                "{schedule} triad --root {} rag ingest {}",
                root.display(),
                dir.display()
            );
            if json {
                print_json(&json!({ "schedule": schedule, "crontab": line }))
            } else {
                println!("{line}");
                Ok(())
            }
        }
        RagSubcommand::Rebuild => {
            open(root)?.rebuild_index()?;
            if json {
                print_json(&json!({ "rebuilt": true }))
            } else {
                println!("Full-text index rebuilt");
                Ok(())
            }
        }
    }
}

fn ingest(root: &Path, path: &Path, json: bool) -> anyhow::Result<()> {
    let mut store = open(root)?;
    if path.is_dir() {
        let report = store
            .ingest_directory(path)
            .with_context(|| format!("failed to ingest {}", path.display()))?;
        if json {
            return print_json(&report);
        }
        println!(
            "Scanned {} files: {} indexed, {} unchanged, {} skipped, {} errors{}",
            report.scanned,
            report.indexed,
            report.unchanged,
            report.skipped,
            report.errors.len(),
            if report.truncated { " (stopped at max_files)" } else { "" }
        );
        if !report.errors.is_empty() {
            let rows = report
                .errors
                .iter()
                .map(|e| vec![e.path.display().to_string(), e.error.clone()])
                .collect();
            print_table(&["PATH", "ERROR"], rows);
        }
        return Ok(());
    }

    let outcome = store
        .ingest_file(path)
        .with_context(|| format!("failed to ingest {}", path.display()))?;
    if json {
        return print_json(&outcome);
    }
    match outcome {
        IngestOutcome::Indexed { context_id } => {
            println!("Indexed {} as context {context_id}", path.display())
        }
        IngestOutcome::Unchanged => println!("Unchanged: {}", path.display()),
        IngestOutcome::Skipped { reason } => {
            println!("Skipped {}: {reason:?}", path.display())
        }
    }
    Ok(())
}
