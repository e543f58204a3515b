use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use std::path::PathBuf;
use triad_core::session_trim::{
    default_projects_dir, format_size, trim_file, trim_session, DEFAULT_THRESHOLD,
};

#[derive(Subcommand)]
pub enum SessionSubcommand {
    /// Replace oversized payloads in a session transcript with placeholders
    Trim {
        /// Session id, or a unique prefix of one
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        session_id: Option<String>,
        /// Trim this JSON-lines file instead of looking up a session
        #[arg(long, requires = "output")]
        file: Option<PathBuf>,
        /// Where to write the trimmed copy of --file
        #[arg(long)]
        output: Option<PathBuf>,
        /// Strings longer than this many bytes are trimmed
        #[arg(long, default_value_t = DEFAULT_THRESHOLD)]
        threshold: usize,
        /// Directory holding session transcripts (default: ~/.claude/projects)
        #[arg(long, env = "TRIAD_PROJECTS_DIR")]
        projects_dir: Option<PathBuf>,
    },
}

pub fn run(subcmd: SessionSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        SessionSubcommand::Trim {
            session_id,
            file,
            output,
            threshold,
            projects_dir,
        } => {
            if let (Some(input), Some(output)) = (file, output) {
                let stats = trim_file(&input, &output, threshold)
                    .with_context(|| format!("failed to trim {}", input.display()))?;
                if json {
                    return print_json(&stats);
                }
                println!(
                    "Trimmed {} of {} lines, saved {} -> {}",
                    stats.trimmed,
                    stats.lines,
                    format_size(stats.saved_bytes),
                    output.display()
                );
                return Ok(());
            }

            let session_id = session_id.context("a session id or --file is required")?;
            let projects_dir = match projects_dir {
                Some(dir) => dir,
                None => default_projects_dir()?,
            };
            let outcome = trim_session(&projects_dir, &session_id, threshold)?;
            if json {
                return print_json(&outcome);
            }
            println!("Source:      {}", outcome.source.display());
            println!("Output:      {}", outcome.output.display());
            println!(
                "Size:        {} -> {}",
                format_size(outcome.original_size),
                format_size(outcome.new_size)
            );
            println!(
                "Trimmed:     {} values, {} invalid lines kept verbatim",
                outcome.stats.trimmed, outcome.stats.invalid_lines
            );
            println!("New session: {}", outcome.new_session_id);
            if outcome.index_updated {
                println!("sessions-index.json updated");
            }
            Ok(())
        }
    }
}
