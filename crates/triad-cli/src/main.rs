mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, consensus::ConsensusSubcommand, delegate::DelegateSubcommand,
    event::EventSubcommand, lock::LockSubcommand, projection::ProjectionSubcommand,
    queue::QueueSubcommand, rag::RagSubcommand, session::SessionSubcommand,
    supervisor::SupervisorSubcommand, worker::WorkerSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "triad",
    about = "Local orchestration core for a claude / codex / gemini workflow",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .triad/ or .git/)
    #[arg(long, global = true, env = "TRIAD_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the .triad/ directory tree and a default config
    Init {
        /// Project name (default: the root directory's name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Show or validate .triad/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Append to and inspect the event log
    Event {
        #[command(subcommand)]
        subcommand: EventSubcommand,
    },

    /// Build and read projections of the event log
    Projection {
        #[command(subcommand)]
        subcommand: ProjectionSubcommand,
    },

    /// Named file locks
    Lock {
        #[command(subcommand)]
        subcommand: LockSubcommand,
    },

    /// Worker registry and the worker loop
    Worker {
        #[command(subcommand)]
        subcommand: WorkerSubcommand,
    },

    /// Worker health, recovery and spawning
    Supervisor {
        #[command(subcommand)]
        subcommand: SupervisorSubcommand,
    },

    /// Priority task queue
    Queue {
        #[command(subcommand)]
        subcommand: QueueSubcommand,
    },

    /// Full-text context store
    Rag {
        #[command(subcommand)]
        subcommand: RagSubcommand,
    },

    /// Cross-agent verification
    Consensus {
        #[command(subcommand)]
        subcommand: ConsensusSubcommand,
    },

    /// Run agent CLIs directly and keep gemini conversations
    Delegate {
        #[command(subcommand)]
        subcommand: DelegateSubcommand,
    },

    /// Agent session transcripts
    Session {
        #[command(subcommand)]
        subcommand: SessionSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Worker {
            subcommand: WorkerSubcommand::Run { .. },
        }
        | Commands::Supervisor {
            subcommand: SupervisorSubcommand::Watch { .. },
        } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init { name } => cmd::init::run(&root, name.as_deref(), cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Event { subcommand } => cmd::event::run(&root, subcommand, cli.json),
        Commands::Projection { subcommand } => cmd::projection::run(&root, subcommand, cli.json),
        Commands::Lock { subcommand } => cmd::lock::run(&root, subcommand, cli.json),
        Commands::Worker { subcommand } => cmd::worker::run(&root, subcommand, cli.json),
        Commands::Supervisor { subcommand } => cmd::supervisor::run(&root, subcommand, cli.json),
        Commands::Queue { subcommand } => cmd::queue::run(&root, subcommand, cli.json),
        Commands::Rag { subcommand } => cmd::rag::run(&root, subcommand, cli.json),
        Commands::Consensus { subcommand } => cmd::consensus::run(&root, subcommand, cli.json),
        Commands::Delegate { subcommand } => cmd::delegate::run(&root, subcommand, cli.json),
        Commands::Session { subcommand } => cmd::session::run(subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
