use crate::cmd::load_config;
use crate::output::print_json;
use clap::Subcommand;
use std::path::Path;
use triad_core::event_store::EventStore;
use triad_core::projection::{refresh_named, ProjectionStore, Refresh, BUILTIN};

#[derive(Subcommand)]
pub enum ProjectionSubcommand {
    /// Replay the whole event log into fresh state
    Rebuild {
        /// Projection name (default: all)
        name: Option<String>,
    },

    /// Apply events appended since the last snapshot
    Update {
        /// Projection name (default: all)
        name: Option<String>,
    },

    /// Print a snapshot, bringing it up to date first
    Show {
        name: String,
        /// Print the persisted snapshot without applying new events
        #[arg(long)]
        stale: bool,
    },
}

pub fn run(root: &Path, subcmd: ProjectionSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let events = EventStore::open(root, &config);
    let store = ProjectionStore::new(root, &events);
    match subcmd {
        ProjectionSubcommand::Rebuild { name } => refresh_all(&store, name, Refresh::Rebuild, json),
        ProjectionSubcommand::Update { name } => refresh_all(&store, name, Refresh::Update, json),
        ProjectionSubcommand::Show { name, stale } => {
            let mode = if stale { Refresh::None } else { Refresh::Update };
            let snap = refresh_named(&store, &name, mode)?;
            if json {
                print_json(&snap)
            } else {
                print!("{}", serde_yaml::to_string(&snap)?);
                Ok(())
            }
        }
    }
}

fn refresh_all(
    store: &ProjectionStore<'_>,
    name: Option<String>,
    mode: Refresh,
    json: bool,
) -> anyhow::Result<()> {
    let names: Vec<String> = match name {
        Some(n) => vec![n],
        None => BUILTIN.iter().map(|s| s.to_string()).collect(),
    };
    let mut out = Vec::new();
    for name in &names {
        let snap = refresh_named(store, name, mode)?;
        let applied = snap["events_applied"].as_u64().unwrap_or(0);
        let offset = snap["offset"].as_u64().unwrap_or(0);
        out.push(serde_json::json!({
            "name": name,
            "events_applied": applied,
            "offset": offset,
        }));
        if !json {
            println!("{name}: {applied} events applied (offset {offset})");
        }
    }
    if json {
        print_json(&out)?;
    }
    Ok(())
}
