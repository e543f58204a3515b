use crate::cmd::load_config;
use crate::output::{fmt_time, print_json, print_table, truncate};
use anyhow::Context;
use clap::Subcommand;
use serde_json::Value;
use std::path::Path;
use triad_core::event_store::{EventStore, IntegrityReport};

#[derive(Subcommand)]
pub enum EventSubcommand {
    /// Append an event to the log
    Append {
        /// Dotted event type, e.g. task.completed
        event_type: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Who is emitting the event
        #[arg(long)]
        source: Option<String>,
    },

    /// List events, oldest first
    List {
        /// Only events of this type or under this prefix (e.g. `task`)
        #[arg(long = "type")]
        event_type: Option<String>,
        /// Show only the last N events
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Report corrupt lines and a torn tail without changing anything
    Validate,

    /// Rewrite the log keeping only valid events (a backup is kept)
    Repair,
}

pub fn run(root: &Path, subcmd: EventSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let store = EventStore::open(root, &config);
    match subcmd {
        EventSubcommand::Append {
            event_type,
            payload,
            source,
        } => append(&store, &event_type, &payload, source, json),
        EventSubcommand::List { event_type, limit } => {
            list(&store, event_type.as_deref(), limit, json)
        }
        EventSubcommand::Validate => validate(&store, json),
        EventSubcommand::Repair => repair(&store, json),
    }
}

fn append(
    store: &EventStore,
    event_type: &str,
    payload: &str,
    source: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let payload: Value = serde_json::from_str(payload).context("payload is not valid JSON")?;
    let event = store
        .append(event_type, payload, source)
        .with_context(|| format!("failed to append '{event_type}'"))?;
    if json {
        print_json(&event)
    } else {
        println!("Appended {} [{}]", event.event_type, event.id);
        Ok(())
    }
}

fn list(
    store: &EventStore,
    event_type: Option<&str>,
    limit: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let mut events = match event_type {
        Some(prefix) => store.filter(prefix)?,
        None => store.read_all()?.events,
    };
    if let Some(n) = limit {
        let skip = events.len().saturating_sub(n);
        events.drain(..skip);
    }

    if json {
        return print_json(&events);
    }
    if events.is_empty() {
        println!("No events.");
        return Ok(());
    }
    let rows = events
        .iter()
        .map(|e| {
            vec![
                fmt_time(&e.timestamp),
                e.event_type.clone(),
                e.source.clone().unwrap_or_else(|| "-".to_string()),
                truncate(&e.payload.to_string(), 60),
            ]
        })
        .collect();
    print_table(&["TIME", "TYPE", "SOURCE", "PAYLOAD"], rows);
    Ok(())
}

fn print_report(report: &IntegrityReport) {
    println!(
        "{} lines, {} valid, {} corrupt{}",
        report.total_lines,
        report.valid,
        report.corrupt.len(),
        if report.torn_tail { ", torn tail" } else { "" }
    );
    for c in &report.corrupt {
        println!("  line {}: {}", c.line, c.reason);
    }
}

fn validate(store: &EventStore, json: bool) -> anyhow::Result<()> {
    let report = store.validate()?;
    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    if !report.is_clean() {
        anyhow::bail!("event log has integrity problems; run 'triad event repair'");
    }
    Ok(())
}

fn repair(store: &EventStore, json: bool) -> anyhow::Result<()> {
    let report = store.repair().context("failed to repair event log")?;
    if json {
        return print_json(&report);
    }
    print_report(&report);
    match &report.backup {
        Some(backup) => println!("Repaired. Original kept at {}", backup.display()),
        None => println!("Nothing to repair."),
    }
    Ok(())
}
