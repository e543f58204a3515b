use crate::cmd::load_config;
use crate::output::{fmt_opt_time, fmt_time, print_json, print_table, truncate};
use anyhow::Context;
use clap::Subcommand;
use serde_json::json;
use std::path::{Path, PathBuf};
use triad_core::event::kinds;
use triad_core::event_store::EventStore;
use triad_core::paths;
use triad_core::queue::{NewTask, QueueDb, Task};
use triad_core::types::{Category, Priority, TaskStatus};

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// Add a task
    Add {
        #[arg(required = true)]
        description: Vec<String>,
        /// P0..P3, or critical/high/medium/low
        #[arg(long, short, default_value = "P2")]
        priority: Priority,
        #[arg(long, short, default_value = "other")]
        category: Category,
        /// Comma-separated task ids that must complete first
        #[arg(long, value_delimiter = ',')]
        depends: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Agent expected to verify the result
        #[arg(long)]
        verifier: Option<String>,
    },

    /// List tasks, most urgent first
    List {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        priority: Option<Priority>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show the task a worker would claim next
    Next,

    /// Show one task
    Get { id: String },

    /// Mark a pending task running
    Start {
        id: String,
        #[arg(long)]
        agent: Option<String>,
    },

    /// Mark a running task completed, or failed with --failed
    Complete {
        id: String,
        #[arg(long)]
        failed: bool,
        /// Refuse unless the task is assigned to this agent
        #[arg(long)]
        agent: Option<String>,
    },

    /// Return a failed task to the queue
    Retry { id: String },

    /// Change a task's priority
    Priority { id: String, priority: Priority },

    /// Promote pending tasks that have waited past the boost thresholds
    Boost,

    /// Group pending tasks into batches by priority and category
    Batch {
        /// Only the most urgent batch
        #[arg(long)]
        next: bool,
        /// Write each batch as a task list under .triad/batches/
        #[arg(long)]
        export: bool,
    },

    /// Queue statistics
    Stats {
        /// Also record a metrics snapshot
        #[arg(long)]
        snapshot: bool,
    },

    /// Add tasks from a `**Task N [id]:** description` list
    Import { file: PathBuf },

    /// Delete a task and its history
    Delete { id: String },

    /// Show a task's state changes
    History { id: String },
}

struct Ctx {
    queue: QueueDb,
    events: EventStore,
}

impl Ctx {
    fn open(root: &Path) -> anyhow::Result<Self> {
        let config = load_config(root)?;
        let queue = QueueDb::open(&paths::queue_db_path(root), &config.queue)
            .context("failed to open task queue")?;
        Ok(Self {
            queue,
            events: EventStore::open(root, &config),
        })
    }

    fn emit(&self, kind: &str, task: &Task) -> anyhow::Result<()> {
        self.events.append(
            kind,
            json!({
                "task_id": task.task_id,
                "priority": task.priority,
                "status": task.status,
                "worker_id": task.assigned_agent,
            }),
            Some("queue".to_string()),
        )?;
        Ok(())
    }
}

pub fn run(root: &Path, subcmd: QueueSubcommand, json: bool) -> anyhow::Result<()> {
    let mut ctx = Ctx::open(root)?;
    match subcmd {
        QueueSubcommand::Add {
            description,
            priority,
            category,
            depends,
            tags,
            verifier,
        } => {
            let task = ctx.queue.add(NewTask {
                category,
                dependencies: depends,
                tags,
                verifier_agent: verifier,
                ..NewTask::new(description.join(" "), priority)
            })?;
            ctx.emit(kinds::TASK_QUEUED, &task)?;
            show_change(&task, "Added", json)
        }
        QueueSubcommand::List {
            status,
            priority,
            limit,
        } => {
            let tasks = ctx.queue.list(status, priority, limit)?;
            if json {
                print_json(&tasks)
            } else if tasks.is_empty() {
                println!("No tasks.");
                Ok(())
            } else {
                print_tasks(&tasks);
                Ok(())
            }
        }
        QueueSubcommand::Next => match ctx.queue.next()? {
            Some(task) if json => print_json(&task),
            Some(task) => {
                print_task(&task);
                Ok(())
            }
            None if json => print_json(&serde_json::Value::Null),
            None => {
                println!("No ready tasks.");
                Ok(())
            }
        },
        QueueSubcommand::Get { id } => {
            let task = ctx.queue.get(&id)?;
            if json {
                print_json(&task)
            } else {
                print_task(&task);
                Ok(())
            }
        }
        QueueSubcommand::Start { id, agent } => {
            let task = ctx.queue.start(&id, agent.as_deref())?;
            ctx.emit(kinds::TASK_STARTED, &task)?;
            show_change(&task, "Started", json)
        }
        QueueSubcommand::Complete { id, failed, agent } => {
            let task = ctx.queue.complete(&id, agent.as_deref(), !failed)?;
            if failed {
                ctx.emit(kinds::TASK_FAILED, &task)?;
                show_change(&task, "Failed", json)
            } else {
                ctx.emit(kinds::TASK_COMPLETED, &task)?;
                show_change(&task, "Completed", json)
            }
        }
        QueueSubcommand::Retry { id } => {
            let task = ctx.queue.retry(&id)?;
            ctx.emit(kinds::TASK_RETRIED, &task)?;
            show_change(&task, "Retrying", json)
        }
        QueueSubcommand::Priority { id, priority } => {
            let task = ctx.queue.set_priority(&id, priority)?;
            show_change(&task, "Reprioritized", json)
        }
        QueueSubcommand::Boost => {
            let boosted = ctx.queue.apply_age_boosts()?;
            if json {
                print_json(&json!({ "boosted": boosted }))
            } else {
                println!("Boosted {boosted} tasks");
                Ok(())
            }
        }
        QueueSubcommand::Batch { next, export } => batch(root, &mut ctx.queue, next, export, json),
        QueueSubcommand::Stats { snapshot } => {
            let stats = if snapshot {
                ctx.queue.save_metrics_snapshot()?
            } else {
                ctx.queue.stats()?
            };
            if json {
                return print_json(&stats);
            }
            println!(
                "total {}  pending {}  running {}  completed {}  failed {}  blocked {}",
                stats.total,
                stats.pending,
                stats.running,
                stats.completed,
                stats.failed,
                stats.blocked
            );
            for (p, n) in &stats.pending_by_priority {
                println!("  {p}: {n} pending");
            }
            println!(
                "boosted {}  avg wait {:.2}s  oldest pending {:.2}h",
                stats.boosted, stats.avg_wait_seconds, stats.oldest_pending_hours
            );
            Ok(())
        }
        QueueSubcommand::Import { file } => {
            let tasks = ctx
                .queue
                .import_tasks(&file)
                .with_context(|| format!("failed to import {}", file.display()))?;
            for task in &tasks {
                ctx.emit(kinds::TASK_QUEUED, task)?;
            }
            if json {
                print_json(&tasks)
            } else {
                println!("Imported {} tasks", tasks.len());
                Ok(())
            }
        }
        QueueSubcommand::Delete { id } => {
            ctx.queue.delete(&id)?;
            if json {
                print_json(&json!({ "task_id": id, "deleted": true }))
            } else {
                println!("Deleted {id}");
                Ok(())
            }
        }
        QueueSubcommand::History { id } => {
            let history = ctx.queue.history(&id)?;
            if json {
                return print_json(&history);
            }
            let rows = history
                .iter()
                .map(|h| {
                    vec![
                        fmt_time(&h.timestamp),
                        h.action.clone(),
                        h.old_value.clone().unwrap_or_else(|| "-".into()),
                        h.new_value.clone().unwrap_or_else(|| "-".into()),
                    ]
                })
                .collect();
            print_table(&["TIME", "ACTION", "FROM", "TO"], rows);
            Ok(())
        }
    }
}

fn batch(
    root: &Path,
    queue: &mut QueueDb,
    next: bool,
    export: bool,
    json: bool,
) -> anyhow::Result<()> {
    let batches = if next {
        queue.next_batch()?.into_iter().collect()
    } else {
        queue.create_batches()?
    };
    let mut files = Vec::new();
    if export {
        let dir = paths::batches_dir(root);
        for b in &batches {
            files.push(queue.export_batch(b, &dir)?);
        }
    }

    if json {
        return print_json(&json!({ "batches": batches, "files": files }));
    }
    if batches.is_empty() {
        println!("No pending tasks to batch.");
        return Ok(());
    }
    let rows = batches
        .iter()
        .map(|b| {
            vec![
                b.batch_id.clone(),
                b.priority.to_string(),
                b.category.to_string(),
                b.task_ids.len().to_string(),
            ]
        })
        .collect();
    print_table(&["BATCH", "PRIORITY", "CATEGORY", "TASKS"], rows);
    for f in &files {
        println!("  wrote {}", f.display());
    }
    Ok(())
}

fn show_change(task: &Task, verb: &str, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(task)
    } else {
        println!("{verb} {} [{}] {}", task.task_id, task.priority, task.status);
        Ok(())
    }
}

fn print_tasks(tasks: &[Task]) {
    let rows = tasks
        .iter()
        .map(|t| {
            vec![
                t.task_id.clone(),
                t.priority.to_string(),
                t.status.to_string(),
                t.category.to_string(),
                t.assigned_agent.clone().unwrap_or_else(|| "-".into()),
                truncate(&t.description, 50),
            ]
        })
        .collect();
    print_table(
        &["ID", "PRIORITY", "STATUS", "CATEGORY", "AGENT", "DESCRIPTION"],
        rows,
    );
}

fn print_task(t: &Task) {
    println!("{}  [{}] {}", t.task_id, t.priority, t.status);
    println!("  {}", t.description);
    println!("  category:   {}", t.category);
    if t.priority != t.original_priority {
        println!(
            "  boosted:    from {} ({} times)",
            t.original_priority, t.boost_count
        );
    }
    if let Some(agent) = &t.assigned_agent {
        println!("  agent:      {agent}");
    }
    if let Some(v) = &t.verifier_agent {
        println!("  verifier:   {v}");
    }
    if !t.dependencies.is_empty() {
        println!("  depends on: {}", t.dependencies.join(", "));
    }
    if !t.tags.is_empty() {
        println!("  tags:       {}", t.tags.join(", "));
    }
    if let Some(batch) = &t.batch_id {
        println!("  batch:      {batch}");
    }
    println!("  retries:    {}/{}", t.retry_count, t.max_retries);
    println!("  created:    {}", fmt_time(&t.created_at));
    println!("  started:    {}", fmt_opt_time(t.started_at.as_ref()));
    println!("  completed:  {}", fmt_opt_time(t.completed_at.as_ref()));
}
