use crate::output::print_json;
use anyhow::Context;
use std::path::Path;
use triad_core::{config::Config, io, paths};

pub fn run(root: &Path, name: Option<&str>, json: bool) -> anyhow::Result<()> {
    let project_name = name.map(str::to_string).unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });

    let mut created = Vec::new();
    for dir in paths::all_dirs(root) {
        if !dir.is_dir() {
            created.push(dir.clone());
        }
        io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let config_path = paths::config_path(root);
    let config_created = !config_path.exists();
    if config_created {
        Config::new(&project_name)
            .save(root)
            .context("failed to write config.yaml")?;
    }

    if json {
        return print_json(&serde_json::json!({
            "root": root,
            "project": project_name,
            "created_dirs": created,
            "config_created": config_created,
        }));
    }

    println!("Initializing triad in: {}", root.display());
    for dir in &created {
        let rel = dir.strip_prefix(root).unwrap_or(dir);
        println!("  created: {}", rel.display());
    }
    if config_created {
        println!("  created: {}", paths::CONFIG_FILE);
    } else {
        println!("  exists:  {}", paths::CONFIG_FILE);
    }
    Ok(())
}
