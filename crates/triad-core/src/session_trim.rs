//! Shrink oversized agent transcripts.
//!
//! Session files are JSON lines. Embedded attachments (base64 files, media
//! data, very large text) are replaced with short placeholders so the
//! session can be resumed. The original file is never modified.

use crate::error::{Result, TriadError};
use crate::io::atomic_write;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_THRESHOLD: usize = 100_000;
const INDEX_FILE: &str = "sessions-index.json";
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrimStats {
    pub lines: usize,
    pub invalid_lines: usize,
    pub trimmed: usize,
    pub saved_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrimOutcome {
    pub source: PathBuf,
    pub output: PathBuf,
    pub new_session_id: String,
    pub original_size: u64,
    pub new_size: u64,
    pub index_updated: bool,
    pub stats: TrimStats,
}

/// Human-readable size with one decimal: `512.0B`, `1.5KB`, `2.0MB`.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1}{unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1}TB")
}

/// Replace oversized payloads in `value`, recursing through objects and
/// arrays. `base64` and `data` strings above `threshold` bytes are trimmed,
/// `content` strings only above ten times the threshold.
pub fn trim_value(value: &mut Value, threshold: usize, stats: &mut TrimStats) {
    match value {
        Value::Object(map) => {
            let mut replacements = Vec::new();
            for (key, v) in map.iter() {
                let Value::String(s) = v else { continue };
                let len = s.len();
                let placeholder = match key.as_str() {
                    "base64" if len > threshold => {
                        let file = map
                            .get("filePath")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown");
                        let size = map
                            .get("originalSize")
                            .and_then(Value::as_u64)
                            .unwrap_or(len as u64);
                        format!(
                            "[BASE64 CONTENT TRIMMED - file: {file}, original_size: {}]",
                            format_size(size)
                        )
                    }
                    "data" if len > threshold => {
                        let media = map
                            .get("media_type")
                            .or_else(|| map.get("type"))
                            .and_then(Value::as_str)
                            .unwrap_or("unknown");
                        format!(
                            "[MEDIA DATA TRIMMED - type: {media}, size: {}]",
                            format_size(len as u64)
                        )
                    }
                    "content" if len > threshold.saturating_mul(10) => {
                        let preview: String = s.chars().take(PREVIEW_CHARS).collect();
                        format!(
                            "[LARGE CONTENT TRIMMED - size: {}, preview: {preview}...]",
                            format_size(len as u64)
                        )
                    }
                    _ => continue,
                };
                debug!(key = %key, size = len, "trimmed value");
                stats.trimmed += 1;
                stats.saved_bytes += len.saturating_sub(placeholder.len()) as u64;
                replacements.push((key.clone(), placeholder));
            }

            for (key, placeholder) in &replacements {
                map.insert(key.clone(), Value::String(placeholder.clone()));
            }
            for (key, v) in map.iter_mut() {
                if !replacements.iter().any(|(k, _)| k == key) {
                    trim_value(v, threshold, stats);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                trim_value(item, threshold, stats);
            }
        }
        _ => {}
    }
}

/// Trim every line of `input` into `output`. Lines that are not valid JSON
/// are copied unchanged.
pub fn trim_file(input: &Path, output: &Path, threshold: usize) -> Result<TrimStats> {
    let mut reader = BufReader::new(File::open(input)?);
    let dir = output.parent().unwrap_or(Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut writer = BufWriter::new(tmp);
    let mut stats = TrimStats::default();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        stats.lines += 1;
        match serde_json::from_slice::<Value>(&buf) {
            Ok(mut value) => {
                trim_value(&mut value, threshold, &mut stats);
                serde_json::to_writer(&mut writer, &value)?;
                writer.write_all(b"\n")?;
            }
            Err(_) => {
                warn!(line = stats.lines, "not valid JSON, copying as-is");
                stats.invalid_lines += 1;
                writer.write_all(&buf)?;
                if !buf.ends_with(b"\n") {
                    writer.write_all(b"\n")?;
                }
            }
        }
    }

    let tmp = writer.into_inner().map_err(|e| e.into_error())?;
    tmp.as_file().sync_all()?;
    tmp.persist(output).map_err(|e| e.error)?;
    Ok(stats)
}

/// `~/.claude/projects`, where agent transcripts are kept.
pub fn default_projects_dir() -> Result<PathBuf> {
    home::home_dir()
        .map(|h| h.join(".claude").join("projects"))
        .ok_or(TriadError::HomeNotFound)
}

/// Find `<id>.jsonl` in any project directory, falling back to the first
/// file whose name contains `id`. Directories are searched in sorted order.
pub fn find_session_file(projects_dir: &Path, session_id: &str) -> Result<PathBuf> {
    let not_found = || TriadError::SessionFileNotFound(session_id.to_string());
    if !projects_dir.is_dir() {
        return Err(not_found());
    }

    let mut projects: Vec<PathBuf> = std::fs::read_dir(projects_dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    projects.sort();

    for dir in projects {
        let exact = dir.join(format!("{session_id}.jsonl"));
        if exact.is_file() {
            return Ok(exact);
        }
        let mut partial: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension().is_some_and(|x| x == "jsonl")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.contains(session_id))
            })
            .collect();
        partial.sort();
        if let Some(first) = partial.into_iter().next() {
            return Ok(first);
        }
    }
    Err(not_found())
}

/// Trim a session into `trimmed-<id8>-<timestamp>.jsonl` beside the
/// original and register it in the project's `sessions-index.json`.
pub fn trim_session(projects_dir: &Path, session_id: &str, threshold: usize) -> Result<TrimOutcome> {
    let source = find_session_file(projects_dir, session_id)?;
    let original_size = std::fs::metadata(&source)?.len();
    let short: String = session_id.chars().take(8).collect();
    let new_id = format!("trimmed-{short}-{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let project_dir = source.parent().unwrap_or(projects_dir).to_path_buf();
    let output = project_dir.join(format!("{new_id}.jsonl"));

    let stats = trim_file(&source, &output, threshold)?;
    let new_size = std::fs::metadata(&output)?.len();
    let index_updated = update_sessions_index(&project_dir, session_id, &new_id, &output)?;

    info!(
        session = session_id,
        output = %output.display(),
        trimmed = stats.trimmed,
        saved = %format_size(original_size.saturating_sub(new_size)),
        "session trimmed"
    );
    Ok(TrimOutcome {
        source,
        output,
        new_session_id: new_id,
        original_size,
        new_size,
        index_updated,
        stats,
    })
}

/// Append a copy of the original's index entry pointing at the trimmed file.
/// Returns false when there is no index or no entry for `old_id`.
fn update_sessions_index(
    project_dir: &Path,
    old_id: &str,
    new_id: &str,
    new_path: &Path,
) -> Result<bool> {
    let index_path = project_dir.join(INDEX_FILE);
    if !index_path.exists() {
        warn!(dir = %project_dir.display(), "no sessions index found");
        return Ok(false);
    }

    let raw = std::fs::read_to_string(&index_path)?;
    let mut index: Value = serde_json::from_str(&raw)?;
    let Some(entries) = index.get_mut("entries").and_then(Value::as_array_mut) else {
        return Ok(false);
    };
    let Some(original) = entries
        .iter()
        .find(|e| e.get("sessionId").and_then(Value::as_str) == Some(old_id))
        .cloned()
    else {
        return Ok(false);
    };

    let mut entry = original;
    if let Value::Object(map) = &mut entry {
        let prompt: String = map
            .get("firstPrompt")
            .and_then(Value::as_str)
            .unwrap_or("")
            .chars()
            .take(100)
            .collect();
        map.insert("sessionId".into(), Value::String(new_id.to_string()));
        map.insert(
            "fullPath".into(),
            Value::String(new_path.to_string_lossy().into_owned()),
        );
        map.insert(
            "firstPrompt".into(),
            Value::String(format!("[TRIMMED] {prompt}...")),
        );
    }
    entries.push(entry);

    std::fs::copy(&index_path, project_dir.join(format!("{INDEX_FILE}.bak")))?;
    atomic_write(&index_path, serde_json::to_string_pretty(&index)?.as_bytes())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn sizes() {
        assert_eq!(format_size(512), "512.0B");
        assert_eq!(format_size(1536), "1.5KB");
        assert_eq!(format_size(2 * 1024 * 1024), "2.0MB");
        assert_eq!(format_size(5 * 1024u64.pow(4)), "5.0TB");
    }

    #[test]
    fn trims_base64_with_file_info() {
        let mut v = json!({
            "source": {"base64": "A".repeat(200), "filePath": "/tmp/a.pdf", "originalSize": 4096}
        });
        let mut stats = TrimStats::default();
        trim_value(&mut v, 100, &mut stats);
        let s = v["source"]["base64"].as_str().unwrap();
        assert_eq!(s, "[BASE64 CONTENT TRIMMED - file: /tmp/a.pdf, original_size: 4.0KB]");
        assert_eq!(stats.trimmed, 1);
        assert!(stats.saved_bytes > 0);
        assert_eq!(v["source"]["filePath"], "/tmp/a.pdf");
    }

    #[test]
    fn trims_media_and_nested_arrays() {
        let mut v = json!({
            "content": [
                {"type": "image", "source": {"data": "x".repeat(150), "media_type": "image/png"}},
                {"type": "text", "text": "keep me"}
            ]
        });
        let mut stats = TrimStats::default();
        trim_value(&mut v, 100, &mut stats);
        let data = v["content"][0]["source"]["data"].as_str().unwrap();
        assert!(data.starts_with("[MEDIA DATA TRIMMED - type: image/png"));
        assert_eq!(v["content"][1]["text"], "keep me");
        assert_eq!(stats.trimmed, 1);
    }

    #[test]
    fn content_uses_higher_threshold() {
        let mut small = json!({"content": "y".repeat(500)});
        let mut stats = TrimStats::default();
        trim_value(&mut small, 100, &mut stats);
        assert_eq!(stats.trimmed, 0);

        let mut big = json!({"content": "y".repeat(1001)});
        trim_value(&mut big, 100, &mut stats);
        let s = big["content"].as_str().unwrap();
        assert!(s.starts_with("[LARGE CONTENT TRIMMED - size: 1001.0B, preview: yyyy"));
        assert_eq!(stats.trimmed, 1);
    }

    #[test]
    fn small_values_untouched() {
        let original = json!({"base64": "abc", "data": "def", "n": 1});
        let mut v = original.clone();
        let mut stats = TrimStats::default();
        trim_value(&mut v, 100, &mut stats);
        assert_eq!(v, original);
    }

    #[test]
    fn file_copies_invalid_lines() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.jsonl");
        let output = dir.path().join("out.jsonl");
        let big = json!({"base64": "B".repeat(300)}).to_string();
        std::fs::write(&input, format!("{big}\nnot json\n{{\"ok\":true}}")).unwrap();

        let stats = trim_file(&input, &output, 100).unwrap();
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.invalid_lines, 1);
        assert_eq!(stats.trimmed, 1);

        let out = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("BASE64 CONTENT TRIMMED"));
        assert_eq!(lines[1], "not json");
        assert_eq!(lines[2], r#"{"ok":true}"#);
    }

    fn projects_with_session(dir: &TempDir, id: &str) -> PathBuf {
        let project = dir.path().join("projects").join("-home-me-app");
        std::fs::create_dir_all(&project).unwrap();
        let line = json!({"message": {"base64": "C".repeat(500)}}).to_string();
        std::fs::write(project.join(format!("{id}.jsonl")), format!("{line}\n")).unwrap();
        dir.path().join("projects")
    }

    #[test]
    fn finds_exact_and_partial() {
        let dir = TempDir::new().unwrap();
        let projects = projects_with_session(&dir, "f919b7b7-d414");
        assert!(find_session_file(&projects, "f919b7b7-d414").is_ok());
        let partial = find_session_file(&projects, "d414").unwrap();
        assert!(partial.ends_with("f919b7b7-d414.jsonl"));
        assert!(matches!(
            find_session_file(&projects, "missing"),
            Err(TriadError::SessionFileNotFound(_))
        ));
    }

    #[test]
    fn trim_session_updates_index() {
        let dir = TempDir::new().unwrap();
        let id = "f919b7b7-d414-4c50";
        let projects = projects_with_session(&dir, id);
        let project = projects.join("-home-me-app");
        let index = json!({"version": 1, "entries": [
            {"sessionId": id, "fullPath": "x", "firstPrompt": "fix the build"}
        ]});
        std::fs::write(project.join(INDEX_FILE), index.to_string()).unwrap();

        let outcome = trim_session(&projects, id, 100).unwrap();
        assert!(outcome.new_session_id.starts_with("trimmed-f919b7b7-"));
        assert!(outcome.output.exists());
        assert!(outcome.new_size < outcome.original_size);
        assert!(outcome.index_updated);
        assert!(project.join("sessions-index.json.bak").exists());

        let updated: Value =
            serde_json::from_str(&std::fs::read_to_string(project.join(INDEX_FILE)).unwrap())
                .unwrap();
        let entries = updated["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["sessionId"], outcome.new_session_id.as_str());
        assert_eq!(entries[1]["firstPrompt"], "[TRIMMED] fix the build...");
    }

    #[test]
    fn trim_without_index_still_writes_output() {
        let dir = TempDir::new().unwrap();
        let projects = projects_with_session(&dir, "abc12345");
        let outcome = trim_session(&projects, "abc12345", 100).unwrap();
        assert!(!outcome.index_updated);
        assert!(outcome.output.exists());
    }
}
