//! `histsync status`: lock state and cached tags.

use super::output::{exists_label, format_size, print_table};
use anyhow::{Context, Result};
use histsync::cache::{list_cache_files, read_samples};
use histsync::sample::format_timestamp;
use histsync::{Config, LockState, RunLock, SystemClock, TagName};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, clap::Args)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct CachedTag {
    tag: String,
    file: String,
    bytes: u64,
    rows: Option<usize>,
    newest: Option<String>,
    error: Option<String>,
}

pub fn run(args: &StatusArgs, config: &Config, config_source: Option<&Path>) -> Result<()> {
    let lock = RunLock::new(
        config.lock_path.clone(),
        config.stale_after(),
        Arc::new(SystemClock),
    );
    let lock_state = lock.inspect().context("Failed to inspect run lock")?;
    let tags = cached_tags(config)?;

    if args.json {
        let out = json!({
            "config_file": config_source.map(|p| p.display().to_string()),
            "remote_dir": config.remote_dir,
            "database": {
                "path": config.database.display().to_string(),
                "exists": config.database.exists(),
            },
            "lock": lock_json(&lock_state, config),
            "cache_dir": config.cache_dir.display().to_string(),
            "tags": tags,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("HISTSYNC STATUS");
    println!("===============");
    println!();
    match config_source {
        Some(path) => println!("Config:   {}", path.display()),
        None => println!("Config:   (defaults)"),
    }
    println!(
        "Remote:   {}",
        config.remote_dir.as_deref().unwrap_or("(not configured)")
    );
    println!(
        "Database: {} ({})",
        config.database.display(),
        exists_label(config.database.exists())
    );
    println!("Lock:     {}", describe_lock(&lock_state));
    println!("Cache:    {} ({} tags)", config.cache_dir.display(), tags.len());

    if !tags.is_empty() {
        println!();
        let rows = tags
            .iter()
            .map(|t| {
                vec![
                    t.tag.clone(),
                    t.rows
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unreadable".to_string()),
                    t.newest.clone().unwrap_or_else(|| "-".to_string()),
                    format_size(t.bytes),
                ]
            })
            .collect();
        print_table(&["TAG", "ROWS", "NEWEST", "SIZE"], rows);
    }
    Ok(())
}

fn cached_tags(config: &Config) -> Result<Vec<CachedTag>> {
    if !config.cache_dir.exists() {
        return Ok(Vec::new());
    }
    let files = list_cache_files(&config.cache_dir, &config.file_suffix).with_context(|| {
        format!(
            "Failed to read cache directory {}",
            config.cache_dir.display()
        )
    })?;

    Ok(files
        .iter()
        .map(|path| {
            let file = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let tag = TagName::from_file_name(&file, &config.file_suffix)
                .map(|t| t.to_string())
                .unwrap_or_else(|_| file.clone());
            let bytes = path.metadata().map(|m| m.len()).unwrap_or(0);
            match read_samples(path) {
                Ok(samples) => CachedTag {
                    tag,
                    file,
                    bytes,
                    rows: Some(samples.len()),
                    newest: samples.last().map(|s| format_timestamp(&s.timestamp)),
                    error: None,
                },
                Err(e) => CachedTag {
                    tag,
                    file,
                    bytes,
                    rows: None,
                    newest: None,
                    error: Some(e.to_string()),
                },
            }
        })
        .collect())
}

fn describe_lock(state: &LockState) -> String {
    match state {
        LockState::Unlocked => "free".to_string(),
        LockState::Held { acquired_at, age } => format!(
            "held since {} ({} min)",
            acquired_at.format("%Y-%m-%d %H:%M:%S"),
            age.num_minutes()
        ),
        LockState::Stale { acquired_at, age } => format!(
            "stale since {} ({} min, will be cleared on next run)",
            acquired_at.format("%Y-%m-%d %H:%M:%S"),
            age.num_minutes()
        ),
        LockState::Corrupt { .. } => "corrupt (will be cleared on next run)".to_string(),
    }
}

fn lock_json(state: &LockState, config: &Config) -> serde_json::Value {
    let path = config.lock_path.display().to_string();
    match state {
        LockState::Unlocked => json!({ "path": path, "state": "unlocked" }),
        LockState::Held { acquired_at, age } => json!({
            "path": path,
            "state": "held",
            "acquired_at": acquired_at.to_string(),
            "age_secs": age.num_seconds(),
        }),
        LockState::Stale { acquired_at, age } => json!({
            "path": path,
            "state": "stale",
            "acquired_at": acquired_at.to_string(),
            "age_secs": age.num_seconds(),
        }),
        LockState::Corrupt { content } => json!({
            "path": path,
            "state": "corrupt",
            "content": content,
        }),
    }
}
