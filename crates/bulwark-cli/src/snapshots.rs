//! `bulwark snapshots ...`

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use bulwark_model::Vec3;
use bulwark_storage::{SnapshotMetadata, SnapshotStore, StorageConfig};
use chrono::{DateTime, Utc};
use colored::Colorize;

/// Open `dir` without sweeping anything.
fn open_store(dir: &Path) -> Result<SnapshotStore> {
    open_with_retention(dir, 0)
}

fn open_with_retention(dir: &Path, retention_days: u32) -> Result<SnapshotStore> {
    let config = StorageConfig {
        root: dir.to_path_buf(),
        retention_days,
    };
    SnapshotStore::open(config, Utc::now())
        .with_context(|| format!("failed to open snapshot store at {}", dir.display()))
}

pub(crate) fn format_age_compact(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - created_at).num_seconds().max(0) as u64;
    let days = delta / 86_400;
    let hours = (delta % 86_400) / 3_600;
    let mins = (delta % 3_600) / 60;
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else if mins > 0 {
        format!("{mins}m")
    } else {
        format!("{delta}s")
    }
}

fn format_snapshot_id(meta: &SnapshotMetadata, full: bool) -> String {
    if full {
        meta.id.to_string()
    } else {
        meta.short_id()
    }
}

/// Parse `x,y,z`.
pub(crate) fn parse_point(text: &str) -> Result<Vec3> {
    let parts: Vec<f32> = text
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid point `{text}`"))?;
    match parts.as_slice() {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(anyhow!("expected `x,y,z`, got `{text}`")),
    }
}

pub fn cmd_list(
    dir: &Path,
    limit: usize,
    full: bool,
    json: bool,
    at: Option<&str>,
) -> Result<()> {
    let store = open_store(dir)?;
    let mut snaps = match at {
        Some(point) => store.covering(parse_point(point)?),
        None => store.list(),
    };
    snaps.reverse();
    snaps.truncate(limit);

    if json {
        println!("{}", serde_json::to_string_pretty(&snaps)?);
        return Ok(());
    }

    let now = Utc::now();
    println!("snapshots (dir={}):", dir.display());
    let latest = store.latest().map(|m| m.id);
    for s in &snaps {
        let mark = if Some(s.id) == latest { "*" } else { " " };
        println!(
            " {mark} {} age={} structures={} objects={} zones={}",
            format_snapshot_id(s, full).bold(),
            format_age_compact(s.created_at, now),
            s.structures.len(),
            s.object_count,
            s.zones().count()
        );
    }
    if snaps.is_empty() {
        println!("  (none)");
    }
    Ok(())
}

pub fn cmd_show(dir: &Path, query: &str, objects: bool) -> Result<()> {
    let store = open_store(dir)?;
    let meta = store.resolve(query)?;

    println!("{} {}", "snapshot".green().bold(), meta.id);
    println!("  created:  {}", meta.created_at.to_rfc3339());
    println!("  payload:  {}", meta.payload_file);
    println!("  objects:  {}", meta.object_count);
    let users: Vec<String> = meta.authorized_users.iter().map(ToString::to_string).collect();
    println!(
        "  players:  {}",
        if users.is_empty() {
            "(none)".to_string()
        } else {
            users.join(", ")
        }
    );
    for s in &meta.structures {
        println!(
            "  structure {} at {}: {} objects, {} zone(s)",
            s.controller,
            s.position,
            s.object_count,
            s.zones.len()
        );
        for z in &s.zones {
            println!("    zone {} r={:.1}", z.center, z.radius);
        }
    }

    if objects {
        let payload = store.read_payload(&meta)?;
        for structure in &payload.structures {
            println!("  {} {}", "objects of".bold(), structure.controller);
            for o in &structure.objects {
                let owner = o
                    .owner
                    .map(|u| u.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "    {} {:?} {} at {} owner={} props={}",
                    o.id,
                    o.kind,
                    o.type_name,
                    o.transform.position,
                    owner,
                    o.properties.len()
                );
            }
        }
    }
    Ok(())
}

pub fn cmd_sweep(dir: &Path, retention_days: u32) -> Result<()> {
    if retention_days == 0 {
        return Err(anyhow!("--retention-days must be at least 1"));
    }
    let before = open_store(dir)?.len();
    let after = open_with_retention(dir, retention_days)?.len();
    println!(
        "{} swept {} snapshot(s) older than {} day(s); {} remain",
        "ok".green().bold(),
        before.saturating_sub(after),
        retention_days,
        after
    );
    Ok(())
}

pub fn cmd_delete(dir: &Path, query: &str) -> Result<()> {
    let store = open_store(dir)?;
    let meta = store.resolve(query)?;
    store.delete(meta.id)?;
    println!("{} deleted {}", "ok".green().bold(), meta.id);
    Ok(())
}
