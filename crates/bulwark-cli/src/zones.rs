//! `bulwark zones`: run the partitioner over a point list.

use std::path::Path;

use anyhow::{Context, Result};
use bulwark_engine::BackupConfig;
use bulwark_model::{Vec3, ZoneDescriptor, ZonePartitioner};
use colored::Colorize;

pub(crate) fn partition_file(
    input: &Path,
    zone_radius: Option<f32>,
    max_radius: Option<f32>,
) -> Result<(usize, Vec<ZoneDescriptor>)> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let points: Vec<Vec3> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a JSON list of points", input.display()))?;

    let defaults = BackupConfig::default();
    let partitioner = ZonePartitioner::new(
        zone_radius.unwrap_or(defaults.zone_radius),
        max_radius.unwrap_or(defaults.max_zone_radius),
    )?
    .with_max_depth(defaults.max_split_depth);
    Ok((points.len(), partitioner.partition(&points)))
}

pub fn cmd_zones(
    input: &Path,
    zone_radius: Option<f32>,
    max_radius: Option<f32>,
    json: bool,
) -> Result<()> {
    let (count, zones) = partition_file(input, zone_radius, max_radius)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&zones)?);
        return Ok(());
    }
    println!(
        "{} {} point(s) into {} zone(s)",
        "Partitioned".green().bold(),
        count,
        zones.len()
    );
    for (i, z) in zones.iter().enumerate() {
        println!("  #{i:<3} center={} radius={:.2}", z.center, z.radius);
    }
    Ok(())
}
