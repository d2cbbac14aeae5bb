//! Bulwark CLI
//!
//! Operator tooling for a snapshot directory:
//! - listing, inspecting, sweeping and deleting stored snapshots
//! - previewing how a set of structural points is partitioned into zones
//! - printing and checking engine configuration files

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod snapshots;
mod zones;

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(author, version, about = "Bulwark: structure snapshots and rollback")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). `RUST_LOG` wins.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and maintain a snapshot directory.
    Snapshots {
        #[command(subcommand)]
        command: SnapshotCommands,
    },

    /// Partition structural points (JSON list of `{x,y,z}`) into zones.
    Zones {
        /// Input points JSON
        #[arg(short, long)]
        input: PathBuf,
        /// Padding radius added around every zone
        #[arg(long)]
        zone_radius: Option<f32>,
        /// Zones wider than this are split
        #[arg(long)]
        max_radius: Option<f32>,
        /// Print zones as JSON
        #[arg(long)]
        json: bool,
    },

    /// Engine configuration helpers.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// List snapshots, newest first.
    List {
        /// Snapshot directory
        #[arg(long, default_value = "./bulwark")]
        dir: PathBuf,
        /// Show at most this many
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print full ids instead of short prefixes
        #[arg(long)]
        full: bool,
        /// Print metadata as JSON
        #[arg(long)]
        json: bool,
        /// Only snapshots whose zones contain this `x,y,z` point
        #[arg(long)]
        at: Option<String>,
    },

    /// Show one snapshot (`latest`, a full id or a unique prefix).
    Show {
        snapshot: String,
        #[arg(long, default_value = "./bulwark")]
        dir: PathBuf,
        /// Also list every recorded object
        #[arg(long)]
        objects: bool,
    },

    /// Delete snapshots older than the retention window.
    Sweep {
        #[arg(long, default_value = "./bulwark")]
        dir: PathBuf,
        #[arg(long, default_value_t = 7)]
        retention_days: u32,
    },

    /// Delete one snapshot.
    Delete {
        snapshot: String,
        #[arg(long, default_value = "./bulwark")]
        dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the default configuration as JSON.
    Default,
    /// Load and validate a configuration file.
    Check { file: PathBuf },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Snapshots { command } => match command {
            SnapshotCommands::List {
                dir,
                limit,
                full,
                json,
                at,
            } => snapshots::cmd_list(&dir, limit, full, json, at.as_deref())?,
            SnapshotCommands::Show {
                snapshot,
                dir,
                objects,
            } => snapshots::cmd_show(&dir, &snapshot, objects)?,
            SnapshotCommands::Sweep {
                dir,
                retention_days,
            } => snapshots::cmd_sweep(&dir, retention_days)?,
            SnapshotCommands::Delete { snapshot, dir } => snapshots::cmd_delete(&dir, &snapshot)?,
        },
        Commands::Zones {
            input,
            zone_radius,
            max_radius,
            json,
        } => zones::cmd_zones(&input, zone_radius, max_radius, json)?,
        Commands::Config { command } => match command {
            ConfigCommands::Default => cmd_config_default()?,
            ConfigCommands::Check { file } => cmd_config_check(&file)?,
        },
    }
    Ok(())
}

fn cmd_config_default() -> Result<()> {
    let config = bulwark_engine::BackupConfig::default();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn cmd_config_check(file: &PathBuf) -> Result<()> {
    use colored::Colorize;

    let config = bulwark_engine::BackupConfig::load(file)
        .with_context(|| format!("invalid config {}", file.display()))?;
    println!("{} {}", "ok".green().bold(), file.display());
    println!(
        "  zones: radius={} max={} depth={}",
        config.zone_radius, config.max_zone_radius, config.max_split_depth
    );
    println!(
        "  saves: delay={}s retries={} step={}ms linking={}",
        config.save_delay_secs,
        config.max_retries,
        config.max_step_duration_ms,
        config.link_structures
    );
    println!(
        "  store: {} (retention {} days)",
        config.storage.root.display(),
        config.storage.retention_days
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snapshot_commands() {
        let cli = Cli::try_parse_from([
            "bulwark", "-vv", "snapshots", "show", "latest", "--dir", "/tmp/b",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Snapshots {
                command: SnapshotCommands::Show { snapshot, dir, objects },
            } => {
                assert_eq!(snapshot, "latest");
                assert_eq!(dir, PathBuf::from("/tmp/b"));
                assert!(!objects);
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn sweep_defaults_to_a_week() {
        let cli = Cli::try_parse_from(["bulwark", "snapshots", "sweep"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Snapshots {
                command: SnapshotCommands::Sweep { retention_days: 7, .. }
            }
        ));
    }

    #[test]
    fn config_check_accepts_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bulwark.json");
        std::fs::write(&path, r#"{ "zone_radius": 25.0 }"#).unwrap();
        cmd_config_check(&path).unwrap();

        std::fs::write(&path, r#"{ "zone_radius": 250.0 }"#).unwrap();
        assert!(cmd_config_check(&path).is_err());
    }
}
