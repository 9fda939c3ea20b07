//! txnrep CLI - Offline inspection of state manager files
//!
//! Reads checkpoint files, backup folders and replica work directories
//! without starting a replica.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use txnrep_common::{StateManagerConfig, checksum};
use txnrep_state_manager::constants::BACKUP_FILE_NAME;
use txnrep_state_manager::work_dir;
use txnrep_state_manager::{CheckpointFile, SerializableMetadata};

#[derive(Parser, Debug)]
#[command(name = "txnrep-cli")]
#[command(about = "txnrep state manager inspection tool")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/txnrep/state-manager.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the records of a checkpoint file
    Inspect {
        /// Checkpoint file path
        file: PathBuf,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Check that a backup folder is complete
    BackupInfo {
        /// Backup folder
        dir: PathBuf,
    },
    /// List replica folders below a work directory
    WorkDir {
        /// Work directory (defaults to the configured one)
        dir: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct CheckpointView<'a> {
    version: u32,
    prepare_lsn: i64,
    record_count: u64,
    checksum: u32,
    created_at_ms: u64,
    /// xxh64 of the whole file, for comparing replicas
    fingerprint: String,
    records: &'a [SerializableMetadata],
}

impl<'a> CheckpointView<'a> {
    fn new(file: &'a CheckpointFile, fingerprint: u64) -> Self {
        Self {
            version: file.header.version,
            prepare_lsn: file.header.prepare_lsn,
            record_count: file.header.record_count,
            checksum: file.header.checksum,
            created_at_ms: file.header.created_at,
            fingerprint: format!("{fingerprint:016x}"),
            records: &file.records,
        }
    }
}

async fn load_config(path: &Path) -> StateManagerConfig {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        debug!(path = %path.display(), "no config file, using defaults");
        return StateManagerConfig::default();
    }
    match tokio::fs::read_to_string(path).await {
        Ok(text) => toml::from_str(&text).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "failed to parse config file");
            StateManagerConfig::default()
        }),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read config file");
            StateManagerConfig::default()
        }
    }
}

fn print_records(records: &[SerializableMetadata]) {
    println!(
        "{:<20} {:<20} {:<16} {:<12} {:>10} {:>10}  NAME",
        "ID", "PARENT", "TYPE", "MODE", "CREATE", "DELETE"
    );
    for r in records {
        println!(
            "{:<20} {:<20} {:<16} {:<12} {:>10} {:>10}  {}",
            r.state_provider_id.to_string(),
            r.parent_id.to_string(),
            r.type_name,
            r.mode.to_string(),
            r.create_lsn,
            r.delete_lsn,
            r.name
        );
    }
}

fn inspect(file: &Path, json: bool, config: &StateManagerConfig) -> Result<()> {
    let checkpoint = CheckpointFile::read(file, config.checkpoint.verify_checksum)
        .with_context(|| format!("failed to read checkpoint {}", file.display()))?;
    let fingerprint = checksum::fingerprint(&std::fs::read(file)?);

    if json {
        let view = CheckpointView::new(&checkpoint, fingerprint);
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!("Checkpoint: {}", file.display());
    println!("Version:     {}", checkpoint.header.version);
    println!("Prepare LSN: {}", checkpoint.header.prepare_lsn);
    println!("Records:     {}", checkpoint.header.record_count);
    println!("Checksum:    {:#010x}", checkpoint.header.checksum);
    println!("Fingerprint: {fingerprint:016x}");
    println!();
    print_records(&checkpoint.records);
    Ok(())
}

/// Provider ids in the backup that have no folder of their own
fn missing_provider_folders(dir: &Path, checkpoint: &CheckpointFile) -> Vec<String> {
    checkpoint
        .records
        .iter()
        .map(|r| r.state_provider_id.to_string())
        .filter(|id| !dir.join(id).is_dir())
        .collect()
}

fn backup_info(dir: &Path, config: &StateManagerConfig) -> Result<()> {
    let path = dir.join(BACKUP_FILE_NAME);
    let checkpoint = CheckpointFile::read(&path, config.checkpoint.verify_checksum)
        .with_context(|| format!("no readable backup in {}", dir.display()))?;

    println!("Backup: {}", dir.display());
    println!("Prepare LSN: {}", checkpoint.header.prepare_lsn);
    println!();
    print_records(&checkpoint.records);

    let missing = missing_provider_folders(dir, &checkpoint);
    if !missing.is_empty() {
        bail!("backup is missing provider folders: {}", missing.join(", "));
    }
    Ok(())
}

fn list_work_dir(dir: &Path) -> Result<()> {
    let scan = work_dir::scan(dir).with_context(|| format!("failed to scan {}", dir.display()))?;

    println!("Work directory: {}", dir.display());
    for replica in &scan.replica_dirs {
        let ids: Vec<_> = replica.state_provider_dirs.iter().map(ToString::to_string).collect();
        println!(
            "  {}  checkpoint={}  providers=[{}]",
            replica.path.display(),
            if replica.has_checkpoint { "yes" } else { "no" },
            ids.join(", ")
        );
    }
    for legacy in &scan.legacy_dirs {
        println!("  {}  (legacy layout)", legacy.display());
    }
    if scan.replica_dirs.is_empty() && scan.legacy_dirs.is_empty() {
        println!("  (empty)");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args.config).await;

    match args.command {
        Commands::Inspect { file, json } => inspect(&file, json, &config),
        Commands::BackupInfo { dir } => backup_info(&dir, &config),
        Commands::WorkDir { dir } => list_work_dir(dir.as_deref().unwrap_or(&config.work_dir)),
    }
}
