//! Peer Sync - Main entry point

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peer_sync::audit::SyncAttempt;
use peer_sync::config::Config;
use peer_sync::crypto::{EncryptionKey, FileKeyStore};
use peer_sync::daemon::{self, PairOutcome, ShutdownCoordinator, SyncRunner};
use peer_sync::manifest::ManifestBuilder;
use peer_sync::transfer::progress::{format_bytes, format_duration};
use peer_sync::{utils, SyncReport, SyncStrategy};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "/etc/peer-sync/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one sync pass over every enabled share and peer
    Sync {
        /// Only shares of this owner
        #[arg(long)]
        owner: Option<i64>,
        /// Only the share with this name
        #[arg(long)]
        share: Option<String>,
        /// Only this peer
        #[arg(long)]
        peer: Option<i64>,
    },
    /// Send one share to one peer as a full encrypted archive
    Archive {
        #[arg(long)]
        owner: i64,
        #[arg(long)]
        share: String,
        #[arg(long)]
        peer: i64,
    },
    /// Run scheduled sync passes until interrupted
    Daemon,
    /// Show recent sync attempts
    History {
        #[arg(long)]
        owner: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Build the manifest of a directory and print its statistics
    Manifest {
        path: PathBuf,
        /// Print the full manifest as JSON
        #[arg(long)]
        json: bool,
    },
    /// Generate and store a new encryption key for an owner
    Keygen {
        #[arg(long)]
        owner: i64,
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        Config::from_file(&args.config)?
    } else if matches!(args.command, Command::Manifest { .. }) {
        Config::default()
    } else {
        bail!("configuration file {} not found", args.config.display());
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting peer-sync v{} (origin: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.origin_server
    );

    match args.command {
        Command::Sync { owner, share, peer } => sync(config, owner, share, peer).await,
        Command::Archive { owner, share, peer } => archive(config, owner, share, peer).await,
        Command::Daemon => daemon::run(config).await,
        Command::History { owner, limit } => history(&config, owner, limit).await,
        Command::Manifest { path, json } => manifest(&config, path, json).await,
        Command::Keygen { owner, force } => keygen(&config, owner, force),
    }
}

fn runner(config: Config) -> Result<SyncRunner> {
    let config = Arc::new(config);
    let (engine, _audit) = daemon::engine_from_config(&config)?;
    Ok(SyncRunner::from_config(config, Arc::new(engine))?)
}

/// Token cancelled on SIGINT/SIGTERM. Cancel it to stop listening.
fn spawn_signal_handler() -> CancellationToken {
    let shutdown = ShutdownCoordinator::new();
    let token = shutdown.token();
    tokio::spawn(async move { shutdown.wait_for_signal().await });
    token
}

fn print_report(label: &str, report: &SyncReport) {
    println!(
        "{}: {} of {} files sent ({}), {} deleted, {} orphans removed in {}",
        label,
        report.files_uploaded,
        report.files_total,
        format_bytes(report.bytes_sent),
        report.files_deleted,
        report.orphans_removed,
        format_duration(report.duration.as_secs())
    );
}

async fn sync(mut config: Config, owner: Option<i64>, share: Option<String>, peer: Option<i64>) -> Result<()> {
    config
        .shares
        .retain(|s| owner.is_none_or(|o| s.owner_id == o) && share.as_ref().is_none_or(|n| &s.name == n));
    config.peers.retain(|p| peer.is_none_or(|id| p.id == id));
    if config.shares.iter().all(|s| !s.enabled) || config.peers.iter().all(|p| !p.enabled) {
        bail!("no enabled share/peer pair matches the selection");
    }

    let runner = runner(config)?;
    let cancel = spawn_signal_handler();
    let results = runner.run_all(&cancel).await;

    let mut failed = 0;
    for result in &results {
        let label = format!("{}/{} -> peer {}", result.owner_id, result.share_name, result.peer_id);
        match &result.outcome {
            PairOutcome::Synced(report) => print_report(&label, report),
            PairOutcome::Skipped => println!("{}: skipped, already running", label),
            PairOutcome::Failed(e) => {
                failed += 1;
                println!("{}: failed: {}", label, e);
            }
        }
    }
    cancel.cancel();
    if failed > 0 {
        bail!("{} of {} sync attempts failed", failed, results.len());
    }
    Ok(())
}

async fn archive(config: Config, owner: i64, share: String, peer: i64) -> Result<()> {
    let share_config = config
        .share(owner, &share)
        .cloned()
        .with_context(|| format!("share {}/{} is not configured", owner, share))?;
    let peer_config = config
        .peer(peer)
        .cloned()
        .with_context(|| format!("peer {} is not configured", peer))?;

    let runner = runner(config)?;
    let cancel = spawn_signal_handler();
    let report = runner
        .run_pair(&share_config, &peer_config, Some(SyncStrategy::Archive), &cancel)
        .await;
    cancel.cancel();
    print_report(&format!("{}/{} -> peer {}", owner, share, peer), &report?);
    Ok(())
}

async fn history(config: &Config, owner: Option<i64>, limit: usize) -> Result<()> {
    let (_engine, audit) = daemon::engine_from_config(config)?;
    let attempts: Vec<SyncAttempt> = tokio::task::spawn_blocking(move || audit.recent(owner, limit)).await??;

    for attempt in attempts {
        let finished = attempt
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "#{:<6} owner {:<5} peer {:<4} {:<8} {} -> {}  {} files, {}  {}",
            attempt.id,
            attempt.owner_id,
            attempt.peer_id,
            attempt.status,
            attempt.started_at.format("%Y-%m-%d %H:%M:%S"),
            finished,
            attempt.files_transferred,
            format_bytes(attempt.bytes_transferred),
            attempt.error_detail
        );
    }
    Ok(())
}

async fn manifest(config: &Config, path: PathBuf, json: bool) -> Result<()> {
    let builder = ManifestBuilder::new(config.sync.remote_naming);
    let origin = config.agent.origin_server.clone();
    let (manifest, stats) = tokio::task::spawn_blocking(move || builder.build(&path, 0, "local", &origin)).await??;

    if json {
        println!("{}", String::from_utf8_lossy(&manifest.to_json()?));
    } else {
        println!(
            "{} files, {} ({} hashed, {} cached, {} skipped)",
            stats.files,
            format_bytes(stats.total_bytes),
            stats.hashed,
            stats.reused,
            stats.skipped
        );
    }
    Ok(())
}

fn keygen(config: &Config, owner: i64, force: bool) -> Result<()> {
    let store = FileKeyStore::new(config.agent.keys_dir());
    let path = store.dir().join(format!("{}.key", owner));
    if path.exists() && !force {
        bail!("{} already exists, pass --force to replace it", path.display());
    }
    store.store(owner, &EncryptionKey::generate())?;
    println!("Key for owner {} written to {}", owner, path.display());
    Ok(())
}
