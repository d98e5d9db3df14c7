use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use lifelock_sync::config::{self, Config};
use lifelock_sync::db::{self, LocalCache};
use lifelock_sync::model::now_millis;
use lifelock_sync::orchestrator::{Orchestrator, SyncPolicy};
use lifelock_sync::remote::SupabaseClient;
use lifelock_sync::store::OfflineStore;
use lifelock_sync::sync_map::SyncTableMap;

#[derive(Debug, Parser)]
#[command(author, version, about = "Offline action queue sync for LifeLock")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Keep syncing until interrupted (default)
    Run,
    /// Apply every due action once and exit; fails if any action was dropped
    Sync,
    /// Show queued and dropped actions
    Status,
    /// Check the sync table map against the configured schema
    CheckSchema,
    /// Print a sample config file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run);
    if let Command::ExampleConfig = command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let map = SyncTableMap::default();

    if let Command::CheckSchema = command {
        return check_schema(&cfg, &map);
    }

    let storage = db::open_local(&cfg.database_url()).await?;
    let cache = LocalCache::new(storage.pool.clone());

    if let Command::Status = command {
        return print_status(&OfflineStore::new(cache, map)).await;
    }

    if cfg.remote.dev_bypass {
        warn!("dev_bypass enabled: requests rely on development row-level-security policies");
    } else if cfg.bearer_token().is_none() {
        warn!("no access token configured; requests run as the anon role");
    }
    let remote = Arc::new(SupabaseClient::from_config(&cfg)?);
    let policy = SyncPolicy::from_config(&cfg);
    let orchestrator = Orchestrator::new(cache, remote, map, &cfg.schema, policy)?;

    match command {
        Command::Sync => {
            let report = orchestrator.sync_pass(now_millis()).await?;
            let remaining = orchestrator.queue().count().await?;
            info!(
                confirmed = report.confirmed,
                retried = report.retried,
                deferred = report.deferred,
                dropped = report.dropped.len(),
                remaining,
                "sync finished"
            );
            for notice in &report.dropped {
                error!(
                    action_id = notice.action_id,
                    entity = %notice.entity,
                    entity_id = %notice.entity_id,
                    error = %notice.error,
                    "{}",
                    notice.reason.user_message()
                );
            }
            if !report.dropped.is_empty() {
                bail!("{} action(s) dropped", report.dropped.len());
            }
        }
        _ => {
            // A CLI process has no network events; treat it as always online.
            let (_online_tx, online_rx) = watch::channel(true);
            info!("starting sync loop");
            orchestrator
                .run(online_rx, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
    }

    Ok(())
}

fn check_schema(cfg: &Config, map: &SyncTableMap) -> Result<()> {
    match map.validate(&cfg.schema) {
        Ok(()) => {
            for (entity, entry) in map.iter() {
                println!(
                    "{:<18} {:<20} on_conflict={}",
                    entity.as_str(),
                    entry.table,
                    entry.effective_conflict_key().join(",")
                );
            }
            println!("ok");
            Ok(())
        }
        Err(mismatches) => {
            for mismatch in &mismatches {
                println!("MISMATCH {mismatch}");
            }
            bail!("{} conflict key mismatch(es)", mismatches.len())
        }
    }
}

async fn print_status(store: &OfflineStore) -> Result<()> {
    let status = store.status().await?;
    println!("pending actions: {}", status.pending);
    println!("dropped actions: {}", status.dropped);
    if status.working_offline {
        println!("working offline: local changes are waiting to sync");
    }
    if let Some(due) = store.queue().next_due_at().await? {
        println!("next attempt due: {}", due.to_rfc3339());
    }
    for dropped in store.dropped().await? {
        println!(
            "  #{} {} {} {} ({}): {}",
            dropped.id,
            dropped.entity_type,
            dropped.kind.as_str(),
            dropped.entity_id,
            dropped.reason,
            dropped.error
        );
    }
    Ok(())
}
