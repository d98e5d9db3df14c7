//! Local durable storage: the record cache, the offline action queue and
//! key-value settings, all in one SQLite database.
//!
//! - `cache`: per-entity object stores with last-write-wins puts.
//! - `queue`: the append-only log of pending mutations.
//! - `settings`: small key-value pairs such as pull cursors.
//! - `model`: row types shared by the repositories.
//!
//! When the durable file cannot be opened the caller gets an in-memory
//! database with the same schema instead of an error; see [`open_local`].

pub mod cache;
pub mod model;
pub mod queue;
pub mod settings;

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::{info, warn};

pub use cache::{LocalCache, RecordFilter};

pub type Pool = SqlitePool;

/// Whether local writes survive a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Durable,
    MemoryOnly,
}

#[derive(Debug, Clone)]
pub struct LocalStorage {
    pub pool: Pool,
    pub mode: StorageMode,
}

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url)?;
    let pool = SqlitePoolOptions::new()
        .connect(&normalized)
        .await
        .with_context(|| format!("failed to open {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Single-connection in-memory pool. The connection is never recycled, so the
/// database lives as long as the pool.
pub async fn memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Open and migrate the durable store, degrading to memory-only when the file
/// is unusable. The fallback is logged once here and never fails the app.
pub async fn open_local(database_url: &str) -> Result<LocalStorage> {
    let durable = async {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        anyhow::Ok(pool)
    };
    match durable.await {
        Ok(pool) => {
            info!(database_url, "local storage opened");
            Ok(LocalStorage {
                pool,
                mode: StorageMode::Durable,
            })
        }
        Err(err) => {
            warn!(
                ?err,
                database_url,
                "local storage unavailable; continuing in memory-only mode, \
                 changes will not survive a restart"
            );
            let pool = memory_pool().await?;
            run_migrations(&pool).await?;
            Ok(LocalStorage {
                pool,
                mode: StorageMode::MemoryOnly,
            })
        }
    }
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass
/// through untouched.
fn prepare_sqlite_url(url: &str) -> Result<String> {
    // Pass through non-sqlite schemes
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return Ok(url.to_string());
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return Ok(url.to_string());
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    Ok(rebuilt)
}

#[cfg(test)]
pub(crate) async fn test_pool() -> Pool {
    let pool = memory_pool().await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
