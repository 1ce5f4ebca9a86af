//! SQLite connection pool for the sync state database.
//!
//! Parallel source tasks upsert file records concurrently, so the pool runs
//! in WAL mode with a busy timeout and is sized by `db.max_connections`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::{Config, DEFAULT_MAX_CONNECTIONS};

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    open(&config.db.path, config.db.max_connections).await
}

/// Open a pool at `db_path` with the default size.
pub async fn connect_path(db_path: &Path) -> Result<SqlitePool> {
    open(db_path, DEFAULT_MAX_CONNECTIONS).await
}

async fn open(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    tracing::debug!(path = %db_path.display(), max_connections, "database opened");
    Ok(pool)
}
