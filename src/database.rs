/// SQLite connection management shared by every sqlx-backed adapter
///
/// One pool serves the execution store, canvas store, lock leases and the
/// durable queue so that worker processes pointed at the same file coordinate
/// through the same database.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Open (or create) the database described by `url`
///
/// Accepts a plain file path, a `sqlite:` URL, or `:memory:`.
pub async fn connect_pool(url: &str) -> Result<SqlitePool> {
    if url == ":memory:" || url == "sqlite::memory:" {
        return memory_pool().await;
    }

    let path = url.strip_prefix("sqlite:").unwrap_or(url);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory '{}'", parent.display()))?;
        }
    }

    tracing::info!("🗄️ Opening scheduler database: {}", path);

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database '{}'", path))?;

    Ok(pool)
}

/// Single-connection in-memory database
///
/// Every sqlite in-memory connection is its own database, so the pool is
/// pinned to one connection that never idles out.
pub async fn memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to open in-memory database")?;
    Ok(pool)
}
