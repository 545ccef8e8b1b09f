/// Lease locks keyed by (executionId, nodeId)
///
/// A lock is a row holding a random token and an expiry. Acquiring succeeds when
/// no row exists or the existing lease has expired; release only deletes the row
/// if the token still matches, so a worker whose lease expired cannot free a lock
/// someone else now holds.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Distributed mutual exclusion with TTL
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try once; `Some(token)` when acquired, `None` when another holder has it
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>>;

    /// Release a lock previously acquired with `token`
    async fn release(&self, key: &str, token: &str) -> Result<()>;
}

/// Lock key for one node of one execution
pub fn node_lock_key(execution_id: &str, node_id: &str) -> String {
    format!("workflow:node:{}:{}", execution_id, node_id)
}

fn expiry_millis(ttl: Duration) -> i64 {
    Utc::now().timestamp_millis() + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2)
}

/// Lease locks stored in the shared SQLite database
#[derive(Debug, Clone)]
pub struct SqliteLockService {
    pool: SqlitePool,
}

impl SqliteLockService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_locks (
                lock_key TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LockService for SqliteLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        // Take over only an expired lease
        let result = sqlx::query(
            r#"
            INSERT INTO node_locks (lock_key, token, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(lock_key) DO UPDATE
                SET token = excluded.token, expires_at = excluded.expires_at
                WHERE node_locks.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(&token)
        .bind(expiry_millis(ttl))
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to acquire lock {}", key))?;

        if result.rows_affected() > 0 {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        sqlx::query("DELETE FROM node_locks WHERE lock_key = ? AND token = ?")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to release lock {}", key))?;
        Ok(())
    }
}

/// In-process lease locks for tests and single-process runs
#[derive(Debug, Default)]
pub struct MemoryLockService {
    /// key -> (token, expires_at millis)
    leases: Mutex<HashMap<String, (String, i64)>>,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        let now = Utc::now().timestamp_millis();
        let mut leases = self.leases.lock().await;
        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        leases.insert(key.to_string(), (token.clone(), expiry_millis(ttl)));
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|(held, _)| held == token) {
            leases.remove(key);
        }
        Ok(())
    }
}
