/// Named job queues for node dispatch and reconciliation
///
/// Jobs carry an id; while a job with the same id is still pending a second
/// enqueue collapses into it. A claimed job is removed from the queue, so
/// delivery is at-most-once per claim and liveness comes from reconciliation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Queue consumed by the node runner
pub const RUN_QUEUE: &str = "workflow-run";
/// Queue consumed by the reconciliation poller
pub const POLL_QUEUE: &str = "workflow-poll";

/// Work item carried by a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueJob {
    RunNode { execution_id: String, node_id: String },
    PollExecution { execution_id: String },
}

impl QueueJob {
    pub fn run_node(execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        QueueJob::RunNode {
            execution_id: execution_id.into(),
            node_id: node_id.into(),
        }
    }

    pub fn poll_execution(execution_id: impl Into<String>) -> Self {
        QueueJob::PollExecution {
            execution_id: execution_id.into(),
        }
    }

    /// Deterministic dedup key: `run:{exec}:{node}` or `poll:{exec}`
    pub fn dedup_id(&self) -> String {
        match self {
            QueueJob::RunNode { execution_id, node_id } => format!("run:{}:{}", execution_id, node_id),
            QueueJob::PollExecution { execution_id } => format!("poll:{}", execution_id),
        }
    }
}

/// Enqueue parameters
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Earliest time the job may be claimed, relative to now
    pub delay: Option<Duration>,
    /// Dedup key; a random id is used when absent
    pub job_id: Option<String>,
}

impl EnqueueOptions {
    pub fn deduplicated(job_id: impl Into<String>) -> Self {
        Self {
            delay: None,
            job_id: Some(job_id.into()),
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            job_id: None,
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    fn resolve(&self) -> (String, DateTime<Utc>) {
        let job_id = self
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let delay = self
            .delay
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .unwrap_or_else(ChronoDuration::zero);
        (job_id, Utc::now() + delay)
    }
}

/// A job waiting in a queue
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub job_id: String,
    pub job: QueueJob,
    pub available_at: DateTime<Utc>,
}

/// A named queue with delayed delivery and dedup by job id
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    /// False for the null queue used in single-process mode
    fn is_enabled(&self) -> bool {
        true
    }

    /// Returns false when the job collapsed into a pending duplicate (or was dropped)
    async fn enqueue(&self, job: QueueJob, options: EnqueueOptions) -> Result<bool>;

    /// Remove and return the oldest due job
    async fn claim(&self) -> Result<Option<QueueJob>>;

    /// Jobs not yet claimed, oldest first
    async fn pending(&self) -> Result<Vec<PendingJob>>;
}

/// Durable queue stored in the shared SQLite database
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    name: String,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                job_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                available_at INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(queue, job_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_jobs_due ON queue_jobs(queue, available_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job: QueueJob, options: EnqueueOptions) -> Result<bool> {
        let (job_id, available_at) = options.resolve();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_jobs (queue, job_id, payload, available_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.name)
        .bind(&job_id)
        .bind(serde_json::to_string(&job)?)
        .bind(available_at.timestamp_millis())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to enqueue {} on {}", job_id, self.name))?;

        let accepted = result.rows_affected() > 0;
        if !accepted {
            tracing::debug!("🔁 Job {} already pending on {}", job_id, self.name);
        }
        Ok(accepted)
    }

    async fn claim(&self) -> Result<Option<QueueJob>> {
        let row = sqlx::query(
            r#"
            DELETE FROM queue_jobs
            WHERE seq = (
                SELECT seq FROM queue_jobs
                WHERE queue = ? AND available_at <= ?
                ORDER BY available_at, seq
                LIMIT 1
            )
            RETURNING job_id, payload
            "#,
        )
        .bind(&self.name)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to claim from {}", self.name))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job_id: String = row.get("job_id");
        let payload: String = row.get("payload");
        match serde_json::from_str(&payload) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                tracing::warn!("⚠️ Dropping unreadable job {} on {}: {}", job_id, self.name, e);
                Ok(None)
            }
        }
    }

    async fn pending(&self) -> Result<Vec<PendingJob>> {
        let rows = sqlx::query(
            "SELECT job_id, payload, available_at FROM queue_jobs WHERE queue = ? ORDER BY available_at, seq",
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let payload: String = row.get("payload");
                let job = serde_json::from_str(&payload).ok()?;
                let available_at: i64 = row.get("available_at");
                Some(PendingJob {
                    job_id: row.get("job_id"),
                    job,
                    available_at: DateTime::from_timestamp_millis(available_at)?,
                })
            })
            .collect())
    }
}

/// In-process queue for tests and embedded runs
#[derive(Debug)]
pub struct MemoryJobQueue {
    name: String,
    jobs: Mutex<Vec<PendingJob>>,
}

impl MemoryJobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Remove and return the oldest job regardless of its delay
    pub async fn claim_ignoring_delay(&self) -> Option<QueueJob> {
        let mut jobs = self.jobs.lock().await;
        if jobs.is_empty() {
            None
        } else {
            Some(jobs.remove(0).job)
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, job: QueueJob, options: EnqueueOptions) -> Result<bool> {
        let (job_id, available_at) = options.resolve();
        let mut jobs = self.jobs.lock().await;
        if jobs.iter().any(|pending| pending.job_id == job_id) {
            return Ok(false);
        }
        jobs.push(PendingJob {
            job_id,
            job,
            available_at,
        });
        Ok(true)
    }

    async fn claim(&self) -> Result<Option<QueueJob>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let due = jobs
            .iter()
            .enumerate()
            .filter(|(_, pending)| pending.available_at <= now)
            .min_by_key(|(_, pending)| pending.available_at)
            .map(|(position, _)| position);
        Ok(due.map(|position| jobs.remove(position).job))
    }

    async fn pending(&self) -> Result<Vec<PendingJob>> {
        Ok(self.jobs.lock().await.clone())
    }
}

/// Queue that accepts and drops everything (no queue backend configured)
#[derive(Debug, Clone)]
pub struct NullJobQueue {
    name: String,
}

impl NullJobQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl JobQueue for NullJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn enqueue(&self, job: QueueJob, _options: EnqueueOptions) -> Result<bool> {
        tracing::trace!("🕳️ {} has no backend, dropping {:?}", self.name, job);
        Ok(false)
    }

    async fn claim(&self) -> Result<Option<QueueJob>> {
        Ok(None)
    }

    async fn pending(&self) -> Result<Vec<PendingJob>> {
        Ok(Vec::new())
    }
}
