/// Configuration management for the canvasflow scheduler
///
/// Handles server binding, database location, scheduler timing and the skill
/// subsystem endpoint. Every value can be overridden through a CANVASFLOW_* env var.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Dispatch, reconciliation and locking parameters
    pub scheduler: SchedulerConfig,
    /// Skill subsystem endpoint
    pub skill: SkillConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path, or ":memory:" for a throwaway database
    pub url: String,
}

/// Which queue backend carries dispatch and reconciliation messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Durable SQLite-backed queue shared by every worker process
    Sqlite,
    /// No queue: enqueue calls are no-ops (desktop / standalone mode)
    None,
}

impl QueueBackend {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "disabled" => QueueBackend::None,
            _ => QueueBackend::Sqlite,
        }
    }
}

/// Scheduler timing and worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub queue_backend: QueueBackend,
    /// Delay between reconciliation passes for one execution
    pub poll_interval_ms: u64,
    /// TTL of the per-node lock
    pub lock_ttl_ms: u64,
    /// Concurrent consumers of the run queue
    pub run_workers: usize,
    /// Concurrent consumers of the poll queue
    pub poll_workers: usize,
    /// Back-off when a queue has nothing due
    pub queue_idle_ms: u64,
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn queue_idle(&self) -> Duration {
        Duration::from_millis(self.queue_idle_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_backend: QueueBackend::Sqlite,
            poll_interval_ms: 1500,
            lock_ttl_ms: 60_000,
            run_workers: 4,
            poll_workers: 2,
            queue_idle_ms: 200,
        }
    }
}

/// Skill subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillConfig {
    /// URL receiving fire-and-forget skill invocations
    pub endpoint: String,
    /// Timeout for the dispatch request (not for the skill itself)
    pub timeout_ms: u64,
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let scheduler_defaults = SchedulerConfig::default();
        Self {
            server: ServerConfig {
                host: env_or("CANVASFLOW_HOST", "0.0.0.0"),
                port: env_parse("CANVASFLOW_PORT", 3004),
            },
            database: DatabaseConfig {
                url: env_or("CANVASFLOW_DATABASE_URL", "data/canvasflow.db"),
            },
            scheduler: SchedulerConfig {
                queue_backend: QueueBackend::parse(&env_or("CANVASFLOW_QUEUE_BACKEND", "sqlite")),
                poll_interval_ms: env_parse("CANVASFLOW_POLL_INTERVAL_MS", scheduler_defaults.poll_interval_ms),
                lock_ttl_ms: env_parse("CANVASFLOW_LOCK_TTL_MS", scheduler_defaults.lock_ttl_ms),
                run_workers: env_parse("CANVASFLOW_RUN_WORKERS", scheduler_defaults.run_workers),
                poll_workers: env_parse("CANVASFLOW_POLL_WORKERS", scheduler_defaults.poll_workers),
                queue_idle_ms: env_parse("CANVASFLOW_QUEUE_IDLE_MS", scheduler_defaults.queue_idle_ms),
            },
            skill: SkillConfig {
                endpoint: env_or("CANVASFLOW_SKILL_ENDPOINT", "http://127.0.0.1:5800/v1/skill/invoke"),
                timeout_ms: env_parse("CANVASFLOW_SKILL_TIMEOUT_MS", 10_000),
            },
        }
    }
}
