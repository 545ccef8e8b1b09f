/// Error taxonomy for workflow orchestration
///
/// Callers of `initialize` / `abort` / `get_detail` only ever see these variants.
/// Transient races (lock contention, a compare-and-swap that matched zero rows)
/// are never errors and never reach this type.

use thiserror::Error;

/// Result alias for scheduler-facing operations
pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Missing canvas or execution, or a caller that does not own it
    #[error("Not found: {0}")]
    NotFound(String),

    /// Canvas graph cannot be executed (cycle, dangling edge)
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Malformed request input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Node-type dispatch failed; the node has already been marked failed
    #[error("Node '{node_id}' failed: {message}")]
    NodeFailed { node_id: String, message: String },

    /// Store, queue, lock, canvas or skill adapter failure
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Stable machine-readable code used in API responses
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::NotFound(_) => "NOT_FOUND",
            WorkflowError::InvalidGraph(_) => "INVALID_GRAPH",
            WorkflowError::InvalidRequest(_) => "INVALID_REQUEST",
            WorkflowError::NodeFailed { .. } => "NODE_FAILED",
            WorkflowError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to return over HTTP; internal details stay in the logs
    pub fn external_message(&self) -> String {
        match self {
            WorkflowError::Internal(_) => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        WorkflowError::NotFound(what.into())
    }
}
