/// canvasflow: DAG workflow scheduler for canvas-derived workflows
///
/// Runs every node of a workflow exactly once across concurrent workers, using
/// persisted per-node state machines, lease locks, a dispatch queue and a
/// reconciliation poller that converges each execution to a terminal state.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by the service layer and the API
pub mod error;

// SQLite pool creation shared by every adapter
pub mod database;

// Canvas layer boundary - graph model, variables, node materialization
pub mod canvas;

// Execution model - records, persistence and node preparation
pub mod workflow;

// Lease locks and job queues
pub mod coordination;

// Skill subsystem boundary
pub mod skill;

// Runtime orchestration - node runner, reconciliation, workers
pub mod runtime;

// HTTP API layer - execution and canvas endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{WorkflowError, WorkflowResult};
pub use runtime::{InitializeRequest, ReconcileReport, RunOutcome, WorkflowScheduler};
pub use server::start_server;
pub use workflow::{ExecutionStatus, NodeStatus};
