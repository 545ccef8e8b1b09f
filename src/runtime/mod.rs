/// Runtime Orchestration
///
/// This module drives workflow executions to completion across workers:
/// - Execution lifecycle (initialize, abort, completion reports, detail)
/// - Node runner guarded by lease locks and conditional status updates
/// - Reconciliation poller that re-derives progress from persisted state
/// - Node type handlers resolved through a hot-swappable registry
/// - Background queue worker pool

// Scheduler construction and execution lifecycle operations
pub mod engine;

// Per-node execution attempts
pub mod executor;

// Periodic reconciliation
pub mod poller;

// Node type strategies (skill vs. structural)
pub mod handlers;

// Queue consumer loops
pub mod scheduler;

// Re-export main types
pub use engine::{InitializeRequest, SchedulerDeps, WorkflowScheduler, ABORTED_MESSAGE};
pub use executor::RunOutcome;
pub use handlers::{NodeHandler, NodeHandlerRegistry, NodeOutcome, NodeRunContext};
pub use poller::ReconcileReport;
pub use scheduler::QueueWorkerPool;
