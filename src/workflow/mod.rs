/// Workflow Execution Model
///
/// Persistent state for workflow runs:
/// - Type definitions (WorkflowExecution, WorkflowNodeExecution, statuses)
/// - SQLite persistence with compare-and-swap status transitions
/// - Node dependency preparation from canvas graphs (petgraph)

// Core execution type definitions
pub mod types;

// SQLite persistence layer for execution state
pub mod storage;

// Canvas graph -> node execution plans
pub mod preparer;

pub use preparer::{CanvasNodePreparer, NodePreparer};
pub use storage::{ExecutionStore, SqliteExecutionStore};
pub use types::{
    ExecutionStatus, NodeCompletion, NodeStatus, WorkflowExecution, WorkflowExecutionDetail,
    WorkflowNodeExecution, SKILL_NODE_TYPE,
};
