/// Canvas layer boundary
///
/// Canvases hold the graph a workflow is derived from and receive its effects:
/// - Type definitions (Canvas, CanvasNode, CanvasEdge, WorkflowVariable)
/// - `CanvasService` trait consumed by the scheduler
/// - SQLite implementation with idempotent node materialization

pub mod types;

pub mod storage;

pub use storage::{CanvasService, SqliteCanvasService};
pub use types::{
    Canvas, CanvasEdge, CanvasGraph, CanvasNode, CanvasNodeData, ConnectFilter,
    CreateCanvasRequest, NodeDiff, WorkflowVariable,
};
