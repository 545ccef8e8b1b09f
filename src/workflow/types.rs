/// Core workflow execution type definitions
///
/// Two persisted records drive orchestration: one `WorkflowExecution` per run and
/// one `WorkflowNodeExecution` per node per run. Node status only ever moves
/// forward: waiting -> executing -> {finish | failed}.

use crate::canvas::types::{CanvasNode, ConnectFilter, WorkflowVariable};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Canvas node type that needs asynchronous skill invocation
pub const SKILL_NODE_TYPE: &str = "skillResponse";

/// Per-node state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Waiting,
    Executing,
    Finish,
    Failed,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Waiting => "waiting",
            NodeStatus::Executing => "executing",
            NodeStatus::Finish => "finish",
            NodeStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(NodeStatus::Waiting),
            "executing" => Some(NodeStatus::Executing),
            "finish" => Some(NodeStatus::Finish),
            "failed" => Some(NodeStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Finish | NodeStatus::Failed)
    }
}

/// Derived execution status, recomputed by reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Executing,
    Finish,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::Finish => "finish",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "executing" => Some(ExecutionStatus::Executing),
            "finish" => Some(ExecutionStatus::Finish),
            "failed" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }

    /// failed if any node failed; finish if nothing is waiting or executing
    pub fn derive<'a>(statuses: impl IntoIterator<Item = &'a NodeStatus>) -> Self {
        let mut any_active = false;
        for status in statuses {
            match status {
                NodeStatus::Failed => return ExecutionStatus::Failed,
                NodeStatus::Waiting | NodeStatus::Executing => any_active = true,
                NodeStatus::Finish => {}
            }
        }
        if any_active {
            ExecutionStatus::Executing
        } else {
            ExecutionStatus::Finish
        }
    }
}

/// One workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub execution_id: String,
    /// Owner of the run (owner of the source canvas)
    pub uid: String,
    pub title: String,
    /// Canvas receiving the effects
    pub canvas_id: String,
    /// Canvas whose graph is executed
    pub source_canvas_id: String,
    pub variables: Vec<WorkflowVariable>,
    pub status: ExecutionStatus,
    pub total_nodes: i64,
    pub executed_nodes: i64,
    pub failed_nodes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Fork mode: results go to a freshly created canvas
    pub fn is_fork(&self) -> bool {
        self.canvas_id != self.source_canvas_id
    }
}

/// One node of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNodeExecution {
    pub node_execution_id: String,
    pub execution_id: String,
    pub node_id: String,
    pub node_type: String,
    pub entity_id: String,
    pub title: String,
    pub status: NodeStatus,
    pub progress: i64,
    pub error_message: Option<String>,
    pub processed_query: String,
    pub original_query: String,
    /// Snapshot of the canvas node at initialization
    pub node_data: Value,
    pub connect_to: Vec<ConnectFilter>,
    pub parent_node_ids: Vec<String>,
    pub child_node_ids: Vec<String>,
    pub result_history: Vec<Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowNodeExecution {
    pub fn is_skill(&self) -> bool {
        self.node_type == SKILL_NODE_TYPE
    }

    /// `data.metadata` of the node snapshot (Null when absent)
    pub fn metadata(&self) -> &Value {
        &self.node_data["data"]["metadata"]
    }

    /// The snapshot as a canvas node, if it still parses
    pub fn snapshot(&self) -> Option<CanvasNode> {
        serde_json::from_value(self.node_data.clone()).ok()
    }
}

/// Preparer output for one node
#[derive(Debug, Clone)]
pub struct NodeExecutionPlan {
    pub node_id: String,
    pub node_type: String,
    pub entity_id: String,
    pub title: String,
    pub processed_query: String,
    pub original_query: String,
    pub connect_to: Vec<ConnectFilter>,
    pub parent_node_ids: Vec<String>,
    pub child_node_ids: Vec<String>,
    pub result_history: Vec<Value>,
    pub node: CanvasNode,
    /// False when the node is not downstream of any start node; such nodes are
    /// recorded as already finished so they never block the run
    pub in_scope: bool,
}

/// Full preparer output: every node plus the resolved start set
#[derive(Debug, Clone, Default)]
pub struct PreparedNodes {
    pub node_executions: Vec<NodeExecutionPlan>,
    pub start_nodes: Vec<String>,
}

/// Fields written by a conditional status transition
#[derive(Debug, Clone)]
pub struct NodeTransition {
    pub status: NodeStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub progress: Option<i64>,
    pub error_message: Option<String>,
}

impl NodeTransition {
    pub fn executing(now: DateTime<Utc>) -> Self {
        Self {
            status: NodeStatus::Executing,
            start_time: Some(now),
            end_time: None,
            progress: Some(0),
            error_message: None,
        }
    }

    pub fn finished(now: DateTime<Utc>) -> Self {
        Self {
            status: NodeStatus::Finish,
            start_time: None,
            end_time: Some(now),
            progress: Some(100),
            error_message: None,
        }
    }

    pub fn failed(now: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Failed,
            start_time: None,
            end_time: Some(now),
            progress: None,
            error_message: Some(message.into()),
        }
    }
}

/// Completion reported by the skill subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCompletion {
    Finished,
    Failed(String),
}

/// Execution plus its node executions in execution order
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionDetail {
    #[serde(flatten)]
    pub execution: WorkflowExecution,
    pub node_executions: Vec<WorkflowNodeExecution>,
}

/// Deserialize a stored JSON column, degrading to the default on any failure
pub fn parse_json_or_default<T: DeserializeOwned + Default>(raw: Option<&str>) -> T {
    match raw {
        Some(text) if !text.trim().is_empty() => serde_json::from_str(text).unwrap_or_else(|e| {
            tracing::warn!("⚠️ Unparseable stored JSON, using default: {}", e);
            T::default()
        }),
        _ => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            NodeStatus::Waiting,
            NodeStatus::Executing,
            NodeStatus::Finish,
            NodeStatus::Failed,
        ] {
            assert_eq!(NodeStatus::parse(status.as_str()), Some(status));
        }
        assert!(NodeStatus::Finish.is_terminal());
        assert!(!NodeStatus::Executing.is_terminal());
        assert_eq!(NodeStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_derive_execution_status() {
        use NodeStatus::*;
        assert_eq!(ExecutionStatus::derive(&[Finish, Finish]), ExecutionStatus::Finish);
        assert_eq!(ExecutionStatus::derive(&[Finish, Waiting]), ExecutionStatus::Executing);
        assert_eq!(ExecutionStatus::derive(&[Executing, Failed]), ExecutionStatus::Failed);
        assert_eq!(ExecutionStatus::derive(&[]), ExecutionStatus::Finish);
    }

    #[test]
    fn test_parse_json_or_default_degrades() {
        let parsed: Vec<String> = parse_json_or_default(Some(r#"["a","b"]"#));
        assert_eq!(parsed, vec!["a", "b"]);

        let broken: Vec<String> = parse_json_or_default(Some("{not json"));
        assert!(broken.is_empty());

        let missing: Vec<ConnectFilter> = parse_json_or_default(None);
        assert!(missing.is_empty());
    }
}
