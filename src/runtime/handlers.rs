/// Node type strategies and their hot-swappable registry
///
/// The node runner owns locking, readiness and status transitions. A handler
/// only performs the side effects of starting one node of its type and says
/// whether the node is already complete or will be reported complete later.

use crate::canvas::{CanvasNode, CanvasNodeData, CanvasService, NodeDiff};
use crate::skill::{SkillInvocation, SkillInvoker};
use crate::workflow::types::{WorkflowExecution, WorkflowNodeExecution, SKILL_NODE_TYPE};
use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::{collections::HashMap, sync::Arc};

/// What a handler sees while starting a node
pub struct NodeRunContext<'a> {
    pub execution: &'a WorkflowExecution,
    pub node: &'a WorkflowNodeExecution,
    pub canvas: &'a dyn CanvasService,
}

/// Result of starting a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Completion arrives later through the node completion callback
    Pending,
    /// The node is done; the runner marks it finished
    Completed,
}

/// Strategy for one node type
#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn node_type(&self) -> &str;

    async fn execute(&self, ctx: NodeRunContext<'_>) -> Result<NodeOutcome>;
}

/// Structural nodes: nothing to do, complete immediately
#[derive(Debug, Default, Clone)]
pub struct PassthroughNodeHandler;

#[async_trait]
impl NodeHandler for PassthroughNodeHandler {
    fn node_type(&self) -> &str {
        "*"
    }

    async fn execute(&self, ctx: NodeRunContext<'_>) -> Result<NodeOutcome> {
        tracing::debug!("⏭️ Pass-through node {} ({})", ctx.node.node_id, ctx.node.node_type);
        Ok(NodeOutcome::Completed)
    }
}

/// Skill nodes: surface the node on the target canvas, then hand off to the skill subsystem
pub struct SkillNodeHandler {
    skill: Arc<dyn SkillInvoker>,
}

impl SkillNodeHandler {
    pub fn new(skill: Arc<dyn SkillInvoker>) -> Self {
        Self { skill }
    }

    /// Node as it should appear in a fork canvas: snapshot, marked executing
    fn materialized_node(node: &WorkflowNodeExecution) -> CanvasNode {
        let mut canvas_node = node.snapshot().unwrap_or_else(|| CanvasNode {
            id: node.node_id.clone(),
            node_type: node.node_type.clone(),
            data: CanvasNodeData {
                title: node.title.clone(),
                entity_id: node.entity_id.clone(),
                metadata: Value::Null,
            },
        });

        if !canvas_node.data.metadata.is_object() {
            canvas_node.data.metadata = json!({});
        }
        if let Some(metadata) = canvas_node.data.metadata.as_object_mut() {
            metadata.insert("status".to_string(), json!("executing"));
            metadata.insert("query".to_string(), json!(node.processed_query));
        }
        canvas_node
    }
}

#[async_trait]
impl NodeHandler for SkillNodeHandler {
    fn node_type(&self) -> &str {
        SKILL_NODE_TYPE
    }

    async fn execute(&self, ctx: NodeRunContext<'_>) -> Result<NodeOutcome> {
        let NodeRunContext { execution, node, canvas } = ctx;

        if execution.is_fork() {
            let materialized = Self::materialized_node(node);
            canvas
                .add_node_to_canvas(&execution.canvas_id, &materialized, &node.connect_to)
                .await?;
        } else {
            canvas
                .sync_node_diff(
                    &execution.canvas_id,
                    &NodeDiff {
                        node_id: node.node_id.clone(),
                        metadata: json!({ "status": "executing", "query": node.processed_query }),
                    },
                )
                .await?;
        }

        let metadata = node.metadata();
        self.skill
            .invoke(SkillInvocation {
                execution_id: execution.execution_id.clone(),
                node_execution_id: node.node_execution_id.clone(),
                node_id: node.node_id.clone(),
                canvas_id: execution.canvas_id.clone(),
                query: node.processed_query.clone(),
                context: metadata.get("contextItems").cloned().unwrap_or(Value::Null),
                model_selection: metadata.get("modelInfo").cloned().unwrap_or(Value::Null),
                tool_selection: metadata.get("selectedToolsets").cloned().unwrap_or(Value::Null),
                result_history: node.result_history.clone(),
            })
            .await?;

        tracing::info!("🧠 Skill invoked for node {} ({})", node.node_id, execution.execution_id);
        Ok(NodeOutcome::Pending)
    }
}

/// Lock-free handler registry keyed by node type
///
/// Registering swaps the whole map, so runs in flight keep the handler they resolved.
pub struct NodeHandlerRegistry {
    handlers: ArcSwap<HashMap<String, Arc<dyn NodeHandler>>>,
    fallback: Arc<dyn NodeHandler>,
}

impl Default for NodeHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeHandlerRegistry {
    /// Empty registry; every type resolves to the pass-through handler
    pub fn new() -> Self {
        Self {
            handlers: ArcSwap::new(Arc::new(HashMap::new())),
            fallback: Arc::new(PassthroughNodeHandler),
        }
    }

    /// Registry with the skill handler installed
    pub fn with_skill(skill: Arc<dyn SkillInvoker>) -> Self {
        let registry = Self::new();
        registry.register(Arc::new(SkillNodeHandler::new(skill)));
        registry
    }

    /// Add or replace the handler for `handler.node_type()`
    pub fn register(&self, handler: Arc<dyn NodeHandler>) {
        let current = self.handlers.load();
        let mut next = (**current).clone();
        let node_type = handler.node_type().to_string();
        next.insert(node_type.clone(), handler);
        self.handlers.store(Arc::new(next));
        tracing::info!("🔌 Registered node handler: {}", node_type);
    }

    pub fn resolve(&self, node_type: &str) -> Arc<dyn NodeHandler> {
        self.handlers
            .load()
            .get(node_type)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.load().keys().cloned().collect();
        types.sort();
        types
    }
}
