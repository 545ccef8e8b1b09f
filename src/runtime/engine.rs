/// Workflow scheduler: execution lifecycle operations
///
/// `WorkflowScheduler` is constructed from explicit clients (store, locks, the
/// run and poll queues, canvas layer, preparer, handler registry) owned by the
/// process bootstrap. This file holds initialization, abort, completion reports
/// and read operations; the node runner and reconciliation poller live in
/// `executor` and `poller`.

use crate::canvas::types::{merge_variables, CreateCanvasRequest, NodeDiff, WorkflowVariable};
use crate::canvas::CanvasService;
use crate::config::SchedulerConfig;
use crate::coordination::{EnqueueOptions, JobQueue, LockService, QueueJob};
use crate::error::{WorkflowError, WorkflowResult};
use crate::runtime::handlers::NodeHandlerRegistry;
use crate::workflow::preparer::{order_for_detail, NodePreparer};
use crate::workflow::storage::ExecutionStore;
use crate::workflow::types::{
    ExecutionStatus, NodeCompletion, NodeExecutionPlan, NodeStatus, NodeTransition,
    WorkflowExecution, WorkflowExecutionDetail, WorkflowNodeExecution,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Error message recorded on nodes stopped by an abort
pub const ABORTED_MESSAGE: &str = "aborted";

/// Clients the scheduler is built from
#[derive(Clone)]
pub struct SchedulerDeps {
    pub store: Arc<dyn ExecutionStore>,
    pub locks: Arc<dyn LockService>,
    pub run_queue: Arc<dyn JobQueue>,
    pub poll_queue: Arc<dyn JobQueue>,
    pub canvas: Arc<dyn CanvasService>,
    pub preparer: Arc<dyn NodePreparer>,
    pub handlers: Arc<NodeHandlerRegistry>,
}

/// Input of `initialize`
#[derive(Debug, Clone, Default)]
pub struct InitializeRequest {
    /// Caller; becomes the owner of the execution
    pub uid: String,
    pub source_canvas_id: String,
    /// Defaults to the source canvas (in-place mode)
    pub target_canvas_id: Option<String>,
    /// Overrides stored canvas variables by name
    pub variables: Option<Vec<WorkflowVariable>>,
    pub start_nodes: Option<Vec<String>>,
    pub check_canvas_ownership: bool,
    /// Execution title; defaults to the source canvas title
    pub title: Option<String>,
}

/// Orchestrates workflow executions over injected clients
pub struct WorkflowScheduler {
    pub(crate) store: Arc<dyn ExecutionStore>,
    pub(crate) locks: Arc<dyn LockService>,
    pub(crate) run_queue: Arc<dyn JobQueue>,
    pub(crate) poll_queue: Arc<dyn JobQueue>,
    pub(crate) canvas: Arc<dyn CanvasService>,
    pub(crate) preparer: Arc<dyn NodePreparer>,
    pub(crate) handlers: Arc<NodeHandlerRegistry>,
    pub(crate) config: SchedulerConfig,
}

impl WorkflowScheduler {
    pub fn new(deps: SchedulerDeps, config: SchedulerConfig) -> Self {
        Self {
            store: deps.store,
            locks: deps.locks,
            run_queue: deps.run_queue,
            poll_queue: deps.poll_queue,
            canvas: deps.canvas,
            preparer: deps.preparer,
            handlers: deps.handlers,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn run_queue(&self) -> &Arc<dyn JobQueue> {
        &self.run_queue
    }

    pub fn poll_queue(&self) -> &Arc<dyn JobQueue> {
        &self.poll_queue
    }

    /// Create a new execution from a canvas and kick off its start nodes
    pub async fn initialize(&self, request: InitializeRequest) -> WorkflowResult<String> {
        let source = self
            .canvas
            .get_canvas(&request.source_canvas_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(format!("Canvas {}", request.source_canvas_id)))?;

        if request.check_canvas_ownership && source.uid != request.uid {
            tracing::warn!(
                "🚫 User {} does not own canvas {}",
                request.uid,
                request.source_canvas_id
            );
            return Err(WorkflowError::not_found(format!("Canvas {}", request.source_canvas_id)));
        }

        let merged = merge_variables(request.variables.as_deref(), &source.variables);
        let canvas_id = request
            .target_canvas_id
            .clone()
            .unwrap_or_else(|| source.canvas_id.clone());
        let is_fork = canvas_id != source.canvas_id;

        // The canvas layer normalizes variables; continue with what it stored
        let variables = if is_fork {
            self.canvas
                .create_canvas(CreateCanvasRequest {
                    canvas_id: canvas_id.clone(),
                    uid: request.uid.clone(),
                    title: source.title.clone(),
                    variables: merged,
                })
                .await?
        } else {
            self.canvas.update_variables(&canvas_id, &merged).await?
        };

        let prepared = self.preparer.prepare(
            &source.graph,
            &variables,
            request.start_nodes.as_deref(),
            is_fork,
        )?;

        let now = Utc::now();
        let execution_id = format!("we-{}", Uuid::new_v4());
        let node_executions = prepared
            .node_executions
            .iter()
            .map(|plan| node_record(&execution_id, plan, now))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let finished = node_executions
            .iter()
            .filter(|node| node.status == NodeStatus::Finish)
            .count() as i64;
        let execution = WorkflowExecution {
            execution_id: execution_id.clone(),
            uid: request.uid.clone(),
            title: request.title.clone().unwrap_or_else(|| source.title.clone()),
            canvas_id: canvas_id.clone(),
            source_canvas_id: source.canvas_id.clone(),
            variables,
            status: ExecutionStatus::derive(node_executions.iter().map(|node| &node.status)),
            total_nodes: node_executions.len() as i64,
            executed_nodes: finished,
            failed_nodes: 0,
            created_at: now,
            updated_at: now,
        };

        self.store.create_execution(&execution, &node_executions).await?;

        tracing::info!(
            "🚀 Initialized execution {} ({} nodes, {} start, {} mode)",
            execution_id,
            node_executions.len(),
            prepared.start_nodes.len(),
            if is_fork { "fork" } else { "in-place" }
        );

        for node_id in &prepared.start_nodes {
            self.dispatch_node(&execution_id, node_id).await?;
        }
        self.schedule_poll(&execution_id).await?;

        Ok(execution_id)
    }

    /// Stop an execution: every waiting or executing node becomes `failed`
    pub async fn abort(&self, execution_id: &str, uid: &str) -> WorkflowResult<()> {
        let execution = self.owned_execution(execution_id, uid).await?;
        let now = Utc::now();

        let mut aborted = 0usize;
        for node in self.store.list_node_executions(execution_id).await? {
            if node.status.is_terminal() {
                continue;
            }
            let applied = self
                .store
                .transition_node(
                    execution_id,
                    &node.node_id,
                    &[NodeStatus::Waiting, NodeStatus::Executing],
                    &NodeTransition::failed(now, ABORTED_MESSAGE),
                )
                .await?;
            if applied {
                aborted += 1;
            }
        }

        let nodes = self.store.list_node_executions(execution_id).await?;
        let (executed, failed) = count_terminal(&nodes);
        let status = ExecutionStatus::derive(nodes.iter().map(|n| &n.status));
        self.store
            .update_execution_progress(execution_id, status, executed, failed)
            .await?;

        if aborted > 0 {
            tracing::info!("🛑 Aborted execution {} ({} nodes stopped)", execution.execution_id, aborted);
        } else {
            tracing::debug!("🛑 Abort of {} changed nothing", execution.execution_id);
        }
        Ok(())
    }

    /// Record a completion reported by the skill subsystem
    ///
    /// Only an `executing` node can complete; anything else returns false.
    pub async fn complete_node(
        &self,
        execution_id: &str,
        node_id: &str,
        completion: NodeCompletion,
    ) -> WorkflowResult<bool> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| WorkflowError::not_found(format!("Execution {}", execution_id)))?;

        let now = Utc::now();
        let transition = match &completion {
            NodeCompletion::Finished => NodeTransition::finished(now),
            NodeCompletion::Failed(message) => NodeTransition::failed(now, message.clone()),
        };

        let applied = self
            .store
            .transition_node(execution_id, node_id, &[NodeStatus::Executing], &transition)
            .await?;
        if !applied {
            tracing::debug!("♻️ Ignoring completion for {} in {}: not executing", node_id, execution_id);
            return Ok(false);
        }

        match &completion {
            NodeCompletion::Finished => tracing::info!("✅ Node {} finished ({})", node_id, execution_id),
            NodeCompletion::Failed(message) => {
                tracing::error!("❌ Node {} failed ({}): {}", node_id, execution_id, message)
            }
        }

        if !execution.is_fork() {
            let metadata = match &completion {
                NodeCompletion::Finished => json!({ "status": "finish" }),
                NodeCompletion::Failed(message) => json!({ "status": "failed", "errorMessage": message }),
            };
            let diff = NodeDiff {
                node_id: node_id.to_string(),
                metadata,
            };
            if let Err(e) = self.canvas.sync_node_diff(&execution.canvas_id, &diff).await {
                tracing::warn!("⚠️ Failed to push completion diff for {}: {}", node_id, e);
            }
        }

        Ok(true)
    }

    /// Execution plus node executions in execution order
    pub async fn get_detail(
        &self,
        execution_id: &str,
        uid: &str,
    ) -> WorkflowResult<WorkflowExecutionDetail> {
        let execution = self.owned_execution(execution_id, uid).await?;
        let nodes = self.store.list_node_executions(execution_id).await?;
        Ok(WorkflowExecutionDetail {
            execution,
            node_executions: order_for_detail(nodes),
        })
    }

    /// Executions owned by `uid`, newest first
    pub async fn list_executions(
        &self,
        uid: &str,
        canvas_id: Option<&str>,
    ) -> WorkflowResult<Vec<WorkflowExecution>> {
        Ok(self.store.list_executions(uid, canvas_id).await?)
    }

    /// Queue a run attempt for one node (collapses with a pending attempt)
    pub(crate) async fn dispatch_node(&self, execution_id: &str, node_id: &str) -> WorkflowResult<bool> {
        let job = QueueJob::run_node(execution_id, node_id);
        let job_id = job.dedup_id();
        let accepted = self
            .run_queue
            .enqueue(job, EnqueueOptions::deduplicated(job_id))
            .await?;
        if accepted {
            tracing::debug!("📤 Dispatched node {} ({})", node_id, execution_id);
        }
        Ok(accepted)
    }

    /// Queue the next reconciliation pass for an execution
    pub(crate) async fn schedule_poll(&self, execution_id: &str) -> WorkflowResult<bool> {
        let job = QueueJob::poll_execution(execution_id);
        let options = EnqueueOptions::delayed(self.config.poll_interval()).with_job_id(job.dedup_id());
        Ok(self.poll_queue.enqueue(job, options).await?)
    }

    /// Missing executions and executions owned by someone else look the same
    async fn owned_execution(&self, execution_id: &str, uid: &str) -> WorkflowResult<WorkflowExecution> {
        match self.store.get_execution(execution_id).await? {
            Some(execution) if execution.uid == uid => Ok(execution),
            _ => Err(WorkflowError::not_found(format!("Execution {}", execution_id))),
        }
    }
}

/// (finished, failed) counts
pub(crate) fn count_terminal(nodes: &[WorkflowNodeExecution]) -> (i64, i64) {
    nodes.iter().fold((0, 0), |(finished, failed), node| match node.status {
        NodeStatus::Finish => (finished + 1, failed),
        NodeStatus::Failed => (finished, failed + 1),
        _ => (finished, failed),
    })
}

fn node_record(
    execution_id: &str,
    plan: &NodeExecutionPlan,
    now: DateTime<Utc>,
) -> anyhow::Result<WorkflowNodeExecution> {
    let node_data = serde_json::to_value(&plan.node)
        .with_context(|| format!("Failed to snapshot node {}", plan.node_id))?;

    let (status, progress, end_time) = if plan.in_scope {
        (NodeStatus::Waiting, 0, None)
    } else {
        (NodeStatus::Finish, 100, Some(now))
    };

    Ok(WorkflowNodeExecution {
        node_execution_id: format!("wne-{}", Uuid::new_v4()),
        execution_id: execution_id.to_string(),
        node_id: plan.node_id.clone(),
        node_type: plan.node_type.clone(),
        entity_id: plan.entity_id.clone(),
        title: plan.title.clone(),
        status,
        progress,
        error_message: None,
        processed_query: plan.processed_query.clone(),
        original_query: plan.original_query.clone(),
        node_data,
        connect_to: plan.connect_to.clone(),
        parent_node_ids: plan.parent_node_ids.clone(),
        child_node_ids: plan.child_node_ids.clone(),
        result_history: plan.result_history.clone(),
        start_time: None,
        end_time,
        created_at: now,
        updated_at: now,
    })
}
