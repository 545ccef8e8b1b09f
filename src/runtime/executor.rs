/// Node runner: one execution attempt for one node
///
/// Safe to call any number of times for the same node, from the dispatch path
/// and from reconciliation catch-up. Only the caller whose conditional
/// `waiting -> executing` update succeeds runs the node's handler.

use crate::coordination::node_lock_key;
use crate::error::{WorkflowError, WorkflowResult};
use crate::runtime::engine::WorkflowScheduler;
use crate::runtime::handlers::{NodeOutcome, NodeRunContext};
use crate::workflow::types::{NodeStatus, NodeTransition, WorkflowExecution, WorkflowNodeExecution};
use chrono::Utc;

/// What a single `run_node` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another worker holds the node lock
    LockContended,
    /// Execution or node record does not exist
    Missing,
    /// Node already left `waiting`
    NotWaiting(NodeStatus),
    /// Some parents are not finished yet
    NotReady { finished: usize, required: usize },
    /// Another caller won the `waiting -> executing` update
    LostRace,
    /// Handler started the node; completion is reported later
    Started,
    /// Handler completed the node synchronously
    Completed,
}

impl WorkflowScheduler {
    /// Run one node if it is waiting and all its parents are finished
    ///
    /// Handler failures mark the node `failed` and are returned as `NodeFailed`.
    pub async fn run_node(&self, execution_id: &str, node_id: &str) -> WorkflowResult<RunOutcome> {
        let key = node_lock_key(execution_id, node_id);
        let Some(token) = self.locks.acquire(&key, self.config.lock_ttl()).await? else {
            tracing::debug!("🔒 Node {} ({}) is locked by another worker", node_id, execution_id);
            return Ok(RunOutcome::LockContended);
        };

        let result = self.run_locked(execution_id, node_id).await;

        if let Err(e) = self.locks.release(&key, &token).await {
            tracing::warn!("⚠️ Failed to release lock {}: {}", key, e);
        }
        result
    }

    async fn run_locked(&self, execution_id: &str, node_id: &str) -> WorkflowResult<RunOutcome> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            tracing::warn!("⚠️ Execution {} not found, skipping node {}", execution_id, node_id);
            return Ok(RunOutcome::Missing);
        };
        let Some(node) = self.store.get_node_execution(execution_id, node_id).await? else {
            tracing::warn!("⚠️ Node {} not found in execution {}", node_id, execution_id);
            return Ok(RunOutcome::Missing);
        };

        if node.status != NodeStatus::Waiting {
            tracing::debug!("⏭️ Node {} ({}) is {}, nothing to do", node_id, execution_id, node.status.as_str());
            return Ok(RunOutcome::NotWaiting(node.status));
        }

        match self.attempt(&execution, &node).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let message = e.to_string();
                tracing::error!("❌ Node {} ({}) failed: {}", node_id, execution_id, message);

                let recorded = self
                    .store
                    .transition_node(
                        execution_id,
                        node_id,
                        &[NodeStatus::Waiting, NodeStatus::Executing],
                        &NodeTransition::failed(Utc::now(), message.clone()),
                    )
                    .await;
                if let Err(record_err) = recorded {
                    tracing::error!("❌ Could not record failure of node {}: {}", node_id, record_err);
                }

                Err(WorkflowError::NodeFailed {
                    node_id: node_id.to_string(),
                    message,
                })
            }
        }
    }

    /// Readiness check, conditional start, then the node type's handler
    async fn attempt(
        &self,
        execution: &WorkflowExecution,
        node: &WorkflowNodeExecution,
    ) -> anyhow::Result<RunOutcome> {
        let required = node.parent_node_ids.len();
        let finished = self
            .store
            .count_finished(&execution.execution_id, &node.parent_node_ids)
            .await?;
        if finished != required {
            tracing::debug!(
                "⏳ Node {} ({}) not ready: {}/{} parents finished",
                node.node_id,
                execution.execution_id,
                finished,
                required
            );
            return Ok(RunOutcome::NotReady { finished, required });
        }

        let started = self
            .store
            .transition_node(
                &execution.execution_id,
                &node.node_id,
                &[NodeStatus::Waiting],
                &NodeTransition::executing(Utc::now()),
            )
            .await?;
        if !started {
            tracing::debug!("🏁 Node {} ({}) already claimed", node.node_id, execution.execution_id);
            return Ok(RunOutcome::LostRace);
        }

        tracing::info!(
            "📍 Executing node {} (type: {}) in {}",
            node.node_id,
            node.node_type,
            execution.execution_id
        );

        let handler = self.handlers.resolve(&node.node_type);
        let outcome = handler
            .execute(NodeRunContext {
                execution,
                node,
                canvas: self.canvas.as_ref(),
            })
            .await?;

        match outcome {
            NodeOutcome::Pending => Ok(RunOutcome::Started),
            NodeOutcome::Completed => {
                self.store
                    .transition_node(
                        &execution.execution_id,
                        &node.node_id,
                        &[NodeStatus::Executing],
                        &NodeTransition::finished(Utc::now()),
                    )
                    .await?;
                tracing::info!("✅ Node {} completed ({})", node.node_id, execution.execution_id);
                Ok(RunOutcome::Completed)
            }
        }
    }
}
