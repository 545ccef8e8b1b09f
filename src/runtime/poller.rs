/// Reconciliation poller
///
/// Re-derives readiness and progress from persisted node state alone, so an
/// execution converges even when dispatch messages are lost. One pass:
/// catch-up dispatch, downstream propagation, aggregate refresh, reschedule.

use crate::error::WorkflowResult;
use crate::runtime::engine::{count_terminal, WorkflowScheduler};
use crate::workflow::types::{ExecutionStatus, NodeStatus, WorkflowNodeExecution};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Summary of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Catch-up dispatches issued (duplicates collapse in the queue)
    pub dispatched: usize,
    /// Pass-through nodes marked finished
    pub propagated: u64,
    pub executed: i64,
    pub failed: i64,
    pub total: i64,
    pub status: ExecutionStatus,
    /// Whether another pass was scheduled
    pub rescheduled: bool,
}

impl ReconcileReport {
    fn empty() -> Self {
        Self {
            dispatched: 0,
            propagated: 0,
            executed: 0,
            failed: 0,
            total: 0,
            status: ExecutionStatus::Finish,
            rescheduled: false,
        }
    }
}

/// In-memory view of one execution's node statuses
struct StatusIndex<'a> {
    nodes: &'a [WorkflowNodeExecution],
    status: HashMap<&'a str, NodeStatus>,
}

impl<'a> StatusIndex<'a> {
    fn new(nodes: &'a [WorkflowNodeExecution]) -> Self {
        let status = nodes.iter().map(|n| (n.node_id.as_str(), n.status)).collect();
        Self { nodes, status }
    }

    fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.status.get(node_id).copied()
    }

    fn parents_finished(&self, node: &WorkflowNodeExecution) -> bool {
        node.parent_node_ids
            .iter()
            .all(|parent| self.status_of(parent) == Some(NodeStatus::Finish))
    }

    /// Waiting skill nodes whose parents are all finished, by node id
    fn ready_skill_nodes(&self) -> Vec<&'a str> {
        let ready: BTreeSet<&str> = self
            .nodes
            .iter()
            .filter(|n| n.is_skill() && self.status_of(&n.node_id) == Some(NodeStatus::Waiting))
            .filter(|n| self.parents_finished(n))
            .map(|n| n.node_id.as_str())
            .collect();
        ready.into_iter().collect()
    }

    /// Waiting non-skill nodes whose parents are all finished, by node id
    ///
    /// Covers children of finished nodes as well as parentless structural nodes
    /// whose dispatch was lost.
    fn propagatable(&self) -> Vec<String> {
        let ids: BTreeSet<&str> = self
            .nodes
            .iter()
            .filter(|n| !n.is_skill() && self.status_of(&n.node_id) == Some(NodeStatus::Waiting))
            .filter(|n| self.parents_finished(n))
            .map(|n| n.node_id.as_str())
            .collect();
        ids.into_iter().map(str::to_string).collect()
    }

    fn mark_finished(&mut self, node_ids: &[String]) {
        for node_id in node_ids {
            self.set_status(node_id, NodeStatus::Finish);
        }
    }

    fn set_status(&mut self, node_id: &str, status: NodeStatus) {
        if let Some(node) = self.nodes.iter().find(|n| n.node_id == node_id) {
            self.status.insert(node.node_id.as_str(), status);
        }
    }

    /// Nodes that can never run: a parent (transitively) failed or is unknown
    fn blocked(&self) -> HashSet<&'a str> {
        let mut blocked: HashSet<&str> = HashSet::new();
        loop {
            let before = blocked.len();
            for node in self.nodes {
                if blocked.contains(node.node_id.as_str()) {
                    continue;
                }
                let stuck = node.parent_node_ids.iter().any(|parent| {
                    blocked.contains(parent.as_str())
                        || matches!(self.status_of(parent), None | Some(NodeStatus::Failed))
                });
                if stuck {
                    blocked.insert(node.node_id.as_str());
                }
            }
            if blocked.len() == before {
                return blocked;
            }
        }
    }

    /// Anything still able to make progress
    fn has_live_work(&self) -> bool {
        let blocked = self.blocked();
        self.nodes.iter().any(|node| match self.status_of(&node.node_id) {
            Some(NodeStatus::Executing) => true,
            Some(NodeStatus::Waiting) => !blocked.contains(node.node_id.as_str()),
            _ => false,
        })
    }
}

impl WorkflowScheduler {
    /// One reconciliation pass over an execution
    ///
    /// A pass that errors still leaves the next pass queued, so a transient
    /// failure never ends reconciliation of an execution.
    pub async fn poll_execution(&self, execution_id: &str) -> WorkflowResult<ReconcileReport> {
        match self.reconcile(execution_id).await {
            Ok(report) => Ok(report),
            Err(e) => {
                tracing::warn!("🔁 Reconciliation of {} failed, retrying later: {}", execution_id, e);
                if let Err(retry) = self.schedule_poll(execution_id).await {
                    tracing::error!("❌ Could not requeue reconciliation of {}: {}", execution_id, retry);
                }
                Err(e)
            }
        }
    }

    async fn reconcile(&self, execution_id: &str) -> WorkflowResult<ReconcileReport> {
        let mut nodes = self.store.list_node_executions(execution_id).await?;
        if nodes.is_empty() {
            tracing::debug!("📭 Execution {} has no nodes to reconcile", execution_id);
            return Ok(ReconcileReport::empty());
        }

        let mut report = ReconcileReport::empty();

        // Catch-up dispatch
        {
            let index = StatusIndex::new(&nodes);
            for node_id in index.ready_skill_nodes() {
                self.dispatch_node(execution_id, node_id).await?;
                report.dispatched += 1;
            }
        }

        // Downstream propagation to a fixed point
        let mut touched = false;
        {
            let mut index = StatusIndex::new(&nodes);
            'propagate: loop {
                let ids = index.propagatable();
                if ids.is_empty() {
                    break;
                }
                touched = true;
                let changed = self
                    .store
                    .finish_waiting_nodes(execution_id, &ids, Utc::now())
                    .await?;
                report.propagated += changed.len() as u64;
                if !changed.is_empty() {
                    tracing::debug!("🔗 Propagated finish to {:?} in {}", changed, execution_id);
                }
                index.mark_finished(&changed);

                // Rows moved by someone else (an abort) keep their stored status
                for node_id in ids.iter().filter(|id| !changed.contains(id)) {
                    let current = self
                        .store
                        .get_node_execution(execution_id, node_id)
                        .await?
                        .map(|n| n.status)
                        .unwrap_or(NodeStatus::Failed);
                    if current == NodeStatus::Waiting {
                        tracing::warn!("⚠️ Node {} in {} refused to propagate", node_id, execution_id);
                        break 'propagate;
                    }
                    index.set_status(node_id, current);
                }
            }
        }
        if touched {
            nodes = self.store.list_node_executions(execution_id).await?;
        }

        // Aggregate refresh
        let (executed, failed) = count_terminal(&nodes);
        let status = ExecutionStatus::derive(nodes.iter().map(|n| &n.status));
        self.store
            .update_execution_progress(execution_id, status, executed, failed)
            .await?;
        report.executed = executed;
        report.failed = failed;
        report.total = nodes.len() as i64;
        report.status = status;

        // Self-rescheduling
        if StatusIndex::new(&nodes).has_live_work() {
            self.schedule_poll(execution_id).await?;
            report.rescheduled = true;
        } else {
            tracing::info!(
                "🏁 Execution {} settled: {} ({}/{} finished, {} failed)",
                execution_id,
                status.as_str(),
                executed,
                report.total,
                failed
            );
        }

        Ok(report)
    }
}
