//! Shared harness: in-memory SQLite, memory queues and locks, recording skill invoker.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use canvasflow::canvas::{Canvas, CanvasEdge, CanvasGraph, CanvasNode, CanvasNodeData, SqliteCanvasService, WorkflowVariable};
use canvasflow::config::SchedulerConfig;
use canvasflow::coordination::{JobQueue, LockService, MemoryJobQueue, MemoryLockService, QueueJob, POLL_QUEUE, RUN_QUEUE};
use canvasflow::database::memory_pool;
use canvasflow::runtime::{NodeHandlerRegistry, RunOutcome, SchedulerDeps, WorkflowScheduler};
use canvasflow::skill::{SkillInvocation, SkillInvoker};
use canvasflow::workflow::types::NodeTransition;
use canvasflow::workflow::{
    CanvasNodePreparer, ExecutionStatus, ExecutionStore, NodeStatus, SqliteExecutionStore, WorkflowExecution,
    WorkflowNodeExecution, SKILL_NODE_TYPE,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const UID: &str = "u-1";

/// Skill invoker that records invocations and can be told to fail for some nodes
#[derive(Default)]
pub struct RecordingSkill {
    pub calls: Mutex<Vec<SkillInvocation>>,
    pub failing_nodes: Mutex<HashSet<String>>,
}

impl RecordingSkill {
    pub fn fail_for(&self, node_id: &str) {
        self.failing_nodes.lock().unwrap().insert(node_id.to_string());
    }

    pub fn invoked_nodes(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.node_id.clone()).collect()
    }
}

#[async_trait]
impl SkillInvoker for RecordingSkill {
    async fn invoke(&self, invocation: SkillInvocation) -> Result<()> {
        if self.failing_nodes.lock().unwrap().contains(&invocation.node_id) {
            return Err(anyhow!("skill service rejected {}", invocation.node_id));
        }
        self.calls.lock().unwrap().push(invocation);
        Ok(())
    }
}

/// Execution store that delegates to SQLite but can be told to misbehave once
pub struct FaultyStore {
    inner: Arc<SqliteExecutionStore>,
    fail_progress: AtomicBool,
    /// Node failed behind the scheduler's back right before the next batch propagation
    fail_before_propagation: Mutex<Option<String>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteExecutionStore>) -> Self {
        Self {
            inner,
            fail_progress: AtomicBool::new(false),
            fail_before_propagation: Mutex::new(None),
        }
    }

    /// The next `update_execution_progress` call errors
    pub fn fail_next_progress_update(&self) {
        self.fail_progress.store(true, Ordering::SeqCst);
    }

    /// The next `finish_waiting_nodes` call finds `node_id` already failed
    pub fn fail_node_before_propagation(&self, node_id: &str) {
        *self.fail_before_propagation.lock().unwrap() = Some(node_id.to_string());
    }
}

#[async_trait]
impl ExecutionStore for FaultyStore {
    async fn create_execution(&self, execution: &WorkflowExecution, nodes: &[WorkflowNodeExecution]) -> Result<()> {
        self.inner.create_execution(execution, nodes).await
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>> {
        self.inner.get_execution(execution_id).await
    }

    async fn get_node_execution(&self, execution_id: &str, node_id: &str) -> Result<Option<WorkflowNodeExecution>> {
        self.inner.get_node_execution(execution_id, node_id).await
    }

    async fn list_node_executions(&self, execution_id: &str) -> Result<Vec<WorkflowNodeExecution>> {
        self.inner.list_node_executions(execution_id).await
    }

    async fn count_finished(&self, execution_id: &str, node_ids: &[String]) -> Result<usize> {
        self.inner.count_finished(execution_id, node_ids).await
    }

    async fn transition_node(
        &self,
        execution_id: &str,
        node_id: &str,
        expected: &[NodeStatus],
        transition: &NodeTransition,
    ) -> Result<bool> {
        self.inner.transition_node(execution_id, node_id, expected, transition).await
    }

    async fn finish_waiting_nodes(
        &self,
        execution_id: &str,
        node_ids: &[String],
        end_time: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let victim = self.fail_before_propagation.lock().unwrap().take();
        if let Some(node_id) = victim {
            self.inner
                .transition_node(
                    execution_id,
                    &node_id,
                    &[NodeStatus::Waiting, NodeStatus::Executing],
                    &NodeTransition::failed(Utc::now(), "aborted"),
                )
                .await?;
        }
        self.inner.finish_waiting_nodes(execution_id, node_ids, end_time).await
    }

    async fn update_execution_progress(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        executed_nodes: i64,
        failed_nodes: i64,
    ) -> Result<()> {
        if self.fail_progress.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("database is locked"));
        }
        self.inner
            .update_execution_progress(execution_id, status, executed_nodes, failed_nodes)
            .await
    }

    async fn list_executions(&self, uid: &str, canvas_id: Option<&str>) -> Result<Vec<WorkflowExecution>> {
        self.inner.list_executions(uid, canvas_id).await
    }
}

pub struct Harness {
    pub scheduler: Arc<WorkflowScheduler>,
    pub canvases: Arc<SqliteCanvasService>,
    pub store: Arc<SqliteExecutionStore>,
    pub faults: Arc<FaultyStore>,
    pub run_queue: Arc<MemoryJobQueue>,
    pub poll_queue: Arc<MemoryJobQueue>,
    pub skill: Arc<RecordingSkill>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_locks(Arc::new(MemoryLockService::new())).await
    }

    pub async fn with_locks(locks: Arc<dyn LockService>) -> Self {
        Self::build(locks, SchedulerConfig::default()).await
    }

    pub async fn with_config(config: SchedulerConfig) -> Self {
        Self::build(Arc::new(MemoryLockService::new()), config).await
    }

    async fn build(locks: Arc<dyn LockService>, config: SchedulerConfig) -> Self {
        let pool = memory_pool().await.unwrap();
        let store = Arc::new(SqliteExecutionStore::new(pool.clone()));
        store.init_schema().await.unwrap();
        let canvases = Arc::new(SqliteCanvasService::new(pool));
        canvases.init_schema().await.unwrap();
        let faults = Arc::new(FaultyStore::new(store.clone()));

        let run_queue = Arc::new(MemoryJobQueue::new(RUN_QUEUE));
        let poll_queue = Arc::new(MemoryJobQueue::new(POLL_QUEUE));
        let skill = Arc::new(RecordingSkill::default());

        let scheduler = Arc::new(WorkflowScheduler::new(
            SchedulerDeps {
                store: faults.clone(),
                locks,
                run_queue: run_queue.clone(),
                poll_queue: poll_queue.clone(),
                canvas: canvases.clone(),
                preparer: Arc::new(CanvasNodePreparer),
                handlers: Arc::new(NodeHandlerRegistry::with_skill(skill.clone())),
            },
            config,
        ));

        Self {
            scheduler,
            canvases,
            store,
            faults,
            run_queue,
            poll_queue,
            skill,
        }
    }

    /// Store a canvas; nodes are (id, type), a type of "skill" means the skill node type
    pub async fn save_canvas(&self, canvas_id: &str, nodes: &[(&str, &str)], edges: &[(&str, &str)]) {
        self.save_canvas_with_variables(canvas_id, nodes, edges, vec![]).await;
    }

    pub async fn save_canvas_with_variables(
        &self,
        canvas_id: &str,
        nodes: &[(&str, &str)],
        edges: &[(&str, &str)],
        variables: Vec<WorkflowVariable>,
    ) {
        let canvas = Canvas {
            canvas_id: canvas_id.to_string(),
            uid: UID.to_string(),
            title: format!("Canvas {}", canvas_id),
            variables,
            graph: CanvasGraph {
                nodes: nodes.iter().map(|(id, kind)| canvas_node(id, kind)).collect(),
                edges: edges.iter().map(|(s, t)| CanvasEdge::new(*s, *t)).collect(),
            },
        };
        self.canvases.save_canvas(&canvas).await.unwrap();
    }

    /// Claim and run every due run job; returns (node id, outcome) in claim order
    pub async fn drain_run_queue(&self, execution_id: &str) -> Vec<(String, RunOutcome)> {
        let mut outcomes = Vec::new();
        while let Some(job) = self.run_queue.claim().await.unwrap() {
            if let QueueJob::RunNode { execution_id: job_exec, node_id } = job {
                assert_eq!(job_exec, execution_id);
                let outcome = self
                    .scheduler
                    .run_node(&job_exec, &node_id)
                    .await
                    .unwrap_or_else(|e| panic!("run_node {} failed: {}", node_id, e));
                outcomes.push((node_id, outcome));
            }
        }
        outcomes
    }

    /// Run-queue jobs currently pending, as node ids
    pub async fn pending_runs(&self) -> Vec<String> {
        self.run_queue
            .pending()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|p| match p.job {
                QueueJob::RunNode { node_id, .. } => Some(node_id),
                _ => None,
            })
            .collect()
    }

    /// Drop every pending reconciliation job; returns how many there were
    pub async fn clear_poll_queue(&self) -> usize {
        let mut cleared = 0;
        while self.poll_queue.claim_ignoring_delay().await.is_some() {
            cleared += 1;
        }
        cleared
    }

    pub async fn statuses(&self, execution_id: &str) -> BTreeMap<String, NodeStatus> {
        self.store
            .list_node_executions(execution_id)
            .await
            .unwrap()
            .into_iter()
            .map(|n| (n.node_id, n.status))
            .collect()
    }

    pub async fn status_of(&self, execution_id: &str, node_id: &str) -> NodeStatus {
        self.store
            .get_node_execution(execution_id, node_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }
}

pub fn canvas_node(id: &str, kind: &str) -> CanvasNode {
    let node_type = if kind == "skill" { SKILL_NODE_TYPE } else { kind };
    CanvasNode {
        id: id.to_string(),
        node_type: node_type.to_string(),
        data: CanvasNodeData {
            title: id.to_uppercase(),
            entity_id: format!("entity-{}", id),
            metadata: json!({ "query": format!("run {}", id) }),
        },
    }
}
