/// Background queue workers
///
/// Spawns consumer loops on the run queue (node runner) and the poll queue
/// (reconciliation). Each loop claims one due job at a time and sleeps for the
/// idle interval when nothing is due.

use crate::coordination::{JobQueue, QueueJob};
use crate::runtime::engine::WorkflowScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Which handler a worker loop drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerKind {
    Run,
    Poll,
}

/// Pool of queue consumer tasks with graceful shutdown
pub struct QueueWorkerPool {
    scheduler: Arc<WorkflowScheduler>,
    shutdown_tx: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl QueueWorkerPool {
    pub fn new(scheduler: Arc<WorkflowScheduler>) -> Self {
        Self {
            scheduler,
            shutdown_tx: None,
            handles: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Spawn `run_workers` + `poll_workers` loops (no-op when already running)
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        let config = self.scheduler.config().clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut spawn = |kind: WorkerKind, count: usize, queue: Arc<dyn JobQueue>| {
            if !queue.is_enabled() {
                tracing::info!("🕳️ Queue {} has no backend, no workers started", queue.name());
                return;
            }
            for worker_id in 0..count {
                self.handles.push(tokio::spawn(worker_loop(
                    kind,
                    worker_id,
                    self.scheduler.clone(),
                    queue.clone(),
                    config.queue_idle(),
                    shutdown_rx.clone(),
                )));
            }
        };

        spawn(WorkerKind::Run, config.run_workers, self.scheduler.run_queue().clone());
        spawn(WorkerKind::Poll, config.poll_workers, self.scheduler.poll_queue().clone());

        tracing::info!(
            "⚙️ Started {} queue workers ({} run, {} poll)",
            self.handles.len(),
            config.run_workers,
            config.poll_workers
        );
        self.shutdown_tx = Some(shutdown_tx);
    }

    /// Signal every loop and wait for them to exit
    pub async fn stop(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        tracing::info!("⏹️ Stopping queue workers");
        let _ = shutdown_tx.send(true);

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Queue worker ended abnormally: {}", e);
            }
        }
        tracing::info!("✅ Queue workers stopped");
    }
}

async fn worker_loop(
    kind: WorkerKind,
    worker_id: usize,
    scheduler: Arc<WorkflowScheduler>,
    queue: Arc<dyn JobQueue>,
    idle: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tracing::debug!("👷 {} worker {} started", queue.name(), worker_id);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let claimed = match queue.claim().await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("❌ {} worker {} failed to claim: {}", queue.name(), worker_id, e);
                None
            }
        };

        match claimed {
            Some(job) => handle_job(kind, &scheduler, job).await,
            None => {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }
    }

    tracing::debug!("👋 {} worker {} exiting", queue.name(), worker_id);
}

async fn handle_job(kind: WorkerKind, scheduler: &WorkflowScheduler, job: QueueJob) {
    match (kind, job) {
        (WorkerKind::Run, QueueJob::RunNode { execution_id, node_id }) => {
            if let Err(e) = scheduler.run_node(&execution_id, &node_id).await {
                tracing::error!("❌ Run of node {} ({}) failed: {}", node_id, execution_id, e);
            }
        }
        (WorkerKind::Poll, QueueJob::PollExecution { execution_id }) => {
            if let Err(e) = scheduler.poll_execution(&execution_id).await {
                tracing::error!("❌ Reconciliation of {} failed: {}", execution_id, e);
            }
        }
        (kind, job) => {
            tracing::warn!("⚠️ {:?} worker ignoring misrouted job {:?}", kind, job);
        }
    }
}
