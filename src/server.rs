/// Server setup and initialization
///
/// Builds every client (database pool, stores, locks, queues, skill invoker),
/// wires them into the scheduler, starts the queue workers and serves HTTP.
/// The bootstrap owns the lifecycle of all of them.

use crate::{
    api::{create_canvas_routes, create_workflow_routes, AppState},
    canvas::SqliteCanvasService,
    config::{Config, QueueBackend},
    coordination::{JobQueue, NullJobQueue, SqliteJobQueue, SqliteLockService, POLL_QUEUE, RUN_QUEUE},
    database::connect_pool,
    runtime::{NodeHandlerRegistry, QueueWorkerPool, SchedulerDeps, WorkflowScheduler},
    skill::HttpSkillInvoker,
    workflow::{CanvasNodePreparer, SqliteExecutionStore},
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Fully wired application: router plus the scheduler it serves
pub struct App {
    pub router: Router,
    pub scheduler: Arc<WorkflowScheduler>,
}

/// Create both queues for the configured backend
async fn build_queues(
    pool: &SqlitePool,
    backend: QueueBackend,
) -> Result<(Arc<dyn JobQueue>, Arc<dyn JobQueue>)> {
    match backend {
        QueueBackend::Sqlite => {
            let run = SqliteJobQueue::new(pool.clone(), RUN_QUEUE);
            let poll = SqliteJobQueue::new(pool.clone(), POLL_QUEUE);
            run.init_schema().await?;
            Ok((Arc::new(run), Arc::new(poll)))
        }
        QueueBackend::None => {
            tracing::warn!("⚠️ No queue backend configured: dispatch and reconciliation are disabled");
            Ok((
                Arc::new(NullJobQueue::new(RUN_QUEUE)),
                Arc::new(NullJobQueue::new(POLL_QUEUE)),
            ))
        }
    }
}

/// Create the scheduler and HTTP router on top of an open pool
pub async fn create_app(config: &Config, pool: SqlitePool) -> Result<App> {
    tracing::info!("📋 Initializing execution store");
    let store = SqliteExecutionStore::new(pool.clone());
    store.init_schema().await?;

    tracing::info!("🎨 Initializing canvas store");
    let canvases = Arc::new(SqliteCanvasService::new(pool.clone()));
    canvases.init_schema().await?;

    tracing::info!("🔒 Initializing node locks");
    let locks = SqliteLockService::new(pool.clone());
    locks.init_schema().await?;

    let (run_queue, poll_queue) = build_queues(&pool, config.scheduler.queue_backend).await?;

    tracing::info!("🧠 Skill endpoint: {}", config.skill.endpoint);
    let skill = HttpSkillInvoker::new(
        config.skill.endpoint.clone(),
        Duration::from_millis(config.skill.timeout_ms),
    )?;

    let scheduler = Arc::new(WorkflowScheduler::new(
        SchedulerDeps {
            store: Arc::new(store),
            locks: Arc::new(locks),
            run_queue,
            poll_queue,
            canvas: canvases.clone(),
            preparer: Arc::new(CanvasNodePreparer),
            handlers: Arc::new(NodeHandlerRegistry::with_skill(Arc::new(skill))),
        },
        config.scheduler.clone(),
    ));

    let app_state = AppState {
        scheduler: scheduler.clone(),
        canvases,
    };

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes().with_state(app_state.clone()))
        .merge(create_canvas_routes().with_state(app_state));

    tracing::info!("✅ Application initialized successfully");
    Ok(App { router, scheduler })
}

/// Start workers and the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting canvasflow server...");

    let pool = connect_pool(&config.database.url).await?;
    let app = create_app(&config, pool.clone()).await?;

    let mut workers = QueueWorkerPool::new(app.scheduler.clone());
    workers.start();

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    let served = axum::serve(listener, app.router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    workers.stop().await;
    pool.close().await;
    served?;

    tracing::info!("👋 canvasflow stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown signal received");
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
