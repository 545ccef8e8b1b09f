/// Workflow execution REST API endpoints
///
/// Thin JSON layer over `WorkflowScheduler`. Every success body has the shape
/// `{ "success": true, "data": ... }`.

use crate::api::{ApiError, ApiResult};
use crate::canvas::{SqliteCanvasService, WorkflowVariable};
use crate::runtime::{InitializeRequest, WorkflowScheduler};
use crate::workflow::types::{NodeCompletion, WorkflowExecution, WorkflowExecutionDetail};
use axum::{
    extract::{Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Execution lifecycle operations
    pub scheduler: Arc<WorkflowScheduler>,
    /// Canvas store, for canvas upserts
    pub canvases: Arc<SqliteCanvasService>,
}

/// `{ success: true, data }` envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self { success: true, data })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeWorkflowRequest {
    pub uid: String,
    pub canvas_id: String,
    #[serde(default)]
    pub target_canvas_id: Option<String>,
    #[serde(default)]
    pub variables: Option<Vec<WorkflowVariable>>,
    #[serde(default)]
    pub start_nodes: Option<Vec<String>>,
    #[serde(default)]
    pub check_canvas_ownership: bool,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeWorkflowResponse {
    pub workflow_execution_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortWorkflowRequest {
    pub uid: String,
    pub execution_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailQuery {
    pub execution_id: String,
    pub uid: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub uid: String,
    #[serde(default)]
    pub canvas_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteNodeRequest {
    pub execution_id: String,
    pub node_id: String,
    /// "finish" or "failed"
    pub status: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteNodeResponse {
    /// False when the node was not executing (late or duplicate report)
    pub applied: bool,
}

/// Create workflow execution routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/workflow/initialize", post(initialize_workflow))
        .route("/v1/workflow/abort", post(abort_workflow))
        .route("/v1/workflow/detail", get(get_workflow_detail))
        .route("/v1/workflow/list", get(list_workflows))
        .route("/v1/workflow/node/complete", post(complete_node))
}

/// Start a new execution
///
/// POST /v1/workflow/initialize
/// Body: { "uid", "canvasId", "targetCanvasId"?, "variables"?, "startNodes"?, "checkCanvasOwnership"? }
async fn initialize_workflow(
    State(state): State<AppState>,
    Json(payload): Json<InitializeWorkflowRequest>,
) -> ApiResult<ApiResponse<InitializeWorkflowResponse>> {
    if payload.uid.is_empty() || payload.canvas_id.is_empty() {
        return Err(ApiError::bad_request("uid and canvasId are required"));
    }

    let execution_id = state
        .scheduler
        .initialize(InitializeRequest {
            uid: payload.uid,
            source_canvas_id: payload.canvas_id,
            target_canvas_id: payload.target_canvas_id,
            variables: payload.variables,
            start_nodes: payload.start_nodes,
            check_canvas_ownership: payload.check_canvas_ownership,
            title: payload.title,
        })
        .await?;

    Ok(ApiResponse::ok(InitializeWorkflowResponse {
        workflow_execution_id: execution_id,
    }))
}

/// Abort an execution
///
/// POST /v1/workflow/abort
/// Body: { "uid", "executionId" }
async fn abort_workflow(
    State(state): State<AppState>,
    Json(payload): Json<AbortWorkflowRequest>,
) -> ApiResult<ApiResponse<Option<()>>> {
    state
        .scheduler
        .abort(&payload.execution_id, &payload.uid)
        .await?;
    Ok(ApiResponse::ok(None))
}

/// Current state of an execution with its nodes in execution order
///
/// GET /v1/workflow/detail?executionId=...&uid=...
async fn get_workflow_detail(
    State(state): State<AppState>,
    Query(query): Query<DetailQuery>,
) -> ApiResult<ApiResponse<WorkflowExecutionDetail>> {
    let detail = state
        .scheduler
        .get_detail(&query.execution_id, &query.uid)
        .await?;
    Ok(ApiResponse::ok(detail))
}

/// Executions of a user, newest first
///
/// GET /v1/workflow/list?uid=...&canvasId=...
async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<ApiResponse<Vec<WorkflowExecution>>> {
    let executions = state
        .scheduler
        .list_executions(&query.uid, query.canvas_id.as_deref())
        .await?;
    Ok(ApiResponse::ok(executions))
}

/// Completion callback from the skill subsystem
///
/// POST /v1/workflow/node/complete
/// Body: { "executionId", "nodeId", "status": "finish" | "failed", "errorMessage"? }
async fn complete_node(
    State(state): State<AppState>,
    Json(payload): Json<CompleteNodeRequest>,
) -> ApiResult<ApiResponse<CompleteNodeResponse>> {
    let completion = match payload.status.as_str() {
        "finish" => NodeCompletion::Finished,
        "failed" => NodeCompletion::Failed(
            payload
                .error_message
                .unwrap_or_else(|| "skill reported failure".to_string()),
        ),
        other => {
            return Err(ApiError::bad_request(format!(
                "status must be 'finish' or 'failed', got '{}'",
                other
            )))
        }
    };

    let applied = state
        .scheduler
        .complete_node(&payload.execution_id, &payload.node_id, completion)
        .await?;
    Ok(ApiResponse::ok(CompleteNodeResponse { applied }))
}
