/// Canvas REST API endpoints
///
/// Minimal canvas management so a graph can be stored and then executed.

use crate::api::workflows::{ApiResponse, AppState};
use crate::api::{ApiError, ApiResult};
use crate::canvas::{Canvas, CanvasService};
use crate::error::WorkflowError;
use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Router,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub uid: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasSaved {
    pub canvas_id: String,
}

/// Create canvas routes
pub fn create_canvas_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/canvas/{id}", put(save_canvas))
        .route("/v1/canvas/{id}", get(get_canvas))
}

/// Create or replace a canvas
///
/// PUT /v1/canvas/{id}
/// Body: { "uid", "title"?, "variables"?, "graph": { "nodes": [...], "edges": [...] } }
async fn save_canvas(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Json(mut canvas): axum::Json<Canvas>,
) -> ApiResult<ApiResponse<CanvasSaved>> {
    // The path is authoritative for the id
    canvas.canvas_id = id;
    if canvas.canvas_id.is_empty() || canvas.uid.is_empty() {
        return Err(ApiError::bad_request("canvas id and uid are required"));
    }

    if let Some(existing) = state.canvases.get_canvas(&canvas.canvas_id).await? {
        if existing.uid != canvas.uid {
            return Err(WorkflowError::not_found(format!("Canvas {}", canvas.canvas_id)).into());
        }
    }

    state.canvases.save_canvas(&canvas).await?;
    tracing::info!(
        "🎨 Saved canvas {} ({} nodes, {} edges)",
        canvas.canvas_id,
        canvas.graph.nodes.len(),
        canvas.graph.edges.len()
    );

    Ok(ApiResponse::ok(CanvasSaved {
        canvas_id: canvas.canvas_id,
    }))
}

/// Get a canvas owned by `uid`
///
/// GET /v1/canvas/{id}?uid=...
async fn get_canvas(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> ApiResult<ApiResponse<Canvas>> {
    match state.canvases.get_canvas(&id).await? {
        Some(canvas) if canvas.uid == owner.uid => Ok(ApiResponse::ok(canvas)),
        _ => Err(WorkflowError::not_found(format!("Canvas {}", id)).into()),
    }
}
