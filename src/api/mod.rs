/// HTTP API Layer
///
/// REST endpoints for the workflow scheduler:
/// - Execution initialize / abort / detail / list
/// - Node completion callback used by the skill subsystem
/// - Canvas upsert and lookup

use crate::error::WorkflowError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

// Workflow execution endpoints
pub mod workflows;

// Canvas endpoints
pub mod canvases;

pub use canvases::create_canvas_routes;
pub use workflows::{create_workflow_routes, AppState};

/// Error returned by handlers, rendered as `{ success: false, error: { code, message } }`
#[derive(Debug)]
pub struct ApiError(pub WorkflowError);

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError(WorkflowError::InvalidRequest(message.into()))
    }
}

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        ApiError(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(WorkflowError::Internal(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkflowError::InvalidGraph(_) | WorkflowError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            WorkflowError::NodeFailed { .. } | WorkflowError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("❌ Request failed: {}", self.0);
        }

        let body = json!({
            "success": false,
            "error": { "code": self.0.code(), "message": self.0.external_message() }
        });
        (status, Json(body)).into_response()
    }
}

/// Result type of every API handler
pub type ApiResult<T> = Result<Json<T>, ApiError>;
