//! HTTP API tests driven through the router with `oneshot`

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use canvasflow::config::Config;
use canvasflow::database::memory_pool;
use canvasflow::server::create_app;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn router() -> Router {
    let config = Config::default();
    let pool = memory_pool().await.unwrap();
    create_app(&config, pool).await.unwrap().router
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn chain_canvas(uid: &str) -> Value {
    json!({
        "uid": uid,
        "title": "Research",
        "graph": {
            "nodes": [
                { "id": "a", "type": "skillResponse", "data": { "entityId": "e-a", "metadata": { "query": "first" } } },
                { "id": "b", "type": "skillResponse", "data": { "entityId": "e-b", "metadata": { "query": "second" } } }
            ],
            "edges": [ { "source": "a", "target": "b" } ]
        }
    })
}

#[tokio::test]
async fn test_health_check() {
    let router = router().await;
    let response = router
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn test_canvas_save_and_owner_lookup() {
    let router = router().await;

    let (status, body) = send(&router, "PUT", "/v1/canvas/c1", Some(chain_canvas("u-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["canvasId"], "c1");

    let (status, body) = send(&router, "GET", "/v1/canvas/c1?uid=u-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["graph"]["nodes"].as_array().unwrap().len(), 2);

    let (status, body) = send(&router, "GET", "/v1/canvas/c1?uid=u-2", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    // Someone else cannot overwrite it
    let (status, _) = send(&router, "PUT", "/v1/canvas/c1", Some(chain_canvas("u-2"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_initialize_detail_list_and_abort() {
    let router = router().await;
    send(&router, "PUT", "/v1/canvas/c1", Some(chain_canvas("u-1"))).await;

    let (status, body) = send(
        &router,
        "POST",
        "/v1/workflow/initialize",
        Some(json!({ "uid": "u-1", "canvasId": "c1", "checkCanvasOwnership": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let exec = body["data"]["workflowExecutionId"].as_str().unwrap().to_string();
    assert!(exec.starts_with("we-"));

    let (status, body) = send(
        &router,
        "GET",
        &format!("/v1/workflow/detail?executionId={}&uid=u-1", exec),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["executionId"], exec.as_str());
    assert_eq!(body["data"]["status"], "executing");
    let nodes = body["data"]["nodeExecutions"].as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0]["nodeId"], "a");
    assert_eq!(nodes[1]["parentNodeIds"], json!(["a"]));

    let (status, _) = send(
        &router,
        "GET",
        &format!("/v1/workflow/detail?executionId={}&uid=u-2", exec),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&router, "GET", "/v1/workflow/list?uid=u-1&canvasId=c1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = send(
        &router,
        "POST",
        "/v1/workflow/abort",
        Some(json!({ "uid": "u-1", "executionId": exec })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(
        &router,
        "GET",
        &format!("/v1/workflow/detail?executionId={}&uid=u-1", exec),
        None,
    )
    .await;
    assert_eq!(body["data"]["status"], "failed");
    assert_eq!(body["data"]["nodeExecutions"][0]["errorMessage"], "aborted");
}

#[tokio::test]
async fn test_initialize_rejects_bad_input() {
    let router = router().await;
    send(&router, "PUT", "/v1/canvas/c1", Some(chain_canvas("u-1"))).await;

    let (status, body) = send(
        &router,
        "POST",
        "/v1/workflow/initialize",
        Some(json!({ "uid": "", "canvasId": "c1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    let (status, _) = send(
        &router,
        "POST",
        "/v1/workflow/initialize",
        Some(json!({ "uid": "u-2", "canvasId": "c1", "checkCanvasOwnership": true })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut cyclic = chain_canvas("u-1");
    cyclic["graph"]["edges"] = json!([
        { "source": "a", "target": "b" },
        { "source": "b", "target": "a" }
    ]);
    send(&router, "PUT", "/v1/canvas/loop", Some(cyclic)).await;
    let (status, body) = send(
        &router,
        "POST",
        "/v1/workflow/initialize",
        Some(json!({ "uid": "u-1", "canvasId": "loop" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_GRAPH");
}

#[tokio::test]
async fn test_complete_node_validation() {
    let router = router().await;
    send(&router, "PUT", "/v1/canvas/c1", Some(chain_canvas("u-1"))).await;
    let (_, body) = send(
        &router,
        "POST",
        "/v1/workflow/initialize",
        Some(json!({ "uid": "u-1", "canvasId": "c1" })),
    )
    .await;
    let exec = body["data"]["workflowExecutionId"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        "POST",
        "/v1/workflow/node/complete",
        Some(json!({ "executionId": exec, "nodeId": "a", "status": "done" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    // Node is still waiting (no workers running), so the report is ignored
    let (status, body) = send(
        &router,
        "POST",
        "/v1/workflow/node/complete",
        Some(json!({ "executionId": exec, "nodeId": "a", "status": "finish" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["applied"], false);

    let (status, _) = send(
        &router,
        "POST",
        "/v1/workflow/node/complete",
        Some(json!({ "executionId": "we-missing", "nodeId": "a", "status": "finish" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
