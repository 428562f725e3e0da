//! Integration tests for the request channel against the in-process backend.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use promptwatch_comfyui::api::{ComfyUIApi, ComfyUIApiError, ItemList};
use promptwatch_comfyui::session::SessionIdentity;
use serde_json::json;

use common::Backend;

async fn setup(client_id: Option<&str>) -> (Arc<Backend>, ComfyUIApi) {
    let backend = Backend::new();
    let url = backend.spawn().await;
    let identity = Arc::new(SessionIdentity::in_memory());
    if let Some(id) = client_id {
        identity.adopt(id).unwrap();
    }
    (backend, ComfyUIApi::new(url, identity))
}

// ---------------------------------------------------------------------------
// Test: queue snapshot
// ---------------------------------------------------------------------------

/// `GET /queue` decodes positional entries and carries the client id.
#[tokio::test]
async fn get_queue_decodes_entries() {
    let (backend, api) = setup(Some("sid-1")).await;
    backend.respond(
        "GET /queue",
        200,
        json!({
            "queue_running": [[4, "run", {}, {}, []]],
            "queue_pending": [[5, "next", {}, {}, []], [6, "last", {}, {}, []]],
        }),
    );

    let snapshot = api.get_queue().await.unwrap();
    assert_eq!(snapshot.total(), 3);
    assert_eq!(snapshot.position_of("last"), Some(2));

    let requests = backend.requests_to("GET", "/queue");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].query.get("clientId").map(String::as_str), Some("sid-1"));
}

/// A non-2xx status is surfaced with its body.
#[tokio::test]
async fn get_queue_error_status() {
    let (backend, api) = setup(None).await;
    backend.respond("GET /queue", 500, json!({"error": "down"}));

    assert_matches!(
        api.get_queue().await,
        Err(ComfyUIApiError::ApiError { status: 500, .. })
    );
    assert!(backend.requests_to("GET", "/queue")[0].query.get("clientId").is_none());
}

/// `GET /prompt` returns the queue status used by polling.
#[tokio::test]
async fn get_status_reads_exec_info() {
    let (backend, api) = setup(None).await;
    backend.respond("GET /prompt", 200, json!({"exec_info": {"queue_remaining": 4}}));

    let status = api.get_status().await.unwrap();
    assert_eq!(status.exec_info.queue_remaining, 4);
}

// ---------------------------------------------------------------------------
// Test: validation and execution
// ---------------------------------------------------------------------------

/// A validated graph yields the renamed prompt id and the graph's node ids.
#[tokio::test]
async fn queue_prompt_returns_prompt_and_nodes() {
    let (backend, api) = setup(Some("sid-1")).await;
    backend.respond(
        "POST /validate_prompt",
        200,
        json!({"code": 0, "run_id": "p-42", "node_error": {}}),
    );

    let graph = json!({"3": {"class_type": "KSampler"}, "9": {"class_type": "SaveImage"}});
    let queued = api
        .queue_prompt(-1, &graph, json!({"nodes": []}), Some("flow-1".into()))
        .await
        .unwrap();

    assert_eq!(queued.prompt_id, "p-42");
    let mut nodes = queued.node_ids.clone();
    nodes.sort();
    assert_eq!(nodes, ["3", "9"]);

    let body = &backend.requests_to("POST", "/validate_prompt")[0].body;
    assert_eq!(body["prompt"], graph);
    assert_eq!(body["client_id"], "sid-1");
    assert_eq!(body["flow_id"], "flow-1");
    assert_eq!(body["front"], true);
    assert!(body.get("number").is_none());
    assert_eq!(body["extra_data"]["extra_pnginfo"]["workflow"], json!({"nodes": []}));
}

/// An explicit queue position is sent as `number`.
#[tokio::test]
async fn queue_prompt_with_position() {
    let (backend, api) = setup(None).await;
    backend.respond("POST /validate_prompt", 200, json!({"code": 0, "run_id": "p"}));

    api.queue_prompt(7, &json!({"1": {}}), json!(null), None)
        .await
        .unwrap();

    let body = &backend.requests_to("POST", "/validate_prompt")[0].body;
    assert_eq!(body["number"], 7);
    assert!(body.get("front").is_none());
}

/// Validation failures carry per-node errors.
#[tokio::test]
async fn validation_failure_reports_node_errors() {
    let (backend, api) = setup(None).await;
    backend.respond(
        "POST /validate_prompt",
        200,
        json!({
            "code": 1003,
            "error": {"message": "Prompt outputs failed validation"},
            "node_error": {"3": {"errors": ["missing model"]}},
        }),
    );

    let result = api.queue_prompt(0, &json!({"3": {}}), json!(null), None).await;
    assert_matches!(
        result,
        Err(ComfyUIApiError::Validation { message, node_errors })
            if message == "Prompt outputs failed validation" && node_errors["3"]["errors"][0] == "missing model"
    );
}

/// Missing workflow data and explicit rejection are both rejections.
#[tokio::test]
async fn rejected_codes() {
    let (backend, api) = setup(None).await;

    backend.respond("POST /validate_prompt", 200, json!({"code": 1001}));
    assert_matches!(
        api.queue_prompt(0, &json!({"1": {}}), json!(null), None).await,
        Err(ComfyUIApiError::Rejected { code: 1001, message }) if message == "not found workflow data"
    );

    backend.respond("POST /validate_prompt", 200, json!({"code": 1002, "error": "quota exceeded"}));
    assert_matches!(
        api.queue_prompt(0, &json!({"1": {}}), json!(null), None).await,
        Err(ComfyUIApiError::Rejected { code: 1002, message }) if message == "quota exceeded"
    );
}

/// A successful validation without a prompt id cannot be tracked.
#[tokio::test]
async fn validation_without_prompt_id() {
    let (backend, api) = setup(None).await;
    backend.respond("POST /validate_prompt", 200, json!({"code": 0}));

    assert_matches!(
        api.queue_prompt(0, &json!({"1": {}}), json!(null), None).await,
        Err(ComfyUIApiError::MissingPromptId)
    );
}

/// `POST /execute/{id}` succeeds on 200 and fails otherwise.
#[tokio::test]
async fn execute_prompt_status() {
    let (backend, api) = setup(None).await;
    backend.respond("POST /execute/p1", 200, json!({"prompt_id": "p1", "number": 2}));
    let response = api.execute_prompt("p1").await.unwrap();
    assert_eq!(response.number, Some(2));

    backend.respond("POST /execute/p2", 400, json!({"error": "bad"}));
    assert_matches!(
        api.execute_prompt("p2").await,
        Err(ComfyUIApiError::ApiError { status: 400, .. })
    );
}

/// Plain submission falls back to a random client id.
#[tokio::test]
async fn submit_workflow_posts_prompt() {
    let (backend, api) = setup(None).await;
    backend.respond(
        "POST /prompt",
        200,
        json!({"prompt_id": "direct", "number": 1, "node_errors": {}}),
    );

    let response = api.submit_workflow(&json!({"1": {}})).await.unwrap();
    assert_eq!(response.prompt_id, "direct");

    let body = &backend.requests_to("POST", "/prompt")[0].body;
    assert!(body["client_id"].as_str().is_some_and(|id| !id.is_empty()));
}

// ---------------------------------------------------------------------------
// Test: queue and history management
// ---------------------------------------------------------------------------

/// Delete and clear post the expected bodies to the right lists.
#[tokio::test]
async fn delete_and_clear_items() {
    let (backend, api) = setup(None).await;
    backend.respond("POST /queue", 200, json!({}));
    backend.respond("POST /history", 200, json!({}));
    backend.respond("POST /interrupt", 200, json!({}));

    api.delete_item(ItemList::Queue, "p1").await.unwrap();
    api.clear_items(ItemList::History).await.unwrap();
    api.interrupt().await.unwrap();

    assert_eq!(backend.requests_to("POST", "/queue")[0].body, json!({"delete": ["p1"]}));
    assert_eq!(backend.requests_to("POST", "/history")[0].body, json!({"clear": true}));
    assert_eq!(backend.requests_to("POST", "/interrupt").len(), 1);
}

/// History entries are returned as a list.
#[tokio::test]
async fn history_entries() {
    let (backend, api) = setup(None).await;
    backend.respond(
        "GET /history",
        200,
        json!({"a": {"status": "ok"}, "b": {"status": "error"}}),
    );

    let history = api.get_history(2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        backend.requests_to("GET", "/history")[0].query.get("max_items").map(String::as_str),
        Some("2")
    );
}

// ---------------------------------------------------------------------------
// Test: authentication
// ---------------------------------------------------------------------------

/// A rejected token is reported as invalid.
#[tokio::test]
async fn authenticate_unauthorized() {
    let (backend, api) = setup(None).await;
    backend.respond("GET /authenticate", 401, json!({"error": "nope"}));

    assert_matches!(api.authenticate("bad").await, Err(ComfyUIApiError::InvalidToken));
}

/// A successful login stores credentials and adopts the returned client id.
#[tokio::test]
async fn authenticate_adopts_identity_and_sets_headers() {
    let (backend, api) = setup(None).await;
    backend.respond(
        "GET /authenticate",
        200,
        json!({"userId": "u-7", "clientId": "auth-client"}),
    );

    let info = api.authenticate("tok").await.unwrap();
    assert_eq!(info.user_id, "u-7");
    assert_eq!(api.identity().client_id().as_deref(), Some("auth-client"));

    api.get_queue().await.unwrap();
    let request = &backend.requests_to("GET", "/queue")[0];
    assert_eq!(request.headers.get("usertoken").map(String::as_str), Some("tok"));
    assert_eq!(request.headers.get("userid").map(String::as_str), Some("u-7"));
    assert_eq!(request.query.get("clientId").map(String::as_str), Some("auth-client"));
}

/// An identity already known is kept over the one returned by login.
#[tokio::test]
async fn authenticate_keeps_existing_identity() {
    let (backend, api) = setup(Some("mine")).await;
    backend.respond(
        "GET /authenticate",
        200,
        json!({"userId": "u-7", "clientId": "theirs"}),
    );

    api.authenticate("tok").await.unwrap();
    assert_eq!(api.identity().client_id().as_deref(), Some("mine"));
}
