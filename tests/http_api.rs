use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use code_awareness_api::{
    api::{self, AppState},
    editor::LocalEditor,
    transport::InMemoryTransport,
    Config, GraphService,
};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> (Router, GraphService) {
    let transport = Arc::new(InMemoryTransport::default());
    let editor = Arc::new(LocalEditor::new());
    let service = GraphService::start(Config::default(), transport.clone(), editor.clone());
    let router = api::router(AppState {
        service: service.clone(),
        transport,
        editor,
    });
    (router, service)
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn healthz_reports_graph_health() {
    let (router, _service) = app();
    let (status, body) = call(&router, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["health"]["status"], "healthy");
}

#[tokio::test]
async fn batch_then_node_lookup() {
    let (router, _service) = app();
    let operations = json!([
        { "type": "node", "operation": "add", "data": { "id": "src/a.ts", "type": "file" } },
        { "type": "node", "operation": "add", "data": { "id": "src/b.ts", "type": "file" } },
        { "type": "edge", "operation": "add", "data": { "from": "src/a.ts", "to": "src/b.ts", "type": "imports" } },
        { "type": "node", "operation": "remove", "data": { "id": "ghost" } }
    ]);
    let (status, report) = call(&router, Method::POST, "/v1/batch", Some(operations)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["applied"], 3);
    assert_eq!(report["failed"][0]["index"], 3);

    let (status, info) = call(&router, Method::GET, "/v1/nodes/src%2Fb.ts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["node"]["id"], "src/b.ts");
    assert_eq!(info["derived"]["inDegree"], 1);

    let (status, edges) = call(&router, Method::GET, "/v1/nodes/src%2Fa.ts/edges", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edges["edges"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn large_batch_is_accepted_for_deferred_application() {
    let (router, service) = app();
    let operations = (0..60)
        .map(|i| json!({ "type": "node", "operation": "add", "data": { "id": format!("n{i}"), "type": "file" } }))
        .collect::<Vec<_>>();
    let (status, body) = call(&router, Method::POST, "/v1/batch", Some(json!({ "operations": operations }))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["deferred"], true);
    assert_eq!(body["total"], 60);

    let nodes = service.filter_nodes(Default::default()).await.unwrap();
    assert_eq!(nodes.len(), 60);
}

#[tokio::test]
async fn unknown_resources_use_error_envelope() {
    let (router, _service) = app();
    let (status, body) = call(&router, Method::GET, "/v1/nodes/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NODE_NOT_FOUND");

    let (status, body) = call(&router, Method::DELETE, "/v1/profiles/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "PROFILE_NOT_FOUND");

    let (status, body) = call(&router, Method::POST, "/v1/events/somethingElse", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "UNKNOWN_EVENT");

    let (status, body) = call(&router, Method::POST, "/v1/batch", Some(json!({ "ops": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_BATCH_REQUEST");
}

#[tokio::test]
async fn inbound_events_show_up_in_outbound_log() {
    let (router, service) = app();
    let (_, first) = call(&router, Method::GET, "/v1/events/outbound", None).await;
    let since = first["nextSeq"].as_u64().unwrap() - 1;

    let (status, body) = call(
        &router,
        Method::POST,
        "/v1/events/agentUpdate",
        Some(json!({ "agentId": "a-1", "agentType": "tester", "currentTask": { "id": "t", "status": "completed" } })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["handlers"], 1);
    service.get_health_status().await.unwrap();

    let (_, log) = call(&router, Method::GET, &format!("/v1/events/outbound?since={since}"), None).await;
    let events = log["events"].as_array().unwrap();
    let update = events
        .iter()
        .find(|event| event["event"] == "agentUpdate")
        .expect("agentUpdate logged");
    assert_eq!(update["payload"]["taskStatus"], "completed");
    assert!(events.windows(2).all(|pair| pair[0]["seq"].as_u64() < pair[1]["seq"].as_u64()));
}

#[tokio::test]
async fn search_and_filter_routes() {
    let (router, service) = app();
    service
        .upsert_node(json!({ "id": "src/cache.rs", "type": "file", "metrics": { "complexity": 12 } }))
        .await
        .unwrap();
    service
        .upsert_node(json!({ "id": "src/api.rs", "type": "file", "metrics": { "complexity": 2 } }))
        .await
        .unwrap();

    let (_, body) = call(&router, Method::POST, "/v1/search", Some(json!({ "term": "cache" }))).await;
    assert_eq!(body["matches"], 1);
    let (_, body) = call(&router, Method::GET, "/v1/search/results", None).await;
    assert_eq!(body["ids"], json!(["src/cache.rs"]));

    let (_, body) = call(
        &router,
        Method::POST,
        "/v1/filter",
        Some(json!({ "types": ["file"], "complexity": { "min": 10 } })),
    )
    .await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["nodes"][0]["id"], "src/cache.rs");
}

#[tokio::test]
async fn profiles_open_and_close_over_http() {
    let (router, _service) = app();
    let (status, _) = call(
        &router,
        Method::POST,
        "/v1/profiles/p1",
        Some(json!({ "operations": ["getNodeInfo"] })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    call(&router, Method::GET, "/v1/nodes/anything", None).await;

    let (status, report) = call(&router, Method::DELETE, "/v1/profiles/p1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["operationMetrics"]["getNodeInfo"]["count"], 1);
}
