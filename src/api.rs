use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::{
    batch::BatchHandle,
    editor::LocalEditor,
    error::GraphError,
    health::HealthState,
    integration::agent::AgentContextRequest,
    search::NodeFilter,
    service::GraphService,
    transport::{events, InMemoryTransport},
};

#[derive(Clone)]
pub struct AppState {
    pub service: GraphService,
    pub transport: Arc<InMemoryTransport>,
    pub editor: Arc<LocalEditor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/nodes/{id}", get(get_node).delete(remove_node))
        .route("/v1/nodes/{id}/edges", get(get_edges))
        .route("/v1/insights", get(get_insights))
        .route("/v1/performance", get(get_performance))
        .route("/v1/history", get(get_history))
        .route("/v1/analysis/{*path}", get(get_analysis))
        .route("/v1/search", post(search))
        .route("/v1/search/results", get(search_results))
        .route("/v1/filter", post(filter))
        .route("/v1/batch", post(batch))
        .route("/v1/events/outbound", get(outbound_events))
        .route("/v1/events/{event}", post(inbound_event))
        .route("/v1/editor/content", post(editor_content))
        .route("/v1/profiles/{id}", post(start_profile).delete(end_profile))
        .route("/v1/agents/context", post(agent_context))
        .route("/v1/errors", post(report_error))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message.into()
            }
        })),
    )
        .into_response()
}

fn graph_error(err: GraphError) -> Response {
    match err {
        GraphError::Validation(err) => error_response(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", err.to_string()),
        GraphError::ServiceClosed => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "SERVICE_CLOSED",
            "Graph service is shut down.",
        ),
        other => {
            warn!("Request failed: {other}");
            error_response(StatusCode::BAD_GATEWAY, "INTEGRATION_FAILED", other.to_string())
        }
    }
}

pub async fn healthz(State(state): State<AppState>) -> Response {
    match state.service.get_health_status().await {
        Ok(health) => {
            let ok = health.status != HealthState::Unhealthy;
            Json(json!({ "ok": ok, "timestamp": Utc::now(), "health": health })).into_response()
        }
        Err(err) => graph_error(err),
    }
}

pub async fn get_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.get_node_info(&id).await {
        Ok(Some(info)) => (StatusCode::OK, Json(info)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "NODE_NOT_FOUND", "Node not found."),
        Err(err) => graph_error(err),
    }
}

pub async fn remove_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.remove_node(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(GraphError::Validation(_)) => error_response(StatusCode::NOT_FOUND, "NODE_NOT_FOUND", "Node not found."),
        Err(err) => graph_error(err),
    }
}

pub async fn get_edges(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.edges_of(&id).await {
        Ok(edges) => Json(json!({ "id": id, "edges": edges })).into_response(),
        Err(err) => graph_error(err),
    }
}

pub async fn get_insights(State(state): State<AppState>) -> Response {
    match state.service.get_project_insights().await {
        Ok(report) => Json(report).into_response(),
        Err(err) => graph_error(err),
    }
}

pub async fn get_performance(State(state): State<AppState>) -> Response {
    match state.service.get_performance_metrics().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => graph_error(err),
    }
}

pub async fn get_history(State(state): State<AppState>) -> Response {
    match state.service.get_change_history().await {
        Ok(history) => Json(json!({ "entries": history })).into_response(),
        Err(err) => graph_error(err),
    }
}

pub async fn get_analysis(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    match state.service.get_analysis_cache(&path).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "ANALYSIS_NOT_CACHED",
            "No fresh analysis is cached for this path.",
        ),
        Err(err) => graph_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub term: String,
}

pub async fn search(State(state): State<AppState>, Json(request): Json<SearchRequest>) -> Response {
    match state.service.search_nodes(&request.term).await {
        Ok(matches) => Json(json!({ "term": request.term, "matches": matches })).into_response(),
        Err(err) => graph_error(err),
    }
}

pub async fn search_results(State(state): State<AppState>) -> Response {
    match state.service.search_results().await {
        Ok(ids) => Json(json!({ "ids": ids })).into_response(),
        Err(err) => graph_error(err),
    }
}

pub async fn filter(State(state): State<AppState>, Json(filter): Json<NodeFilter>) -> Response {
    match state.service.filter_nodes(filter).await {
        Ok(nodes) => Json(json!({ "count": nodes.len(), "nodes": nodes })).into_response(),
        Err(err) => graph_error(err),
    }
}

/// Accepts either a bare array of operations or `{ "operations": [...] }`.
pub async fn batch(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let operations = match body {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("operations") {
            Some(Value::Array(items)) => items,
            _ => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_BATCH_REQUEST",
                    "Request must include an `operations` array.",
                )
            }
        },
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_BATCH_REQUEST",
                "Request must include an `operations` array.",
            )
        }
    };

    match state.service.batch_update(operations).await {
        Ok(BatchHandle::Completed(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(BatchHandle::Deferred { batch_id, total, .. }) => (
            StatusCode::ACCEPTED,
            Json(json!({ "batchId": batch_id, "total": total, "deferred": true })),
        )
            .into_response(),
        Err(err) => graph_error(err),
    }
}

pub async fn inbound_event(
    State(state): State<AppState>,
    Path(event): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    if !events::INBOUND.contains(&event.as_str()) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "UNKNOWN_EVENT",
            format!("`{event}` is not an inbound event."),
        );
    }
    if state.service.is_disposed() {
        return graph_error(GraphError::ServiceClosed);
    }

    let handlers = state.transport.deliver(&event, payload);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "event": event, "handlers": handlers })),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct OutboundQuery {
    #[serde(default)]
    pub since: u64,
}

pub async fn outbound_events(State(state): State<AppState>, Query(query): Query<OutboundQuery>) -> Response {
    let events = state.transport.outbound_since(query.since);
    Json(json!({ "events": events, "nextSeq": state.transport.next_seq() })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct EditorContent {
    pub path: String,
    pub content: String,
}

pub async fn editor_content(State(state): State<AppState>, Json(document): Json<EditorContent>) -> Response {
    if document.path.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_DOCUMENT", "Document path is required.");
    }
    state.editor.set_content(document.path.clone(), document.content);
    (StatusCode::ACCEPTED, Json(json!({ "path": document.path }))).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct ProfileRequest {
    #[serde(default)]
    pub operations: Vec<String>,
}

pub async fn start_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ProfileRequest>>,
) -> Response {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    state.service.start_profile(&id, request.operations);
    (StatusCode::ACCEPTED, Json(json!({ "id": id }))).into_response()
}

pub async fn end_profile(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.service.end_profile(&id).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "PROFILE_NOT_FOUND", "Profile not found."),
        Err(err) => graph_error(err),
    }
}

pub async fn agent_context(State(state): State<AppState>, Json(request): Json<AgentContextRequest>) -> Response {
    match state.service.provide_agent_context(request).await {
        Ok(slice) => Json(slice).into_response(),
        Err(err) => graph_error(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct ErrorReportRequest {
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

pub async fn report_error(State(state): State<AppState>, Json(request): Json<ErrorReportRequest>) -> Response {
    state.service.report_error(&request.message, request.stack.as_deref());
    StatusCode::ACCEPTED.into_response()
}
