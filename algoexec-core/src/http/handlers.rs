//! Route handlers. Thin: all real decisions live in
//! [`crate::executor::Executor`] / [`crate::runtime::ServiceRuntime`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::{AlgorithmRequest, AlgorithmResponse};
use crate::runtime::ServiceState;

use super::AppState;

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.runtime.state().await {
        ServiceState::Running => (StatusCode::OK, "ready"),
        other => (StatusCode::SERVICE_UNAVAILABLE, ready_reason(other)),
    }
}

fn ready_reason(state: ServiceState) -> &'static str {
    match state {
        ServiceState::Created => "not provisioned",
        ServiceState::Provisioning => "provisioning",
        ServiceState::Ready => "ready but not yet running",
        ServiceState::Running => "ready",
        ServiceState::Degraded => "degraded",
        ServiceState::Draining => "draining",
        ServiceState::Shutdown => "shut down",
    }
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.executor.recorder().metrics().render_prometheus_text();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Serialize)]
struct CatalogEntry {
    name: String,
    version: String,
    kind: crate::registry::spec::AlgorithmKind,
    description: Option<String>,
    route: String,
    schema_url: String,
    #[serde(rename = "createdTime", skip_serializing_if = "Option::is_none")]
    created_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<String>,
    #[serde(rename = "applicationScenarios", skip_serializing_if = "Option::is_none")]
    application_scenarios: Option<String>,
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    extra: std::collections::HashMap<String, String>,
}

/// `spec.md` §4.9: `{name, version, description, kind, …metadata}` - the
/// remaining `AlgorithmMetadata` fields ride alongside as their own
/// top-level keys rather than a nested `metadata` object, matching the
/// flat shape the registry KV catalog publishes
/// (`src/registry_publisher.rs`).
pub async fn list_algorithms(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries: Vec<CatalogEntry> = state
        .executor
        .registry()
        .list()
        .into_iter()
        .map(|spec| CatalogEntry {
            route: format!("/algorithms/{}/{}", spec.name, spec.version),
            schema_url: format!("/algorithms/{}/{}/schema", spec.name, spec.version),
            description: spec.metadata.description.clone(),
            created_time: spec.metadata.created_time.clone(),
            author: spec.metadata.author.clone(),
            category: spec.metadata.category.clone(),
            application_scenarios: spec.metadata.application_scenarios.clone(),
            extra: spec.metadata.extra.clone(),
            kind: spec.kind,
            name: spec.name,
            version: spec.version,
        })
        .collect();
    Json(entries)
}

pub async fn algorithm_schema(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
) -> Response {
    match state.executor.registry().get(&name, &version) {
        Ok(spec) => Json(serde_json::json!({
            "input": spec.entrypoint.input_schema(),
            "output": spec.entrypoint.output_schema(),
            "execution": spec.execution,
            "kind": spec.kind,
        }))
        .into_response(),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("unknown algorithm {name} ({version})")})),
        )
            .into_response(),
    }
}

/// Admission gate run before a request is ever dispatched: the service
/// only accepts work while `Running`, and refuses new work (without
/// tearing down what's already in flight) once it starts `Draining`
/// (`spec.md` §4.8/§4.9).
fn admission_rejection(state: ServiceState, request_id: Option<String>) -> Option<Response> {
    match state {
        ServiceState::Running => None,
        ServiceState::Draining => Some(
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(AlgorithmResponse::unrouted(429, "service is draining", request_id)),
            )
                .into_response(),
        ),
        other => Some(
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(AlgorithmResponse::unrouted(
                    503,
                    format!("service is not accepting requests ({})", ready_reason(other)),
                    request_id,
                )),
            )
                .into_response(),
        ),
    }
}

pub async fn invoke(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    let request = parse_request(body);

    if let Some(rejection) = admission_rejection(state.runtime.state().await, Some(request.request_id.clone())) {
        return rejection;
    }

    let spec = match state.executor.registry().get(&name, &version) {
        Ok(spec) => spec,
        Err(_) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": format!("unknown algorithm {name} ({version})")})),
            )
                .into_response()
        }
    };

    let response = state.executor.dispatch(&spec, request).await;
    let status = response_status(response.code);
    (status, Json(response)).into_response()
}

/// Maps a wire `code` back onto an HTTP status: `0` (the success default)
/// becomes `200`, any other value in the valid HTTP status range is used
/// as-is (an algorithm's overridden `code`, `spec.md` §4.3, is meant to be
/// the HTTP status), and anything out of range falls back to `500`.
fn response_status(code: i32) -> StatusCode {
    if code == 0 {
        return StatusCode::OK;
    }
    u16::try_from(code)
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Accepts either a full envelope (carrying `requestId`/`datetime`) or a
/// bare JSON payload, wrapping the latter into a freshly minted envelope.
/// Keeps the common case - posting just the algorithm's input - simple
/// while still honoring an explicit envelope when a caller supplies one.
fn parse_request(body: Value) -> AlgorithmRequest {
    if body.get("requestId").is_some() && body.get("data").is_some() {
        serde_json::from_value(body.clone()).unwrap_or_else(|_| AlgorithmRequest::new(body))
    } else {
        AlgorithmRequest::new(body)
    }
}

pub async fn admin_drain(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.runtime.draining().await {
        Ok(()) => (StatusCode::ACCEPTED, "draining"),
        Err(_) => (StatusCode::CONFLICT, "cannot drain from the current state"),
    }
}

pub async fn admin_reload_overrides(State(state): State<Arc<AppState>>) -> Response {
    match &state.overrides_dir {
        None => (
            StatusCode::NOT_IMPLEMENTED,
            "no overrides directory is configured",
        )
            .into_response(),
        Some(dir) => match state.executor.registry().load_overrides(std::path::Path::new(dir)) {
            Ok(count) => (StatusCode::OK, Json(serde_json::json!({"applied": count}))).into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response(),
        },
    }
}
