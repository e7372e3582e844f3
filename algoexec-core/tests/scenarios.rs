//! In-process integration tests for the invoke path, driven through the
//! real `axum::Router` via `tower::ServiceExt::oneshot` - no socket bind,
//! same approach the teacher's own HTTP-layer tests use. Covers S1
//! (happy path), S5 (lifecycle admission gating), and S6 (response-meta
//! override on both the success and error paths).

use std::sync::Arc;
use std::time::Duration;

use algoexec_core::config::CorsConfig;
use algoexec_core::context::ExecutionContext;
use algoexec_core::envelope::AlgoError;
use algoexec_core::executor::Executor;
use algoexec_core::http::{self, AppState};
use algoexec_core::observe::Recorder;
use algoexec_core::pool::WorkerPoolConfig;
use algoexec_core::registry::spec::{
    AlgorithmKind, AlgorithmMetadata, Entrypoint, ExecutionConfig, ExecutionMode, LoggingConfig,
};
use algoexec_core::registry::{AlgorithmRegistry, AlgorithmSpec};
use algoexec_core::runtime::ServiceRuntime;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower::ServiceExt;

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct Num {
    value: i64,
}

fn double(input: Num) -> Result<Num, AlgoError> {
    Ok(Num {
        value: input.value * 2,
    })
}

fn sets_meta(input: Num) -> Result<Num, AlgoError> {
    ExecutionContext::current().set_response_code(201);
    ExecutionContext::current().set_response_message("created");
    Ok(input)
}

fn fails_with_meta(_input: Num) -> Result<Num, AlgoError> {
    ExecutionContext::current().set_response_code(418);
    ExecutionContext::current().set_response_message("teapot");
    Err(AlgoError::runtime("deliberate failure"))
}

fn scaled_by_hyperparams(input: Num) -> Result<Num, AlgoError> {
    let factor = ExecutionContext::current()
        .hyperparams()
        .and_then(|h| h.get("factor"))
        .and_then(|f| f.as_i64())
        .unwrap_or(1);
    Ok(Num {
        value: input.value * factor,
    })
}

fn in_process_spec(name: &'static str, f: fn(Num) -> Result<Num, AlgoError>) -> AlgorithmSpec {
    AlgorithmSpec {
        name: name.into(),
        version: "v1".into(),
        kind: AlgorithmKind::Prediction,
        entrypoint: Entrypoint::function("scenarios", name, f),
        execution: ExecutionConfig {
            mode: ExecutionMode::InProcess,
            ..ExecutionConfig::default()
        },
        logging: LoggingConfig::default(),
        metadata: AlgorithmMetadata::default(),
    }
}

fn build_state() -> (Arc<AppState>, ServiceRuntime) {
    let registry = AlgorithmRegistry::new();
    registry
        .register_all(vec![
            in_process_spec("Double", double),
            in_process_spec("SetsMeta", sets_meta),
            in_process_spec("FailsWithMeta", fails_with_meta),
            in_process_spec("ScaledByHyperparams", scaled_by_hyperparams),
        ])
        .unwrap();

    let recorder = Recorder::new();
    let pool_config = WorkerPoolConfig {
        max_workers: 2,
        queue_size: 4,
        kill_grace: Duration::from_millis(100),
        kill_tree: true,
    };
    let executor = Arc::new(Executor::new(registry, recorder, pool_config));
    let runtime = ServiceRuntime::new();
    let state = Arc::new(AppState {
        executor,
        runtime: runtime.clone(),
        publisher: None,
        admin_enabled: false,
        overrides_dir: None,
    });
    (state, runtime)
}

fn post_json(uri: &str, value: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&value).unwrap()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn s1_happy_path_doubles_and_returns_200() {
    let (state, runtime) = build_state();
    runtime.provisioning().await.unwrap();
    runtime.ready().await.unwrap();
    runtime.running().await.unwrap();
    let app = http::router(state, &CorsConfig::default());

    let response = app
        .oneshot(post_json("/algorithms/Double/v1", serde_json::json!({"value": 3})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["code"], 0);
    assert_eq!(body["message"], "success");
    assert_eq!(body["data"]["value"], 6);
}

#[tokio::test]
async fn s5_lifecycle_gates_admission_by_state() {
    let (state, runtime) = build_state();
    let app = http::router(state, &CorsConfig::default());

    // Not yet Running: rejected with 503.
    runtime.provisioning().await.unwrap();
    runtime.ready().await.unwrap();
    let response = app
        .clone()
        .oneshot(post_json("/algorithms/Double/v1", serde_json::json!({"value": 1})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Running: admitted.
    runtime.running().await.unwrap();
    let response = app
        .clone()
        .oneshot(post_json("/algorithms/Double/v1", serde_json::json!({"value": 1})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Draining: rejected with 429, distinct from the pre-Running 503.
    runtime.draining().await.unwrap();
    let response = app
        .oneshot(post_json("/algorithms/Double/v1", serde_json::json!({"value": 1})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn s6_response_meta_override_on_success_and_failure() {
    let (state, runtime) = build_state();
    runtime.provisioning().await.unwrap();
    runtime.ready().await.unwrap();
    runtime.running().await.unwrap();
    let app = http::router(state, &CorsConfig::default());

    let response = app
        .clone()
        .oneshot(post_json("/algorithms/SetsMeta/v1", serde_json::json!({"value": 1})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::from_u16(201).unwrap());
    let body = body_json(response).await;
    assert_eq!(body["code"], 201);
    assert_eq!(body["message"], "created");

    let response = app
        .oneshot(post_json(
            "/algorithms/FailsWithMeta/v1",
            serde_json::json!({"value": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::from_u16(418).unwrap());
    let body = body_json(response).await;
    assert_eq!(body["code"], 418);
    assert_eq!(body["message"], "teapot");
    assert!(body["data"].is_null());
}

#[tokio::test]
async fn hyperparams_reach_an_in_process_algorithm_via_the_ambient() {
    let (state, runtime) = build_state();
    runtime.provisioning().await.unwrap();
    runtime.ready().await.unwrap();
    runtime.running().await.unwrap();
    let app = http::router(state, &CorsConfig::default());

    let envelope = serde_json::json!({
        "requestId": "r1",
        "datetime": "2025-01-01T00:00:00Z",
        "context": {},
        "data": {"value": 3},
        "hyperparams": {"factor": 4},
    });
    let response = app
        .oneshot(post_json("/algorithms/ScaledByHyperparams/v1", envelope))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["value"], 12);
}
