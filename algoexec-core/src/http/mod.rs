//! HTTP front door (C9).

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::CorsConfig;
use crate::executor::Executor;
use crate::registry_publisher::RegistryPublisher;
use crate::runtime::ServiceRuntime;

/// Shared state every handler reaches through `axum::extract::State`.
pub struct AppState {
    pub executor: Arc<Executor>,
    pub runtime: ServiceRuntime,
    pub publisher: Option<Arc<RegistryPublisher>>,
    pub admin_enabled: bool,
    /// Directory `POST /admin/overrides/reload` re-scans, if configured.
    pub overrides_dir: Option<String>,
}

pub fn router(state: Arc<AppState>, cors: &CorsConfig) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .route("/algorithms", get(handlers::list_algorithms))
        .route(
            "/algorithms/:name/:version/schema",
            get(handlers::algorithm_schema),
        )
        .route("/algorithms/:name/:version", post(handlers::invoke));

    if state.admin_enabled {
        router = router
            .route("/admin/drain", post(handlers::admin_drain))
            .route("/admin/overrides/reload", post(handlers::admin_reload_overrides));
    }

    let cors_layer = if cors.allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<_> = cors
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}
