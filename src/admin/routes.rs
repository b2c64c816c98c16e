//! Admin HTTP surface (§6.3): `/api/v1/storage/*`, reusing the donor's
//! axum `AppState`-extraction handler shape and tower middleware.

use crate::admin::facade::AdminFacade;
use crate::middleware::{rate_limit::rate_limit_middleware, request_logging, RateLimitConfig, RateLimitLayer};
use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Builds the admin surface: the `/api/v1/storage/*` facade endpoints
/// plus a `/metrics` Prometheus scrape endpoint fed by the recorder
/// installed at startup.
pub fn router(facade: Arc<AdminFacade>, prometheus: PrometheusHandle) -> Router {
    let limiter = RateLimitLayer::new(RateLimitConfig::default());

    Router::new()
        .route("/api/v1/storage/status", get(status))
        .route("/api/v1/storage/stats", get(stats))
        .route("/api/v1/storage/migration/execute", post(migration_execute))
        .route("/api/v1/storage/migration/status", get(migration_status))
        .route("/api/v1/storage/lifecycle/cleanup", post(lifecycle_cleanup))
        .route("/api/v1/storage/config", get(config))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(facade)
        .route("/metrics", get(move || async move { prometheus.render() }))
}

async fn status(State(facade): State<Arc<AdminFacade>>) -> Json<Value> {
    Json(serde_json::to_value(facade.status()).unwrap())
}

async fn stats(State(facade): State<Arc<AdminFacade>>) -> Json<Value> {
    Json(serde_json::to_value(facade.stats()).unwrap())
}

async fn migration_execute(State(facade): State<Arc<AdminFacade>>) -> Result<Json<Value>, StatusCode> {
    let report = facade.trigger_migration().await;
    let value = serde_json::to_value(report).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(value))
}

async fn migration_status(State(facade): State<Arc<AdminFacade>>) -> Json<Value> {
    Json(facade.migration_status())
}

async fn lifecycle_cleanup(State(facade): State<Arc<AdminFacade>>) -> Result<Json<Value>, StatusCode> {
    let reports = facade.trigger_cleanup().await;
    let value = serde_json::to_value(reports).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(value))
}

async fn config(State(facade): State<Arc<AdminFacade>>) -> Json<Value> {
    Json(facade.config())
}
