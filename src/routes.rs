//! Route definitions and router setup
//!
//! Configures all API routes and middleware. Every pipeline endpoint is
//! tenant-scoped by construction: the tenant id is part of the path and
//! every store query filters by it.

mod evidence;
mod patterns;
mod proposals;
mod tenant_config;

use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    // Build CORS layer
    let cors = build_cors_layer(settings);

    // Build tracing/logging layer
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    // Build middleware stack
    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    // Build the router
    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Evidence ingestion
        .route(
            "/api/tenants/{tenant}/evidence",
            post(evidence::submit_evidence),
        )

        // Need patterns
        .route("/api/tenants/{tenant}/patterns", get(patterns::list_patterns))
        .route(
            "/api/tenants/{tenant}/patterns/{id}",
            get(patterns::get_pattern),
        )

        // Proposals: review queue, detail, admin actions
        .route(
            "/api/tenants/{tenant}/proposals",
            get(proposals::list_proposals),
        )
        .route(
            "/api/tenants/{tenant}/proposals/{id}",
            get(proposals::get_proposal),
        )
        .route(
            "/api/tenants/{tenant}/proposals/{id}/review",
            post(proposals::review_proposal),
        )
        .route(
            "/api/tenants/{tenant}/proposals/{id}/test",
            post(proposals::test_proposal),
        )
        .route(
            "/api/tenants/{tenant}/proposals/{id}/publish",
            post(proposals::publish_proposal),
        )

        // Dead-lettered pipeline tasks awaiting manual inspection
        .route(
            "/api/tenants/{tenant}/dead-letters",
            get(proposals::list_dead_letters),
        )

        // Per-tenant threshold & evidence-weight configuration
        .route(
            "/api/tenants/{tenant}/config",
            get(tenant_config::get_config).put(tenant_config::update_config),
        )

        // Apply middleware and state
        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
            .max_age(Duration::from_secs(3600))
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
            .max_age(Duration::from_secs(3600))
    }
}

/// Health check endpoint
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}
