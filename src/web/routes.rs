use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// Routes that start or resume a query; these count against the rate limit
fn mutating_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/query", post(handlers::api::submit_query))
        .route("/approve/{query_id}", post(handlers::api::approve_query))
        .route(
            "/sessions/{session_id}/query",
            post(handlers::api::submit_session_query),
        )
        .route(
            "/sessions/{session_id}/stream",
            get(handlers::api::stream_session_query),
        )
        .route_layer(middleware::from_fn_with_state(
            state,
            handlers::api::rate_limit,
        ))
}

// API Routes - REST API for programmatic access
pub fn api_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            .merge(mutating_routes(state))
            // Sessions
            .route(
                "/sessions",
                post(handlers::api::create_session).get(handlers::api::list_sessions),
            )
            .route(
                "/sessions/{session_id}/history",
                get(handlers::api::session_history),
            )
            // Query records
            .route("/queries/{query_id}", get(handlers::api::get_query))
            .route("/history", get(handlers::api::query_history))
            // Cache management
            .route("/cache/stats", get(handlers::api::cache_stats))
            .route("/cache/flush", post(handlers::api::flush_cache))
            // Schema and system status
            .route("/schema", get(handlers::api::get_schema))
            .route("/schema/refresh", post(handlers::api::refresh_schema))
            .route("/health", get(handlers::api::health)),
    )
}
