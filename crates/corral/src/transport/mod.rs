// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport for the broker.

pub mod auth;
pub mod http;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::CorralState;

/// Build the axum `Router` with all broker routes.
pub fn build_router(state: Arc<CorralState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/api/v1/health", get(http::health))
        // Submissions
        .route("/api/v1/submissions", post(http::submit))
        .route(
            "/api/v1/requests/{id}",
            get(http::poll_request).delete(http::cancel_request),
        )
        // Sessions
        .route("/api/v1/sessions", post(http::create_session))
        .route(
            "/api/v1/sessions/{id}",
            get(http::get_session)
                .patch(http::update_session)
                .delete(http::delete_session),
        )
        // Tenant introspection
        .route("/api/v1/quota", get(http::quota))
        .route("/api/v1/pool", get(http::pool_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
