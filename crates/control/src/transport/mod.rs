// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP transport for the control plane.

pub mod auth;
pub mod http;
pub mod internal;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Build the axum `Router` with the public and internal routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health (no auth)
        .route("/v1/health", get(http::health))
        // Session surface
        .route("/v1/sessions", post(http::create_session).get(http::list_sessions))
        .route("/v1/sessions/{id}", get(http::get_session).post(http::update_session))
        .route("/v1/sessions/{id}/debug", get(http::session_debug))
        // Container-facing internal surface (bearer-token authenticated)
        .route("/internal/sessions/{id}/ready", post(internal::session_ready))
        .route("/internal/sessions/{id}/connections", post(internal::session_connections))
        // Middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
