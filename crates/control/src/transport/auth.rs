// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::admission::Resolution;
use crate::state::AppState;

/// Header carrying the client API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Axum middleware that resolves the API key into a project context.
///
/// Exempt: `/v1/health` (liveness) and `/internal/` (bearer-token
/// authenticated per route by the token service).
pub async fn auth_layer(
    state: State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/v1/health" || path.starts_with("/internal/") {
        return next.run(req).await;
    }

    let Some(api_key) = req.headers().get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) else {
        let (status, body) =
            crate::error::ApiError::Auth.to_http_response("missing API key header");
        return (status, body).into_response();
    };

    match state.admission.resolve(api_key).await {
        Ok(resolution) => {
            req.extensions_mut().insert(AuthContext(resolution));
            next.run(req).await
        }
        Err(e) => e.to_http_response().into_response(),
    }
}

/// Request extension carrying the resolved key context.
#[derive(Clone)]
pub struct AuthContext(pub Resolution);
