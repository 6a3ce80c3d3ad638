// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket listener fronting the browser's CDP endpoint.
//!
//! Upgrades on `/cdp` carry a bearer token in the `Authorization` header or a
//! `?token=` query param. Invalid tokens never reach the browser: the upgrade
//! is completed only to deliver the typed close frame (4401/4403), which is
//! the only channel a WebSocket client can read a rejection from.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use aviary::token::{TokenError, TokenService};

use crate::config::ProxyConfig;
use crate::pipe::{self, CLOSE_INTERNAL, CLOSE_SESSION_MISMATCH, CLOSE_TOKEN_INVALID};
use crate::report;
use crate::watchdog::ConnectionTracker;

/// Shared proxy state.
pub struct ProxyState {
    pub config: ProxyConfig,
    pub tokens: Arc<TokenService>,
    pub tracker: Arc<ConnectionTracker>,
    /// Browser WebSocket URL discovered from `/json/version` at startup.
    pub browser_ws_url: String,
    pub started_at: Instant,
    pub shutdown: CancellationToken,
}

/// Build the proxy `Router`.
pub fn build_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/cdp", get(cdp_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CdpQuery {
    pub token: Option<String>,
}

/// `GET /healthz` — container-local liveness.
async fn healthz(State(s): State<Arc<ProxyState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "running",
        "session_id": s.config.session_id,
        "live_connections": s.tracker.live(),
    }))
}

/// Extract the bearer token from headers or query.
fn extract_token(headers: &HeaderMap, query: &CdpQuery) -> Option<String> {
    if let Some(header) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = header.strip_prefix("Bearer ") {
            return Some(token.to_owned());
        }
    }
    query.token.clone()
}

/// `GET /cdp` — authenticated WebSocket upgrade.
pub async fn cdp_handler(
    State(s): State<Arc<ProxyState>>,
    headers: HeaderMap,
    Query(query): Query<CdpQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(token) = extract_token(&headers, &query) else {
        s.tracker.record_auth_failure();
        tracing::warn!(session_id = %s.config.session_id, "connection without token");
        return ws
            .on_upgrade(move |socket| reject(socket, CLOSE_TOKEN_INVALID, "missing token"))
            .into_response();
    };

    match s.tokens.verify(&token, &s.config.session_id).await {
        Ok(claims) => {
            tracing::debug!(
                session_id = %s.config.session_id,
                project_id = %claims.pid,
                "CDP connection authenticated"
            );
            ws.on_upgrade(move |socket| handle_client(s, socket)).into_response()
        }
        Err(TokenError::SessionMismatch) => {
            s.tracker.record_auth_failure();
            tracing::warn!(session_id = %s.config.session_id, "token bound to another session");
            ws.on_upgrade(move |socket| {
                reject(socket, CLOSE_SESSION_MISMATCH, "token bound to another session")
            })
            .into_response()
        }
        Err(e) => {
            s.tracker.record_auth_failure();
            tracing::warn!(session_id = %s.config.session_id, reason = %e, "token rejected");
            ws.on_upgrade(move |socket| reject(socket, CLOSE_TOKEN_INVALID, "invalid token"))
                .into_response()
        }
    }
}

/// Complete the upgrade only to deliver the close frame; the browser is never
/// dialed.
async fn reject(socket: WebSocket, code: u16, reason: &'static str) {
    let (mut tx, _rx) = socket.split();
    pipe::close_client(&mut tx, code, reason).await;
}

/// Per-connection handler: dial the browser, track the counter, pump frames.
async fn handle_client(state: Arc<ProxyState>, socket: WebSocket) {
    let upstream = match tokio_tungstenite::connect_async(&state.browser_ws_url).await {
        Ok((upstream, _)) => upstream,
        Err(e) => {
            tracing::error!(err = %e, "browser CDP connect failed");
            let (mut tx, _rx) = socket.split();
            pipe::close_client(&mut tx, CLOSE_INTERNAL, "browser unreachable").await;
            return;
        }
    };

    let live = state.tracker.connected();
    tracing::info!(session_id = %state.config.session_id, live, "CDP connection established");
    report::spawn_connections_report(&state.config, live);

    let end = pipe::pump(socket, upstream, state.shutdown.clone()).await;

    let live = state.tracker.disconnected();
    tracing::info!(session_id = %state.config.session_id, live, end = ?end, "CDP connection closed");
    report::spawn_connections_report(&state.config, live);
}
