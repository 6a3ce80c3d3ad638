// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Container-facing internal routes, authenticated with the session's own
//! bearer token.
//!
//! The proxy inside each container reports chrome-ready and connection counts
//! here; the store write happens in the control plane so the change stream
//! remains the single wake-up path for blocked create handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::session::{now_iso8601, InternalStatus, SessionPatch};
use crate::state::AppState;
use crate::store::StoreError;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyRequest {
    /// Fallback address when the RUNNING lifecycle event has not landed yet.
    #[serde(default)]
    pub public_address: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsRequest {
    pub live: u32,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// `POST /internal/sessions/{id}/ready` — container self-report of
/// chrome-ready. Requires the RUNNING address to be recorded (or supplied);
/// returns 409 while the record is still CREATING so the proxy retries.
pub async fn session_ready(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ReadyRequest>>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return ApiError::Auth.to_http_response("missing bearer token").into_response();
    };
    if let Err(e) = s.tokens.verify(token, &id).await {
        return ApiError::Auth.to_http_response(e.to_string()).into_response();
    }

    let session = match s.store.get(&id).await {
        Ok(session) => session,
        Err(StoreError::NotFound(_)) => {
            return ApiError::NotFound.to_http_response("session not found").into_response()
        }
        Err(e) => return ApiError::Transient.to_http_response(e.to_string()).into_response(),
    };

    match session.internal_status {
        // Idempotent re-report.
        InternalStatus::Ready | InternalStatus::Active => {
            return Json(AckResponse { ok: true }).into_response()
        }
        InternalStatus::Provisioning => {}
        other => {
            return ApiError::Conflict
                .to_http_response(format!("session is {other}; not ready-eligible"))
                .into_response();
        }
    }

    // READY requires a reachable address (I3 gates connect info on it).
    let provided = body.and_then(|Json(b)| b.public_address);
    let address = session.public_address.clone().or(provided.clone());
    let Some(address) = address else {
        return ApiError::Conflict
            .to_http_response("no public address recorded yet")
            .into_response();
    };

    let connect_url = session
        .signing_key
        .as_deref()
        .map(|tok| format!("wss://{address}/cdp?token={tok}"));
    let patch = SessionPatch {
        internal_status: Some(InternalStatus::Ready),
        ready_at: Some(now_iso8601()),
        public_address: provided,
        connect_url: if session.connect_url.is_none() { connect_url } else { None },
        ..SessionPatch::default()
    };

    match s.store.update_if(&id, InternalStatus::Provisioning, patch).await {
        Ok(_) => {
            tracing::info!(session_id = %id, "session reported ready");
            Json(AckResponse { ok: true }).into_response()
        }
        Err(StoreError::Conflict { actual, .. }) => {
            // Raced with another writer; READY/ACTIVE means someone else won.
            if matches!(actual, InternalStatus::Ready | InternalStatus::Active) {
                Json(AckResponse { ok: true }).into_response()
            } else {
                ApiError::Conflict
                    .to_http_response(format!("session moved to {actual}"))
                    .into_response()
            }
        }
        Err(e) => ApiError::Transient.to_http_response(e.to_string()).into_response(),
    }
}

/// `POST /internal/sessions/{id}/connections` — live CDP connection count.
///
/// First connection drives `READY -> ACTIVE`; dropping to zero drives
/// `ACTIVE -> READY` when `keep_alive` is set (otherwise the idle watchdog
/// terminates the container and the STOPPED event closes the session).
pub async fn session_connections(
    State(s): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ConnectionsRequest>,
) -> impl IntoResponse {
    let Some(token) = bearer_token(&headers) else {
        return ApiError::Auth.to_http_response("missing bearer token").into_response();
    };
    if let Err(e) = s.tokens.verify(token, &id).await {
        return ApiError::Auth.to_http_response(e.to_string()).into_response();
    }

    let session = match s.store.get(&id).await {
        Ok(session) => session,
        Err(StoreError::NotFound(_)) => {
            return ApiError::NotFound.to_http_response("session not found").into_response()
        }
        Err(e) => return ApiError::Transient.to_http_response(e.to_string()).into_response(),
    };

    let result = match (session.internal_status, req.live) {
        (InternalStatus::Ready, live) if live > 0 => {
            s.store
                .update_if(&id, InternalStatus::Ready, SessionPatch::transition(InternalStatus::Active))
                .await
                .map(|_| ())
        }
        (InternalStatus::Active, 0) if session.keep_alive => {
            s.store
                .update_if(&id, InternalStatus::Active, SessionPatch::transition(InternalStatus::Ready))
                .await
                .map(|_| ())
        }
        // Everything else is a no-op: repeated reports, terminal sessions,
        // or zero-drop without keep_alive (the watchdog owns that path).
        _ => Ok(()),
    };

    match result {
        Ok(()) => Json(AckResponse { ok: true }).into_response(),
        Err(StoreError::Conflict { .. }) => Json(AckResponse { ok: true }).into_response(),
        Err(e) => ApiError::Transient.to_http_response(e.to_string()).into_response(),
    }
}
