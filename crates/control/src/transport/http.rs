// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Public HTTP handlers for the session surface.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::coordinator::CreateSessionInput;
use crate::error::ApiError;
use crate::session::{Session, Status};
use crate::state::AppState;
use crate::store::{Page, StoreError};
use crate::transport::auth::AuthContext;

// -- Request/Response types ---------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub project_id: Option<String>,
    /// Requested session timeout in seconds; clamped server-side.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub user_metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    pub sessions: Vec<SessionResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `{status: "REQUEST_RELEASE"}` is the only accepted mutation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateSessionRequest {
    pub status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugResponse {
    pub ws_url: String,
    pub devtools_frontend_url: String,
    pub pages_url: String,
}

/// Client-visible session image.
///
/// `connect_url`/`public_address` are withheld until the session is live, and
/// `signing_key` only appears on owner reads of a single session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub id: String,
    pub project_id: String,
    pub status: Status,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<String>,
    pub expires_at: u64,
    pub region: String,
    pub keep_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub user_metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SessionResponse {
    pub fn from_session(session: &Session, include_signing_key: bool) -> Self {
        let live = session.connect_info_visible();
        Self {
            id: session.session_id.clone(),
            project_id: session.project_id.clone(),
            status: session.status,
            created_at: session.created_at.clone(),
            updated_at: session.updated_at.clone(),
            started_at: session.started_at.clone(),
            ready_at: session.ready_at.clone(),
            terminated_at: session.terminated_at.clone(),
            expires_at: session.expires_at,
            region: session.region.clone(),
            keep_alive: session.keep_alive,
            context_id: session.context_id.clone(),
            user_metadata: session.user_metadata.clone(),
            connect_url: if live { session.connect_url.clone() } else { None },
            signing_key: if include_signing_key { session.signing_key.clone() } else { None },
            public_address: if live { session.public_address.clone() } else { None },
            failure_reason: session.failure_reason.clone(),
        }
    }
}

// -- Handlers -----------------------------------------------------------------

/// `GET /v1/health`
pub async fn health(State(_s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse { status: "running".to_owned() })
}

/// `POST /v1/sessions` — create a session, blocking until READY or failure.
pub async fn create_session(
    State(s): State<Arc<AppState>>,
    Extension(AuthContext(resolution)): Extension<AuthContext>,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> impl IntoResponse {
    // Unknown fields and malformed bodies are validation errors, not 422s.
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return ApiError::Validation.to_http_response(rejection.body_text()).into_response()
        }
    };

    let input = CreateSessionInput {
        project_id: req.project_id,
        timeout_secs: req.timeout,
        keep_alive: req.keep_alive,
        context_id: req.context_id,
        user_metadata: req.user_metadata.unwrap_or_default(),
        env: Default::default(),
    };

    match s.coordinator.create_session(&resolution, input, None).await {
        Ok(session) => {
            tracing::info!(session_id = %session.session_id, project_id = %session.project_id, "session created");
            Json(SessionResponse::from_session(&session, true)).into_response()
        }
        Err(e) => {
            tracing::warn!(project_id = %resolution.project_id, err = %e, "create session failed");
            e.to_http_response().into_response()
        }
    }
}

/// `GET /v1/sessions` — list by project, newest first, paginated.
pub async fn list_sessions(
    State(s): State<Arc<AppState>>,
    Extension(AuthContext(resolution)): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let project_id = query.project_id.unwrap_or_else(|| resolution.project_id.clone());
    if !resolution.allows(&project_id) {
        return ApiError::Forbidden
            .to_http_response("API key may not access this project")
            .into_response();
    }

    let page = Page { limit: query.limit.unwrap_or(50).min(200), cursor: query.cursor };
    match s.store.list_by_project(&project_id, page).await {
        Ok(result) => {
            let sessions = result
                .sessions
                .iter()
                .map(|session| SessionResponse::from_session(session, false))
                .collect();
            Json(SessionListResponse { sessions, next_cursor: result.next_cursor })
                .into_response()
        }
        Err(e) => ApiError::Transient.to_http_response(e.to_string()).into_response(),
    }
}

/// `GET /v1/sessions/{id}` — fetch one session; `signing_key` only for the
/// owning project's key.
pub async fn get_session(
    State(s): State<Arc<AppState>>,
    Extension(AuthContext(resolution)): Extension<AuthContext>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let session = match s.store.get(&id).await {
        Ok(session) => session,
        Err(StoreError::NotFound(_)) => {
            return ApiError::NotFound.to_http_response("session not found").into_response()
        }
        Err(e) => return ApiError::Transient.to_http_response(e.to_string()).into_response(),
    };

    if !resolution.allows(&session.project_id) {
        return ApiError::Forbidden
            .to_http_response("session belongs to another project")
            .into_response();
    }

    Json(SessionResponse::from_session(&session, true)).into_response()
}

/// `POST /v1/sessions/{id}` — the only supported change is
/// `{status: "REQUEST_RELEASE"}`.
pub async fn update_session(
    State(s): State<Arc<AppState>>,
    Extension(AuthContext(resolution)): Extension<AuthContext>,
    Path(id): Path<String>,
    body: Result<Json<UpdateSessionRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return ApiError::Validation.to_http_response(rejection.body_text()).into_response()
        }
    };

    if req.status != "REQUEST_RELEASE" {
        return ApiError::Validation
            .to_http_response(format!("unsupported status change: {}", req.status))
            .into_response();
    }

    // Ownership check before any mutation.
    match s.store.get(&id).await {
        Ok(session) if !resolution.allows(&session.project_id) => {
            return ApiError::Forbidden
                .to_http_response("session belongs to another project")
                .into_response();
        }
        Err(StoreError::NotFound(_)) => {
            return ApiError::NotFound.to_http_response("session not found").into_response()
        }
        Err(e) => return ApiError::Transient.to_http_response(e.to_string()).into_response(),
        Ok(_) => {}
    }

    match s.coordinator.release_session(&id).await {
        Ok(session) => {
            tracing::info!(session_id = %id, "release requested");
            Json(SessionResponse::from_session(&session, false)).into_response()
        }
        Err(e) => e.to_http_response().into_response(),
    }
}

/// `GET /v1/sessions/{id}/debug` — auxiliary URLs for live sessions.
pub async fn session_debug(
    State(s): State<Arc<AppState>>,
    Extension(AuthContext(resolution)): Extension<AuthContext>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let session = match s.store.get(&id).await {
        Ok(session) => session,
        Err(StoreError::NotFound(_)) => {
            return ApiError::NotFound.to_http_response("session not found").into_response()
        }
        Err(e) => return ApiError::Transient.to_http_response(e.to_string()).into_response(),
    };

    if !resolution.allows(&session.project_id) {
        return ApiError::Forbidden
            .to_http_response("session belongs to another project")
            .into_response();
    }

    let (Some(address), Some(connect_url)) =
        (session.public_address.as_deref(), session.connect_url.as_deref())
    else {
        return ApiError::NotFound
            .to_http_response("session has no live debug endpoints")
            .into_response();
    };
    if !session.connect_info_visible() {
        return ApiError::NotFound
            .to_http_response("session has no live debug endpoints")
            .into_response();
    }

    Json(DebugResponse {
        ws_url: connect_url.to_owned(),
        devtools_frontend_url: format!(
            "https://{address}/devtools/inspector.html?wss={address}/cdp"
        ),
        pages_url: format!("https://{address}/json/list"),
    })
    .into_response()
}
