// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed session storage with conditional writes and a change stream.
//!
//! Every successful write is observable downstream as a before/after image,
//! ordered per session. The event router consumes the change stream; no other
//! component may cache mutable session records across awaits.

pub mod memory;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::backoff_delay;
use crate::session::{InternalStatus, Session, SessionPatch};

/// Storage errors. Conditional-write losers surface as `Conflict` so callers
/// can re-read and decide whether the intended transition is still reachable.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// `update_if` precondition violated.
    Conflict { session_id: String, expected: InternalStatus, actual: InternalStatus },
    /// The requested transition is not in the legal table.
    IllegalTransition { session_id: String, from: InternalStatus, to: InternalStatus },
    /// Unique-key collision on create.
    DuplicateId(String),
    /// The project is at its non-terminal session cap.
    CapacityExceeded { project_id: String, limit: usize },
    NotFound(String),
    /// Upstream store throttling or delivery trouble; retryable.
    Transient(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { session_id, expected, actual } => {
                write!(f, "conflict on {session_id}: expected {expected}, found {actual}")
            }
            Self::IllegalTransition { session_id, from, to } => {
                write!(f, "illegal transition on {session_id}: {from} -> {to}")
            }
            Self::DuplicateId(id) => write!(f, "duplicate session id {id}"),
            Self::CapacityExceeded { project_id, limit } => {
                write!(f, "project {project_id} is at its session limit ({limit})")
            }
            Self::NotFound(id) => write!(f, "session {id} not found"),
            Self::Transient(msg) => write!(f, "transient store error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Bounded retry budget for transient store failures.
pub const TRANSIENT_RETRY_ATTEMPTS: u32 = 3;

const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(2);

/// Run a store operation, retrying `Transient` failures with jittered
/// exponential backoff up to the bounded budget. Every other error returns
/// immediately.
pub async fn retry_transient<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(StoreError::Transient(msg)) => {
                attempt += 1;
                if attempt >= TRANSIENT_RETRY_ATTEMPTS {
                    return Err(StoreError::Transient(msg));
                }
                tracing::debug!(attempt, err = %msg, "transient store error, retrying");
                tokio::time::sleep(backoff_delay(attempt - 1, RETRY_BASE, RETRY_MAX)).await;
            }
            other => return other,
        }
    }
}

/// Before/after image emitted on every successful write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub session_id: String,
    /// `None` for the initial create.
    pub before: Option<Session>,
    pub after: Session,
}

/// Pagination input for list operations.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub limit: usize,
    /// Session id of the last record from the previous page.
    pub cursor: Option<String>,
}

/// One page of list results, newest first.
#[derive(Debug, Clone)]
pub struct SessionPage {
    pub sessions: Vec<Session>,
    pub next_cursor: Option<String>,
}

/// Typed CRUD and conditional writes over the session table.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new record; fails with [`StoreError::DuplicateId`] on collision.
    async fn create(&self, session: Session) -> Result<(), StoreError>;

    /// Insert a new record, rejecting with [`StoreError::CapacityExceeded`]
    /// when the project already holds `limit` non-terminal sessions. The
    /// count and the insert commit under one guard, so concurrent creates
    /// cannot both slip under the cap.
    async fn create_capped(&self, session: Session, limit: usize) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Session, StoreError>;

    /// Conditional update: applies `patch` only while `internal_status`
    /// equals `expected`. A transition target must be legal per the table.
    async fn update_if(
        &self,
        session_id: &str,
        expected: InternalStatus,
        patch: SessionPatch,
    ) -> Result<Session, StoreError>;

    /// Sessions owned by `project_id`, newest first (the
    /// `project_id x created_at` index).
    async fn list_by_project(&self, project_id: &str, page: Page)
        -> Result<SessionPage, StoreError>;

    /// Non-terminal sessions whose `expires_at` has passed (the
    /// `status x expires_at` index).
    async fn scan_expired(&self, now_epoch: u64, limit: usize)
        -> Result<Vec<Session>, StoreError>;

    /// CREATING/PROVISIONING records created before `older_than_epoch`.
    async fn scan_stuck(
        &self,
        older_than_epoch: u64,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError>;

    /// Count of non-terminal sessions for a project.
    async fn count_active(&self, project_id: &str) -> Result<usize, StoreError>;

    /// Subscribe to the per-session-ordered change stream.
    fn subscribe_changes(&self) -> broadcast::Receiver<StateChange>;
}
