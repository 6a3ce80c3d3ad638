// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session record, status pair, and the canonical transition table.
//!
//! `InternalStatus` is the authoritative lifecycle label; `Status` is the
//! client-visible projection. Both are written atomically through the store's
//! conditional writes, so readers never observe a torn pair.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Client-visible session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Running,
    Completed,
    Error,
    TimedOut,
}

/// Authoritative internal lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalStatus {
    Creating,
    Provisioning,
    Ready,
    Active,
    Terminating,
    Stopped,
    Failed,
}

impl InternalStatus {
    /// Terminal states are sinks: no further transition is permitted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether `self -> dst` is a legal transition.
    pub fn can_transition_to(self, dst: Self) -> bool {
        use InternalStatus::*;
        match (self, dst) {
            (Creating, Provisioning) => true,
            (Provisioning, Ready) => true,
            (Ready, Active) => true,
            (Active, Ready) => true,
            (Ready | Active, Terminating) => true,
            (Terminating, Stopped) => true,
            (src, Failed) => !src.is_terminal(),
            _ => false,
        }
    }

    /// Project this internal status onto the client-visible `Status`.
    ///
    /// TTL expiry overrides the mapping for terminal records (`TIMED_OUT`
    /// instead of `ERROR`/`COMPLETED`); callers pass that explicitly via the
    /// session patch rather than through this mapping.
    pub fn client_status(self) -> Status {
        match self {
            Self::Creating | Self::Provisioning | Self::Ready | Self::Active => Status::Running,
            Self::Terminating | Self::Stopped => Status::Completed,
            Self::Failed => Status::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Provisioning => "PROVISIONING",
            Self::Ready => "READY",
            Self::Active => "ACTIVE",
            Self::Terminating => "TERMINATING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for InternalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of audit envelopes retained per session.
pub const EVENT_HISTORY_LIMIT: usize = 32;

/// Hard cap on serialized `user_metadata` size.
pub const USER_METADATA_MAX_BYTES: usize = 4096;

/// Typed audit envelope appended to a session's bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A container-lifecycle phase was observed for this session's task.
    Lifecycle { phase: String, reason: Option<String>, at: String },
    /// The status pair changed.
    StateChange { from: String, to: String, at: String },
    /// A client-facing action (create, release) was accepted.
    Request { action: String, at: String },
}

/// The primary session entity.
///
/// Timestamps are flat ISO-8601 UTC strings; `expires_at` stays numeric
/// (Unix seconds) because it drives the TTL index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub project_id: String,
    pub api_key_id: String,

    pub status: Status,
    pub internal_status: InternalStatus,

    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<String>,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<String>,
    pub expires_at: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    pub region: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_key: Option<String>,

    pub keep_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default)]
    pub user_metadata: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub event_history: Vec<SessionEvent>,
    #[serde(default)]
    pub retry_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Session {
    /// Whether connection material may be exposed to clients yet.
    pub fn connect_info_visible(&self) -> bool {
        matches!(self.internal_status, InternalStatus::Ready | InternalStatus::Active)
    }

    /// Append an audit envelope, keeping only the most recent
    /// [`EVENT_HISTORY_LIMIT`] entries.
    pub fn push_event(&mut self, event: SessionEvent) {
        self.event_history.push(event);
        if self.event_history.len() > EVENT_HISTORY_LIMIT {
            let excess = self.event_history.len() - EVENT_HISTORY_LIMIT;
            self.event_history.drain(..excess);
        }
    }
}

/// Partial update applied through `SessionStore::update_if`.
///
/// `internal_status` is the transition target; the client-visible `status` is
/// derived from it unless `status_override` pins it (TTL expiry writes
/// `TIMED_OUT` this way).
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub internal_status: Option<InternalStatus>,
    pub status_override: Option<Status>,
    pub started_at: Option<String>,
    pub ready_at: Option<String>,
    pub terminated_at: Option<String>,
    pub task_id: Option<String>,
    pub public_address: Option<String>,
    pub connect_url: Option<String>,
    pub failure_reason: Option<String>,
    pub event: Option<SessionEvent>,
    pub retry_count: Option<u32>,
}

impl SessionPatch {
    /// Patch that only moves the status pair.
    pub fn transition(dst: InternalStatus) -> Self {
        Self { internal_status: Some(dst), ..Self::default() }
    }

    pub fn with_event(mut self, event: SessionEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}

// -- Time helpers -------------------------------------------------------------

/// Return current epoch seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Return the current UTC time as an ISO 8601 string (e.g. "2026-02-14T01:23:45Z").
pub fn now_iso8601() -> String {
    iso8601_from_epoch(epoch_secs())
}

/// Convert epoch seconds to an ISO 8601 UTC string.
pub fn iso8601_from_epoch(secs: u64) -> String {
    let time_secs = secs % 86400;
    let hours = time_secs / 3600;
    let minutes = (time_secs % 3600) / 60;
    let seconds = time_secs % 60;
    // Civil calendar from days since epoch (Howard Hinnant's algorithm).
    let days = secs / 86400;
    let z = days as i64 + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}

#[cfg(test)]
#[path = "session_tests.rs"]
pub(crate) mod tests;
