// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Seam to the container platform's task-run API.
//!
//! The platform itself is an external collaborator; this module defines the
//! typed surface the coordinator and reconciler depend on, an HTTP adapter for
//! the hosted platform, and a local process launcher for development and
//! tests.

pub mod http;
pub mod process;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Container-lifecycle phases reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecyclePhase {
    Provisioning,
    Running,
    Stopped,
}

/// Normalized lifecycle event. `session_id` comes from the `session_id` tag
/// stamped onto the task at launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub task_id: String,
    pub session_id: String,
    pub phase: LifecyclePhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Everything the platform needs to start one browser container.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub session_id: String,
    pub project_id: String,
    /// Bearer token the container's proxy will verify connections against.
    pub token: String,
    pub keep_alive: bool,
    /// Extra environment for the container, filtered against reserved keys.
    pub env: HashMap<String, String>,
}

/// Platform handle for a launched task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub task_id: String,
}

/// A task visible in the platform's running-task listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningTask {
    pub task_id: String,
    /// `session_id` tag, when present.
    pub session_id: Option<String>,
}

/// Typed client for the container platform.
#[async_trait::async_trait]
pub trait ContainerPlatform: Send + Sync {
    /// Launch a container; the task must be tagged with the session id so the
    /// event router can correlate lifecycle events.
    async fn run_task(&self, spec: TaskSpec) -> anyhow::Result<TaskHandle>;

    /// Best-effort stop. Stopping an already-dead task is not an error.
    async fn stop_task(&self, task_id: &str, reason: &str) -> anyhow::Result<()>;

    /// All currently running tasks with their session tags.
    async fn list_tasks(&self) -> anyhow::Result<Vec<RunningTask>>;
}

/// Environment keys owned by the orchestrator; template-supplied env may not
/// override them.
pub const RESERVED_ENV_KEYS: &[&str] = &[
    "SESSION_ID",
    "SESSION_TOKEN",
    "PROJECT_ID",
    "SESSION_KEEP_ALIVE",
    "SESSION_IDLE_GRACE_SECONDS",
    "SESSION_MIN_LIFETIME_SECONDS",
    "CONTROL_URL",
    "CDP_PROXY_PORT",
    "BROWSER_CDP_PORT",
    "TOKEN_SIGNING_KEY_REF",
];

/// Filter reserved keys out of a user/template-supplied env map.
pub fn filter_env(env: HashMap<String, String>) -> HashMap<String, String> {
    env.into_iter().filter(|(k, _)| !RESERVED_ENV_KEYS.iter().any(|r| k == *r)).collect()
}
