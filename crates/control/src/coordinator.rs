// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Provisioning coordinator: turns the asynchronous container lifecycle into
//! one blocking create call.
//!
//! Ordering discipline: the readiness waiter is subscribed *before* the task
//! launches, and the store is polled once *after* subscribing, so a READY that
//! lands on either side of the subscription is never missed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::sleep_until;

use crate::admission::{Admission, Resolution};
use crate::broker::{ReadinessBroker, ReadyKind};
use crate::config::Config;
use crate::error::{ApiError, CoreError};
use crate::platform::{filter_env, ContainerPlatform, TaskSpec};
use crate::session::{
    epoch_secs, now_iso8601, InternalStatus, Session, SessionEvent, SessionPatch, Status,
};
use crate::store::{retry_transient, SessionStore, StoreError};
use crate::token::{Claims, TokenService};

/// Attempts at reserving a fresh session id before giving up.
const ID_RESERVE_ATTEMPTS: u32 = 3;

/// Normalized create-session input (admission has already validated it).
#[derive(Debug, Clone, Default)]
pub struct CreateSessionInput {
    /// Target project; defaults to the key's primary project.
    pub project_id: Option<String>,
    pub timeout_secs: Option<u64>,
    pub keep_alive: bool,
    pub context_id: Option<String>,
    pub user_metadata: serde_json::Map<String, serde_json::Value>,
    /// Extra container env; reserved keys are stripped.
    pub env: HashMap<String, String>,
}

/// Orchestrates session creation end to end.
pub struct Coordinator {
    config: Config,
    store: Arc<dyn SessionStore>,
    broker: Arc<ReadinessBroker>,
    platform: Arc<dyn ContainerPlatform>,
    tokens: Arc<TokenService>,
    admission: Arc<Admission>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        store: Arc<dyn SessionStore>,
        broker: Arc<ReadinessBroker>,
        platform: Arc<dyn ContainerPlatform>,
        tokens: Arc<TokenService>,
        admission: Arc<Admission>,
    ) -> Self {
        Self { config, store, broker, platform, tokens, admission }
    }

    /// Create a session and block until it is READY, failed, or timed out.
    ///
    /// `caller_deadline` is the request context's deadline, if any; the
    /// effective wait is the earlier of it and the provisioning deadline.
    pub async fn create_session(
        &self,
        resolution: &Resolution,
        input: CreateSessionInput,
        caller_deadline: Option<Instant>,
    ) -> Result<Session, CoreError> {
        // 1. Admit.
        let project_id =
            input.project_id.clone().unwrap_or_else(|| resolution.project_id.clone());
        if !resolution.allows(&project_id) {
            return Err(CoreError::new(
                ApiError::Forbidden,
                format!("API key may not access project {project_id}"),
            ));
        }
        let project = self.admission.active_project(&project_id)?.clone();
        self.admission.check_concurrency(&project).await?;
        self.admission.validate_metadata(&input.user_metadata)?;

        let timeout_secs = self.admission.clamp_timeout(&project, input.timeout_secs);
        let expires_at = epoch_secs() + timeout_secs;

        // 2+3. Issue token and reserve the record; retry with a fresh id on
        // unique-key collision. The token binds the session id, so it is
        // re-minted per attempt. The reserve re-checks the cap under the
        // store's guard, so concurrent creates cannot both slip under it.
        let (session_id, token) = self
            .reserve(resolution, &input, &project_id, expires_at, project.concurrency)
            .await?;

        // 4. Subscribe before launch so a fast container cannot signal READY
        // into the void.
        let mut waiter = self.broker.subscribe(&session_id).await;
        let waiter_token = waiter.token;

        // 5. Launch.
        let launch = self
            .platform
            .run_task(TaskSpec {
                session_id: session_id.clone(),
                project_id: project_id.clone(),
                token: token.clone(),
                keep_alive: input.keep_alive,
                env: self.task_env(&session_id, &project_id, &token, &input),
            })
            .await;

        let task_id = match launch {
            Ok(handle) => handle.task_id,
            Err(e) => {
                tracing::error!(session_id = %session_id, err = %e, "task launch failed");
                self.fail_session(&session_id, "launch_error", None).await;
                self.broker.unsubscribe(&session_id, waiter_token).await;
                return Err(CoreError::new(
                    ApiError::ProvisioningFailed,
                    format!("container launch failed: {e}"),
                ));
            }
        };
        self.record_task_id(&session_id, &task_id).await;

        // 6. Poll once, then wait.
        let deadline = {
            let provision = Instant::now() + self.config.provision_deadline();
            match caller_deadline {
                Some(caller) => provision.min(caller),
                None => provision,
            }
        };

        let result = self.wait_for_outcome(&session_id, &task_id, &mut waiter, deadline).await;

        // 8. Always unsubscribe.
        self.broker.unsubscribe(&session_id, waiter_token).await;
        result
    }

    async fn reserve(
        &self,
        resolution: &Resolution,
        input: &CreateSessionInput,
        project_id: &str,
        expires_at: u64,
        concurrency: usize,
    ) -> Result<(String, String), CoreError> {
        let mut attempt = 0;
        loop {
            let session_id = format!("sess_{}", uuid::Uuid::new_v4().simple());
            let token = self
                .tokens
                .issue_with_claims(Claims {
                    sid: session_id.clone(),
                    pid: project_id.to_owned(),
                    nbf: epoch_secs(),
                    exp: expires_at,
                })
                .await
                .map_err(|e| CoreError::transient(format!("token issue failed: {e}")))?;

            let now = now_iso8601();
            let session = Session {
                session_id: session_id.clone(),
                project_id: project_id.to_owned(),
                api_key_id: resolution.api_key_id.clone(),
                status: Status::Running,
                internal_status: InternalStatus::Creating,
                created_at: now.clone(),
                started_at: None,
                ready_at: None,
                updated_at: now.clone(),
                terminated_at: None,
                expires_at,
                task_id: None,
                public_address: None,
                region: self.config.region.clone(),
                connect_url: None,
                signing_key: Some(token.clone()),
                keep_alive: input.keep_alive,
                context_id: input.context_id.clone(),
                user_metadata: input.user_metadata.clone(),
                event_history: vec![SessionEvent::Request { action: "create".into(), at: now }],
                retry_count: attempt,
                failure_reason: None,
            };

            let created =
                retry_transient(|| self.store.create_capped(session.clone(), concurrency)).await;
            match created {
                Ok(()) => return Ok((session_id, token)),
                Err(StoreError::DuplicateId(_)) => {
                    attempt += 1;
                    if attempt >= ID_RESERVE_ATTEMPTS {
                        return Err(CoreError::new(
                            ApiError::Fatal,
                            "session id collisions exhausted retries",
                        ));
                    }
                }
                Err(e @ StoreError::CapacityExceeded { .. }) => {
                    return Err(CoreError::new(ApiError::ConcurrencyExceeded, e.to_string()))
                }
                // Retry budget exhausted.
                Err(StoreError::Transient(msg)) => return Err(CoreError::transient(msg)),
                Err(e) => return Err(CoreError::new(ApiError::Fatal, e.to_string())),
            }
        }
    }

    fn task_env(
        &self,
        session_id: &str,
        project_id: &str,
        token: &str,
        input: &CreateSessionInput,
    ) -> HashMap<String, String> {
        let mut env = filter_env(input.env.clone());
        env.insert("SESSION_ID".into(), session_id.to_owned());
        env.insert("SESSION_TOKEN".into(), token.to_owned());
        env.insert("PROJECT_ID".into(), project_id.to_owned());
        env.insert("SESSION_KEEP_ALIVE".into(), input.keep_alive.to_string());
        env.insert(
            "CONTROL_URL".into(),
            format!("http://{}:{}", self.config.host, self.config.port),
        );
        env.insert("TOKEN_SIGNING_KEY_REF".into(), self.config.token_signing_key_ref.clone());
        env.insert("CDP_PROXY_PORT".into(), self.config.cdp_proxy_port.to_string());
        env
    }

    /// Best-effort stamp of the platform handle onto the record. The RUNNING
    /// lifecycle event writes it too; losing this race is fine.
    async fn record_task_id(&self, session_id: &str, task_id: &str) {
        let patch =
            SessionPatch { task_id: Some(task_id.to_owned()), ..SessionPatch::default() };
        for expected in [InternalStatus::Creating, InternalStatus::Provisioning] {
            match self.store.update_if(session_id, expected, patch.clone()).await {
                Ok(_) => return,
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => {
                    tracing::debug!(session_id, err = %e, "task id stamp skipped");
                    return;
                }
            }
        }
    }

    async fn wait_for_outcome(
        &self,
        session_id: &str,
        task_id: &str,
        waiter: &mut crate::broker::Waiter,
        deadline: Instant,
    ) -> Result<Session, CoreError> {
        // Short-circuit: the container may have raced ahead of the
        // subscription; one store read covers it.
        let current = self
            .store
            .get(session_id)
            .await
            .map_err(|e| CoreError::new(ApiError::Fatal, e.to_string()))?;
        match current.internal_status {
            InternalStatus::Ready | InternalStatus::Active => return Ok(current),
            InternalStatus::Failed => {
                return Err(self.provisioning_failed(&current));
            }
            _ => {}
        }

        let outcome = tokio::select! {
            event = waiter.wait() => event,
            _ = sleep_until(deadline.into()) => None,
        };

        match outcome {
            Some(event) if event.kind == ReadyKind::Ready => {
                // Return the freshest image; ACTIVE can follow READY quickly.
                self.store
                    .get(session_id)
                    .await
                    .map_err(|e| CoreError::new(ApiError::Fatal, e.to_string()))
            }
            Some(event) => {
                self.stop_task_best_effort(task_id, "provisioning_failed").await;
                Err(self.provisioning_failed(&event.snapshot))
            }
            None => self.handle_timeout(session_id, task_id).await,
        }
    }

    /// 7c. Deadline elapsed: mark the record FAILED/TIMED_OUT and stop the
    /// task. A READY that slips in concurrently wins instead.
    async fn handle_timeout(
        &self,
        session_id: &str,
        task_id: &str,
    ) -> Result<Session, CoreError> {
        let current = self
            .store
            .get(session_id)
            .await
            .map_err(|e| CoreError::new(ApiError::Fatal, e.to_string()))?;

        match current.internal_status {
            InternalStatus::Ready | InternalStatus::Active => return Ok(current),
            status if status.is_terminal() => return Err(self.provisioning_failed(&current)),
            _ => {}
        }

        let patch = SessionPatch {
            internal_status: Some(InternalStatus::Failed),
            status_override: Some(Status::TimedOut),
            terminated_at: Some(now_iso8601()),
            failure_reason: Some("provisioning_timeout".into()),
            ..SessionPatch::default()
        };
        match self.store.update_if(session_id, current.internal_status, patch).await {
            Ok(_) | Err(StoreError::Conflict { .. }) => {}
            Err(e) => {
                tracing::error!(session_id, err = %e, "timeout transition failed");
            }
        }

        // The conditional write may have lost to a READY transition.
        if let Ok(fresh) = self.store.get(session_id).await {
            if fresh.connect_info_visible() {
                return Ok(fresh);
            }
        }

        self.stop_task_best_effort(task_id, "provisioning_timeout").await;
        tracing::warn!(session_id, "provisioning timed out");
        Err(CoreError::new(
            ApiError::ProvisioningTimeout,
            format!("session {session_id} did not become ready in time"),
        ))
    }

    fn provisioning_failed(&self, session: &Session) -> CoreError {
        let reason =
            session.failure_reason.clone().unwrap_or_else(|| "provisioning failed".to_owned());
        CoreError::new(ApiError::ProvisioningFailed, reason)
    }

    async fn fail_session(&self, session_id: &str, reason: &str, expected: Option<InternalStatus>) {
        let expected = expected.unwrap_or(InternalStatus::Creating);
        let patch = SessionPatch {
            internal_status: Some(InternalStatus::Failed),
            terminated_at: Some(now_iso8601()),
            failure_reason: Some(reason.to_owned()),
            ..SessionPatch::default()
        };
        if let Err(e) = self.store.update_if(session_id, expected, patch).await {
            tracing::debug!(session_id, err = %e, "fail transition skipped");
        }
    }

    async fn stop_task_best_effort(&self, task_id: &str, reason: &str) {
        if let Err(e) = self.platform.stop_task(task_id, reason).await {
            tracing::warn!(task_id, err = %e, "best-effort task stop failed");
        }
    }

    /// Explicit release: `READY|ACTIVE -> TERMINATING` plus a best-effort task
    /// stop. A first-round conflict (e.g. a READY/ACTIVE flip from a
    /// connection report) is re-read and retried once; a second loss means the
    /// session really left those states.
    pub async fn release_session(&self, session_id: &str) -> Result<Session, CoreError> {
        let mut attempt = 0;
        loop {
            let current =
                retry_transient(|| self.store.get(session_id)).await.map_err(|e| match e {
                    StoreError::NotFound(_) => {
                        CoreError::new(ApiError::NotFound, "session not found")
                    }
                    other => CoreError::new(ApiError::Fatal, other.to_string()),
                })?;

            if current.internal_status.is_terminal() {
                return Ok(current);
            }
            if !matches!(
                current.internal_status,
                InternalStatus::Ready | InternalStatus::Active
            ) {
                return Err(CoreError::conflict(format!(
                    "session is {}; release requires READY or ACTIVE",
                    current.internal_status
                )));
            }

            let patch = SessionPatch::transition(InternalStatus::Terminating).with_event(
                SessionEvent::Request { action: "release".into(), at: now_iso8601() },
            );
            match self.store.update_if(session_id, current.internal_status, patch).await {
                Ok(updated) => {
                    if let Some(ref task_id) = updated.task_id {
                        self.stop_task_best_effort(task_id, "release").await;
                    }
                    return Ok(updated);
                }
                Err(StoreError::Conflict { .. }) if attempt == 0 => {
                    attempt += 1;
                }
                Err(e) => return Err(CoreError::conflict(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
