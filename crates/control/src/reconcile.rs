// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic reconciler: restores the invariants between the session store and
//! the container platform.
//!
//! Three passes per sweep: TTL expiry, orphaned tasks, and stuck provisioning.
//! Every write goes through `update_if`, so the sweeper is idempotent and safe
//! to run concurrently with the hot path.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::platform::ContainerPlatform;
use crate::session::{epoch_secs, now_iso8601, InternalStatus, SessionPatch, Status};
use crate::store::{SessionStore, StoreError};

/// Maximum records touched per pass per sweep.
const SWEEP_LIMIT: usize = 256;

/// One reconciler instance per control plane process.
pub struct Reconciler {
    config: Config,
    store: Arc<dyn SessionStore>,
    platform: Arc<dyn ContainerPlatform>,
}

impl Reconciler {
    pub fn new(
        config: Config,
        store: Arc<dyn SessionStore>,
        platform: Arc<dyn ContainerPlatform>,
    ) -> Self {
        Self { config, store, platform }
    }

    /// Run one full sweep: TTL, orphans, stuck provisioning.
    pub async fn sweep(&self) {
        self.sweep_expired().await;
        self.sweep_orphan_tasks().await;
        self.sweep_stuck_provisioning().await;
    }

    /// Pass 1: non-terminal records past `expires_at` become FAILED/TIMED_OUT
    /// and their task is stopped best-effort.
    async fn sweep_expired(&self) {
        let now = epoch_secs();
        let expired = match self.store.scan_expired(now, SWEEP_LIMIT).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(err = %e, "TTL scan failed");
                return;
            }
        };

        for session in expired {
            let patch = SessionPatch {
                internal_status: Some(InternalStatus::Failed),
                status_override: Some(Status::TimedOut),
                terminated_at: Some(now_iso8601()),
                failure_reason: Some("ttl_expired".into()),
                ..SessionPatch::default()
            };
            match self
                .store
                .update_if(&session.session_id, session.internal_status, patch)
                .await
            {
                Ok(_) => {
                    tracing::info!(session_id = %session.session_id, "session expired by TTL");
                    if let Some(ref task_id) = session.task_id {
                        self.stop_task(task_id, "ttl_expired").await;
                    }
                }
                // Lost the conditional write: the hot path moved the record.
                Err(StoreError::Conflict { .. }) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session.session_id, err = %e, "TTL transition failed");
                }
            }
        }
    }

    /// Pass 2: running tasks whose session is missing or terminal are stopped
    /// with reason `orphan`.
    async fn sweep_orphan_tasks(&self) {
        let tasks = match self.platform.list_tasks().await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(err = %e, "task listing failed");
                return;
            }
        };

        for task in tasks {
            let Some(ref session_id) = task.session_id else {
                // Untagged tasks are not ours to manage.
                continue;
            };

            let orphaned = match self.store.get(session_id).await {
                Ok(session) => session.internal_status.is_terminal(),
                Err(StoreError::NotFound(_)) => true,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, err = %e, "orphan check read failed");
                    false
                }
            };

            if orphaned {
                tracing::warn!(
                    task_id = %task.task_id,
                    session_id = %session_id,
                    "stopping orphaned task"
                );
                self.stop_task(&task.task_id, "orphan").await;
            }
        }
    }

    /// Pass 3: CREATING/PROVISIONING records older than the stuck threshold
    /// without a matching running task become FAILED.
    async fn sweep_stuck_provisioning(&self) {
        let cutoff = epoch_secs().saturating_sub(self.config.stuck_after_secs);
        let stuck = match self.store.scan_stuck(cutoff, SWEEP_LIMIT).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(err = %e, "stuck scan failed");
                return;
            }
        };
        if stuck.is_empty() {
            return;
        }

        let running: HashSet<String> = match self.platform.list_tasks().await {
            Ok(tasks) => tasks.into_iter().filter_map(|t| t.session_id).collect(),
            Err(e) => {
                // Without the listing we cannot tell stuck from slow; skip.
                tracing::warn!(err = %e, "task listing failed, skipping stuck pass");
                return;
            }
        };

        for session in stuck {
            if running.contains(&session.session_id) {
                continue;
            }
            let patch = SessionPatch {
                internal_status: Some(InternalStatus::Failed),
                terminated_at: Some(now_iso8601()),
                failure_reason: Some("stuck_provisioning".into()),
                ..SessionPatch::default()
            };
            match self
                .store
                .update_if(&session.session_id, session.internal_status, patch)
                .await
            {
                Ok(_) => {
                    tracing::warn!(session_id = %session.session_id, "failed stuck provisioning record");
                }
                Err(StoreError::Conflict { .. }) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session.session_id, err = %e, "stuck transition failed");
                }
            }
        }
    }

    async fn stop_task(&self, task_id: &str, reason: &str) {
        if let Err(e) = self.platform.stop_task(task_id, reason).await {
            tracing::warn!(task_id, reason, err = %e, "best-effort task stop failed");
        }
    }
}

/// Spawn the reconciler loop: one sweep at startup, then on a fixed cadence.
pub fn spawn_reconciler(reconciler: Arc<Reconciler>, shutdown: CancellationToken) {
    let interval = reconciler.config.reconcile_interval();

    tokio::spawn(async move {
        reconciler.sweep().await;

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; the startup sweep covered it.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            reconciler.sweep().await;
        }
    });
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
