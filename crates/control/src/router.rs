// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event router: normalizes container-lifecycle events and store change
//! records into session transitions and readiness notifications.
//!
//! Lifecycle events arrive on `{prefix}.task.>` (and from the local process
//! platform's synthesized stream); change records come off the store's
//! change stream. Delivery is at-least-once on both paths, so transitions are
//! deduped by `(session_id, after_status)` with a short-lived seen-set.

use std::sync::Arc;

use futures_util::StreamExt;
use indexmap::IndexMap;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::broker::{ReadinessBroker, ReadyEvent, ReadyKind};
use crate::platform::{LifecycleEvent, LifecyclePhase};
use crate::session::{now_iso8601, InternalStatus, SessionEvent, SessionPatch};
use crate::store::{SessionStore, StateChange, StoreError};

/// Bounded insertion-ordered dedup set; oldest entries are evicted first.
struct SeenSet {
    map: IndexMap<(String, InternalStatus), ()>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self { map: IndexMap::with_capacity(capacity), capacity }
    }

    /// Record the key; returns false if it was already present.
    fn insert(&mut self, session_id: &str, status: InternalStatus) -> bool {
        let key = (session_id.to_owned(), status);
        if self.map.contains_key(&key) {
            return false;
        }
        self.map.insert(key, ());
        while self.map.len() > self.capacity {
            self.map.shift_remove_index(0);
        }
        true
    }
}

/// Routes external events into store transitions and broker publishes.
pub struct EventRouter {
    store: Arc<dyn SessionStore>,
    broker: Arc<ReadinessBroker>,
    seen: Mutex<SeenSet>,
}

impl EventRouter {
    pub fn new(store: Arc<dyn SessionStore>, broker: Arc<ReadinessBroker>) -> Self {
        Self { store, broker, seen: Mutex::new(SeenSet::new(1024)) }
    }

    /// Apply one lifecycle event to the session record.
    pub async fn handle_lifecycle(&self, event: LifecycleEvent) {
        let session_id = event.session_id.clone();
        tracing::debug!(
            session_id = %session_id,
            task_id = %event.task_id,
            phase = ?event.phase,
            "lifecycle event"
        );

        let result = match event.phase {
            LifecyclePhase::Provisioning => self.apply_provisioning(&event).await,
            LifecyclePhase::Running => self.apply_running(&event).await,
            LifecyclePhase::Stopped => self.apply_stopped(&event).await,
        };

        match result {
            Ok(()) => {}
            // Conflicts here are duplicate or late events; the record already
            // moved on.
            Err(StoreError::Conflict { .. }) | Err(StoreError::IllegalTransition { .. }) => {
                tracing::debug!(session_id = %session_id, phase = ?event.phase, "stale lifecycle event ignored");
            }
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(session_id = %session_id, task_id = %event.task_id, "lifecycle event for unknown session");
            }
            Err(e) => {
                tracing::error!(session_id = %session_id, err = %e, "lifecycle transition failed");
            }
        }
    }

    async fn apply_provisioning(&self, event: &LifecycleEvent) -> Result<(), StoreError> {
        let patch = SessionPatch::transition(InternalStatus::Provisioning)
            .with_event(lifecycle_audit(event));
        let patch = SessionPatch { started_at: Some(now_iso8601()), ..patch };
        self.store.update_if(&event.session_id, InternalStatus::Creating, patch).await?;
        Ok(())
    }

    async fn apply_running(&self, event: &LifecycleEvent) -> Result<(), StoreError> {
        // RUNNING doubles as the pending signal when the platform never sent
        // an explicit PROVISIONING phase.
        let current = self.store.get(&event.session_id).await?;
        if current.internal_status == InternalStatus::Creating {
            let patch = SessionPatch::transition(InternalStatus::Provisioning);
            let patch = SessionPatch { started_at: Some(now_iso8601()), ..patch };
            self.store.update_if(&event.session_id, InternalStatus::Creating, patch).await?;
        }

        let Some(ref address) = event.public_address else {
            tracing::warn!(session_id = %event.session_id, "RUNNING event without public address");
            return Ok(());
        };

        let session = self.store.get(&event.session_id).await?;
        let connect_url = session
            .signing_key
            .as_deref()
            .map(|token| format!("wss://{address}/cdp?token={token}"));

        let patch = SessionPatch {
            task_id: Some(event.task_id.clone()),
            public_address: Some(address.clone()),
            connect_url,
            event: Some(lifecycle_audit(event)),
            ..SessionPatch::default()
        };
        self.store.update_if(&event.session_id, InternalStatus::Provisioning, patch).await?;
        Ok(())
    }

    async fn apply_stopped(&self, event: &LifecycleEvent) -> Result<(), StoreError> {
        let session = self.store.get(&event.session_id).await?;
        let current = session.internal_status;

        if current.is_terminal() {
            return Ok(());
        }

        let clean_exit = matches!(event.exit_code, None | Some(0));
        match current {
            InternalStatus::Terminating => {
                let patch = SessionPatch::transition(InternalStatus::Stopped);
                let patch = SessionPatch {
                    terminated_at: Some(now_iso8601()),
                    event: Some(lifecycle_audit(event)),
                    ..patch
                };
                self.store.update_if(&event.session_id, current, patch).await?;
            }
            InternalStatus::Ready | InternalStatus::Active if clean_exit => {
                // Idle self-termination: fold through TERMINATING so the
                // transition table holds.
                self.store
                    .update_if(
                        &event.session_id,
                        current,
                        SessionPatch::transition(InternalStatus::Terminating)
                            .with_event(lifecycle_audit(event)),
                    )
                    .await?;
                let patch = SessionPatch::transition(InternalStatus::Stopped);
                let patch =
                    SessionPatch { terminated_at: Some(now_iso8601()), ..patch };
                self.store
                    .update_if(&event.session_id, InternalStatus::Terminating, patch)
                    .await?;
            }
            _ => {
                let reason = event
                    .reason
                    .clone()
                    .or_else(|| event.exit_code.map(|c| format!("container_exit_{c}")))
                    .unwrap_or_else(|| "container_stopped".to_owned());
                let patch = SessionPatch::transition(InternalStatus::Failed)
                    .with_failure_reason(reason)
                    .with_event(lifecycle_audit(event));
                let patch =
                    SessionPatch { terminated_at: Some(now_iso8601()), ..patch };
                self.store.update_if(&event.session_id, current, patch).await?;
            }
        }
        Ok(())
    }

    /// Apply one store change record: publish readiness notifications for
    /// `* -> READY` and failure notifications for `* -> FAILED`.
    pub async fn handle_change(&self, change: StateChange) {
        let after = change.after.internal_status;
        let kind = match after {
            InternalStatus::Ready => ReadyKind::Ready,
            InternalStatus::Failed => ReadyKind::Failed,
            _ => return,
        };

        // At-least-once delivery upstream: drop duplicates.
        if !self.seen.lock().await.insert(&change.session_id, after) {
            tracing::debug!(session_id = %change.session_id, status = %after, "duplicate change record dropped");
            return;
        }

        tracing::info!(session_id = %change.session_id, status = %after, "publishing readiness notification");
        self.broker
            .publish(&change.session_id, ReadyEvent { kind, snapshot: change.after })
            .await;
    }
}

fn lifecycle_audit(event: &LifecycleEvent) -> SessionEvent {
    SessionEvent::Lifecycle {
        phase: format!("{:?}", event.phase).to_uppercase(),
        reason: event.reason.clone(),
        at: now_iso8601(),
    }
}

/// Spawn the router's consumption loops: the merged lifecycle channel and the
/// store change stream.
pub fn spawn_router(
    router: Arc<EventRouter>,
    mut lifecycle_rx: mpsc::Receiver<LifecycleEvent>,
    shutdown: CancellationToken,
) {
    let mut changes = router.store.subscribe_changes();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                event = lifecycle_rx.recv() => {
                    match event {
                        Some(event) => router.handle_lifecycle(event).await,
                        None => break,
                    }
                }

                change = changes.recv() => {
                    match change {
                        Ok(change) => router.handle_change(change).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // The reconciler closes any gap a lagged change
                            // stream leaves behind.
                            tracing::warn!(skipped = n, "change stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
}

/// Spawn the NATS lifecycle subscriber, forwarding platform events into the
/// router's lifecycle channel.
pub fn spawn_lifecycle_subscriber(
    client: async_nats::Client,
    prefix: String,
    lifecycle_tx: mpsc::Sender<LifecycleEvent>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let subject = format!("{prefix}.task.>");
        let mut sub = match client.subscribe(subject.clone()).await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::error!(subject, err = %e, "lifecycle subscribe failed");
                return;
            }
        };
        tracing::info!(subject, "lifecycle subscriber connected");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = sub.next() => {
                    let Some(msg) = msg else { break };
                    match serde_json::from_slice::<LifecycleEvent>(&msg.payload) {
                        Ok(event) => {
                            if lifecycle_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(subject = %msg.subject, err = %e, "invalid lifecycle payload");
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
