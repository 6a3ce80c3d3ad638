// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Readiness broker: wakes blocked create handlers when their session
//! becomes READY or FAILED.
//!
//! Waiters are single-shot and keyed by session id. Local delivery is a keyed
//! channel map; cross-instance delivery rides a NATS subject per deployment,
//! filtered in-process by session id. Subscribers that might have arrived
//! after a publish must poll the store once before blocking; the coordinator's
//! poll-then-wait step covers that race.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::session::Session;

/// Outcome kinds delivered to a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadyKind {
    Ready,
    Failed,
    Timeout,
}

/// Event delivered to a blocked create handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyEvent {
    pub kind: ReadyKind,
    pub snapshot: Session,
}

struct WaiterSlot {
    token: u64,
    tx: mpsc::Sender<ReadyEvent>,
}

/// Handle returned by [`ReadinessBroker::subscribe`].
pub struct Waiter {
    pub token: u64,
    rx: mpsc::Receiver<ReadyEvent>,
}

impl Waiter {
    /// Block until the single event arrives or the broker drops the slot.
    pub async fn wait(&mut self) -> Option<ReadyEvent> {
        self.rx.recv().await
    }
}

/// Wire payload for cross-instance readiness fan-out.
#[derive(Debug, Serialize, Deserialize)]
struct FanoutPayload {
    session_id: String,
    event: ReadyEvent,
}

/// In-process pub/sub keyed by session id, bridged across instances via NATS.
pub struct ReadinessBroker {
    waiters: Mutex<HashMap<String, Vec<WaiterSlot>>>,
    next_token: AtomicU64,
    nats: Option<async_nats::Client>,
    prefix: String,
}

impl ReadinessBroker {
    pub fn new(nats: Option<async_nats::Client>, prefix: impl Into<String>) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            nats,
            prefix: prefix.into(),
        }
    }

    fn subject(&self) -> String {
        format!("{}.events.session", self.prefix)
    }

    /// Allocate a single-shot waiter for `session_id`.
    pub async fn subscribe(&self, session_id: &str) -> Waiter {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        self.waiters
            .lock()
            .await
            .entry(session_id.to_owned())
            .or_default()
            .push(WaiterSlot { token, tx });
        Waiter { token, rx }
    }

    /// Drop a waiter. Idempotent: unknown tokens are ignored.
    pub async fn unsubscribe(&self, session_id: &str, token: u64) {
        let mut waiters = self.waiters.lock().await;
        if let Some(slots) = waiters.get_mut(session_id) {
            slots.retain(|s| s.token != token);
            if slots.is_empty() {
                waiters.remove(session_id);
            }
        }
    }

    /// Deliver to every active local subscriber and to peers via NATS.
    pub async fn publish(&self, session_id: &str, event: ReadyEvent) {
        self.publish_local(session_id, &event).await;

        if let Some(ref client) = self.nats {
            let payload =
                FanoutPayload { session_id: session_id.to_owned(), event };
            if let Ok(json) = serde_json::to_vec(&payload) {
                if let Err(e) = client.publish(self.subject(), json.into()).await {
                    tracing::warn!(session_id, err = %e, "readiness fan-out publish failed");
                }
            }
        }
    }

    /// Wake local waiters only. Waiters are single-shot: the slots are drained
    /// so a second publish for the same session finds nobody.
    async fn publish_local(&self, session_id: &str, event: &ReadyEvent) {
        let slots = self.waiters.lock().await.remove(session_id).unwrap_or_default();
        for slot in slots {
            // A full (capacity-1) or closed channel means the waiter already
            // got its event or gave up; both are fine to drop.
            let _ = slot.tx.try_send(event.clone());
        }
    }

    /// Number of live waiters for a session (test and metrics hook).
    pub async fn waiter_count(&self, session_id: &str) -> usize {
        self.waiters.lock().await.get(session_id).map(Vec::len).unwrap_or(0)
    }
}

/// Spawn the cross-instance fan-out listener.
///
/// Every instance subscribes to the deployment-wide subject and filters by its
/// own waiter keys; the publishing instance already drained its local waiters,
/// so echoes are no-ops.
pub fn spawn_fanout_listener(broker: Arc<ReadinessBroker>, shutdown: CancellationToken) {
    let Some(client) = broker.nats.clone() else { return };
    let subject = broker.subject();

    tokio::spawn(async move {
        let mut sub = match client.subscribe(subject.clone()).await {
            Ok(sub) => sub,
            Err(e) => {
                tracing::error!(subject, err = %e, "readiness fan-out subscribe failed");
                return;
            }
        };
        tracing::info!(subject, "readiness fan-out listener connected");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = sub.next() => {
                    let Some(msg) = msg else { break };
                    match serde_json::from_slice::<FanoutPayload>(&msg.payload) {
                        Ok(payload) => {
                            broker.publish_local(&payload.session_id, &payload.event).await;
                        }
                        Err(e) => {
                            tracing::debug!(err = %e, "invalid readiness fan-out payload");
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
