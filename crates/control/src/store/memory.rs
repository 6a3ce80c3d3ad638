// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory `SessionStore` with per-key conditional writes.
//!
//! The production deployment fronts an external KV table; this implementation
//! keeps the same contract (conditional writes, two secondary indexes, ordered
//! change emission) behind a single `RwLock`, which is what makes the
//! conditional writes linearizable per key.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::{broadcast, RwLock};

use crate::session::{epoch_secs, now_iso8601, InternalStatus, Session, SessionEvent, SessionPatch};
use crate::store::{Page, SessionPage, SessionStore, StateChange, StoreError};

struct Entry {
    session: Session,
    created_epoch: u64,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Entry>,
    /// `project_id -> session ids in creation order`.
    by_project: HashMap<String, Vec<String>>,
    /// `internal_status -> (expires_at, session_id)` ordered by expiry.
    by_status_expiry: HashMap<InternalStatus, BTreeSet<(u64, String)>>,
}

impl Tables {
    fn reindex_status(&mut self, id: &str, from: InternalStatus, to: InternalStatus, expires: u64) {
        if from == to {
            return;
        }
        if let Some(bucket) = self.by_status_expiry.get_mut(&from) {
            bucket.remove(&(expires, id.to_owned()));
        }
        self.by_status_expiry.entry(to).or_default().insert((expires, id.to_owned()));
    }
}

/// In-memory session store.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    change_tx: broadcast::Sender<StateChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self { tables: RwLock::new(Tables::default()), change_tx }
    }

    fn emit(&self, change: StateChange) {
        // No receiver yet is fine; the router subscribes before serving.
        let _ = self.change_tx.send(change);
    }

    /// Insert under the write lock. When `limit` is set, the non-terminal
    /// count and the insert commit under the same guard (invariant I6).
    async fn insert(&self, session: Session, limit: Option<usize>) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.sessions.contains_key(&session.session_id) {
            return Err(StoreError::DuplicateId(session.session_id));
        }

        if let Some(limit) = limit {
            let active = tables
                .by_project
                .get(&session.project_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| tables.sessions.get(id))
                        .filter(|e| !e.session.internal_status.is_terminal())
                        .count()
                })
                .unwrap_or(0);
            if active >= limit {
                return Err(StoreError::CapacityExceeded {
                    project_id: session.project_id.clone(),
                    limit,
                });
            }
        }

        let id = session.session_id.clone();
        tables.by_project.entry(session.project_id.clone()).or_default().push(id.clone());
        tables
            .by_status_expiry
            .entry(session.internal_status)
            .or_default()
            .insert((session.expires_at, id.clone()));

        let change = StateChange { session_id: id.clone(), before: None, after: session.clone() };
        tables.sessions.insert(id, Entry { session, created_epoch: epoch_secs() });
        drop(tables);

        self.emit(change);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a patch to a session in place, returning the previous image.
fn apply_patch(session: &mut Session, patch: SessionPatch) -> Result<Session, StoreError> {
    let before = session.clone();

    if let Some(dst) = patch.internal_status {
        if dst != session.internal_status {
            if !session.internal_status.can_transition_to(dst) {
                return Err(StoreError::IllegalTransition {
                    session_id: session.session_id.clone(),
                    from: session.internal_status,
                    to: dst,
                });
            }
            session.push_event(SessionEvent::StateChange {
                from: session.internal_status.as_str().to_owned(),
                to: dst.as_str().to_owned(),
                at: now_iso8601(),
            });
            session.internal_status = dst;
            session.status = dst.client_status();
        }
    }
    if let Some(status) = patch.status_override {
        session.status = status;
    }
    if let Some(v) = patch.started_at {
        session.started_at = Some(v);
    }
    if let Some(v) = patch.ready_at {
        session.ready_at = Some(v);
    }
    if let Some(v) = patch.terminated_at {
        session.terminated_at = Some(v);
    }
    if let Some(v) = patch.task_id {
        session.task_id = Some(v);
    }
    if let Some(v) = patch.public_address {
        session.public_address = Some(v);
    }
    if let Some(v) = patch.connect_url {
        session.connect_url = Some(v);
    }
    if let Some(v) = patch.failure_reason {
        session.failure_reason = Some(v);
    }
    if let Some(v) = patch.retry_count {
        session.retry_count = v;
    }
    if let Some(event) = patch.event {
        session.push_event(event);
    }
    session.updated_at = now_iso8601();

    Ok(before)
}

#[async_trait::async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        self.insert(session, None).await
    }

    async fn create_capped(&self, session: Session, limit: usize) -> Result<(), StoreError> {
        self.insert(session, Some(limit)).await
    }

    async fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        let tables = self.tables.read().await;
        tables
            .sessions
            .get(session_id)
            .map(|e| e.session.clone())
            .ok_or_else(|| StoreError::NotFound(session_id.to_owned()))
    }

    async fn update_if(
        &self,
        session_id: &str,
        expected: InternalStatus,
        patch: SessionPatch,
    ) -> Result<Session, StoreError> {
        let mut tables = self.tables.write().await;

        let actual = tables
            .sessions
            .get(session_id)
            .map(|e| e.session.internal_status)
            .ok_or_else(|| StoreError::NotFound(session_id.to_owned()))?;
        if actual != expected {
            return Err(StoreError::Conflict {
                session_id: session_id.to_owned(),
                expected,
                actual,
            });
        }

        let target = patch.internal_status;
        let entry = match tables.sessions.get_mut(session_id) {
            Some(e) => e,
            None => return Err(StoreError::NotFound(session_id.to_owned())),
        };
        let before = apply_patch(&mut entry.session, patch)?;
        let after = entry.session.clone();
        let expires = after.expires_at;

        if let Some(dst) = target {
            tables.reindex_status(session_id, expected, dst, expires);
        }
        drop(tables);

        self.emit(StateChange {
            session_id: session_id.to_owned(),
            before: Some(before),
            after: after.clone(),
        });
        Ok(after)
    }

    async fn list_by_project(
        &self,
        project_id: &str,
        page: Page,
    ) -> Result<SessionPage, StoreError> {
        let tables = self.tables.read().await;
        let ids = tables.by_project.get(project_id).cloned().unwrap_or_default();

        // Index is in creation order; lists run newest first.
        let mut newest_first: Vec<&String> = ids.iter().rev().collect();
        if let Some(ref cursor) = page.cursor {
            if let Some(pos) = newest_first.iter().position(|id| *id == cursor) {
                newest_first = newest_first.split_off(pos + 1);
            } else {
                newest_first.clear();
            }
        }

        let limit = if page.limit == 0 { 50 } else { page.limit };
        let sessions: Vec<Session> = newest_first
            .iter()
            .take(limit)
            .filter_map(|id| tables.sessions.get(*id).map(|e| e.session.clone()))
            .collect();
        let next_cursor = if newest_first.len() > limit {
            sessions.last().map(|s| s.session_id.clone())
        } else {
            None
        };

        Ok(SessionPage { sessions, next_cursor })
    }

    async fn scan_expired(
        &self,
        now_epoch: u64,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        let tables = self.tables.read().await;
        let mut out = Vec::new();
        for (status, bucket) in &tables.by_status_expiry {
            if status.is_terminal() {
                continue;
            }
            for (expires, id) in bucket {
                if *expires >= now_epoch || out.len() >= limit {
                    break;
                }
                if let Some(entry) = tables.sessions.get(id) {
                    out.push(entry.session.clone());
                }
            }
        }
        Ok(out)
    }

    async fn scan_stuck(
        &self,
        older_than_epoch: u64,
        limit: usize,
    ) -> Result<Vec<Session>, StoreError> {
        let tables = self.tables.read().await;
        let mut out = Vec::new();
        for status in [InternalStatus::Creating, InternalStatus::Provisioning] {
            let Some(bucket) = tables.by_status_expiry.get(&status) else { continue };
            for (_, id) in bucket {
                if out.len() >= limit {
                    break;
                }
                if let Some(entry) = tables.sessions.get(id) {
                    if entry.created_epoch < older_than_epoch {
                        out.push(entry.session.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn count_active(&self, project_id: &str) -> Result<usize, StoreError> {
        let tables = self.tables.read().await;
        let count = tables
            .by_project
            .get(project_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.sessions.get(id))
                    .filter(|e| !e.session.internal_status.is_terminal())
                    .count()
            })
            .unwrap_or(0);
        Ok(count)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
