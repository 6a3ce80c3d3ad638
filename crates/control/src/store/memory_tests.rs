// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::*;
use crate::session::Status;

fn session(id: &str, project: &str) -> Session {
    Session {
        session_id: id.to_owned(),
        project_id: project.to_owned(),
        api_key_id: "key_1".into(),
        status: Status::Running,
        internal_status: InternalStatus::Creating,
        created_at: now_iso8601(),
        started_at: None,
        ready_at: None,
        updated_at: now_iso8601(),
        terminated_at: None,
        expires_at: epoch_secs() + 3600,
        task_id: None,
        public_address: None,
        region: "local".into(),
        connect_url: None,
        signing_key: Some("tok".into()),
        keep_alive: false,
        context_id: None,
        user_metadata: serde_json::Map::new(),
        event_history: Vec::new(),
        retry_count: 0,
        failure_reason: None,
    }
}

#[tokio::test]
async fn create_then_get_round_trips() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.create(session("s1", "p1")).await?;
    let got = store.get("s1").await?;
    assert_eq!(got.session_id, "s1");
    assert_eq!(got.internal_status, InternalStatus::Creating);
    Ok(())
}

#[tokio::test]
async fn create_rejects_duplicate_id() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.create(session("s1", "p1")).await?;
    match store.create(session("s1", "p1")).await {
        Err(StoreError::DuplicateId(id)) => assert_eq!(id, "s1"),
        other => anyhow::bail!("expected DuplicateId, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn update_if_applies_legal_transition() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.create(session("s1", "p1")).await?;

    let updated = store
        .update_if(
            "s1",
            InternalStatus::Creating,
            SessionPatch::transition(InternalStatus::Provisioning),
        )
        .await?;
    assert_eq!(updated.internal_status, InternalStatus::Provisioning);
    assert_eq!(updated.status, Status::Running);
    // The transition was recorded in the audit history.
    assert!(updated
        .event_history
        .iter()
        .any(|e| matches!(e, SessionEvent::StateChange { to, .. } if to == "PROVISIONING")));
    Ok(())
}

#[tokio::test]
async fn update_if_rejects_wrong_expected() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.create(session("s1", "p1")).await?;

    match store
        .update_if(
            "s1",
            InternalStatus::Provisioning,
            SessionPatch::transition(InternalStatus::Ready),
        )
        .await
    {
        Err(StoreError::Conflict { expected, actual, .. }) => {
            assert_eq!(expected, InternalStatus::Provisioning);
            assert_eq!(actual, InternalStatus::Creating);
        }
        other => anyhow::bail!("expected Conflict, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn update_if_rejects_illegal_transition() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.create(session("s1", "p1")).await?;

    match store
        .update_if("s1", InternalStatus::Creating, SessionPatch::transition(InternalStatus::Ready))
        .await
    {
        Err(StoreError::IllegalTransition { from, to, .. }) => {
            assert_eq!(from, InternalStatus::Creating);
            assert_eq!(to, InternalStatus::Ready);
        }
        other => anyhow::bail!("expected IllegalTransition, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn concurrent_conditional_writes_have_one_winner() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.create(session("s1", "p1")).await?;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .update_if(
                    "s1",
                    InternalStatus::Creating,
                    SessionPatch::transition(InternalStatus::Provisioning),
                )
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await?.is_ok() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one conditional write may win");
    Ok(())
}

#[tokio::test]
async fn create_capped_rejects_at_limit() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.create_capped(session("s1", "p1"), 2).await?;
    store.create_capped(session("s2", "p1"), 2).await?;

    match store.create_capped(session("s3", "p1"), 2).await {
        Err(StoreError::CapacityExceeded { project_id, limit }) => {
            assert_eq!(project_id, "p1");
            assert_eq!(limit, 2);
        }
        other => anyhow::bail!("expected CapacityExceeded, got {other:?}"),
    }

    // Other projects have their own budget.
    store.create_capped(session("s4", "p2"), 2).await?;

    // Terminal records free up capacity.
    store
        .update_if("s1", InternalStatus::Creating, SessionPatch::transition(InternalStatus::Failed))
        .await?;
    store.create_capped(session("s5", "p1"), 2).await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_capped_creates_never_exceed_limit() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.create_capped(session(&format!("s{i}"), "p1"), 2).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await? {
            Ok(()) => winners += 1,
            Err(StoreError::CapacityExceeded { .. }) => {}
            Err(e) => anyhow::bail!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 2, "the cap admits exactly `limit` concurrent creates");
    assert_eq!(store.count_active("p1").await?, 2);
    Ok(())
}

#[tokio::test]
async fn retry_transient_retries_then_succeeds() -> anyhow::Result<()> {
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

    let result = crate::store::retry_transient(|| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if n < 2 {
                Err(StoreError::Transient("throttled".into()))
            } else {
                Ok(n)
            }
        }
    })
    .await?;

    assert_eq!(result, 2);
    assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 3);
    Ok(())
}

#[tokio::test]
async fn retry_transient_gives_up_after_budget() -> anyhow::Result<()> {
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

    let result: Result<(), StoreError> = crate::store::retry_transient(|| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Err(StoreError::Transient("still throttled".into()))
        }
    })
    .await;

    assert!(matches!(result, Err(StoreError::Transient(_))));
    assert_eq!(
        calls.load(std::sync::atomic::Ordering::Relaxed),
        crate::store::TRANSIENT_RETRY_ATTEMPTS
    );
    Ok(())
}

#[tokio::test]
async fn retry_transient_does_not_retry_conflicts() -> anyhow::Result<()> {
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));

    let result: Result<(), StoreError> = crate::store::retry_transient(|| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Err(StoreError::Conflict {
                session_id: "s1".into(),
                expected: InternalStatus::Creating,
                actual: InternalStatus::Failed,
            })
        }
    })
    .await;

    assert!(matches!(result, Err(StoreError::Conflict { .. })));
    assert_eq!(calls.load(std::sync::atomic::Ordering::Relaxed), 1);
    Ok(())
}

#[tokio::test]
async fn change_stream_emits_before_and_after() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let mut changes = store.subscribe_changes();

    store.create(session("s1", "p1")).await?;
    let created = changes.recv().await?;
    assert!(created.before.is_none());
    assert_eq!(created.after.internal_status, InternalStatus::Creating);

    store
        .update_if(
            "s1",
            InternalStatus::Creating,
            SessionPatch::transition(InternalStatus::Provisioning),
        )
        .await?;
    let updated = changes.recv().await?;
    let before = updated.before.as_ref().ok_or_else(|| anyhow::anyhow!("missing before"))?;
    assert_eq!(before.internal_status, InternalStatus::Creating);
    assert_eq!(updated.after.internal_status, InternalStatus::Provisioning);
    Ok(())
}

#[tokio::test]
async fn list_by_project_newest_first_with_cursor() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    for i in 0..5 {
        store.create(session(&format!("s{i}"), "p1")).await?;
    }
    store.create(session("other", "p2")).await?;

    let page = store.list_by_project("p1", Page { limit: 2, cursor: None }).await?;
    let ids: Vec<&str> = page.sessions.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["s4", "s3"]);
    let cursor = page.next_cursor.ok_or_else(|| anyhow::anyhow!("expected next cursor"))?;

    let page2 = store.list_by_project("p1", Page { limit: 2, cursor: Some(cursor) }).await?;
    let ids2: Vec<&str> = page2.sessions.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids2, vec!["s2", "s1"]);
    Ok(())
}

#[tokio::test]
async fn scan_expired_returns_only_past_non_terminal() -> anyhow::Result<()> {
    let store = MemoryStore::new();

    let mut expired = session("old", "p1");
    expired.expires_at = epoch_secs() - 100;
    store.create(expired).await?;

    let mut live = session("live", "p1");
    live.expires_at = epoch_secs() + 3600;
    store.create(live).await?;

    let mut finished = session("done", "p1");
    finished.expires_at = epoch_secs() - 100;
    finished.internal_status = InternalStatus::Stopped;
    finished.status = Status::Completed;
    store.create(finished).await?;

    let hits = store.scan_expired(epoch_secs(), 10).await?;
    let ids: Vec<&str> = hits.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["old"]);
    Ok(())
}

#[tokio::test]
async fn count_active_ignores_terminal() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.create(session("s1", "p1")).await?;
    store.create(session("s2", "p1")).await?;

    let mut dead = session("s3", "p1");
    dead.internal_status = InternalStatus::Failed;
    dead.status = Status::Error;
    store.create(dead).await?;

    assert_eq!(store.count_active("p1").await?, 2);
    assert_eq!(store.count_active("p2").await?, 0);
    Ok(())
}

#[tokio::test]
async fn status_reindex_tracks_transitions() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let mut s = session("s1", "p1");
    s.expires_at = epoch_secs() - 10;
    store.create(s).await?;

    // Still visible to the TTL scan while CREATING.
    assert_eq!(store.scan_expired(epoch_secs(), 10).await?.len(), 1);

    store
        .update_if(
            "s1",
            InternalStatus::Creating,
            SessionPatch::transition(InternalStatus::Failed),
        )
        .await?;

    // Terminal records drop out of the sweep.
    assert!(store.scan_expired(epoch_secs(), 10).await?.is_empty());
    Ok(())
}
