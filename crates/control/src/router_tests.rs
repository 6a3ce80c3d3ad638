// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::session::{epoch_secs, Session, Status};
use crate::store::memory::MemoryStore;

fn lifecycle(session_id: &str, phase: LifecyclePhase) -> LifecycleEvent {
    LifecycleEvent {
        task_id: "task_1".into(),
        session_id: session_id.to_owned(),
        phase,
        reason: None,
        public_address: None,
        exit_code: None,
    }
}

fn creating_session(id: &str) -> Session {
    Session {
        session_id: id.to_owned(),
        project_id: "p1".into(),
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
        signing_key: Some("tok123".into()),
        keep_alive: false,
        context_id: None,
        user_metadata: serde_json::Map::new(),
        event_history: Vec::new(),
        retry_count: 0,
        failure_reason: None,
    }
}

async fn setup() -> (Arc<MemoryStore>, Arc<ReadinessBroker>, EventRouter) {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(ReadinessBroker::new(None, "test"));
    let router =
        EventRouter::new(Arc::clone(&store) as Arc<dyn SessionStore>, Arc::clone(&broker));
    (store, broker, router)
}

#[tokio::test]
async fn provisioning_phase_advances_creating() -> anyhow::Result<()> {
    let (store, _, router) = setup().await;
    store.create(creating_session("s1")).await?;

    router.handle_lifecycle(lifecycle("s1", LifecyclePhase::Provisioning)).await;

    let session = store.get("s1").await?;
    assert_eq!(session.internal_status, InternalStatus::Provisioning);
    assert!(session.started_at.is_some());
    Ok(())
}

#[tokio::test]
async fn running_phase_records_address_and_connect_url() -> anyhow::Result<()> {
    let (store, _, router) = setup().await;
    store.create(creating_session("s1")).await?;

    let mut event = lifecycle("s1", LifecyclePhase::Running);
    event.public_address = Some("10.1.2.3:9223".into());
    router.handle_lifecycle(event).await;

    let session = store.get("s1").await?;
    assert_eq!(session.internal_status, InternalStatus::Provisioning);
    assert_eq!(session.public_address.as_deref(), Some("10.1.2.3:9223"));
    assert_eq!(
        session.connect_url.as_deref(),
        Some("wss://10.1.2.3:9223/cdp?token=tok123")
    );
    assert_eq!(session.task_id.as_deref(), Some("task_1"));
    Ok(())
}

#[tokio::test]
async fn duplicate_lifecycle_events_are_ignored() -> anyhow::Result<()> {
    let (store, _, router) = setup().await;
    store.create(creating_session("s1")).await?;

    router.handle_lifecycle(lifecycle("s1", LifecyclePhase::Provisioning)).await;
    // Same phase again: conflict, swallowed.
    router.handle_lifecycle(lifecycle("s1", LifecyclePhase::Provisioning)).await;

    let session = store.get("s1").await?;
    assert_eq!(session.internal_status, InternalStatus::Provisioning);
    Ok(())
}

#[tokio::test]
async fn stopped_with_nonzero_exit_fails_session() -> anyhow::Result<()> {
    let (store, _, router) = setup().await;
    store.create(creating_session("s1")).await?;
    router.handle_lifecycle(lifecycle("s1", LifecyclePhase::Provisioning)).await;

    let mut event = lifecycle("s1", LifecyclePhase::Stopped);
    event.exit_code = Some(137);
    event.reason = Some("container_exit_137".into());
    router.handle_lifecycle(event).await;

    let session = store.get("s1").await?;
    assert_eq!(session.internal_status, InternalStatus::Failed);
    assert_eq!(session.status, Status::Error);
    assert_eq!(session.failure_reason.as_deref(), Some("container_exit_137"));
    assert!(session.terminated_at.is_some());
    Ok(())
}

#[tokio::test]
async fn clean_stop_from_ready_folds_through_terminating() -> anyhow::Result<()> {
    let (store, _, router) = setup().await;
    let mut session = creating_session("s1");
    session.internal_status = InternalStatus::Ready;
    store.create(session).await?;

    let mut event = lifecycle("s1", LifecyclePhase::Stopped);
    event.exit_code = Some(0);
    router.handle_lifecycle(event).await;

    let session = store.get("s1").await?;
    assert_eq!(session.internal_status, InternalStatus::Stopped);
    assert_eq!(session.status, Status::Completed);
    Ok(())
}

#[tokio::test]
async fn stopped_on_terminal_session_is_a_noop() -> anyhow::Result<()> {
    let (store, _, router) = setup().await;
    let mut session = creating_session("s1");
    session.internal_status = InternalStatus::Failed;
    session.status = Status::Error;
    store.create(session).await?;

    router.handle_lifecycle(lifecycle("s1", LifecyclePhase::Stopped)).await;

    let session = store.get("s1").await?;
    assert_eq!(session.internal_status, InternalStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn ready_change_wakes_waiter() -> anyhow::Result<()> {
    let (store, broker, router) = setup().await;
    let mut session = creating_session("s1");
    session.internal_status = InternalStatus::Ready;

    let mut waiter = broker.subscribe("s1").await;
    router
        .handle_change(StateChange {
            session_id: "s1".into(),
            before: None,
            after: session,
        })
        .await;

    let event = waiter.wait().await.ok_or_else(|| anyhow::anyhow!("waiter starved"))?;
    assert_eq!(event.kind, crate::broker::ReadyKind::Ready);
    let _ = store;
    Ok(())
}

#[tokio::test]
async fn failed_change_wakes_waiter_with_failed_kind() -> anyhow::Result<()> {
    let (_, broker, router) = setup().await;
    let mut session = creating_session("s1");
    session.internal_status = InternalStatus::Failed;

    let mut waiter = broker.subscribe("s1").await;
    router
        .handle_change(StateChange { session_id: "s1".into(), before: None, after: session })
        .await;

    let event = waiter.wait().await.ok_or_else(|| anyhow::anyhow!("waiter starved"))?;
    assert_eq!(event.kind, crate::broker::ReadyKind::Failed);
    Ok(())
}

#[tokio::test]
async fn duplicate_ready_changes_publish_once() -> anyhow::Result<()> {
    let (_, broker, router) = setup().await;
    let mut session = creating_session("s1");
    session.internal_status = InternalStatus::Ready;

    let change = StateChange { session_id: "s1".into(), before: None, after: session };
    router.handle_change(change.clone()).await;

    // Re-delivered change record (at-least-once upstream).
    let mut waiter = broker.subscribe("s1").await;
    router.handle_change(change).await;

    let res = tokio::time::timeout(Duration::from_millis(50), waiter.wait()).await;
    assert!(res.is_err(), "duplicate change must not publish again");
    Ok(())
}

#[tokio::test]
async fn intermediate_changes_publish_nothing() -> anyhow::Result<()> {
    let (_, broker, router) = setup().await;
    for status in [InternalStatus::Provisioning, InternalStatus::Terminating, InternalStatus::Stopped] {
        let mut session = creating_session("s1");
        session.internal_status = status;
        let mut waiter = broker.subscribe("s1").await;
        router
            .handle_change(StateChange {
                session_id: "s1".into(),
                before: None,
                after: session,
            })
            .await;
        let res = tokio::time::timeout(Duration::from_millis(20), waiter.wait()).await;
        assert!(res.is_err(), "{status} change must not wake waiters");
        broker.unsubscribe("s1", waiter.token).await;
    }
    Ok(())
}

#[test]
fn seen_set_evicts_oldest() {
    let mut seen = SeenSet::new(2);
    assert!(seen.insert("a", InternalStatus::Ready));
    assert!(seen.insert("b", InternalStatus::Ready));
    assert!(!seen.insert("a", InternalStatus::Ready));

    // Inserting a third key evicts "a".
    assert!(seen.insert("c", InternalStatus::Ready));
    assert!(seen.insert("a", InternalStatus::Ready));
}
