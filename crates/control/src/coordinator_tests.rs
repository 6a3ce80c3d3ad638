// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::admission::{ApiKeyRecord, ProjectRegistry, RegistryConfig, sha256_hex};
use crate::broker::ReadinessBroker;
use crate::platform::{LifecycleEvent, LifecyclePhase, RunningTask, TaskHandle};
use crate::router::{spawn_router, EventRouter};
use crate::store::memory::MemoryStore;
use crate::token::SecretStore;

struct FixedSecret;

#[async_trait::async_trait]
impl SecretStore for FixedSecret {
    async fn fetch(&self, _key_ref: &str) -> anyhow::Result<Vec<u8>> {
        Ok(b"coordinator-test-key".to_vec())
    }
}

/// Scripted container platform.
enum Script {
    /// Emit PROVISIONING/RUNNING, then mark the session READY after a delay.
    Ready { delay: Duration },
    /// Mark the session READY before `run_task` even returns.
    ReadyBeforeReturn,
    /// Emit STOPPED with a nonzero exit after a delay.
    Crash { delay: Duration, exit_code: i32 },
    /// Never signal anything.
    Hang,
    /// Fail the launch call itself.
    LaunchError,
}

struct MockPlatform {
    script: Script,
    store: Arc<MemoryStore>,
    lifecycle_tx: mpsc::Sender<LifecycleEvent>,
    launches: AtomicU32,
    stopped: Mutex<Vec<(String, String)>>,
}

impl MockPlatform {
    fn event(session_id: &str, phase: LifecyclePhase) -> LifecycleEvent {
        LifecycleEvent {
            task_id: "task_mock".into(),
            session_id: session_id.to_owned(),
            phase,
            reason: None,
            public_address: matches!(phase, LifecyclePhase::Running)
                .then(|| "127.0.0.1:9223".to_owned()),
            exit_code: None,
        }
    }

    /// What the container's ready report does through the internal endpoint.
    async fn mark_ready(store: &MemoryStore, session_id: &str) {
        use crate::store::SessionStore as _;
        let patch = SessionPatch {
            internal_status: Some(InternalStatus::Ready),
            ready_at: Some(now_iso8601()),
            ..SessionPatch::default()
        };
        let _ = store.update_if(session_id, InternalStatus::Provisioning, patch).await;
    }
}

#[async_trait::async_trait]
impl crate::platform::ContainerPlatform for MockPlatform {
    async fn run_task(&self, spec: TaskSpec) -> anyhow::Result<TaskHandle> {
        self.launches.fetch_add(1, Ordering::Relaxed);
        let session_id = spec.session_id.clone();
        let tx = self.lifecycle_tx.clone();

        match self.script {
            Script::LaunchError => anyhow::bail!("no capacity"),
            Script::Hang => {}
            Script::ReadyBeforeReturn => {
                let _ = tx.send(Self::event(&session_id, LifecyclePhase::Provisioning)).await;
                let _ = tx.send(Self::event(&session_id, LifecyclePhase::Running)).await;
                // Wait for the router to drain, then flip READY synchronously.
                for _ in 0..50 {
                    use crate::store::SessionStore as _;
                    if let Ok(s) = self.store.get(&session_id).await {
                        if s.internal_status == InternalStatus::Provisioning
                            && s.public_address.is_some()
                        {
                            break;
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Self::mark_ready(&self.store, &session_id).await;
            }
            Script::Ready { delay } => {
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    let _ = tx.send(Self::event(&session_id, LifecyclePhase::Provisioning)).await;
                    let _ = tx.send(Self::event(&session_id, LifecyclePhase::Running)).await;
                    tokio::time::sleep(delay).await;
                    Self::mark_ready(&store, &session_id).await;
                });
            }
            Script::Crash { delay, exit_code } => {
                tokio::spawn(async move {
                    let _ = tx.send(Self::event(&session_id, LifecyclePhase::Provisioning)).await;
                    tokio::time::sleep(delay).await;
                    let mut stopped = Self::event(&session_id, LifecyclePhase::Stopped);
                    stopped.exit_code = Some(exit_code);
                    stopped.reason = Some(format!("container_exit_{exit_code}"));
                    let _ = tx.send(stopped).await;
                });
            }
        }

        Ok(TaskHandle { task_id: "task_mock".into() })
    }

    async fn stop_task(&self, task_id: &str, reason: &str) -> anyhow::Result<()> {
        self.stopped.lock().await.push((task_id.to_owned(), reason.to_owned()));
        Ok(())
    }

    async fn list_tasks(&self) -> anyhow::Result<Vec<RunningTask>> {
        Ok(vec![])
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    store: Arc<MemoryStore>,
    platform: Arc<MockPlatform>,
    admission: Arc<Admission>,
    _shutdown: CancellationToken,
}

async fn harness(script: Script) -> Harness {
    harness_with_concurrency(script, 10).await
}

async fn harness_with_concurrency(script: Script, concurrency: usize) -> Harness {
    let mut config = Config::default();
    config.provision_deadline_secs = 1;

    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(ReadinessBroker::new(None, "test"));
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(64);

    let shutdown = CancellationToken::new();
    let router = Arc::new(EventRouter::new(
        Arc::clone(&store) as Arc<dyn SessionStore>,
        Arc::clone(&broker),
    ));
    spawn_router(router, lifecycle_rx, shutdown.clone());

    let platform = Arc::new(MockPlatform {
        script,
        store: Arc::clone(&store),
        lifecycle_tx,
        launches: AtomicU32::new(0),
        stopped: Mutex::new(Vec::new()),
    });

    let registry = ProjectRegistry::from_config(RegistryConfig {
        projects: vec![crate::admission::Project {
            project_id: "p1".into(),
            concurrency,
            default_timeout_secs: 600,
            max_timeout_secs: Some(7200),
            status: crate::admission::ProjectStatus::Active,
        }],
        api_keys: vec![ApiKeyRecord {
            api_key_id: "key_1".into(),
            key_hash: sha256_hex("test-api-key"),
            project_id: "p1".into(),
            additional_project_ids: vec![],
        }],
    });
    let admission = Arc::new(Admission::new(
        registry,
        Arc::clone(&store) as Arc<dyn SessionStore>,
        16,
        Duration::from_secs(300),
        3600,
        21600,
    ));

    let tokens = Arc::new(TokenService::new(
        Arc::new(FixedSecret),
        "test:key",
        Duration::from_secs(600),
    ));

    let coordinator = Arc::new(Coordinator::new(
        config,
        Arc::clone(&store) as Arc<dyn SessionStore>,
        broker,
        Arc::clone(&platform) as Arc<dyn ContainerPlatform>,
        tokens,
        Arc::clone(&admission),
    ));

    Harness { coordinator, store, platform, admission, _shutdown: shutdown }
}

async fn resolution(h: &Harness) -> Resolution {
    h.admission.resolve("test-api-key").await.unwrap()
}

#[tokio::test]
async fn happy_path_returns_running_session() -> anyhow::Result<()> {
    let h = harness(Script::Ready { delay: Duration::from_millis(50) }).await;
    let res = resolution(&h).await;

    let session = h
        .coordinator
        .create_session(
            &res,
            CreateSessionInput { timeout_secs: Some(120), ..Default::default() },
            None,
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    assert_eq!(session.status, Status::Running);
    assert_eq!(session.internal_status, InternalStatus::Ready);
    let url = session.connect_url.ok_or_else(|| anyhow::anyhow!("missing connect url"))?;
    assert!(url.starts_with("wss://127.0.0.1:9223/cdp?token="));
    assert_eq!(session.public_address.as_deref(), Some("127.0.0.1:9223"));
    Ok(())
}

#[tokio::test]
async fn ready_before_subscribe_short_circuits() -> anyhow::Result<()> {
    let h = harness(Script::ReadyBeforeReturn).await;
    let res = resolution(&h).await;

    let started = std::time::Instant::now();
    let session = h
        .coordinator
        .create_session(&res, CreateSessionInput::default(), None)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    assert_eq!(session.internal_status, InternalStatus::Ready);
    assert!(
        started.elapsed() < Duration::from_millis(900),
        "poll-then-wait should return without blocking to the deadline"
    );
    Ok(())
}

#[tokio::test]
async fn container_crash_fails_fast() -> anyhow::Result<()> {
    let h = harness(Script::Crash { delay: Duration::from_millis(50), exit_code: 137 }).await;
    let res = resolution(&h).await;

    let started = std::time::Instant::now();
    let err = h
        .coordinator
        .create_session(&res, CreateSessionInput::default(), None)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;

    assert_eq!(err.kind, ApiError::ProvisioningFailed);
    assert!(err.message.contains("container_exit_137"));
    assert!(
        started.elapsed() < Duration::from_millis(900),
        "failure must not wait out the provisioning deadline"
    );
    Ok(())
}

#[tokio::test]
async fn hang_times_out_and_marks_timed_out() -> anyhow::Result<()> {
    let h = harness(Script::Hang).await;
    let res = resolution(&h).await;

    let err = h
        .coordinator
        .create_session(&res, CreateSessionInput::default(), None)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected timeout"))?;
    assert_eq!(err.kind, ApiError::ProvisioningTimeout);

    // The record is terminal with the TIMED_OUT override.
    use crate::store::SessionStore as _;
    let page = h.store.list_by_project("p1", crate::store::Page::default()).await?;
    let session = page.sessions.first().ok_or_else(|| anyhow::anyhow!("no record"))?;
    assert_eq!(session.internal_status, InternalStatus::Failed);
    assert_eq!(session.status, Status::TimedOut);

    // The task was stopped best-effort.
    let stopped = h.platform.stopped.lock().await;
    assert!(stopped.iter().any(|(_, reason)| reason == "provisioning_timeout"));
    Ok(())
}

#[tokio::test]
async fn launch_error_leaves_terminal_record() -> anyhow::Result<()> {
    let h = harness(Script::LaunchError).await;
    let res = resolution(&h).await;

    let err = h
        .coordinator
        .create_session(&res, CreateSessionInput::default(), None)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
    assert_eq!(err.kind, ApiError::ProvisioningFailed);

    use crate::store::SessionStore as _;
    let page = h.store.list_by_project("p1", crate::store::Page::default()).await?;
    let session = page.sessions.first().ok_or_else(|| anyhow::anyhow!("no record"))?;
    assert_eq!(session.internal_status, InternalStatus::Failed);
    assert_eq!(session.failure_reason.as_deref(), Some("launch_error"));
    Ok(())
}

#[tokio::test]
async fn concurrency_cap_rejects_without_side_effects() -> anyhow::Result<()> {
    let h = harness_with_concurrency(Script::Hang, 0).await;
    let res = resolution(&h).await;

    let err = h
        .coordinator
        .create_session(&res, CreateSessionInput::default(), None)
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected rejection"))?;
    assert_eq!(err.kind, ApiError::ConcurrencyExceeded);

    // No record written, no task launched.
    use crate::store::SessionStore as _;
    let page = h.store.list_by_project("p1", crate::store::Page::default()).await?;
    assert!(page.sessions.is_empty());
    assert_eq!(h.platform.launches.load(Ordering::Relaxed), 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_creates_cannot_exceed_cap() -> anyhow::Result<()> {
    let h =
        harness_with_concurrency(Script::Ready { delay: Duration::from_millis(30) }, 1).await;
    let res = resolution(&h).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let coordinator = Arc::clone(&h.coordinator);
        let res = res.clone();
        handles.push(tokio::spawn(async move {
            coordinator.create_session(&res, CreateSessionInput::default(), None).await
        }));
    }

    let mut ok = 0;
    let mut capped = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => ok += 1,
            Err(e) if e.kind == ApiError::ConcurrencyExceeded => capped += 1,
            Err(e) => anyhow::bail!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1, "exactly one create may win the cap");
    assert_eq!(capped, 1);

    // The cap held at every moment: only one record was ever written.
    use crate::store::SessionStore as _;
    let page = h.store.list_by_project("p1", crate::store::Page::default()).await?;
    assert_eq!(page.sessions.len(), 1);
    Ok(())
}

#[tokio::test]
async fn foreign_project_is_forbidden() -> anyhow::Result<()> {
    let h = harness(Script::Hang).await;
    let res = resolution(&h).await;

    let err = h
        .coordinator
        .create_session(
            &res,
            CreateSessionInput { project_id: Some("p-other".into()), ..Default::default() },
            None,
        )
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected rejection"))?;
    assert_eq!(err.kind, ApiError::Forbidden);
    assert_eq!(h.platform.launches.load(Ordering::Relaxed), 0);
    Ok(())
}

#[tokio::test]
async fn session_token_verifies_for_its_own_session() -> anyhow::Result<()> {
    let h = harness(Script::Ready { delay: Duration::from_millis(30) }).await;
    let res = resolution(&h).await;

    let session = h
        .coordinator
        .create_session(&res, CreateSessionInput::default(), None)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let token = session.signing_key.ok_or_else(|| anyhow::anyhow!("missing signing key"))?;
    let tokens = TokenService::new(
        Arc::new(FixedSecret),
        "test:key",
        Duration::from_secs(600),
    );
    let claims = tokens.verify(&token, &session.session_id).await?;
    assert_eq!(claims.pid, "p1");
    assert!(tokens.verify(&token, "sess_other").await.is_err());
    Ok(())
}

#[tokio::test]
async fn release_transitions_and_stops_task() -> anyhow::Result<()> {
    let h = harness(Script::Ready { delay: Duration::from_millis(30) }).await;
    let res = resolution(&h).await;

    let session = h
        .coordinator
        .create_session(&res, CreateSessionInput::default(), None)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let released = h
        .coordinator
        .release_session(&session.session_id)
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(released.internal_status, InternalStatus::Terminating);
    assert_eq!(released.status, Status::Completed);

    let stopped = h.platform.stopped.lock().await;
    assert!(stopped.iter().any(|(_, reason)| reason == "release"));
    Ok(())
}

#[tokio::test]
async fn release_of_unknown_session_is_not_found() {
    let h = harness(Script::Hang).await;
    let err = h.coordinator.release_session("sess_ghost").await.err().map(|e| e.kind);
    assert_eq!(err, Some(ApiError::NotFound));
}
