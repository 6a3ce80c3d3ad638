// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Aviary control plane: session orchestration for remote browser containers.
//!
//! One synchronous create call reserves a session record, launches a browser
//! container, and blocks until the container's CDP proxy reports ready (or the
//! provisioning deadline passes). After hand-off, clients stream CDP through
//! the per-container auth proxy; this process only tracks state.

pub mod admission;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod platform;
pub mod reconcile;
pub mod router;
pub mod session;
pub mod state;
pub mod store;
pub mod token;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::admission::{Admission, ProjectRegistry, RegistryConfig};
use crate::broker::ReadinessBroker;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::platform::ContainerPlatform;
use crate::reconcile::Reconciler;
use crate::router::EventRouter;
use crate::store::memory::MemoryStore;
use crate::store::SessionStore;
use crate::token::{LocalSecretStore, TokenService};
use crate::transport::build_router;

/// Run the control plane until shutdown.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    // External collaborators.
    let nats = match config.nats_url {
        Some(ref url) => {
            let mut opts = async_nats::ConnectOptions::new();
            if let Some(ref token) = config.nats_token {
                opts = opts.token(token.clone());
            }
            opts = opts.retry_on_initial_connect();
            tracing::info!(url = %url, prefix = %config.nats_prefix, "connecting NATS");
            Some(opts.connect(url).await?)
        }
        None => None,
    };

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let broker = Arc::new(ReadinessBroker::new(nats.clone(), config.nats_prefix.clone()));
    broker::spawn_fanout_listener(Arc::clone(&broker), shutdown.clone());

    // Lifecycle events: merged channel fed by NATS and/or the local platform.
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(256);
    if let Some(ref client) = nats {
        router::spawn_lifecycle_subscriber(
            client.clone(),
            config.nats_prefix.clone(),
            lifecycle_tx.clone(),
            shutdown.clone(),
        );
    }

    let platform: Arc<dyn ContainerPlatform> = if let Some(ref url) = config.platform_url {
        Arc::new(platform::http::HttpPlatform::new(
            url.clone(),
            config.platform_token.clone(),
        ))
    } else if let Some(ref launch) = config.launch {
        let public_address = format!("127.0.0.1:{}", config.cdp_proxy_port);
        let process = platform::process::ProcessPlatform::new(
            launch.clone(),
            public_address,
            lifecycle_tx.clone(),
        );
        process.spawn_reaper(shutdown.clone());
        Arc::new(process)
    } else {
        anyhow::bail!("no container platform configured: set AVIARY_PLATFORM_URL or AVIARY_LAUNCH");
    };

    let registry = match config.project_registry {
        Some(ref path) => ProjectRegistry::from_file(path)?,
        None => {
            tracing::warn!("no project registry configured; every API key will be rejected");
            ProjectRegistry::from_config(RegistryConfig::default())
        }
    };
    let admission = Arc::new(Admission::new(
        registry,
        Arc::clone(&store),
        config.key_cache_capacity,
        config.key_cache_ttl(),
        config.default_timeout_secs,
        config.max_timeout_secs,
    ));

    let tokens = Arc::new(TokenService::new(
        Arc::new(LocalSecretStore),
        config.token_signing_key_ref.clone(),
        config.token_key_refresh().min(Duration::from_secs(600)),
    ));

    let router = Arc::new(EventRouter::new(Arc::clone(&store), Arc::clone(&broker)));
    router::spawn_router(router, lifecycle_rx, shutdown.clone());

    let coordinator = Coordinator::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&broker),
        Arc::clone(&platform),
        Arc::clone(&tokens),
        Arc::clone(&admission),
    );

    let reconciler = Arc::new(Reconciler::new(
        config.clone(),
        Arc::clone(&store),
        Arc::clone(&platform),
    ));
    reconcile::spawn_reconciler(reconciler, shutdown.clone());

    let app_state = Arc::new(state::AppState {
        config,
        store,
        broker,
        platform,
        tokens,
        admission,
        coordinator,
        shutdown: shutdown.clone(),
    });

    tracing::info!("aviary control plane listening on {addr}");
    let app = build_router(app_state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
