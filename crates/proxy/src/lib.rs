// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Aviary CDP auth proxy: per-container WebSocket listener in front of the
//! browser's DevTools endpoint.
//!
//! Validates session-scoped bearer tokens, pipes CDP frames both ways, tracks
//! live connections, and self-terminates the container after the idle grace.

pub mod config;
pub mod pipe;
pub mod report;
pub mod server;
pub mod watchdog;

use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use aviary::token::{LocalSecretStore, TokenService};

use crate::config::ProxyConfig;
use crate::server::{build_router, ProxyState};
use crate::watchdog::ConnectionTracker;

/// Run the proxy until idle shutdown or external cancellation.
pub async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    if config.session_id.is_empty() {
        anyhow::bail!("SESSION_ID must be set");
    }

    let started_at = Instant::now();
    let shutdown = CancellationToken::new();

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(session_id = %config.session_id, "CDP auth proxy listening on {addr}");

    // The browser owns loopback; wait for it before accepting traffic.
    let browser_ws_url = report::discover_browser_ws(config.browser_port, &shutdown).await?;

    let tokens = Arc::new(TokenService::new(
        Arc::new(LocalSecretStore),
        config.token_signing_key_ref.clone(),
        config.token_key_refresh(),
    ));
    let tracker = Arc::new(ConnectionTracker::new());

    report::spawn_ready_report(&config, shutdown.clone());
    watchdog::spawn_watchdog(
        config.clone(),
        Arc::clone(&tracker),
        started_at,
        shutdown.clone(),
    );

    let state = Arc::new(ProxyState {
        config,
        tokens,
        tracker: Arc::clone(&tracker),
        browser_ws_url,
        started_at,
        shutdown: shutdown.clone(),
    });

    let router = build_router(Arc::clone(&state));
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    // Final audit line before the clean exit the platform reports as STOPPED.
    tracing::info!(
        session_id = %state.config.session_id,
        uptime_secs = started_at.elapsed().as_secs(),
        total_connections = tracker.total_accepted(),
        auth_failures = tracker.auth_failures(),
        "proxy shut down"
    );
    Ok(())
}
