// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Idle watchdog: terminates the container once no CDP connection has been
//! live for the idle grace period.
//!
//! The proxy is the only writer to the connection counter and the idle clock.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::{ProxyConfig, WATCHDOG_PERIOD};

/// Atomic live-connection counter plus auth-failure metric.
#[derive(Default)]
pub struct ConnectionTracker {
    live: AtomicI64,
    total_accepted: AtomicU64,
    auth_failures: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment on upstream-established.
    pub fn connected(&self) -> i64 {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement on either side closing.
    pub fn disconnected(&self) -> i64 {
        self.live.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn live(&self) -> i64 {
        self.live.load(Ordering::Relaxed)
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failures(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }
}

/// Whether the watchdog should initiate self-termination.
///
/// Requires: keep-alive off, zero live connections for at least `idle_grace`,
/// and uptime past `min_lifetime`.
pub fn should_terminate(
    live: i64,
    idle_for: Option<Duration>,
    uptime: Duration,
    idle_grace: Duration,
    min_lifetime: Duration,
    keep_alive: bool,
) -> bool {
    if keep_alive || live > 0 {
        return false;
    }
    if uptime < min_lifetime {
        return false;
    }
    matches!(idle_for, Some(idle) if idle >= idle_grace)
}

/// Spawn the single watchdog task. On idle expiry it cancels `shutdown`,
/// which closes the listener and lets the process exit cleanly.
pub fn spawn_watchdog(
    config: ProxyConfig,
    tracker: Arc<ConnectionTracker>,
    started_at: Instant,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(WATCHDOG_PERIOD);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut idle_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            let live = tracker.live();
            if live > 0 {
                idle_since = None;
                continue;
            }
            let now = Instant::now();
            let idle_since = *idle_since.get_or_insert(now);

            if should_terminate(
                live,
                Some(now.duration_since(idle_since)),
                started_at.elapsed(),
                config.idle_grace(),
                config.min_lifetime(),
                config.keep_alive,
            ) {
                tracing::info!(
                    session_id = %config.session_id,
                    idle_secs = now.duration_since(idle_since).as_secs(),
                    "idle grace elapsed, shutting down"
                );
                shutdown.cancel();
                break;
            }
        }
    });
}

#[cfg(test)]
#[path = "watchdog_tests.rs"]
mod tests;
