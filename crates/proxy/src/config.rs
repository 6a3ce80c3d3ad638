// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Cadence of the idle watchdog.
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(5);

/// Configuration for the per-container CDP auth proxy.
#[derive(Debug, Clone, clap::Args)]
pub struct ProxyConfig {
    /// Port the proxy listens on inside the container.
    #[arg(long, default_value_t = 9223, env = "CDP_PROXY_PORT")]
    pub port: u16,

    /// Loopback port the browser's CDP endpoint listens on.
    #[arg(long, default_value_t = 9222, env = "BROWSER_CDP_PORT")]
    pub browser_port: u16,

    /// Session this container serves; tokens must match it.
    #[arg(long, env = "SESSION_ID")]
    pub session_id: String,

    /// Session keep-alive: suppresses idle self-termination.
    #[arg(long, default_value_t = false, env = "SESSION_KEEP_ALIVE")]
    pub keep_alive: bool,

    /// Continuous zero-connection span before self-termination.
    #[arg(long, default_value_t = 60, env = "SESSION_IDLE_GRACE_SECONDS")]
    pub idle_grace_secs: u64,

    /// Minimum uptime before the watchdog may terminate.
    #[arg(long, default_value_t = 30, env = "SESSION_MIN_LIFETIME_SECONDS")]
    pub min_lifetime_secs: u64,

    /// Control-plane base URL for readiness/connection reports.
    #[arg(long, env = "CONTROL_URL")]
    pub control_url: Option<String>,

    /// This session's own bearer token, used for control-plane reports.
    #[arg(long, env = "SESSION_TOKEN")]
    pub session_token: Option<String>,

    /// Secret-store handle for the token verification key.
    #[arg(long, default_value = "env:AVIARY_TOKEN_KEY", env = "TOKEN_SIGNING_KEY_REF")]
    pub token_signing_key_ref: String,

    /// Verification-key cache TTL.
    #[arg(long, default_value_t = 600, env = "TOKEN_KEY_REFRESH_SECONDS")]
    pub token_key_refresh_secs: u64,
}

impl ProxyConfig {
    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.idle_grace_secs)
    }

    pub fn min_lifetime(&self) -> Duration {
        Duration::from_secs(self.min_lifetime_secs)
    }

    pub fn token_key_refresh(&self) -> Duration {
        Duration::from_secs(self.token_key_refresh_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 9223,
            browser_port: 9222,
            session_id: String::new(),
            keep_alive: false,
            idle_grace_secs: 60,
            min_lifetime_secs: 30,
            control_url: None,
            session_token: None,
            token_signing_key_ref: "env:AVIARY_TOKEN_KEY".into(),
            token_key_refresh_secs: 600,
        }
    }
}
