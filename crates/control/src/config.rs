// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

/// Configuration for the aviary control plane.
#[derive(Debug, Clone, clap::Args)]
pub struct Config {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "AVIARY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "AVIARY_PORT")]
    pub port: u16,

    /// Region label stamped onto session records.
    #[arg(long, default_value = "local", env = "AVIARY_REGION")]
    pub region: String,

    /// Path to the project/API-key registry JSON file.
    #[arg(long, env = "AVIARY_PROJECT_REGISTRY")]
    pub project_registry: Option<std::path::PathBuf>,

    /// NATS server URL for cross-instance fan-out and lifecycle events.
    /// If unset, the broker runs instance-local only.
    #[arg(long, env = "AVIARY_NATS_URL")]
    pub nats_url: Option<String>,

    /// NATS auth token.
    #[arg(long, env = "AVIARY_NATS_TOKEN")]
    pub nats_token: Option<String>,

    /// NATS subject prefix.
    #[arg(long, default_value = "aviary", env = "AVIARY_NATS_PREFIX")]
    pub nats_prefix: String,

    /// Upper bound on the synchronous provisioning wait.
    #[arg(long, default_value_t = 45, env = "SESSION_PROVISION_DEADLINE_SECONDS")]
    pub provision_deadline_secs: u64,

    /// Default session timeout when the client omits one.
    #[arg(long, default_value_t = 3600, env = "SESSION_DEFAULT_TIMEOUT_SECONDS")]
    pub default_timeout_secs: u64,

    /// Global cap on the session timeout; per-project caps never exceed this.
    #[arg(long, default_value_t = 21600, env = "SESSION_MAX_TIMEOUT_SECONDS")]
    pub max_timeout_secs: u64,

    /// Reconciler cadence.
    #[arg(long, default_value_t = 300, env = "RECONCILE_INTERVAL_SECONDS")]
    pub reconcile_interval_secs: u64,

    /// Age after which CREATING/PROVISIONING records without a running task
    /// are failed by the reconciler.
    #[arg(long, default_value_t = 600, env = "RECONCILE_STUCK_AFTER_SECONDS")]
    pub stuck_after_secs: u64,

    /// Secret-store handle for the token signing key.
    #[arg(long, default_value = "env:AVIARY_TOKEN_KEY", env = "TOKEN_SIGNING_KEY_REF")]
    pub token_signing_key_ref: String,

    /// Signing-key cache TTL.
    #[arg(long, default_value_t = 600, env = "TOKEN_KEY_REFRESH_SECONDS")]
    pub token_key_refresh_secs: u64,

    /// Port the CDP auth proxy listens on inside each container; used when
    /// composing connect URLs.
    #[arg(long, default_value_t = 9223, env = "CDP_PROXY_PORT")]
    pub cdp_proxy_port: u16,

    /// Launch command template for the local process platform (shell command
    /// via `sh -c`). When unset, the HTTP platform adapter must be configured.
    #[arg(long, env = "AVIARY_LAUNCH")]
    pub launch: Option<String>,

    /// Base URL of the container platform's task-run API.
    #[arg(long, env = "AVIARY_PLATFORM_URL")]
    pub platform_url: Option<String>,

    /// Bearer token for the container platform API.
    #[arg(long, env = "AVIARY_PLATFORM_TOKEN")]
    pub platform_token: Option<String>,

    /// API-key resolution cache TTL.
    #[arg(long, default_value_t = 300, env = "AVIARY_KEY_CACHE_TTL_SECONDS")]
    pub key_cache_ttl_secs: u64,

    /// API-key resolution cache capacity.
    #[arg(long, default_value_t = 1024, env = "AVIARY_KEY_CACHE_CAPACITY")]
    pub key_cache_capacity: usize,
}

impl Config {
    pub fn provision_deadline(&self) -> Duration {
        Duration::from_secs(self.provision_deadline_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn token_key_refresh(&self) -> Duration {
        Duration::from_secs(self.token_key_refresh_secs)
    }

    pub fn key_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.key_cache_ttl_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            region: "local".into(),
            project_registry: None,
            nats_url: None,
            nats_token: None,
            nats_prefix: "aviary".into(),
            provision_deadline_secs: 45,
            default_timeout_secs: 3600,
            max_timeout_secs: 21600,
            reconcile_interval_secs: 300,
            stuck_after_secs: 600,
            token_signing_key_ref: "env:AVIARY_TOKEN_KEY".into(),
            token_key_refresh_secs: 600,
            cdp_proxy_port: 9223,
            launch: None,
            platform_url: None,
            platform_token: None,
            key_cache_ttl_secs: 300,
            key_cache_capacity: 1024,
        }
    }
}
