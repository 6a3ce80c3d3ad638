// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Short-lived signed bearer tokens scoped to one session.
//!
//! Wire format is a compact three-part string
//! `base64url(header).base64url(claims).base64url(sig)` with an HMAC-SHA256
//! signature over the first two parts. Tokens are immutable once issued; the
//! signing key is fetched through a [`SecretStore`] handle and cached with a
//! bounded TTL.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::session::epoch_secs;

/// Token verification failures, mapped onto WS close codes by the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Malformed,
    BadSignature,
    Expired,
    NotYetValid,
    SessionMismatch,
    KeyUnavailable,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Malformed => "malformed token",
            Self::BadSignature => "bad signature",
            Self::Expired => "token expired",
            Self::NotYetValid => "token not yet valid",
            Self::SessionMismatch => "token bound to another session",
            Self::KeyUnavailable => "signing key unavailable",
        };
        f.write_str(s)
    }
}

impl std::error::Error for TokenError {}

/// Claims bound into every session token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Session id the token authorizes.
    pub sid: String,
    /// Owning project.
    pub pid: String,
    /// Not-before, epoch seconds.
    pub nbf: u64,
    /// Expiry, epoch seconds.
    pub exp: u64,
}

#[derive(Debug, Serialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

const HEADER: Header = Header { alg: "HS256", typ: "JWT" };

/// Read-only handle to the secret backing store.
///
/// Production uses the platform secret manager; tests and the local stack use
/// the `env:` / `file:` refs below.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn fetch(&self, key_ref: &str) -> anyhow::Result<Vec<u8>>;
}

/// Resolves `env:NAME` and `file:/path` secret refs.
pub struct LocalSecretStore;

#[async_trait::async_trait]
impl SecretStore for LocalSecretStore {
    async fn fetch(&self, key_ref: &str) -> anyhow::Result<Vec<u8>> {
        if let Some(name) = key_ref.strip_prefix("env:") {
            let value = std::env::var(name)
                .map_err(|_| anyhow::anyhow!("secret env var {name} not set"))?;
            return Ok(value.into_bytes());
        }
        if let Some(path) = key_ref.strip_prefix("file:") {
            let bytes = tokio::fs::read(path).await?;
            return Ok(bytes);
        }
        anyhow::bail!("unsupported secret ref: {key_ref}")
    }
}

struct CachedKey {
    key: hmac::Key,
    fetched_at: Instant,
}

/// Issues and verifies session-scoped bearer tokens.
pub struct TokenService {
    secrets: std::sync::Arc<dyn SecretStore>,
    key_ref: String,
    refresh_ttl: Duration,
    cached: Mutex<Option<CachedKey>>,
}

impl TokenService {
    pub fn new(
        secrets: std::sync::Arc<dyn SecretStore>,
        key_ref: impl Into<String>,
        refresh_ttl: Duration,
    ) -> Self {
        Self { secrets, key_ref: key_ref.into(), refresh_ttl, cached: Mutex::new(None) }
    }

    /// Fetch the signing key, reusing the cached copy inside its TTL.
    async fn signing_key(&self) -> Result<hmac::Key, TokenError> {
        {
            let guard = self.cached.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ref cached) = *guard {
                if cached.fetched_at.elapsed() < self.refresh_ttl {
                    return Ok(cached.key.clone());
                }
            }
        }

        let material =
            self.secrets.fetch(&self.key_ref).await.map_err(|_| TokenError::KeyUnavailable)?;
        let key = hmac::Key::new(hmac::HMAC_SHA256, &material);

        let mut guard = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(CachedKey { key: key.clone(), fetched_at: Instant::now() });
        Ok(key)
    }

    /// Mint a token for `(session_id, project_id)` valid for `ttl`.
    pub async fn issue(
        &self,
        session_id: &str,
        project_id: &str,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let now = epoch_secs();
        self.issue_with_claims(Claims {
            sid: session_id.to_owned(),
            pid: project_id.to_owned(),
            nbf: now,
            exp: now + ttl.as_secs(),
        })
        .await
    }

    /// Mint a token with explicit claims (the coordinator pins `exp` to the
    /// session's `expires_at`).
    pub async fn issue_with_claims(&self, claims: Claims) -> Result<String, TokenError> {
        let key = self.signing_key().await?;

        let header = serde_json::to_vec(&HEADER).map_err(|_| TokenError::Malformed)?;
        let payload = serde_json::to_vec(&claims).map_err(|_| TokenError::Malformed)?;
        let signing_input =
            format!("{}.{}", URL_SAFE_NO_PAD.encode(header), URL_SAFE_NO_PAD.encode(payload));
        let tag = hmac::sign(&key, signing_input.as_bytes());

        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref())))
    }

    /// Verify a token against the session it is being presented for.
    ///
    /// A valid token for session A never authorizes session B.
    pub async fn verify(&self, token: &str, target_session: &str) -> Result<Claims, TokenError> {
        let claims = self.verify_any(token).await?;
        if claims.sid != target_session {
            return Err(TokenError::SessionMismatch);
        }
        Ok(claims)
    }

    /// Verify signature and validity window without binding to a target.
    pub async fn verify_any(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.splitn(3, '.');
        let (header_b64, payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s)) => (h, p, s),
            _ => return Err(TokenError::Malformed),
        };

        let key = self.signing_key().await?;
        let signing_input = format!("{header_b64}.{payload_b64}");
        let sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| TokenError::Malformed)?;
        hmac::verify(&key, signing_input.as_bytes(), &sig)
            .map_err(|_| TokenError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| TokenError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        let now = epoch_secs();
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }
        // Small skew allowance for clocks across the control plane and containers.
        if claims.nbf > now + 30 {
            return Err(TokenError::NotYetValid);
        }
        Ok(claims)
    }
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
