// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admission control: API-key resolution, per-project concurrency caps, and
//! input normalization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::{ApiError, CoreError};
use crate::session::USER_METADATA_MAX_BYTES;
use crate::store::{retry_transient, SessionStore};

/// Floor for the session timeout clamp.
pub const MIN_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Active,
    Suspended,
}

/// Read-only project reference data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub concurrency: usize,
    pub default_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_timeout_secs: Option<u64>,
    pub status: ProjectStatus,
}

/// Hash-keyed API key record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub api_key_id: String,
    /// Lowercase hex SHA-256 of the raw key.
    pub key_hash: String,
    pub project_id: String,
    #[serde(default)]
    pub additional_project_ids: Vec<String>,
}

/// On-disk registry shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyRecord>,
}

/// Loaded project/API-key reference data.
pub struct ProjectRegistry {
    projects: HashMap<String, Project>,
    keys_by_hash: HashMap<String, ApiKeyRecord>,
}

impl ProjectRegistry {
    pub fn from_config(config: RegistryConfig) -> Self {
        let projects =
            config.projects.into_iter().map(|p| (p.project_id.clone(), p)).collect();
        let keys_by_hash =
            config.api_keys.into_iter().map(|k| (k.key_hash.clone(), k)).collect();
        Self { projects, keys_by_hash }
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RegistryConfig = serde_json::from_str(&contents)?;
        Ok(Self::from_config(config))
    }

    pub fn project(&self, project_id: &str) -> Option<&Project> {
        self.projects.get(project_id)
    }

    fn key_by_hash(&self, hash: &str) -> Option<&ApiKeyRecord> {
        self.keys_by_hash.get(hash)
    }
}

/// Result of resolving an API key.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub api_key_id: String,
    pub project_id: String,
    pub allowed_project_ids: Vec<String>,
}

impl Resolution {
    pub fn allows(&self, project_id: &str) -> bool {
        self.allowed_project_ids.iter().any(|p| p == project_id)
    }
}

struct CachedResolution {
    resolution: Resolution,
    fetched_at: Instant,
}

/// Bounded TTL LRU for key resolutions. Most-recently-used at the back;
/// eviction pops from the front.
struct KeyCache {
    map: IndexMap<String, CachedResolution>,
    capacity: usize,
    ttl: Duration,
}

impl KeyCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self { map: IndexMap::with_capacity(capacity), capacity, ttl }
    }

    fn get(&mut self, hash: &str) -> Option<Resolution> {
        let fresh = match self.map.get(hash) {
            Some(cached) if cached.fetched_at.elapsed() < self.ttl => {
                Some(cached.resolution.clone())
            }
            Some(_) => None,
            None => return None,
        };
        match fresh {
            Some(resolution) => {
                // Bump to most-recently-used.
                if let Some(cached) = self.map.shift_remove(hash) {
                    self.map.insert(hash.to_owned(), cached);
                }
                Some(resolution)
            }
            None => {
                self.map.shift_remove(hash);
                None
            }
        }
    }

    fn put(&mut self, hash: String, resolution: Resolution) {
        self.map.shift_remove(&hash);
        self.map.insert(hash, CachedResolution { resolution, fetched_at: Instant::now() });
        while self.map.len() > self.capacity {
            self.map.shift_remove_index(0);
        }
    }
}

/// Admission control service.
pub struct Admission {
    registry: ProjectRegistry,
    cache: Mutex<KeyCache>,
    store: Arc<dyn SessionStore>,
    default_timeout_secs: u64,
    global_max_timeout_secs: u64,
}

impl Admission {
    pub fn new(
        registry: ProjectRegistry,
        store: Arc<dyn SessionStore>,
        cache_capacity: usize,
        cache_ttl: Duration,
        default_timeout_secs: u64,
        global_max_timeout_secs: u64,
    ) -> Self {
        Self {
            registry,
            cache: Mutex::new(KeyCache::new(cache_capacity, cache_ttl)),
            store,
            default_timeout_secs,
            global_max_timeout_secs,
        }
    }

    /// Resolve an API key to its project context.
    pub async fn resolve(&self, api_key: &str) -> Result<Resolution, CoreError> {
        let hash = sha256_hex(api_key);

        if let Some(cached) = self.cache.lock().await.get(&hash) {
            return Ok(cached);
        }

        let record = self
            .registry
            .key_by_hash(&hash)
            .ok_or_else(|| CoreError::new(ApiError::Auth, "unknown API key"))?;

        let mut allowed = vec![record.project_id.clone()];
        allowed.extend(record.additional_project_ids.iter().cloned());
        let resolution = Resolution {
            api_key_id: record.api_key_id.clone(),
            project_id: record.project_id.clone(),
            allowed_project_ids: allowed,
        };

        self.cache.lock().await.put(hash, resolution.clone());
        Ok(resolution)
    }

    /// Look up a project, rejecting suspended or unknown ones.
    pub fn active_project(&self, project_id: &str) -> Result<&Project, CoreError> {
        let project = self
            .registry
            .project(project_id)
            .ok_or_else(|| CoreError::new(ApiError::Forbidden, "unknown project"))?;
        if project.status != ProjectStatus::Active {
            return Err(CoreError::new(ApiError::Forbidden, "project suspended"));
        }
        Ok(project)
    }

    /// Reject when the project is at its non-terminal session cap.
    ///
    /// This is the fast-fail gate (no record write, no task launch); the
    /// store's capped create enforces the cap atomically at reserve time.
    pub async fn check_concurrency(&self, project: &Project) -> Result<(), CoreError> {
        let active = retry_transient(|| self.store.count_active(&project.project_id))
            .await
            .map_err(|e| CoreError::transient(e.to_string()))?;
        if active >= project.concurrency {
            return Err(CoreError::new(
                ApiError::ConcurrencyExceeded,
                format!(
                    "project {} has {active} active sessions (limit {})",
                    project.project_id, project.concurrency
                ),
            ));
        }
        Ok(())
    }

    /// Clamp a requested timeout to `[60, min(project cap, global cap)]`.
    pub fn clamp_timeout(&self, project: &Project, requested: Option<u64>) -> u64 {
        let cap = project
            .max_timeout_secs
            .unwrap_or(self.global_max_timeout_secs)
            .min(self.global_max_timeout_secs);
        let requested = requested.unwrap_or_else(|| {
            if project.default_timeout_secs > 0 {
                project.default_timeout_secs
            } else {
                self.default_timeout_secs
            }
        });
        requested.clamp(MIN_TIMEOUT_SECS, cap.max(MIN_TIMEOUT_SECS))
    }

    /// Enforce the serialized metadata size cap.
    pub fn validate_metadata(
        &self,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), CoreError> {
        let size = serde_json::to_vec(metadata).map(|v| v.len()).unwrap_or(usize::MAX);
        if size > USER_METADATA_MAX_BYTES {
            return Err(CoreError::validation(format!(
                "user_metadata is {size} bytes (limit {USER_METADATA_MAX_BYTES})"
            )));
        }
        Ok(())
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

/// Lowercase hex SHA-256 of an API key.
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push(char::from(HEX[(b >> 4) as usize]));
        out.push(char::from(HEX[(b & 0xf) as usize]));
    }
    out
}

#[cfg(test)]
#[path = "admission_tests.rs"]
mod tests;
