// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed error codes shared across the HTTP surface and internal components.

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds surfaced by the orchestration core.
///
/// Retryability is a property of the kind, not of the message: `Transient` and
/// first-round `Conflict` are retried locally; everything else propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiError {
    Validation,
    Auth,
    Forbidden,
    NotFound,
    ConcurrencyExceeded,
    Conflict,
    ProvisioningTimeout,
    ProvisioningFailed,
    Transient,
    Fatal,
}

impl ApiError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::ProvisioningTimeout => 408,
            Self::ConcurrencyExceeded => 409,
            Self::Conflict => 409,
            Self::ProvisioningFailed => 503,
            Self::Transient => 503,
            Self::Fatal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Auth => "AUTH_ERROR",
            Self::Forbidden => "PROJECT_MISMATCH",
            Self::NotFound => "NOT_FOUND",
            Self::ConcurrencyExceeded => "CONCURRENCY_EXCEEDED",
            Self::Conflict => "CONFLICT",
            Self::ProvisioningTimeout => "PROVISIONING_TIMEOUT",
            Self::ProvisioningFailed => "PROVISIONING_FAILED",
            Self::Transient => "TRANSIENT",
            Self::Fatal => "FATAL",
        }
    }

    /// Whether a local retry may succeed without caller intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Conflict)
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody { code: self.as_str().to_owned(), message: message.into() }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ErrorResponse>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, Json(body))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// An [`ApiError`] paired with context for logs and client payloads.
#[derive(Debug, Clone)]
pub struct CoreError {
    pub kind: ApiError,
    pub message: String,
}

impl CoreError {
    pub fn new(kind: ApiError, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ApiError::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ApiError::Conflict, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ApiError::Transient, message)
    }

    pub fn to_http_response(&self) -> (StatusCode, Json<ErrorResponse>) {
        self.kind.to_http_response(self.message.clone())
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {}

/// Jittered exponential backoff schedule for `Transient` retries.
///
/// Yields `base * 2^attempt` capped at `max`, with up to 25% random jitter.
pub fn backoff_delay(attempt: u32, base: std::time::Duration, max: std::time::Duration) -> std::time::Duration {
    use rand::Rng;
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(max);
    let jitter_range = capped.as_millis() as u64 / 4;
    let jitter = if jitter_range == 0 { 0 } else { rand::rng().random_range(0..=jitter_range) };
    capped + std::time::Duration::from_millis(jitter)
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
