// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Browser discovery and control-plane reporting.

use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Poll the browser's `/json/version` until Chrome answers, returning its
/// WebSocket debugger URL.
pub async fn discover_browser_ws(
    browser_port: u16,
    shutdown: &CancellationToken,
) -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap_or_default();
    let url = format!("http://127.0.0.1:{browser_port}/json/version");

    let mut backoff = Duration::from_millis(250);
    loop {
        if shutdown.is_cancelled() {
            anyhow::bail!("shutdown before browser became reachable");
        }

        match client.get(&url).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.json::<VersionResponse>().await {
                    Ok(version) => {
                        tracing::info!(ws_url = %version.web_socket_debugger_url, "browser CDP discovered");
                        return Ok(version.web_socket_debugger_url);
                    }
                    Err(e) => tracing::debug!(err = %e, "bad /json/version payload"),
                },
                Err(e) => tracing::debug!(err = %e, "browser not ready"),
            },
            Err(e) => tracing::debug!(err = %e, "browser not reachable yet"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => anyhow::bail!("shutdown before browser became reachable"),
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_secs(2));
    }
}

/// Spawn the chrome-ready report. Retries with exponential backoff until the
/// control plane acknowledges; 409 means the RUNNING event has not landed yet
/// and is retried like a transport error.
pub fn spawn_ready_report(config: &ProxyConfig, shutdown: CancellationToken) {
    let (Some(control_url), Some(token)) =
        (config.control_url.clone(), config.session_token.clone())
    else {
        tracing::warn!("no control URL or session token; skipping ready report");
        return;
    };
    let session_id = config.session_id.clone();

    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        let url = format!("{control_url}/internal/sessions/{session_id}/ready");

        let mut backoff = Duration::from_millis(500);
        for attempt in 0u32.. {
            if shutdown.is_cancelled() {
                return;
            }

            match client.post(&url).bearer_auth(&token).json(&serde_json::json!({})).send().await
            {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(session_id = %session_id, "ready report acknowledged");
                    return;
                }
                Ok(resp) => {
                    tracing::debug!(
                        session_id = %session_id,
                        status = %resp.status(),
                        attempt,
                        "ready report not accepted, retrying"
                    );
                }
                Err(e) => {
                    tracing::debug!(session_id = %session_id, err = %e, attempt, "ready report failed, retrying");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    });
}

/// Best-effort live-connection count report.
pub fn spawn_connections_report(config: &ProxyConfig, live: i64) {
    let (Some(control_url), Some(token)) =
        (config.control_url.clone(), config.session_token.clone())
    else {
        return;
    };
    let session_id = config.session_id.clone();

    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        let url = format!("{control_url}/internal/sessions/{session_id}/connections");
        let body = serde_json::json!({ "live": live.max(0) });

        if let Err(e) = client.post(&url).bearer_auth(&token).json(&body).send().await {
            tracing::debug!(session_id = %session_id, err = %e, "connections report failed");
        }
    });
}
