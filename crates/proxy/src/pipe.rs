// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bidirectional CDP frame pump between one downstream client and its
//! dedicated upstream browser connection.
//!
//! Frames pass through verbatim, order preserved per direction, message
//! boundaries intact. A side that cannot accept a write within the
//! back-pressure window is closed with 1011 and its counterpart is closed
//! immediately after.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// Token invalid or expired.
pub const CLOSE_TOKEN_INVALID: u16 = 4401;
/// Token bound to a different session.
pub const CLOSE_SESSION_MISMATCH: u16 = 4403;
/// Container shutting down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Back-pressure or upstream failure.
pub const CLOSE_INTERNAL: u16 = 1011;

/// Window a peer gets to accept a write before its connection is cut.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why the pump stopped; drives the close frames sent to each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    ClientClosed,
    UpstreamClosed,
    BackPressure,
    Shutdown,
}

/// Pump frames both ways until either side closes, back-pressure trips, or
/// shutdown is requested. Close frames are delivered best-effort on exit.
pub async fn pump(client: WebSocket, upstream: Upstream, shutdown: CancellationToken) -> PumpEnd {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let end = run_pump(&mut client_tx, &mut client_rx, &mut upstream_tx, &mut upstream_rx, shutdown)
        .await;

    match end {
        PumpEnd::Shutdown => {
            close_client(&mut client_tx, CLOSE_GOING_AWAY, "container shutting down").await;
            close_upstream(&mut upstream_tx, CloseCode::Away).await;
        }
        PumpEnd::BackPressure => {
            close_client(&mut client_tx, CLOSE_INTERNAL, "write stalled").await;
            close_upstream(&mut upstream_tx, CloseCode::Error).await;
        }
        PumpEnd::ClientClosed => {
            close_upstream(&mut upstream_tx, CloseCode::Normal).await;
        }
        PumpEnd::UpstreamClosed => {
            close_client(&mut client_tx, CLOSE_GOING_AWAY, "browser connection closed").await;
        }
    }
    end
}

async fn run_pump(
    client_tx: &mut SplitSink<WebSocket, ClientMessage>,
    client_rx: &mut SplitStream<WebSocket>,
    upstream_tx: &mut SplitSink<Upstream, UpstreamMessage>,
    upstream_rx: &mut SplitStream<Upstream>,
    shutdown: CancellationToken,
) -> PumpEnd {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return PumpEnd::Shutdown,

            // Client -> browser
            msg = client_rx.next() => {
                let forward = match msg {
                    Some(Ok(ClientMessage::Text(text))) => {
                        Some(UpstreamMessage::Text(text.as_str().into()))
                    }
                    Some(Ok(ClientMessage::Binary(bytes))) => {
                        Some(UpstreamMessage::Binary(bytes))
                    }
                    // Ping/pong are link-local; each hop answers its own.
                    Some(Ok(ClientMessage::Ping(_) | ClientMessage::Pong(_))) => None,
                    Some(Ok(ClientMessage::Close(_))) | None => return PumpEnd::ClientClosed,
                    Some(Err(_)) => return PumpEnd::ClientClosed,
                };
                if let Some(frame) = forward {
                    match tokio::time::timeout(WRITE_TIMEOUT, upstream_tx.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return PumpEnd::UpstreamClosed,
                        Err(_) => return PumpEnd::BackPressure,
                    }
                }
            }

            // Browser -> client
            msg = upstream_rx.next() => {
                let forward = match msg {
                    Some(Ok(UpstreamMessage::Text(text))) => {
                        Some(ClientMessage::Text(text.as_str().into()))
                    }
                    Some(Ok(UpstreamMessage::Binary(bytes))) => {
                        Some(ClientMessage::Binary(bytes))
                    }
                    Some(Ok(UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_))) => None,
                    Some(Ok(UpstreamMessage::Close(_))) | None => return PumpEnd::UpstreamClosed,
                    Some(Ok(UpstreamMessage::Frame(_))) => None,
                    Some(Err(_)) => return PumpEnd::UpstreamClosed,
                };
                if let Some(frame) = forward {
                    match tokio::time::timeout(WRITE_TIMEOUT, client_tx.send(frame)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return PumpEnd::ClientClosed,
                        Err(_) => return PumpEnd::BackPressure,
                    }
                }
            }
        }
    }
}

/// Send a close frame to the downstream client, best-effort.
pub async fn close_client(
    client_tx: &mut SplitSink<WebSocket, ClientMessage>,
    code: u16,
    reason: &str,
) {
    let frame = CloseFrame { code, reason: reason.into() };
    let _ = client_tx.send(ClientMessage::Close(Some(frame))).await;
}

async fn close_upstream(upstream_tx: &mut SplitSink<Upstream, UpstreamMessage>, code: CloseCode) {
    let frame = UpstreamCloseFrame { code, reason: "".into() };
    let _ = upstream_tx.send(UpstreamMessage::Close(Some(frame))).await;
}
