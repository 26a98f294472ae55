//! WebSocket connection lifecycle: handshake, auth, read/write loops.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voxbus_core::config::Config;
use voxbus_core::protocol::{
    AuthParams, BusFrame, ConnectParams, Features, HelloOk, Limits, PROTOCOL_VERSION, ServerInfo,
    events, methods,
};

use crate::methods::dispatch_method;
use crate::state::{ConnectionState, GatewayState, OUTBOUND_QUEUE};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check a client's ConnectParams against the configured auth mode.
fn authenticate(config: &Config, params: &ConnectParams) -> Result<(), String> {
    let auth_config = config.gateway.as_ref().and_then(|g| g.auth.as_ref());
    let mode = auth_config.map(|a| a.effective_mode()).unwrap_or("none");

    match mode {
        "none" => Ok(()),
        "token" => {
            let expected = auth_config
                .and_then(|a| a.resolve_token())
                .ok_or_else(|| "Server token not configured".to_string())?;

            match &params.auth {
                Some(AuthParams::Token { token }) => {
                    // Compare digests so the comparison length never depends on the input.
                    let expected_hash = format!("{:x}", Sha256::digest(expected.as_bytes()));
                    let provided_hash = format!("{:x}", Sha256::digest(token.as_bytes()));
                    if constant_time_eq(&provided_hash, &expected_hash) {
                        Ok(())
                    } else {
                        Err("Invalid token".to_string())
                    }
                }
                None => Err("Token authentication required".to_string()),
            }
        }
        other => Err(format!("Unknown auth mode: {other}")),
    }
}

fn hello(state: &GatewayState, conn_id: &str) -> HelloOk {
    HelloOk {
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            conn_id: conn_id.to_string(),
            epoch: state.bus.epoch().to_string(),
        },
        features: Features {
            methods: methods::ALL.iter().map(|m| m.to_string()).collect(),
            events: events::ALL.iter().map(|e| e.to_string()).collect(),
            keys: state.bus.registry().keys().cloned().collect(),
        },
        auth_mode: state.auth_mode().to_string(),
        limits: Limits {
            max_payload: state.config.max_payload(),
        },
    }
}

fn encode(frame: &BusFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(s) => Some(s),
        Err(e) => {
            error!(%e, "Failed to serialize frame");
            None
        }
    }
}

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    serve_connection(&state, &conn_id, ws).await;
    cleanup_connection(&state, &conn_id).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();

    info!(conn_id = %conn_id, "WebSocket connection closed");
}

async fn serve_connection(state: &Arc<GatewayState>, conn_id: &str, ws: WebSocket) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (event_tx, mut event_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    let needs_auth = state.auth_mode() != "none";
    state.connections.write().await.insert(
        conn_id.to_string(),
        ConnectionState::new(conn_id.to_string(), event_tx.clone()),
    );

    let hello_frame = BusFrame::event(
        events::HELLO,
        serde_json::to_value(hello(state, conn_id)).ok(),
        Some(0),
    );
    if let Some(msg) = encode(&hello_frame) {
        if ws_tx.send(Message::Text(msg.into())).await.is_err() {
            return;
        }
    }

    if needs_auth {
        let result = tokio::time::timeout(AUTH_TIMEOUT, wait_for_auth(&state.config, &mut ws_rx, conn_id)).await;
        match result {
            Ok(Ok(client_id)) => {
                if let Some(conn) = state.connections.write().await.get_mut(conn_id) {
                    conn.client_id = client_id;
                }
                let ok_event = BusFrame::event(events::AUTH_OK, None, Some(1));
                if let Some(msg) = encode(&ok_event) {
                    if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                        return;
                    }
                }
                info!(conn_id = %conn_id, "Client authenticated");
            }
            Ok(Err(reason)) => {
                warn!(conn_id = %conn_id, %reason, "Authentication failed");
                let err_frame = BusFrame::event(
                    events::AUTH_ERROR,
                    Some(serde_json::json!({ "message": reason })),
                    None,
                );
                if let Some(msg) = encode(&err_frame) {
                    let _ = ws_tx.send(Message::Text(msg.into())).await;
                }
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
            Err(_) => {
                warn!(conn_id = %conn_id, "Authentication timeout");
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
        }
    }

    // Responses and subscription events share one outbound queue.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = event_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let msg_result = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            next = ws_rx.next() => match next {
                Some(m) => m,
                None => break,
            },
        };
        match msg_result {
            Ok(Message::Text(text)) => {
                let response = match serde_json::from_str::<BusFrame>(text.as_str()) {
                    Ok(BusFrame::Request { id, method, params }) => {
                        match dispatch_method(state, conn_id, &id, &method, params).await {
                            Some(frame) => frame,
                            None => continue,
                        }
                    }
                    Ok(_) => {
                        debug!(conn_id = %conn_id, "Received non-request frame, ignoring");
                        continue;
                    }
                    Err(e) => {
                        warn!(conn_id = %conn_id, %e, "Invalid frame received");
                        BusFrame::error("unknown", "parse_error", format!("Invalid frame: {e}"))
                    }
                };
                if let Some(msg) = encode(&response) {
                    tokio::select! {
                        _ = state.shutdown.cancelled() => break,
                        sent = event_tx.send(msg) => if sent.is_err() { break },
                    }
                }
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            // Axum answers pings itself.
            _ => {}
        }
    }

    send_task.abort();
}

/// Wait for the client's `connect` request and authenticate it.
/// Returns the client's self-reported id on success.
async fn wait_for_auth(
    config: &Config,
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    conn_id: &str,
) -> Result<Option<String>, String> {
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if let Ok(BusFrame::Request {
                    method,
                    params: Some(params),
                    ..
                }) = serde_json::from_str::<BusFrame>(text.as_str())
                {
                    if method == methods::CONNECT {
                        let connect: ConnectParams = serde_json::from_value(params)
                            .map_err(|e| format!("Invalid connect params: {e}"))?;
                        authenticate(config, &connect)?;
                        return Ok(Some(connect.client.id));
                    }
                }
                debug!(conn_id = %conn_id, "Received non-auth message during handshake");
                return Err("Expected connect request for authentication".to_string());
            }
            Ok(Message::Close(_)) => return Err("Connection closed during auth".to_string()),
            Err(e) => return Err(format!("WebSocket error during auth: {e}")),
            _ => continue,
        }
    }
    Err("Connection dropped during auth".to_string())
}

async fn cleanup_connection(state: &Arc<GatewayState>, conn_id: &str) {
    let removed = state.connections.write().await.remove(conn_id);
    if let Some(mut conn) = removed {
        let closed = conn.close_subscriptions();
        if closed > 0 {
            debug!(conn_id = %conn_id, closed, "Released subscriptions");
        }
    }
}
