//! Gateway method handlers.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use voxbus_core::protocol::{
    BusFrame, ClearParams, ConnectParams, KeyParams, SubscribeParams, UnsubscribeParams, methods,
};
use voxbus_core::{ClearOutcome, Proposal, Rejection};

use crate::events::forward_subscription;
use crate::state::GatewayState;

/// Dispatch a method request.
///
/// Returns the response frame to queue, or `None` when the handler queued
/// its own response ahead of follow-up events.
pub async fn dispatch_method(
    state: &Arc<GatewayState>,
    conn_id: &str,
    request_id: &str,
    method: &str,
    params: Option<serde_json::Value>,
) -> Option<BusFrame> {
    debug!(method, "Dispatching method");

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let response = dispatch_method_inner(state, conn_id, request_id, method, params).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_request(method, start.elapsed().as_secs_f64());

    response
}

async fn dispatch_method_inner(
    state: &Arc<GatewayState>,
    conn_id: &str,
    request_id: &str,
    method: &str,
    params: Option<serde_json::Value>,
) -> Option<BusFrame> {
    let frame = match method {
        methods::CONNECT => handle_connect(state, conn_id, request_id, params).await,
        methods::PROPOSE => handle_propose(state, request_id, params).await,
        methods::GET => handle_get(state, request_id, params).await,
        methods::CLEAR => handle_clear(state, request_id, params).await,
        methods::SNAPSHOT => handle_snapshot(state, request_id).await,
        methods::SUBSCRIBE => return handle_subscribe(state, conn_id, request_id, params).await,
        methods::UNSUBSCRIBE => handle_unsubscribe(state, conn_id, request_id, params).await,
        methods::RULES_LIST => handle_rules_list(state, request_id),
        _ => BusFrame::error(
            request_id,
            "method_not_found",
            format!("Unknown method: {method}"),
        ),
    };
    Some(frame)
}

fn parse_params<T: DeserializeOwned>(
    request_id: &str,
    params: Option<serde_json::Value>,
) -> Result<T, BusFrame> {
    serde_json::from_value(params.unwrap_or_default())
        .map_err(|e| BusFrame::error(request_id, "invalid_params", e.to_string()))
}

// ============================================================
// Connection
// ============================================================

async fn handle_connect(
    state: &Arc<GatewayState>,
    conn_id: &str,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> BusFrame {
    let connect: ConnectParams = match parse_params(request_id, params) {
        Ok(p) => p,
        Err(frame) => return frame,
    };
    if let Some(conn) = state.connections.write().await.get_mut(conn_id) {
        conn.client_id = Some(connect.client.id.clone());
    }
    info!(conn_id, client = %connect.client.id, "Client identified");
    BusFrame::ok(request_id, json!({ "conn_id": conn_id }))
}

// ============================================================
// State methods
// ============================================================

async fn handle_propose(
    state: &Arc<GatewayState>,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> BusFrame {
    let proposal: Proposal = match parse_params(request_id, params) {
        Ok(p) => p,
        Err(frame) => return frame,
    };
    let decision = state.bus.propose(proposal).await;

    #[cfg(feature = "metrics")]
    {
        use voxbus_core::Decision;
        crate::metrics::record_decision(match &decision {
            Decision::Accepted { .. } => "accepted",
            Decision::Rejected { reason } => reason.as_str(),
        });
    }

    to_payload(request_id, &decision)
}

async fn handle_get(
    state: &Arc<GatewayState>,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> BusFrame {
    let params: KeyParams = match parse_params(request_id, params) {
        Ok(p) => p,
        Err(frame) => return frame,
    };
    if !state.bus.registry().contains(&params.key) {
        return BusFrame::error(
            request_id,
            Rejection::UnknownKey.as_str(),
            format!("No rule for key: {}", params.key),
        );
    }
    let entry = state.bus.get(&params.key).await;
    BusFrame::ok(request_id, json!({ "entry": entry }))
}

async fn handle_clear(
    state: &Arc<GatewayState>,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> BusFrame {
    let params: ClearParams = match parse_params(request_id, params) {
        Ok(p) => p,
        Err(frame) => return frame,
    };
    let outcome: ClearOutcome = state.bus.clear(&params.key, params.source).await;
    to_payload(request_id, &outcome)
}

async fn handle_snapshot(state: &Arc<GatewayState>, request_id: &str) -> BusFrame {
    let entries = state.bus.snapshot().await;
    BusFrame::ok(request_id, json!({ "entries": entries }))
}

// ============================================================
// Subscriptions
// ============================================================

/// Open a subscription and queue the response before any of its events.
async fn handle_subscribe(
    state: &Arc<GatewayState>,
    conn_id: &str,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> Option<BusFrame> {
    let params: SubscribeParams = match parse_params(request_id, params) {
        Ok(p) => p,
        Err(frame) => return Some(frame),
    };
    let sub = match state.bus.subscribe(&params.pattern, params.replay).await {
        Ok(sub) => sub,
        Err(e) => return Some(BusFrame::error(request_id, "invalid_params", e.to_string())),
    };
    let subscription_id = sub.id().to_string();

    let event_tx = match state.connections.read().await.get(conn_id) {
        Some(conn) => conn.event_tx.clone(),
        None => return Some(BusFrame::error(request_id, "not_connected", "Connection is closing")),
    };

    let response = BusFrame::ok(
        request_id,
        json!({ "subscription_id": subscription_id, "pattern": sub.pattern().as_str() }),
    );
    let msg = match serde_json::to_string(&response) {
        Ok(msg) => msg,
        Err(e) => return Some(BusFrame::error(request_id, "internal", e.to_string())),
    };
    // Queued before the forwarder starts, so the id precedes its events.
    if event_tx.send(msg).await.is_err() {
        return None;
    }

    let task = forward_subscription(sub, event_tx);
    match state.connections.write().await.get_mut(conn_id) {
        Some(conn) => {
            conn.subscriptions.insert(subscription_id.clone(), task);
        }
        None => task.abort(),
    }
    debug!(conn_id, subscription = %subscription_id, pattern = %params.pattern, "Subscribed");
    None
}

async fn handle_unsubscribe(
    state: &Arc<GatewayState>,
    conn_id: &str,
    request_id: &str,
    params: Option<serde_json::Value>,
) -> BusFrame {
    let params: UnsubscribeParams = match parse_params(request_id, params) {
        Ok(p) => p,
        Err(frame) => return frame,
    };
    let task = state
        .connections
        .write()
        .await
        .get_mut(conn_id)
        .and_then(|c| c.subscriptions.remove(&params.subscription_id));

    let removed = match task {
        Some(task) => {
            task.abort();
            true
        }
        None => false,
    };
    BusFrame::ok(request_id, json!({ "removed": removed }))
}

// ============================================================
// Rules
// ============================================================

fn handle_rules_list(state: &Arc<GatewayState>, request_id: &str) -> BusFrame {
    let rules: Vec<serde_json::Value> = state
        .bus
        .registry()
        .iter()
        .map(|(key, policy)| {
            json!({
                "key": key,
                "allowed_sources": policy.allowed_sources(),
                "min_priority": policy.min_priority(),
                "allow_if": policy.allow_if(),
            })
        })
        .collect();
    BusFrame::ok(request_id, json!({ "rules": rules }))
}

// ============================================================
// Helpers
// ============================================================

fn to_payload<T: serde::Serialize>(request_id: &str, value: &T) -> BusFrame {
    match serde_json::to_value(value) {
        Ok(payload) => BusFrame::ok(request_id, payload),
        Err(e) => BusFrame::error(request_id, "internal", e.to_string()),
    }
}
