//! Axum-based WebSocket server.

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::connection::handle_ws_connection;
use crate::state::GatewayState;

/// Bind the configured address and serve until shutdown.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.gateway_bind());
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    serve(state, listener).await
}

/// Serve the gateway on an already bound listener.
///
/// Returns after Ctrl+C or `state.shutdown` fires and open connections drain.
pub async fn serve(state: Arc<GatewayState>, listener: TcpListener) -> anyhow::Result<()> {
    #[allow(unused_mut)]
    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/state", get(state_handler))
        .with_state(state.clone());

    #[cfg(feature = "metrics")]
    {
        let handle = crate::metrics::install_prometheus_recorder()?;
        app = app.route("/metrics", get(move || std::future::ready(handle.render())));
    }

    let app = app.layer(TraceLayer::new_for_http());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.max_message_size(state.config.max_payload())
        .on_upgrade(move |socket| handle_ws_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let connections = state.connections.read().await.len();
    let subscriptions = state.subscription_count().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "connections": connections,
        "subscriptions": subscriptions,
        "keys": state.bus.registry().len(),
        "published": state.bus.notifier().published(),
    }))
}

async fn state_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let entries = state.bus.snapshot().await;
    axum::Json(json!({ "entries": entries }))
}

async fn shutdown_signal(state: Arc<GatewayState>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(%e, "Failed to install CTRL+C handler");
                // Without a signal handler only an explicit shutdown can stop us.
                state.shutdown.cancelled().await;
            }
        }
        _ = state.shutdown.cancelled() => {}
    }
    info!("Shutdown signal received");
    state.shutdown.cancel();
}
