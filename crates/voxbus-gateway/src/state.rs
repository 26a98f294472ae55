//! Gateway shared state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use voxbus_core::config::Config;
use voxbus_state::StateBus;

/// Frames buffered per connection. A full queue holds back the
/// subscription forwarders, which then lag and resync from the store.
pub const OUTBOUND_QUEUE: usize = 256;

/// Shared gateway state accessible from all connections and handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub bus: Arc<StateBus>,
    pub connections: RwLock<HashMap<String, ConnectionState>>,
    /// Fires when the server should stop accepting and drain.
    pub shutdown: CancellationToken,
}

/// Per-connection state.
pub struct ConnectionState {
    pub conn_id: String,
    pub client_id: Option<String>,
    pub event_tx: mpsc::Sender<String>,
    /// Forwarding task per live subscription, keyed by subscription id.
    pub subscriptions: HashMap<String, JoinHandle<()>>,
}

impl ConnectionState {
    pub fn new(conn_id: String, event_tx: mpsc::Sender<String>) -> Self {
        Self {
            conn_id,
            client_id: None,
            event_tx,
            subscriptions: HashMap::new(),
        }
    }

    /// Stop every forwarding task. Dropping the tasks drops their receivers.
    pub fn close_subscriptions(&mut self) -> usize {
        let count = self.subscriptions.len();
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
        count
    }
}

impl GatewayState {
    pub fn new(config: Arc<Config>, bus: Arc<StateBus>) -> Self {
        Self {
            config,
            bus,
            connections: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn auth_mode(&self) -> &str {
        self.config
            .gateway
            .as_ref()
            .and_then(|g| g.auth.as_ref())
            .map(|a| a.effective_mode())
            .unwrap_or("none")
    }

    /// Live subscriptions across all connections.
    pub async fn subscription_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .map(|c| c.subscriptions.len())
            .sum()
    }
}
