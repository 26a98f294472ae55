//! WebSocket client for a remote bus gateway.
//!
//! One background task owns the socket. Requests are correlated by id and
//! resolved through oneshot channels; subscription events are routed by the
//! server-assigned subscription id. When the socket drops, in-flight requests
//! fail with `ConnectionLost`, the task reconnects with exponential backoff,
//! and every live subscription is re-established with replay. A per-key
//! version cursor hides anything a subscriber has already seen; the cursors
//! are reset when the bus reports a new epoch, since versions restart there.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voxbus_core::config::Config;
use voxbus_core::protocol::{
    AuthParams, BusFrame, ClearParams, ClientInfo, ConnectParams, KeyParams, StateChangedEvent,
    events, methods,
};
use voxbus_core::{
    ClearOutcome, Decision, Proposal, SourceId, StateChange, StateEntry, StateKey,
};

use crate::{BusClient, ChangeStream, ClientError};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RESUBSCRIBE_ATTEMPTS: u32 = 3;

/// Connection settings for [`RemoteClient`].
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    pub url: String,
    pub token: Option<String>,
    pub client_id: String,
    pub source: Option<SourceId>,
    pub request_timeout: Duration,
}

impl RemoteOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            client_id: format!("voxbus-client-{}", std::process::id()),
            source: None,
            request_timeout: Duration::from_millis(2000),
        }
    }

    /// URL, token, and request timeout taken from a loaded config.
    pub fn from_config(config: &Config) -> Self {
        let mut options = Self::new(config.gateway_url());
        options.token = config.auth_token();
        options.request_timeout = Duration::from_millis(config.bus().request_timeout_ms);
        options
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_source(mut self, source: SourceId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

struct Pending {
    tx: oneshot::Sender<Result<Value, ClientError>>,
    /// Local subscription to bind once the server assigns its id.
    subscribe_for: Option<u64>,
}

struct SubEntry {
    pattern: String,
    server_id: Option<String>,
    cursor: HashMap<StateKey, u64>,
    tx: mpsc::UnboundedSender<StateChange>,
}

#[derive(Default)]
struct Tables {
    pending: HashMap<String, Pending>,
    subs: HashMap<u64, SubEntry>,
    /// Server subscription id to local subscription id.
    routes: HashMap<String, u64>,
    /// Outbound queue of the live socket; `None` while disconnected.
    writer: Option<mpsc::UnboundedSender<String>>,
    /// Epoch reported by the bus on the last handshake.
    epoch: Option<String>,
    /// Subscribe requests that timed out. The server may still create the
    /// subscription, so a late success is answered with an unsubscribe.
    abandoned: HashSet<String>,
}

impl Tables {
    /// Install the outbound queue of a freshly handshaken socket. Returns
    /// the subscriptions to re-establish on it.
    fn attach(&mut self, writer: mpsc::UnboundedSender<String>, epoch: String) -> Vec<(u64, String)> {
        self.writer = Some(writer);
        if self.epoch.as_ref().is_some_and(|seen| *seen != epoch) {
            info!(%epoch, "Bus epoch changed, resetting subscription cursors");
            for sub in self.subs.values_mut() {
                sub.cursor.clear();
            }
        }
        self.epoch = Some(epoch);
        self.subs
            .iter()
            .map(|(local, sub)| (*local, sub.pattern.clone()))
            .collect()
    }

    /// Attach a server subscription id. Returns false if the local
    /// subscription was dropped while the request was in flight.
    fn bind(&mut self, local: u64, server_id: &str) -> bool {
        match self.subs.get_mut(&local) {
            Some(sub) => {
                if let Some(old) = sub.server_id.replace(server_id.to_string()) {
                    self.routes.remove(&old);
                }
                self.routes.insert(server_id.to_string(), local);
                true
            }
            None => false,
        }
    }

    fn deliver(&mut self, server_id: &str, change: StateChange) {
        let Some(local) = self.routes.get(server_id) else {
            debug!(subscription = server_id, "Event for unknown subscription");
            return;
        };
        let Some(sub) = self.subs.get_mut(local) else {
            return;
        };
        let seen = sub.cursor.get(change.key()).copied().unwrap_or(0);
        if change.version() <= seen {
            return;
        }
        sub.cursor.insert(change.key().clone(), change.version());
        let _ = sub.tx.send(change);
    }

    /// Forget a local subscription. Returns its server id if it had one.
    fn release(&mut self, local: u64) -> Option<String> {
        let sub = self.subs.remove(&local)?;
        let server_id = sub.server_id?;
        self.routes.remove(&server_id);
        Some(server_id)
    }

    fn disconnect(&mut self, reason: &str) {
        self.writer = None;
        for (_, pending) in self.pending.drain() {
            let _ = pending
                .tx
                .send(Err(ClientError::ConnectionLost(reason.to_string())));
        }
        self.routes.clear();
        self.abandoned.clear();
        for sub in self.subs.values_mut() {
            sub.server_id = None;
        }
    }
}

struct Inner {
    options: RemoteOptions,
    next_id: AtomicU64,
    tables: Mutex<Tables>,
    cancel: CancellationToken,
}

impl Inner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        subscribe_for: Option<u64>,
    ) -> Result<Value, ClientError> {
        let id = format!("r{}", self.next_id());
        let text = serde_json::to_string(&BusFrame::request(id.clone(), method, Some(params)))?;
        let (tx, rx) = oneshot::channel();
        {
            let mut tables = self.tables();
            let Some(writer) = tables.writer.clone() else {
                return Err(ClientError::ConnectionLost("not connected".into()));
            };
            tables.pending.insert(id.clone(), Pending { tx, subscribe_for });
            if writer.send(text).is_err() {
                tables.pending.remove(&id);
                return Err(ClientError::ConnectionLost("connection closing".into()));
            }
        }

        let timeout = self.options.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionLost(
                "connection closed before response".into(),
            )),
            Err(_) => {
                let mut tables = self.tables();
                if tables.pending.remove(&id).is_some() && subscribe_for.is_some() {
                    tables.abandoned.insert(id);
                }
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    /// Fire-and-forget unsubscribe; the response is ignored.
    fn send_unsubscribe(&self, server_id: &str) {
        let frame = BusFrame::request(
            format!("r{}", self.next_id()),
            methods::UNSUBSCRIBE,
            Some(json!({ "subscription_id": server_id })),
        );
        let Ok(text) = serde_json::to_string(&frame) else {
            return;
        };
        if let Some(writer) = self.tables().writer.as_ref() {
            let _ = writer.send(text);
        }
    }

    fn handle_text(&self, text: &str) {
        let frame = match serde_json::from_str::<BusFrame>(text) {
            Ok(f) => f,
            Err(e) => {
                warn!(%e, "Invalid frame from bus");
                return;
            }
        };
        match frame {
            BusFrame::Response {
                id,
                ok,
                payload,
                error,
            } => {
                let mut tables = self.tables();
                let Some(pending) = tables.pending.remove(&id) else {
                    let late_subscription = tables
                        .abandoned
                        .remove(&id)
                        .then(|| payload.as_ref()?.get("subscription_id")?.as_str())
                        .flatten()
                        .filter(|_| ok);
                    drop(tables);
                    match late_subscription {
                        Some(server_id) => {
                            debug!(id, subscription = server_id, "Releasing subscription that arrived after timeout");
                            self.send_unsubscribe(server_id);
                        }
                        None => debug!(id, "Response for unknown request"),
                    }
                    return;
                };
                let result = if ok {
                    let payload = payload.unwrap_or(Value::Null);
                    if let (Some(local), Some(server_id)) = (
                        pending.subscribe_for,
                        payload.get("subscription_id").and_then(Value::as_str),
                    ) {
                        if !tables.bind(local, server_id) {
                            drop(tables);
                            self.send_unsubscribe(server_id);
                        }
                    }
                    Ok(payload)
                } else {
                    let (code, message) = error
                        .map(|e| (e.code, e.message))
                        .unwrap_or_else(|| ("unknown".into(), "Request failed".into()));
                    Err(ClientError::Server { code, message })
                };
                let _ = pending.tx.send(result);
            }
            BusFrame::Event { event, payload, .. } if event == events::STATE_CHANGED => {
                let Some(payload) = payload else {
                    return;
                };
                match serde_json::from_value::<StateChangedEvent>(payload) {
                    Ok(ev) => self.tables().deliver(&ev.subscription_id, ev.change),
                    Err(e) => warn!(%e, "Malformed state.changed event"),
                }
            }
            _ => {}
        }
    }
}

/// Client for a bus gateway reachable over WebSocket.
///
/// Dropping the client closes the connection and ends all its streams.
pub struct RemoteClient {
    inner: Arc<Inner>,
}

impl RemoteClient {
    /// Connect and authenticate. Fails if the first connection attempt fails;
    /// later drops are retried in the background.
    pub async fn connect(options: RemoteOptions) -> Result<Self, ClientError> {
        let (ws, epoch) = handshake(&options).await?;
        info!(url = %options.url, %epoch, "Connected to bus");
        let inner = Arc::new(Inner {
            options,
            next_id: AtomicU64::new(1),
            tables: Mutex::new(Tables::default()),
            cancel: CancellationToken::new(),
        });
        // The queue is live before `connect` returns, so the first request
        // never races the background task.
        let (tx, rx) = mpsc::unbounded_channel();
        inner.tables().attach(tx, epoch);
        tokio::spawn(maintain(inner.clone(), ws, rx));
        Ok(Self { inner })
    }

    pub fn url(&self) -> &str {
        &self.inner.options.url
    }

    pub fn is_connected(&self) -> bool {
        self.inner.tables().writer.is_some()
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

#[derive(Deserialize)]
struct EntryPayload {
    entry: Option<StateEntry>,
}

#[derive(Deserialize)]
struct EntriesPayload {
    entries: Vec<StateEntry>,
}

#[async_trait]
impl BusClient for RemoteClient {
    async fn propose(&self, proposal: Proposal) -> Result<Decision, ClientError> {
        let params = serde_json::to_value(&proposal)?;
        let payload = self.inner.request(methods::PROPOSE, params, None).await?;
        Ok(serde_json::from_value(payload)?)
    }

    async fn get(&self, key: &StateKey) -> Result<Option<StateEntry>, ClientError> {
        let params = serde_json::to_value(KeyParams { key: key.clone() })?;
        let payload = self.inner.request(methods::GET, params, None).await?;
        Ok(serde_json::from_value::<EntryPayload>(payload)?.entry)
    }

    async fn clear(&self, key: &StateKey, source: SourceId) -> Result<ClearOutcome, ClientError> {
        let params = serde_json::to_value(ClearParams {
            key: key.clone(),
            source,
        })?;
        let payload = self.inner.request(methods::CLEAR, params, None).await?;
        Ok(serde_json::from_value(payload)?)
    }

    async fn snapshot(&self) -> Result<Vec<StateEntry>, ClientError> {
        let payload = self.inner.request(methods::SNAPSHOT, json!({}), None).await?;
        Ok(serde_json::from_value::<EntriesPayload>(payload)?.entries)
    }

    async fn subscribe(&self, pattern: &str, replay: bool) -> Result<ChangeStream, ClientError> {
        let local = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.tables().subs.insert(
            local,
            SubEntry {
                pattern: pattern.to_string(),
                server_id: None,
                cursor: HashMap::new(),
                tx,
            },
        );

        let params = json!({ "pattern": pattern, "replay": replay });
        if let Err(e) = self.inner.request(methods::SUBSCRIBE, params, Some(local)).await {
            let released = self.inner.tables().release(local);
            if let Some(server_id) = released {
                self.inner.send_unsubscribe(&server_id);
            }
            return Err(e);
        }

        Ok(Box::pin(RemoteSubscription {
            local,
            inner: Arc::downgrade(&self.inner),
            rx: UnboundedReceiverStream::new(rx),
        }))
    }
}

/// Stream half of a remote subscription. Unsubscribes on drop.
struct RemoteSubscription {
    local: u64,
    inner: Weak<Inner>,
    rx: UnboundedReceiverStream<StateChange>,
}

impl Stream for RemoteSubscription {
    type Item = StateChange;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StateChange>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let released = inner.tables().release(self.local);
        if let Some(server_id) = released {
            inner.send_unsubscribe(&server_id);
        }
    }
}

/// Exponential backoff capped at `MAX_RECONNECT_DELAY`.
fn backoff_delay(attempts: u32) -> Duration {
    let factor = 1u32 << attempts.saturating_sub(1).min(6);
    std::cmp::min(RECONNECT_BASE_DELAY * factor, MAX_RECONNECT_DELAY)
}

/// Own the socket for the client's lifetime, reconnecting as needed.
async fn maintain(inner: Arc<Inner>, first: Ws, first_rx: mpsc::UnboundedReceiver<String>) {
    let mut conn = Some((first, first_rx));
    let mut attempts = 0u32;
    loop {
        if let Some((ws, rx)) = conn.take() {
            attempts = 0;
            let reason = run_connection(&inner, ws, rx).await;
            inner.tables().disconnect(&reason);
            if inner.cancel.is_cancelled() {
                break;
            }
            warn!(url = %inner.options.url, %reason, "Connection to bus lost");
        }

        attempts += 1;
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff_delay(attempts)) => {}
        }

        match handshake(&inner.options).await {
            Ok((ws, epoch)) => {
                info!(url = %inner.options.url, attempts, %epoch, "Reconnected to bus");
                let (tx, rx) = mpsc::unbounded_channel();
                let resubscribe = inner.tables().attach(tx, epoch);
                if !resubscribe.is_empty() {
                    tokio::spawn(restore_subscriptions(inner.clone(), resubscribe));
                }
                conn = Some((ws, rx));
            }
            Err(e) => debug!(%e, attempts, "Reconnect attempt failed"),
        }
    }
    debug!(url = %inner.options.url, "Bus client stopped");
}

/// Pump one socket until it fails. Returns why it ended.
async fn run_connection(
    inner: &Arc<Inner>,
    ws: Ws,
    mut rx: mpsc::UnboundedReceiver<String>,
) -> String {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return "client shut down".into();
            }
            outbound = rx.recv() => {
                let Some(text) = outbound else {
                    return "writer closed".into();
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    return e.to_string();
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => inner.handle_text(text.as_str()),
                Some(Ok(Message::Close(_))) | None => return "server closed the connection".into(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return e.to_string(),
            },
        }
    }
}

/// Re-establish subscriptions after a reconnect, replaying current state.
///
/// Timeouts are retried with backoff. A subscription the bus refuses, or
/// one that keeps timing out, is ended so its stream yields `None`. A lost
/// connection stops the pass; the next connection starts a new one.
async fn restore_subscriptions(inner: Arc<Inner>, subs: Vec<(u64, String)>) {
    for (local, pattern) in subs {
        let params = json!({ "pattern": pattern, "replay": true });
        let mut attempts = 0u32;
        loop {
            if !inner.tables().subs.contains_key(&local) {
                break;
            }
            attempts += 1;
            match inner.request(methods::SUBSCRIBE, params.clone(), Some(local)).await {
                Ok(_) => {
                    debug!(pattern, "Resubscribed");
                    break;
                }
                Err(ClientError::ConnectionLost(_)) => return,
                Err(e) if e.is_transient() && attempts < RESUBSCRIBE_ATTEMPTS => {
                    warn!(pattern, %e, attempts, "Resubscribe failed, retrying");
                    tokio::select! {
                        _ = inner.cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff_delay(attempts)) => {}
                    }
                }
                Err(e) => {
                    warn!(pattern, %e, "Resubscribe failed, ending subscription");
                    let released = inner.tables().release(local);
                    if let Some(server_id) = released {
                        inner.send_unsubscribe(&server_id);
                    }
                    break;
                }
            }
        }
    }
}

/// Open a socket, read `hello`, and identify (authenticating if required).
/// Returns the socket and the bus epoch announced in `hello`.
async fn handshake(options: &RemoteOptions) -> Result<(Ws, String), ClientError> {
    let attempt = async {
        let (mut ws, _) = connect_async(options.url.as_str())
            .await
            .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;

        let (auth_mode, epoch) = match next_frame(&mut ws).await? {
            BusFrame::Event { event, payload, .. } if event == events::HELLO => {
                let field = |ptr: &str| {
                    payload
                        .as_ref()
                        .and_then(|p| p.pointer(ptr))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                };
                (
                    field("/auth_mode").unwrap_or_else(|| "none".into()),
                    field("/server/epoch").unwrap_or_default(),
                )
            }
            other => {
                return Err(ClientError::Protocol(format!("Expected hello, got {other:?}")));
            }
        };

        let params = ConnectParams {
            client: ClientInfo {
                id: options.client_id.clone(),
                source: options.source,
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            auth: options.token.clone().map(|token| AuthParams::Token { token }),
        };
        let frame = BusFrame::request("connect", methods::CONNECT, Some(serde_json::to_value(&params)?));
        ws.send(Message::Text(serde_json::to_string(&frame)?.into()))
            .await
            .map_err(|e| ClientError::ConnectionLost(e.to_string()))?;

        if auth_mode == "token" {
            match next_frame(&mut ws).await? {
                BusFrame::Event { event, .. } if event == events::AUTH_OK => {}
                BusFrame::Event { event, payload, .. } if event == events::AUTH_ERROR => {
                    let message = payload
                        .as_ref()
                        .and_then(|p| p.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("Authentication failed")
                        .to_string();
                    return Err(ClientError::Server {
                        code: "auth_error".into(),
                        message,
                    });
                }
                other => {
                    return Err(ClientError::Protocol(format!("Expected auth result, got {other:?}")));
                }
            }
        }
        Ok((ws, epoch))
    };

    tokio::time::timeout(HANDSHAKE_TIMEOUT, attempt)
        .await
        .map_err(|_| ClientError::Timeout(HANDSHAKE_TIMEOUT))?
}

async fn next_frame(ws: &mut Ws) -> Result<BusFrame, ClientError> {
    while let Some(msg) = ws.next().await {
        match msg.map_err(|e| ClientError::ConnectionLost(e.to_string()))? {
            Message::Text(text) => return Ok(serde_json::from_str(text.as_str())?),
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(ClientError::ConnectionLost("closed during handshake".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn change(key: &str, version: u64) -> StateChange {
        StateChange::Updated {
            entry: StateEntry {
                key: key.into(),
                value: json!(version),
                source: SourceId::Llm,
                priority: 0,
                timestamp: Utc::now(),
                version,
            },
        }
    }

    fn tables_with_sub() -> (Tables, mpsc::UnboundedReceiver<StateChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut tables = Tables::default();
        tables.subs.insert(
            7,
            SubEntry {
                pattern: "*".into(),
                server_id: None,
                cursor: HashMap::new(),
                tx,
            },
        );
        assert!(tables.bind(7, "srv-a"));
        (tables, rx)
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(2), Duration::from_millis(200));
        assert_eq!(backoff_delay(4), Duration::from_millis(800));
        assert_eq!(backoff_delay(30), MAX_RECONNECT_DELAY);
    }

    #[test]
    fn test_deliver_drops_already_seen_versions() {
        let (mut tables, mut rx) = tables_with_sub();
        tables.deliver("srv-a", change("tts_ready", 1));
        tables.deliver("srv-a", change("tts_ready", 2));
        // Replay after reconnect repeats the current version.
        tables.deliver("srv-a", change("tts_ready", 2));
        tables.deliver("srv-a", change("ai_speaking", 1));

        let got: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|c| (c.key().to_string(), c.version()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("tts_ready".to_string(), 1),
                ("tts_ready".to_string(), 2),
                ("ai_speaking".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_disconnect_fails_pending_and_unbinds() {
        let (mut tables, _rx) = tables_with_sub();
        let (tx, mut pending_rx) = oneshot::channel();
        tables.pending.insert("r1".into(), Pending { tx, subscribe_for: None });

        tables.disconnect("boom");
        assert!(matches!(
            pending_rx.try_recv(),
            Ok(Err(ClientError::ConnectionLost(_)))
        ));
        assert!(tables.routes.is_empty());
        assert!(tables.subs[&7].server_id.is_none());

        // Events for the old server id no longer route anywhere.
        tables.deliver("srv-a", change("tts_ready", 1));
        assert!(tables.subs[&7].cursor.is_empty());
    }

    /// An inner whose outbound queue is read by the test instead of a socket.
    fn detached(timeout: Duration) -> (Arc<Inner>, mpsc::UnboundedReceiver<String>) {
        let inner = Arc::new(Inner {
            options: RemoteOptions::new("ws://127.0.0.1:1/ws").with_request_timeout(timeout),
            next_id: AtomicU64::new(1),
            tables: Mutex::new(Tables::default()),
            cancel: CancellationToken::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        inner.tables().attach(tx, "epoch-a".into());
        (inner, rx)
    }

    fn add_sub(inner: &Inner, local: u64, pattern: &str) -> mpsc::UnboundedReceiver<StateChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        inner.tables().subs.insert(
            local,
            SubEntry {
                pattern: pattern.into(),
                server_id: None,
                cursor: HashMap::new(),
                tx,
            },
        );
        rx
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<String>) -> (String, String, Value) {
        let text = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for request")
            .expect("outbound queue closed");
        match serde_json::from_str(&text).unwrap() {
            BusFrame::Request { id, method, params } => (id, method, params.unwrap_or_default()),
            other => panic!("expected request, got {other:?}"),
        }
    }

    fn reply(inner: &Inner, frame: BusFrame) {
        inner.handle_text(&serde_json::to_string(&frame).unwrap());
    }

    #[test]
    fn test_new_epoch_resets_cursors() {
        let (mut tables, mut rx) = tables_with_sub();
        let (writer, _outbound) = mpsc::unbounded_channel();
        tables.attach(writer.clone(), "epoch-a".into());
        tables.deliver("srv-a", change("tts_ready", 3));

        // Same epoch: the replayed version stays hidden.
        tables.disconnect("restart");
        let resubscribe = tables.attach(writer.clone(), "epoch-a".into());
        assert_eq!(resubscribe, vec![(7, "*".to_string())]);
        assert!(tables.bind(7, "srv-b"));
        tables.deliver("srv-b", change("tts_ready", 3));

        // Fresh bus: versions start over and must not be swallowed.
        tables.disconnect("restart");
        tables.attach(writer, "epoch-b".into());
        assert!(tables.bind(7, "srv-c"));
        tables.deliver("srv-c", change("tts_ready", 1));

        let versions: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|c| c.version())
            .collect();
        assert_eq!(versions, vec![3, 1]);
    }

    #[tokio::test]
    async fn test_first_request_after_attach_is_sent() {
        let (inner, mut rx) = detached(Duration::from_secs(5));
        let client = RemoteClient { inner: inner.clone() };

        let get = tokio::spawn(async move { client.get(&"tts_ready".into()).await });
        let (id, method, params) = next_request(&mut rx).await;
        assert_eq!(method, methods::GET);
        assert_eq!(params["key"], "tts_ready");
        reply(&inner, BusFrame::ok(id, json!({ "entry": null })));
        assert!(get.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_late_subscribe_response_is_unsubscribed() {
        let (inner, mut rx) = detached(Duration::from_millis(50));
        let client = RemoteClient { inner: inner.clone() };

        let err = client.subscribe("*", false).await.err().unwrap();
        assert!(matches!(err, ClientError::Timeout(_)));
        assert!(inner.tables().subs.is_empty());

        let (id, method, _) = next_request(&mut rx).await;
        assert_eq!(method, methods::SUBSCRIBE);
        reply(&inner, BusFrame::ok(id, json!({ "subscription_id": "srv-late" })));

        let (_, method, params) = next_request(&mut rx).await;
        assert_eq!(method, methods::UNSUBSCRIBE);
        assert_eq!(params["subscription_id"], "srv-late");
    }

    #[tokio::test]
    async fn test_resubscribe_retries_after_timeout() {
        let (inner, mut rx) = detached(Duration::from_millis(200));
        let _changes = add_sub(&inner, 7, "tts_*");
        let task = tokio::spawn(restore_subscriptions(inner.clone(), vec![(7, "tts_*".into())]));

        let (first, method, params) = next_request(&mut rx).await;
        assert_eq!(method, methods::SUBSCRIBE);
        assert_eq!(params["replay"], true);

        // The first attempt goes unanswered; a retry follows after backoff.
        let (second, _, _) = next_request(&mut rx).await;
        assert_ne!(first, second);
        reply(&inner, BusFrame::ok(second, json!({ "subscription_id": "srv-2" })));
        task.await.unwrap();
        assert_eq!(inner.tables().routes.get("srv-2"), Some(&7));

        // The server answers the abandoned attempt late; that one is released.
        reply(&inner, BusFrame::ok(first, json!({ "subscription_id": "srv-1" })));
        let (_, method, params) = next_request(&mut rx).await;
        assert_eq!(method, methods::UNSUBSCRIBE);
        assert_eq!(params["subscription_id"], "srv-1");
        assert_eq!(inner.tables().routes.get("srv-2"), Some(&7));
    }

    #[tokio::test]
    async fn test_refused_resubscribe_ends_stream() {
        let (inner, mut rx) = detached(Duration::from_secs(5));
        let mut changes = add_sub(&inner, 7, "tts_*");
        let task = tokio::spawn(restore_subscriptions(inner.clone(), vec![(7, "tts_*".into())]));

        let (id, _, _) = next_request(&mut rx).await;
        reply(&inner, BusFrame::error(id, "invalid_params", "bad pattern"));
        task.await.unwrap();

        assert!(inner.tables().subs.is_empty());
        assert!(changes.recv().await.is_none());
    }

    #[test]
    fn test_bind_after_release_reports_orphan() {
        let (mut tables, _rx) = tables_with_sub();
        assert_eq!(tables.release(7), Some("srv-a".to_string()));
        assert!(!tables.bind(7, "srv-b"));
        assert!(tables.routes.is_empty());
    }
}
