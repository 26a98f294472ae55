//! voxbus wire protocol v1.
//!
//! All bus communication uses JSON-over-WebSocket with three frame types:
//! Request, Response, and Event.

use serde::{Deserialize, Serialize};

use crate::types::{SourceId, StateChange, StateKey};

/// Protocol version implemented by this bus.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request method names.
pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const PROPOSE: &str = "state.propose";
    pub const GET: &str = "state.get";
    pub const CLEAR: &str = "state.clear";
    pub const SNAPSHOT: &str = "state.snapshot";
    pub const SUBSCRIBE: &str = "state.subscribe";
    pub const UNSUBSCRIBE: &str = "state.unsubscribe";
    pub const RULES_LIST: &str = "rules.list";

    pub const ALL: [&str; 7] = [PROPOSE, GET, CLEAR, SNAPSHOT, SUBSCRIBE, UNSUBSCRIBE, RULES_LIST];
}

/// Server-pushed event names.
pub mod events {
    pub const HELLO: &str = "hello";
    pub const AUTH_OK: &str = "auth.ok";
    pub const AUTH_ERROR: &str = "auth.error";
    pub const STATE_CHANGED: &str = "state.changed";

    pub const ALL: [&str; 1] = [STATE_CHANGED];
}

/// A bus wire frame, the top-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusFrame {
    /// Client -> Server request.
    #[serde(rename = "req")]
    Request {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
    },

    /// Server -> Client response.
    #[serde(rename = "res")]
    Response {
        id: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },

    /// Server -> Client event push.
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl BusFrame {
    pub fn request(id: impl Into<String>, method: &str, params: Option<serde_json::Value>) -> Self {
        BusFrame::Request {
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }

    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        BusFrame::Response {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        BusFrame::Response {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.to_string(),
                message: message.into(),
                details: None,
            }),
        }
    }

    pub fn event(event: &str, payload: Option<serde_json::Value>, seq: Option<u64>) -> Self {
        BusFrame::Event {
            event: event.to_string(),
            payload,
            seq,
        }
    }
}

/// Error shape returned in response frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Client handshake parameters (first frame when auth is on).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectParams {
    pub client: ClientInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AuthParams {
    #[serde(rename = "token")]
    Token { token: String },
}

/// Server hello sent on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOk {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub auth_mode: String,
    pub limits: Limits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub conn_id: String,
    /// Version lineage of the bus. Changes from different epochs have
    /// unrelated version numbers.
    #[serde(default)]
    pub epoch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
    pub keys: Vec<StateKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    pub max_payload: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyParams {
    pub key: StateKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearParams {
    pub key: StateKey,
    pub source: SourceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub pattern: String,
    /// Deliver the current state of every matching key before live changes.
    #[serde(default)]
    pub replay: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    pub subscription_id: String,
}

/// Payload of a `state.changed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub subscription_id: String,
    pub change: StateChange,
}
