//! Gateway integration tests: start a real gateway and interact via WS + HTTP.
//!
//! Run with: `cargo test -p voxbus-gateway --test integration`

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use voxbus_core::config::{Config, GatewayAuthConfig, GatewayConfig, RuleConfig};
use voxbus_core::{RuleRegistry, SourceId};
use voxbus_gateway::GatewayState;
use voxbus_state::StateBus;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_rules() -> Vec<RuleConfig> {
    vec![
        RuleConfig::new("ai_speaking", &[SourceId::Tts], 2),
        RuleConfig::new("stt_ready", &[SourceId::Stt], 0),
        RuleConfig::new("user_wants_to_talk", &[SourceId::Gui, SourceId::Stt], 0),
    ]
}

/// Build a gateway on an ephemeral port and return its state + port.
async fn start_test_gateway(config: Config) -> (Arc<GatewayState>, u16) {
    let registry = RuleRegistry::from_rules(&config.rules).unwrap();
    let bus = Arc::new(StateBus::new(registry, 256));
    let state = Arc::new(GatewayState::new(Arc::new(config), bus));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = voxbus_gateway::serve(state_clone, listener).await;
    });

    (state, port)
}

async fn default_gateway() -> (Arc<GatewayState>, u16) {
    start_test_gateway(Config {
        rules: test_rules(),
        ..Default::default()
    })
    .await
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Connect and consume the hello event.
async fn connect(port: u16) -> (Ws, Value) {
    let url = format!("ws://127.0.0.1:{port}/ws");
    let (mut ws, _) = connect_async(&url).await.expect("WS connect failed");
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["event"], "hello");
    (ws, hello)
}

async fn request(ws: &mut Ws, id: &str, method: &str, params: Value) -> Value {
    let req = json!({ "type": "req", "id": id, "method": method, "params": params });
    ws.send(Message::Text(req.to_string().into())).await.unwrap();
    loop {
        let frame = next_json(ws).await;
        if frame["type"] == "res" && frame["id"] == id {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_state, port) = default_gateway().await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("Health request failed");

    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["keys"], 3);
}

#[tokio::test]
async fn test_hello_lists_methods_and_keys() {
    let (_state, port) = default_gateway().await;
    let (_ws, hello) = connect(port).await;

    let payload = &hello["payload"];
    assert_eq!(payload["protocol"], 1);
    assert_eq!(payload["auth_mode"], "none");
    assert!(!payload["server"]["epoch"].as_str().unwrap().is_empty());
    let methods: Vec<&str> = payload["features"]["methods"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|m| m.as_str())
        .collect();
    assert!(methods.contains(&"state.propose"));
    assert!(methods.contains(&"state.subscribe"));
    assert_eq!(payload["features"]["keys"], json!(["ai_speaking", "stt_ready", "user_wants_to_talk"]));
}

#[tokio::test]
async fn test_propose_get_and_state_endpoint() {
    let (_state, port) = default_gateway().await;
    let (mut ws, _) = connect(port).await;

    let res = request(
        &mut ws,
        "p1",
        "state.propose",
        json!({"key": "ai_speaking", "value": "True", "source": "tts", "priority": 10}),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["status"], "accepted");
    assert_eq!(res["payload"]["entry"]["version"], 1);

    let res = request(
        &mut ws,
        "p2",
        "state.propose",
        json!({"key": "ai_speaking", "value": "False", "source": "gui", "priority": 99}),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["status"], "rejected");
    assert_eq!(res["payload"]["reason"], "unauthorized");

    let res = request(&mut ws, "g1", "state.get", json!({"key": "ai_speaking"})).await;
    assert_eq!(res["payload"]["entry"]["value"], "True");

    let body: Value = reqwest::get(format!("http://127.0.0.1:{port}/state"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["key"], "ai_speaking");
}

#[tokio::test]
async fn test_subscriber_receives_changes_from_other_connection() {
    let (_state, port) = default_gateway().await;
    let (mut watcher, _) = connect(port).await;
    let (mut writer, _) = connect(port).await;

    let res = request(&mut watcher, "s1", "state.subscribe", json!({"pattern": "user_*"})).await;
    let sub_id = res["payload"]["subscription_id"].as_str().unwrap().to_string();

    // Not matched by the pattern.
    request(
        &mut writer,
        "p0",
        "state.propose",
        json!({"key": "stt_ready", "value": "True", "source": "stt", "priority": 20}),
    )
    .await;
    request(
        &mut writer,
        "p1",
        "state.propose",
        json!({"key": "user_wants_to_talk", "value": "True", "source": "gui", "priority": 38}),
    )
    .await;
    request(&mut writer, "c1", "state.clear", json!({"key": "user_wants_to_talk", "source": "stt"})).await;

    let first = next_json(&mut watcher).await;
    assert_eq!(first["event"], "state.changed");
    assert_eq!(first["payload"]["subscription_id"], sub_id.as_str());
    assert_eq!(first["payload"]["change"]["kind"], "updated");
    assert_eq!(first["payload"]["change"]["entry"]["value"], "True");

    let second = next_json(&mut watcher).await;
    assert_eq!(second["payload"]["change"]["kind"], "cleared");
    assert_eq!(second["payload"]["change"]["version"], 2);
}

#[tokio::test]
async fn test_replay_delivers_current_state_first() {
    let (_state, port) = default_gateway().await;
    let (mut ws, _) = connect(port).await;

    request(
        &mut ws,
        "p1",
        "state.propose",
        json!({"key": "stt_ready", "value": "True", "source": "stt", "priority": 20}),
    )
    .await;
    request(&mut ws, "s1", "state.subscribe", json!({"pattern": "*", "replay": true})).await;

    let event = next_json(&mut ws).await;
    assert_eq!(event["event"], "state.changed");
    assert_eq!(event["payload"]["change"]["entry"]["key"], "stt_ready");
}

#[tokio::test]
async fn test_unsubscribe_and_disconnect_release_subscriptions() {
    let (state, port) = default_gateway().await;
    let (mut ws, _) = connect(port).await;

    let res = request(&mut ws, "s1", "state.subscribe", json!({"pattern": "*"})).await;
    let sub_id = res["payload"]["subscription_id"].as_str().unwrap().to_string();
    request(&mut ws, "s2", "state.subscribe", json!({"pattern": "ai_*"})).await;
    assert_eq!(state.subscription_count().await, 2);

    let res = request(&mut ws, "u1", "state.unsubscribe", json!({"subscription_id": sub_id})).await;
    assert_eq!(res["payload"]["removed"], true);
    assert_eq!(state.subscription_count().await, 1);

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if state.connections.read().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.subscription_count().await, 0);
}

#[tokio::test]
async fn test_rules_list_and_errors() {
    let (_state, port) = default_gateway().await;
    let (mut ws, _) = connect(port).await;

    let res = request(&mut ws, "r1", "rules.list", json!({})).await;
    assert_eq!(res["payload"]["rules"].as_array().unwrap().len(), 3);

    let res = request(&mut ws, "e1", "state.get", json!({"key": "ghost"})).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "unknown_key");

    let res = request(&mut ws, "e2", "state.subscribe", json!({"pattern": ""})).await;
    assert_eq!(res["error"]["code"], "invalid_params");

    ws.send(Message::Text("not json".to_string().into())).await.unwrap();
    let res = next_json(&mut ws).await;
    assert_eq!(res["error"]["code"], "parse_error");
}

#[tokio::test]
async fn test_token_auth() {
    let config = Config {
        gateway: Some(GatewayConfig {
            port: 0,
            bind: None,
            auth: Some(GatewayAuthConfig {
                mode: Some("token".into()),
                token: Some("s3cret".into()),
                token_env: None,
            }),
            max_payload: 1_048_576,
        }),
        rules: test_rules(),
        ..Default::default()
    };
    let (_state, port) = start_test_gateway(config).await;

    let (mut bad, hello) = connect(port).await;
    assert_eq!(hello["payload"]["auth_mode"], "token");
    let req = json!({
        "type": "req", "id": "a1", "method": "connect",
        "params": {"client": {"id": "gui"}, "auth": {"type": "token", "token": "nope"}}
    });
    bad.send(Message::Text(req.to_string().into())).await.unwrap();
    assert_eq!(next_json(&mut bad).await["event"], "auth.error");

    let (mut good, _) = connect(port).await;
    let req = json!({
        "type": "req", "id": "a2", "method": "connect",
        "params": {"client": {"id": "gui", "source": "gui"}, "auth": {"type": "token", "token": "s3cret"}}
    });
    good.send(Message::Text(req.to_string().into())).await.unwrap();
    assert_eq!(next_json(&mut good).await["event"], "auth.ok");

    let res = request(&mut good, "g1", "state.get", json!({"key": "stt_ready"})).await;
    assert_eq!(res["ok"], true);
    assert!(res["payload"]["entry"].is_null());
}
