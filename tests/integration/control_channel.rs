//! Integration tests for the control channel against an in-process central
//! service mock (axum websocket server)
//!
//! These tests verify that:
//! - The gateway authenticates and sends a heartbeat right after connecting
//! - Commands are acknowledged exactly once when they ask for it
//! - A `flush` command reaches the forwarder
//! - A dropped connection degrades health and is re-established

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
    routing::get,
};
use edge_gateway::{
    actors::{control::ControlHandle, messages::ControlState},
    backoff::BackoffPolicy,
    buffer::{BufferStore, MemoryBuffer},
    collector::Collector,
    commands::CommandDispatcher,
    config::ControlConfig,
    health::{HealthReporter, LinkStatusStore},
};
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use url::Url;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{GATEWAY_ID, health_config, spawn_forwarder, spawn_retention, wait_for, wire_record};

#[derive(Debug, Clone)]
enum Action {
    Send(String),
    /// Drop the connection without a close frame
    Drop,
}

struct Shared {
    inbound: mpsc::UnboundedSender<Value>,
    actions: broadcast::Sender<Action>,
    handshakes: Mutex<Vec<HeaderMap>>,
}

struct MockCentral {
    addr: SocketAddr,
    inbound: mpsc::UnboundedReceiver<Value>,
    shared: Arc<Shared>,
}

impl MockCentral {
    async fn start() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (actions, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            inbound: inbound_tx,
            actions,
            handshakes: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/control", get(ws_handler))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            inbound: inbound_rx,
            shared,
        }
    }

    fn url(&self) -> Url {
        Url::parse(&format!("ws://{}/control", self.addr)).unwrap()
    }

    fn send(&self, frame: Value) {
        self.shared
            .actions
            .send(Action::Send(frame.to_string()))
            .unwrap();
    }

    fn drop_connections(&self) {
        self.shared.actions.send(Action::Drop).unwrap();
    }

    fn handshakes(&self) -> Vec<HeaderMap> {
        self.shared.handshakes.lock().unwrap().clone()
    }

    /// Next frame of the given `type`, skipping others
    async fn next_frame(&mut self, kind: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let frame = self.inbound.recv().await.unwrap();
                if frame["type"] == kind {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no `{kind}` frame within 5s"))
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(shared): State<Arc<Shared>>,
) -> Response {
    shared.handshakes.lock().unwrap().push(headers);
    let actions = shared.actions.subscribe();
    let inbound = shared.inbound.clone();
    ws.on_upgrade(move |socket| session(socket, actions, inbound))
}

async fn session(
    mut socket: WebSocket,
    mut actions: broadcast::Receiver<Action>,
    inbound: mpsc::UnboundedSender<Value>,
) {
    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str(&text) {
                        let _ = inbound.send(frame);
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            action = actions.recv() => match action {
                Ok(Action::Send(text)) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Action::Drop) | Err(_) => break,
            },
        }
    }
}

struct Gateway {
    control: ControlHandle,
    link: LinkStatusStore,
    buffer: Arc<dyn BufferStore>,
    health: HealthReporter,
}

fn spawn_gateway(url: Url, uplink_base: &str, heartbeat: Duration) -> Gateway {
    let buffer: Arc<dyn BufferStore> = Arc::new(MemoryBuffer::new());
    let (forwarder, delivery) = spawn_forwarder(buffer.clone(), uplink_base, 100);
    let retention = spawn_retention(buffer.clone());
    let link = LinkStatusStore::disconnected();

    let config = ControlConfig {
        url,
        token: Some("control-token".to_string()),
        heartbeat_interval: heartbeat,
        connect_timeout: Duration::from_secs(2),
        backoff: BackoffPolicy::new(Duration::from_millis(50), Duration::from_millis(200)),
    };

    let control = ControlHandle::spawn(
        config,
        GATEWAY_ID.to_string(),
        Some("org-test".to_string()),
        buffer.clone(),
        CommandDispatcher::new(forwarder.clone(), retention),
        forwarder,
        link.clone(),
    );

    let mut health_config = health_config();
    health_config.disconnect_threshold = Duration::ZERO;
    let health = HealthReporter::new(
        GATEWAY_ID,
        buffer.clone(),
        delivery,
        Some(link.clone()),
        health_config,
    );

    Gateway {
        control,
        link,
        buffer,
        health,
    }
}

fn command(id: &str, command_type: &str, payload: Value, requires_ack: bool) -> Value {
    json!({
        "type": "command",
        "command": {"id": id, "type": command_type, "payload": payload, "requiresAck": requires_ack}
    })
}

#[tokio::test]
async fn test_heartbeat_after_connect() {
    let mut central = MockCentral::start().await;
    let gateway = spawn_gateway(central.url(), "http://127.0.0.1:9", Duration::from_secs(3600));

    let heartbeat = central.next_frame("heartbeat").await;
    assert_eq!(heartbeat["gatewayId"], GATEWAY_ID);
    assert_eq!(heartbeat["organizationId"], "org-test");
    assert_eq!(heartbeat["queueDepth"], 0);
    assert!(heartbeat["timestamp"].is_string());
    assert_eq!(heartbeat["metrics"]["pending"], 0);

    let handshakes = central.handshakes();
    let handshake = &handshakes[0];
    assert_eq!(handshake["authorization"], "Bearer control-token");
    assert_eq!(handshake["x-gateway-id"], GATEWAY_ID);

    assert!(wait_for(Duration::from_secs(2), || gateway.link.is_connected()).await);
    let state = gateway.control.get_state().await.unwrap();
    assert_eq!(state.state, ControlState::Connected);
    assert_eq!(state.connections, 1);

    gateway.control.shutdown().await;
}

#[tokio::test]
async fn test_commands_are_acknowledged() {
    let mut central = MockCentral::start().await;
    let gateway = spawn_gateway(central.url(), "http://127.0.0.1:9", Duration::from_secs(3600));
    central.next_frame("heartbeat").await;

    central.send(command("c-1", "self-destruct", json!({}), true));
    let ack = central.next_frame("ack").await;
    assert_eq!(ack["commandId"], "c-1");
    assert_eq!(ack["status"], "rejected");
    assert!(ack["error"].as_str().unwrap().contains("self-destruct"));

    // no ack requested, none sent; the following ack belongs to c-3
    central.send(command("c-2", "ping", Value::Null, false));
    central.send(command("c-3", "ping", Value::Null, true));
    let ack = central.next_frame("ack").await;
    assert_eq!(ack["commandId"], "c-3");
    assert_eq!(ack["status"], "accepted");
    assert!(ack.get("error").is_none());

    central.send(json!({"type": "command", "command": {"id": "c-4", "requiresAck": true}}));
    let ack = central.next_frame("ack").await;
    assert_eq!(ack["commandId"], "c-4");
    assert_eq!(ack["status"], "rejected");

    let state = gateway.control.get_state().await.unwrap();
    assert_eq!(state.state, ControlState::Connected);
    assert_eq!(state.commands_received, 4);
    assert_eq!(state.acks_sent, 3);
    assert_eq!(state.connections, 1);

    gateway.control.shutdown().await;
}

#[tokio::test]
async fn test_flush_command_reaches_forwarder() {
    let uplink = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&uplink)
        .await;

    let mut central = MockCentral::start().await;
    let gateway = spawn_gateway(central.url(), &uplink.uri(), Duration::from_secs(3600));
    central.next_frame("heartbeat").await;

    let collector = Collector::new(gateway.buffer.clone(), GATEWAY_ID, None, 10);
    collector
        .ingest_batch(GATEWAY_ID, None, vec![wire_record("a"), wire_record("b")])
        .await
        .unwrap();

    central.send(command("c-1", "flush", Value::Null, true));
    let ack = central.next_frame("ack").await;
    assert_eq!(ack["status"], "accepted");

    let buffer = gateway.buffer.clone();
    assert!(
        wait_for(Duration::from_secs(5), || {
            let buffer = buffer.clone();
            async move { buffer.depth().await.unwrap() == 0 }
        })
        .await
    );
    assert_eq!(gateway.buffer.stats().await.unwrap().delivered, 2);

    gateway.control.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_interval_can_be_changed() {
    let mut central = MockCentral::start().await;
    let gateway = spawn_gateway(central.url(), "http://127.0.0.1:9", Duration::from_secs(3600));
    central.next_frame("heartbeat").await;

    central.send(command(
        "c-1",
        "set_heartbeat_interval",
        json!({"intervalSecs": 1}),
        true,
    ));
    assert_eq!(central.next_frame("ack").await["status"], "accepted");

    // would take an hour with the old interval
    central.next_frame("heartbeat").await;
    let state = gateway.control.get_state().await.unwrap();
    assert_eq!(state.heartbeat_interval_secs, 1);
    assert!(state.heartbeats_sent >= 2);

    gateway.control.shutdown().await;
}

#[tokio::test]
async fn test_reconnects_after_connection_loss() {
    let mut central = MockCentral::start().await;
    let gateway = spawn_gateway(central.url(), "http://127.0.0.1:9", Duration::from_secs(3600));
    central.next_frame("heartbeat").await;

    central.drop_connections();

    let link = gateway.link.clone();
    assert!(
        wait_for(Duration::from_secs(2), || {
            let link = link.clone();
            async move { !link.is_connected().await }
        })
        .await
    );
    let snapshot = gateway.health.snapshot().await;
    assert!(!snapshot.uplink.connected);
    assert!(snapshot.control.unwrap().last_error.is_some());

    // a fresh heartbeat arrives on the new connection
    central.next_frame("heartbeat").await;
    assert!(wait_for(Duration::from_secs(2), || gateway.link.is_connected()).await);

    let state = gateway.control.get_state().await.unwrap();
    assert_eq!(state.connections, 2);
    assert_eq!(central.handshakes().len(), 2);

    gateway.control.shutdown().await;
}
