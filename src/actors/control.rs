//! ControlChannelActor - Persistent WebSocket link to the central service
//!
//! ## Lifecycle
//!
//! ```text
//! CONNECTING ──ok──► CONNECTED ──close / error──► RECONNECTING ──delay──► CONNECTING
//!     │                                                ▲
//!     └──────────────────error─────────────────────────┘
//! ```
//!
//! While connected the actor sends a heartbeat every interval (the first one
//! right after the handshake), answers commands through the
//! [`CommandDispatcher`] and acknowledges those that ask for it. Reconnect
//! delays follow the shared backoff policy and reset after the first
//! heartbeat that goes out on a new connection.
//!
//! Commands to the actor itself are served in every state, including the
//! handshake and the reconnect wait.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use sysinfo::System;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument, trace, warn};

use crate::actors::forwarder::ForwarderHandle;
use crate::backoff::Backoff;
use crate::buffer::BufferStore;
use crate::commands::{CommandDispatcher, CommandEffect};
use crate::config::ControlConfig;
use crate::health::LinkStatusStore;
use crate::protocol::{AckPayload, HeartbeatPayload, InboundMessage, OutboundMessage, classify};

use super::SHUTDOWN_TIMEOUT;
use super::messages::{ControlCommand, ControlState, ControlStats};

/// Longest a single outbound frame may take
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest a heartbeat waits for forwarder statistics
const FORWARDER_STATS_TIMEOUT: Duration = Duration::from_millis(250);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Why the control socket could not be opened or was lost
#[derive(Debug, Error)]
pub enum ControlChannelError {
    #[error("invalid control request: {0}")]
    InvalidRequest(String),

    #[error("handshake timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    #[error("closed: {0}")]
    Closed(String),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the actor does after handling one of its own commands
enum Flow {
    Continue,
    Stop(Option<oneshot::Sender<()>>),
}

/// Result of one connection attempt
enum Attempt {
    Connected(Box<WsStream>),
    Failed(ControlChannelError),
    Stop(Option<oneshot::Sender<()>>),
}

/// How a connected session ended
enum SessionEnd {
    Shutdown(Option<oneshot::Sender<()>>),
    Lost(ControlChannelError),
}

/// Reply and side effects of one inbound frame
#[derive(Debug, Default)]
struct FrameOutcome {
    ack: Option<AckPayload>,
    heartbeat_interval: Option<Duration>,
    link_alive: bool,
}

pub struct ControlChannelActor {
    config: ControlConfig,
    gateway_id: String,
    organization_id: Option<String>,
    buffer: Arc<dyn BufferStore>,
    dispatcher: CommandDispatcher,
    forwarder: ForwarderHandle,

    /// Control link status, read by the health reporter
    link: LinkStatusStore,

    command_rx: mpsc::Receiver<ControlCommand>,
    stats: ControlStats,

    /// Current heartbeat period, may be changed by the central service
    heartbeat_interval: Duration,

    /// Queue depth reported by the last heartbeat that could read the buffer
    last_queue_depth: Option<u64>,

    backoff: Backoff,
    system: System,
}

impl ControlChannelActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControlConfig,
        gateway_id: String,
        organization_id: Option<String>,
        buffer: Arc<dyn BufferStore>,
        dispatcher: CommandDispatcher,
        forwarder: ForwarderHandle,
        link: LinkStatusStore,
        command_rx: mpsc::Receiver<ControlCommand>,
    ) -> Self {
        let heartbeat_interval = config.heartbeat_interval;
        let backoff = Backoff::new(config.backoff);
        Self {
            stats: ControlStats::new(heartbeat_interval.as_secs()),
            config,
            gateway_id,
            organization_id,
            buffer,
            dispatcher,
            forwarder,
            link,
            command_rx,
            heartbeat_interval,
            last_queue_depth: None,
            backoff,
            system: System::new(),
        }
    }

    #[instrument(skip(self), fields(url = %self.config.url))]
    pub async fn run(mut self) {
        info!(
            "starting control channel (heartbeat every {:?})",
            self.heartbeat_interval
        );

        let shutdown_ack = loop {
            self.stats.state = if self.stats.connections == 0 {
                ControlState::Connecting
            } else {
                ControlState::Reconnecting
            };

            match self.connect_or_stop().await {
                Attempt::Stop(ack) => break ack,
                Attempt::Connected(stream) => match self.run_session(*stream).await {
                    SessionEnd::Shutdown(ack) => break ack,
                    SessionEnd::Lost(reason) => self.connection_lost(reason).await,
                },
                Attempt::Failed(e) => self.connection_lost(e).await,
            }

            if let Flow::Stop(ack) = self.wait_before_reconnect().await {
                break ack;
            }
        };

        self.stats.state = ControlState::Disconnected;
        info!("control channel stopped");
        if let Some(tx) = shutdown_ack {
            let _ = tx.send(());
        }
    }

    /// Run the handshake while still serving actor commands.
    async fn connect_or_stop(&mut self) -> Attempt {
        debug!("connecting control channel");

        let connecting = connect(self.config.clone(), self.gateway_id.clone());
        tokio::pin!(connecting);

        loop {
            tokio::select! {
                result = &mut connecting => {
                    return match result {
                        Ok(stream) => Attempt::Connected(Box::new(stream)),
                        Err(e) => Attempt::Failed(e),
                    };
                }
                cmd = self.command_rx.recv() => {
                    if let Flow::Stop(ack) = self.handle_command(cmd) {
                        return Attempt::Stop(ack);
                    }
                }
            }
        }
    }

    async fn wait_before_reconnect(&mut self) -> Flow {
        let delay = self.backoff.next_delay();
        info!(
            "reconnecting control channel in {:?} (attempt {})",
            delay,
            self.backoff.attempt()
        );
        let wake_at = Instant::now() + delay;

        loop {
            tokio::select! {
                _ = sleep_until(wake_at) => return Flow::Continue,
                cmd = self.command_rx.recv() => {
                    if let Flow::Stop(ack) = self.handle_command(cmd) {
                        return Flow::Stop(ack);
                    }
                }
            }
        }
    }

    async fn connection_lost(&mut self, error: ControlChannelError) {
        warn!("control channel down: {}", error);
        let reason = error.to_string();
        self.stats.state = ControlState::Reconnecting;
        self.stats.last_error = Some(reason.clone());
        self.link.record_failure(reason).await;
    }

    async fn run_session(&mut self, stream: WsStream) -> SessionEnd {
        let (mut sink, mut source): (WsSink, WsSource) = stream.split();

        self.stats.state = ControlState::Connected;
        self.stats.connections += 1;
        self.stats.last_connected = Some(Utc::now());
        info!("control channel connected");

        // first tick completes immediately: heartbeat right after the handshake
        let mut heartbeat = interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut first_heartbeat = true;

        loop {
            tokio::select! {
                biased;

                cmd = self.command_rx.recv() => {
                    if let Flow::Stop(ack) = self.handle_command(cmd) {
                        let _ = timeout(SEND_TIMEOUT, sink.send(Message::Close(None))).await;
                        return SessionEnd::Shutdown(ack);
                    }
                }

                _ = heartbeat.tick() => {
                    let Some(payload) = self.heartbeat_payload().await else {
                        continue;
                    };
                    let frame = OutboundMessage::Heartbeat(payload);
                    if let Err(e) = send(&mut sink, &frame).await {
                        return SessionEnd::Lost(e);
                    }

                    self.stats.heartbeats_sent += 1;
                    self.link.record_success().await;
                    if first_heartbeat {
                        self.backoff.reset();
                        first_heartbeat = false;
                    }
                    trace!("heartbeat sent");
                }

                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let outcome = self.handle_frame(&text);

                        if outcome.link_alive {
                            self.link.record_success().await;
                        }

                        if let Some(period) = outcome.heartbeat_interval {
                            info!("heartbeat interval changed to {:?}", period);
                            self.heartbeat_interval = period;
                            self.stats.heartbeat_interval_secs = period.as_secs();
                            heartbeat = interval_at(Instant::now() + period, period);
                            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        }

                        if let Some(ack) = outcome.ack {
                            let command_id = ack.command_id.clone();
                            if let Err(e) = send(&mut sink, &OutboundMessage::Ack(ack)).await {
                                warn!("ack for command {} not sent", command_id);
                                return SessionEnd::Lost(e);
                            }
                            self.stats.acks_sent += 1;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("by server ({}): {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "by server".to_string());
                        return SessionEnd::Lost(ControlChannelError::Closed(reason));
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!("ignoring binary frame on control channel");
                    }
                    Some(Ok(_)) => {
                        // ping/pong are answered by tungstenite
                    }
                    Some(Err(e)) => {
                        return SessionEnd::Lost(ControlChannelError::Transport(e.to_string()));
                    }
                    None => {
                        return SessionEnd::Lost(ControlChannelError::Closed(
                            "stream ended".to_string(),
                        ));
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, text: &str) -> FrameOutcome {
        match classify(text) {
            InboundMessage::HeartbeatAck => {
                trace!("heartbeat acknowledged");
                FrameOutcome {
                    link_alive: true,
                    ..Default::default()
                }
            }

            InboundMessage::Command(envelope) => {
                self.stats.commands_received += 1;
                let mut outcome = FrameOutcome::default();

                match self.dispatcher.dispatch(&envelope) {
                    Ok(effect) => {
                        info!(
                            "accepted command {} ({})",
                            envelope.id, envelope.command_type
                        );
                        if let CommandEffect::HeartbeatInterval(period) = effect {
                            outcome.heartbeat_interval = Some(period);
                        }
                        if envelope.requires_ack {
                            outcome.ack = Some(AckPayload::accepted(&envelope.id));
                        }
                    }
                    Err(e) => {
                        warn!(
                            "rejected command {} ({}): {}",
                            envelope.id, envelope.command_type, e
                        );
                        if envelope.requires_ack {
                            outcome.ack = Some(AckPayload::rejected(&envelope.id, e.to_string()));
                        }
                    }
                }

                outcome
            }

            InboundMessage::MalformedCommand {
                id,
                requires_ack,
                reason,
            } => {
                self.stats.commands_received += 1;
                warn!("malformed command frame: {}", reason);

                FrameOutcome {
                    ack: id
                        .filter(|_| requires_ack)
                        .map(|id| AckPayload::rejected(id, format!("malformed command: {reason}"))),
                    ..Default::default()
                }
            }

            InboundMessage::Ack { command_id } => {
                debug!("central acknowledged {:?}", command_id);
                FrameOutcome::default()
            }

            InboundMessage::Unrecognized { kind } => {
                debug!("ignoring unrecognized frame (type {:?})", kind);
                FrameOutcome::default()
            }
        }
    }

    /// Build the next heartbeat.
    ///
    /// When the buffer cannot be read the last known depth is reported instead;
    /// with no known depth yet the heartbeat is skipped (`None`).
    async fn heartbeat_payload(&mut self) -> Option<HeartbeatPayload> {
        let mut metrics = BTreeMap::new();

        let queue_depth = match self.buffer.stats().await {
            Ok(stats) => {
                metrics.insert("pending".to_string(), json!(stats.pending));
                metrics.insert("inFlight".to_string(), json!(stats.in_flight));
                metrics.insert("delivered".to_string(), json!(stats.delivered));
                self.last_queue_depth = Some(stats.depth());
                stats.depth()
            }
            Err(e) => {
                let Some(depth) = self.last_queue_depth else {
                    warn!("skipping heartbeat, buffer stats unavailable: {}", e);
                    return None;
                };
                warn!("heartbeat reports last known queue depth {}: {}", depth, e);
                metrics.insert("bufferError".to_string(), Value::String(e.to_string()));
                metrics.insert("queueDepthStale".to_string(), Value::Bool(true));
                depth
            }
        };

        if let Ok(Some(forwarder)) =
            timeout(FORWARDER_STATS_TIMEOUT, self.forwarder.get_stats()).await
        {
            metrics.insert(
                "forwarderConsecutiveFailures".to_string(),
                json!(forwarder.consecutive_failures),
            );
        }

        self.system.refresh_memory();
        metrics.insert("memoryUsed".to_string(), json!(self.system.used_memory()));
        metrics.insert("memoryTotal".to_string(), json!(self.system.total_memory()));

        let load = System::load_average();
        metrics.insert(
            "loadAverage".to_string(),
            json!([load.one, load.five, load.fifteen]),
        );

        Some(HeartbeatPayload {
            gateway_id: self.gateway_id.clone(),
            queue_depth,
            timestamp: Utc::now(),
            organization_id: self.organization_id.clone(),
            metrics,
        })
    }

    fn handle_command(&mut self, cmd: Option<ControlCommand>) -> Flow {
        match cmd {
            Some(ControlCommand::GetState { respond_to }) => {
                let _ = respond_to.send(self.stats.clone());
                Flow::Continue
            }
            Some(ControlCommand::Shutdown { respond_to }) => {
                debug!("received shutdown command");
                Flow::Stop(Some(respond_to))
            }
            None => {
                warn!("command channel closed, shutting down");
                Flow::Stop(None)
            }
        }
    }
}

/// Open the control socket with the gateway's credentials.
async fn connect(config: ControlConfig, gateway_id: String) -> Result<WsStream, ControlChannelError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(invalid_request)?;

    let headers = request.headers_mut();
    if let Some(token) = &config.token {
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).map_err(invalid_request)?,
        );
    }
    headers.insert(
        "x-gateway-id",
        HeaderValue::from_str(&gateway_id).map_err(invalid_request)?,
    );
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("edge-gateway/", env!("CARGO_PKG_VERSION"))),
    );

    let (stream, response) = timeout(config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| ControlChannelError::ConnectTimeout(config.connect_timeout))?
        .map_err(|e| ControlChannelError::Connect(e.to_string()))?;

    debug!("control handshake complete ({})", response.status());
    Ok(stream)
}

fn invalid_request(e: impl std::fmt::Display) -> ControlChannelError {
    ControlChannelError::InvalidRequest(e.to_string())
}

async fn send(sink: &mut WsSink, message: &OutboundMessage) -> Result<(), ControlChannelError> {
    let text = message.to_json()?;

    timeout(SEND_TIMEOUT, sink.send(Message::Text(text)))
        .await
        .map_err(|_| ControlChannelError::SendTimeout(SEND_TIMEOUT))?
        .map_err(|e| ControlChannelError::Transport(e.to_string()))
}

/// Handle for controlling the ControlChannelActor
#[derive(Clone)]
pub struct ControlHandle {
    sender: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    pub fn spawn(
        config: ControlConfig,
        gateway_id: String,
        organization_id: Option<String>,
        buffer: Arc<dyn BufferStore>,
        dispatcher: CommandDispatcher,
        forwarder: ForwarderHandle,
        link: LinkStatusStore,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = ControlChannelActor::new(
            config,
            gateway_id,
            organization_id,
            buffer,
            dispatcher,
            forwarder,
            link,
            cmd_rx,
        );
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn get_state(&self) -> Option<ControlStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControlCommand::GetState { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ControlCommand::Shutdown { respond_to: tx })
            .await
            .is_err()
        {
            return;
        }

        if timeout(SHUTDOWN_TIMEOUT, rx).await.is_err() {
            warn!("control channel did not stop within {:?}", SHUTDOWN_TIMEOUT);
        }
    }
}
