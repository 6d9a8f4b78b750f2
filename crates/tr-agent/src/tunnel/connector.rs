//! Outbound WebSocket connector
//!
//! Dials the relay's agent endpoint, completes the register handshake and
//! turns inbound frames into [`TunnelEvent`]s for the agent's event loop.

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use tr_core::config::AgentConfig;
use tr_protocol::{AgentId, Frame, ProtocolError, SessionId, TerminalSize};

use super::reconnect::ExponentialBackoff;

/// Capacity of the inbound event queue between the socket reader and the
/// event loop.
const TUNNEL_EVENT_CHANNEL_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Relay URL or connect headers are unusable; retrying will not help
    #[error("Invalid relay request: {0}")]
    InvalidRequest(String),

    /// Connect or register handshake took too long
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// WebSocket-level failure
    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// Relay sent something that is not a frame
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket closed before `registered` arrived
    #[error("Relay closed the connection before acknowledging registration")]
    NotRegistered,

    /// Shutdown requested while connecting
    #[error("Connection attempt cancelled")]
    Cancelled,
}

/// Events received from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Spawn a shell for a new session
    StartShell {
        session_id: SessionId,
        size: TerminalSize,
    },
    /// Operator input for a session
    Data { session_id: SessionId, data: String },
    /// Operator resized their terminal
    Resize {
        session_id: SessionId,
        size: TerminalSize,
    },
    /// Session is over; kill the shell
    CloseShell { session_id: SessionId },
    /// Keepalive probe
    Ping,
    /// Socket closed
    Disconnected,
}

impl TunnelEvent {
    /// Translate a relay frame. Frames the agent has no use for yield `None`.
    pub fn from_frame(frame: Frame) -> Option<Self> {
        let event = match frame {
            Frame::StartShell {
                session_id,
                cols,
                rows,
            } => TunnelEvent::StartShell {
                session_id,
                size: size_or_default(cols, rows),
            },

            Frame::Data {
                session_id: Some(session_id),
                data,
            } => TunnelEvent::Data { session_id, data },

            Frame::Resize {
                session_id: Some(session_id),
                cols,
                rows,
            } => TunnelEvent::Resize {
                session_id,
                size: size_or_default(cols, rows),
            },

            Frame::CloseShell {
                session_id: Some(session_id),
            } => TunnelEvent::CloseShell { session_id },

            Frame::Ping => TunnelEvent::Ping,

            Frame::Registered { agent_id } => {
                tracing::debug!("Relay re-acknowledged registration as {}", agent_id);
                return None;
            }

            other => {
                tracing::warn!("Unexpected {} frame from relay", other.frame_type().as_str());
                return None;
            }
        };
        Some(event)
    }
}

/// A zero dimension means "not given"
fn size_or_default(cols: u16, rows: u16) -> TerminalSize {
    let default = TerminalSize::default();
    TerminalSize::new(
        if cols == 0 { default.cols } else { cols },
        if rows == 0 { default.rows } else { rows },
    )
}

/// Establishes the outbound connection to the relay
pub struct TunnelConnector {
    config: AgentConfig,
    node_name: String,
}

impl TunnelConnector {
    /// Create a new tunnel connector
    pub fn new(config: AgentConfig) -> Self {
        let node_name = config.node_name();
        Self { config, node_name }
    }

    /// Get the agent configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Node name announced to the relay
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Connect, retrying with backoff until registered or cancelled.
    ///
    /// Invalid request errors are returned immediately. The backoff is reset
    /// once a registration succeeds.
    pub async fn connect_with_retry(
        &self,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> Result<ActiveTunnel, ConnectionError> {
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                attempt = self.try_connect() => attempt,
            };

            match attempt {
                Ok(tunnel) => {
                    tracing::info!(
                        "Registered with relay at {} as {}",
                        self.config.relay_url,
                        tunnel.agent_id()
                    );
                    backoff.reset();
                    return Ok(tunnel);
                }
                Err(e @ ConnectionError::InvalidRequest(_)) => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!("Connection failed: {}. Retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Attempt a single connection and registration
    pub async fn try_connect(&self) -> Result<ActiveTunnel, ConnectionError> {
        let request = self.build_request()?;
        let timeout = self.config.connect_timeout;

        tracing::debug!("Connecting to {}", self.config.relay_url);
        let (ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;

        let (mut sink, mut stream) = ws.split();

        let register = Frame::Register {
            node_name: Some(self.node_name.clone()),
        };
        sink.send(Message::Text(register.encode()?.into())).await?;

        let agent_id = tokio::time::timeout(timeout, wait_for_registered(&mut stream))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;

        let (event_tx, event_rx) = mpsc::channel(TUNNEL_EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_events(stream, event_tx));

        Ok(ActiveTunnel {
            agent_id,
            sink,
            event_rx,
            reader,
        })
    }

    fn build_request(&self) -> Result<Request, ConnectionError> {
        let mut request = self
            .config
            .relay_url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidRequest(format!("{}: {}", self.config.relay_url, e)))?;

        let headers = request.headers_mut();
        headers.insert("x-node-name", header(&self.node_name)?);
        if let Some(api_key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            headers.insert("x-api-key", header(api_key)?);
        }

        Ok(request)
    }
}

fn header(value: &str) -> Result<HeaderValue, ConnectionError> {
    HeaderValue::from_str(value)
        .map_err(|e| ConnectionError::InvalidRequest(format!("bad header value: {}", e)))
}

/// Read frames until `registered`, skipping anything else
async fn wait_for_registered(
    stream: &mut SplitStream<WsStream>,
) -> Result<AgentId, ConnectionError> {
    while let Some(msg) = stream.next().await {
        let Some(text) = message_text(msg?) else {
            continue;
        };
        match Frame::decode(&text) {
            Ok(Frame::Registered { agent_id }) => return Ok(agent_id),
            Ok(other) => {
                tracing::debug!(
                    "Ignoring {} frame while waiting for registration",
                    other.frame_type().as_str()
                );
            }
            Err(e) => tracing::warn!("Invalid frame from relay: {}", e),
        }
    }
    Err(ConnectionError::NotRegistered)
}

/// Reader task: socket frames to tunnel events
async fn read_events(mut stream: SplitStream<WsStream>, event_tx: mpsc::Sender<TunnelEvent>) {
    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("WebSocket read error: {}", e);
                break;
            }
        };
        if msg.is_close() {
            tracing::info!("Relay closed the connection");
            break;
        }
        let Some(text) = message_text(msg) else {
            continue;
        };

        let frame = match Frame::decode(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Invalid frame from relay: {}", e);
                continue;
            }
        };

        if let Some(event) = TunnelEvent::from_frame(frame) {
            if event_tx.send(event).await.is_err() {
                return;
            }
        }
    }

    let _ = event_tx.send(TunnelEvent::Disconnected).await;
}

fn message_text(msg: Message) -> Option<String> {
    match msg {
        Message::Text(text) => Some(text.as_str().to_string()),
        Message::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok(),
        _ => None,
    }
}

/// A registered connection to the relay
pub struct ActiveTunnel {
    agent_id: AgentId,
    sink: SplitSink<WsStream, Message>,
    event_rx: mpsc::Receiver<TunnelEvent>,
    reader: JoinHandle<()>,
}

impl ActiveTunnel {
    /// Id the relay assigned at registration
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Send a frame to the relay
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ConnectionError> {
        let text = frame.encode()?;
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Send shell output for a session
    pub async fn send_data(
        &mut self,
        session_id: &SessionId,
        data: String,
    ) -> Result<(), ConnectionError> {
        self.send(&Frame::Data {
            session_id: Some(session_id.clone()),
            data,
        })
        .await
    }

    /// Report that a session's shell has ended
    pub async fn send_close_shell(&mut self, session_id: &SessionId) -> Result<(), ConnectionError> {
        self.send(&Frame::close_shell(session_id.clone())).await
    }

    /// Report a session-scoped failure
    pub async fn send_error(
        &mut self,
        session_id: &SessionId,
        message: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        self.send(&Frame::error(message).with_session(session_id.clone()))
            .await
    }

    /// Answer a keepalive ping
    pub async fn send_pong(&mut self) -> Result<(), ConnectionError> {
        self.send(&Frame::Pong).await
    }

    /// Receive the next event from the relay
    pub async fn recv_event(&mut self) -> Option<TunnelEvent> {
        self.event_rx.recv().await
    }

    /// Close the connection
    pub async fn close(mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
        self.reader.abort();
    }
}
