//! WebSocket connection handlers
//!
//! Each upgraded socket is split into a reader loop, which owns the
//! socket's routing link, and a writer task that drains the socket's
//! outbound queue. Whichever side ends first brings the other down through
//! the shared cancellation token.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tr_core::RelayError;
use tr_protocol::{AgentId, Frame};

use crate::connection::{Outbound, PeerHandle};
use crate::router::{AgentLink, OperatorFlow, OperatorLink};
use crate::server::http;
use crate::state::RelayState;

/// Header carrying the agent's default node name
pub const NODE_NAME_HEADER: &str = "x-node-name";

/// Header carrying the agent's pass-through credential
pub const API_KEY_HEADER: &str = "x-api-key";

/// Sent to operators that open `/terminal` without an agent id
pub const MISSING_AGENT_ID: &str = "Missing agentId parameter";

/// Sent to operators whose attach target is absent or offline
pub const AGENT_OFFLINE: &str = "Agent not connected or offline";

/// Sent to WebSocket clients that upgrade on any other path
pub const UNKNOWN_ENDPOINT: &str = "Unknown endpoint";

/// How long a closing socket gets to flush its queue
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// A peer that cannot take one message in this long is dropped
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Query parameters of the operator endpoint
#[derive(Debug, Default, Deserialize)]
pub struct TerminalParams {
    #[serde(rename = "agentId")]
    pub agent_id: Option<String>,
}

/// `GET /agent`: upgrade an agent connection
pub async fn agent_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let node_name = header_value(&headers, NODE_NAME_HEADER);
    let api_key = header_value(&headers, API_KEY_HEADER);

    ws.on_upgrade(move |socket| serve_agent(socket, state, peer_addr, node_name, api_key))
}

/// `GET /terminal?agentId=...`: upgrade an operator connection
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    Query(params): Query<TerminalParams>,
) -> Response {
    ws.on_upgrade(move |socket| serve_operator(socket, state, peer_addr, params.agent_id))
}

/// Fallback route. A WebSocket upgrade is accepted long enough to be told
/// the endpoint does not exist; plain HTTP gets a 404.
pub async fn unknown_endpoint(ws: Option<WebSocketUpgrade>, uri: Uri) -> Response {
    match ws {
        Some(ws) => {
            tracing::info!("WebSocket upgrade on unknown path {}", uri.path());
            ws.on_upgrade(reject_unknown)
        }
        None => http::not_found().await.into_response(),
    }
}

async fn reject_unknown(mut socket: WebSocket) {
    match Frame::error(UNKNOWN_ENDPOINT).encode() {
        Ok(text) => {
            let _ = socket.send(Message::Text(text)).await;
        }
        Err(e) => tracing::error!("Failed to encode error frame: {}", e),
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn serve_agent(
    socket: WebSocket,
    state: Arc<RelayState>,
    peer_addr: SocketAddr,
    node_name: Option<String>,
    api_key: Option<String>,
) {
    tracing::info!(
        "Agent connection attempt from {} ({})",
        peer_addr,
        node_name.as_deref().unwrap_or("unnamed")
    );

    let (sink, mut stream) = socket.split();
    let (handle, rx) = state.new_peer();
    let writer = tokio::spawn(pump_outbound(sink, rx, handle.token().clone()));

    let mut link = AgentLink::new(state, handle.clone(), peer_addr, node_name, api_key);

    // An abort from the keepalive sweep must reach the cascade below even
    // while a frame is mid-flight.
    while let Some(text) = next_text(&mut stream, &handle, peer_addr).await {
        tokio::select! {
            _ = handle.closed() => break,
            _ = link.handle_text(&text) => {}
        }
    }

    let closed = link.close().await;
    tracing::debug!(
        "Agent socket from {} finished, {} session(s) cascaded",
        peer_addr,
        closed
    );
    handle.close();
    finish(writer, &handle).await;
}

async fn serve_operator(
    socket: WebSocket,
    state: Arc<RelayState>,
    peer_addr: SocketAddr,
    agent_id: Option<String>,
) {
    let (sink, mut stream) = socket.split();
    let (handle, rx) = state.new_peer();
    let writer = tokio::spawn(pump_outbound(sink, rx, handle.token().clone()));

    let Some(agent_id) = agent_id.filter(|id| !id.is_empty()).map(AgentId::new) else {
        tracing::info!("Operator from {} connected without agentId", peer_addr);
        reject(&handle, MISSING_AGENT_ID);
        finish(writer, &handle).await;
        return;
    };

    let link = match OperatorLink::attach(state, handle.clone(), agent_id.clone()).await {
        Ok(link) => link,
        Err(e) => {
            tracing::info!("Rejected operator from {} for {}: {}", peer_addr, agent_id, e);
            reject(&handle, &operator_message(&e));
            finish(writer, &handle).await;
            return;
        }
    };

    while let Some(text) = next_text(&mut stream, &handle, peer_addr).await {
        let flow = tokio::select! {
            _ = handle.closed() => break,
            flow = link.handle_text(&text) => flow,
        };
        if flow == OperatorFlow::Close {
            break;
        }
    }

    let session_id = link.session_id().clone();
    if link.close().await {
        tracing::debug!("Operator for session {} detached", session_id);
    }
    handle.close();
    finish(writer, &handle).await;
}

/// Wait for the next text message, or `None` once the socket is done.
///
/// Binary messages are accepted if they hold UTF-8. Control frames are
/// answered by the WebSocket layer and skipped here.
async fn next_text(
    stream: &mut SplitStream<WebSocket>,
    handle: &PeerHandle,
    peer_addr: SocketAddr,
) -> Option<String> {
    loop {
        let msg = tokio::select! {
            _ = handle.closed() => return None,
            msg = stream.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => return Some(text),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => return Some(text),
                Err(_) => {
                    tracing::warn!("Dropping non-UTF-8 binary message from {}", peer_addr);
                }
            },
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let err = RelayError::TransportFault(e.to_string());
                tracing::warn!("Connection from {} failed: {}", peer_addr, err);
                return None;
            }
        }
    }
}

/// Drain a socket's outbound queue into its sink.
///
/// Stops on `Outbound::Close`, on a write failure or stall, or when the
/// token is cancelled. The token is always cancelled on the way out so the
/// reader loop stops too.
async fn pump_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = rx.recv() => command,
        };

        match command {
            Some(Outbound::Text(text)) => {
                let write = tokio::select! {
                    _ = cancel.cancelled() => break,
                    write = tokio::time::timeout(
                        WRITE_TIMEOUT,
                        sink.send(Message::Text(text)),
                    ) => write,
                };
                match write {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!("Socket write failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Socket write stalled for {:?}, dropping peer",
                            WRITE_TIMEOUT
                        );
                        cancel.cancel();
                        return;
                    }
                }
            }
            Some(Outbound::Close) | None => break,
        }
    }

    let _ = tokio::time::timeout(WRITE_TIMEOUT, async {
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    })
    .await;
    cancel.cancel();
}

/// Send an `error` frame and close
fn reject(handle: &PeerHandle, message: &str) {
    handle.close_with(&Frame::error(message));
}

/// Give the writer a bounded window to flush, then tear it down
async fn finish(mut writer: JoinHandle<()>, handle: &PeerHandle) {
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        tracing::debug!("Writer did not flush within {:?}, aborting", WRITER_GRACE);
        handle.abort();
        writer.abort();
    }
}

fn operator_message(err: &RelayError) -> String {
    match err {
        RelayError::AgentOffline(_) => AGENT_OFFLINE.to_string(),
        other => other.to_string(),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
