//! Agent event loop
//!
//! Keeps one tunnel to the relay alive and maps its events onto local PTY
//! sessions. Reconnects with backoff whenever the tunnel drops.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tr_core::config::AgentConfig;
use tr_protocol::{SessionId, TerminalSize};

use crate::pty::{spawn_pty_reader, PtyManager, PtyOutput};
use crate::tunnel::{ActiveTunnel, ConnectionError, ExponentialBackoff, TunnelConnector, TunnelEvent};

const PTY_OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for a reader task after its PTY is closed
const READER_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Pause between a dropped tunnel and the next connect attempt
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Why the event loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Tunnel closed or failed
    Disconnected,
    /// Local shutdown requested
    Cancelled,
}

/// Agent state across reconnects
pub struct AgentRuntime {
    connector: TunnelConnector,
    pty: PtyManager,
    readers: HashMap<SessionId, (JoinHandle<()>, CancellationToken)>,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig) -> Self {
        let pty = PtyManager::new(config.default_shell.clone(), config.default_env.clone());
        Self {
            connector: TunnelConnector::new(config),
            pty,
            readers: HashMap::new(),
        }
    }

    /// Node name announced to the relay
    pub fn node_name(&self) -> &str {
        self.connector.node_name()
    }

    /// Connect, serve, reconnect, until cancelled.
    ///
    /// Returns an error only when the relay request itself is unusable.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = ExponentialBackoff::from_config(&self.connector.config().backoff);

        loop {
            let mut tunnel = match self.connector.connect_with_retry(&mut backoff, &cancel).await {
                Ok(tunnel) => tunnel,
                Err(ConnectionError::Cancelled) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            let exit = self.serve(&mut tunnel, &cancel).await;
            let closed = self.close_all_sessions().await;
            if closed > 0 {
                tracing::info!("Closed {} session(s) after tunnel loss", closed);
            }
            tunnel.close().await;

            if exit == LoopExit::Cancelled {
                tracing::info!("Agent shutting down");
                return Ok(());
            }

            tracing::warn!("Disconnected from relay");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
            }
            tracing::info!("Reconnecting...");
        }
    }

    /// Run the event loop for one registered tunnel
    pub async fn serve(&mut self, tunnel: &mut ActiveTunnel, cancel: &CancellationToken) -> LoopExit {
        let (output_tx, mut output_rx) = mpsc::channel::<PtyOutput>(PTY_OUTPUT_CHANNEL_CAPACITY);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LoopExit::Cancelled,

                event = tunnel.recv_event() => {
                    let Some(event) = event else {
                        return LoopExit::Disconnected;
                    };
                    if !self.handle_event(tunnel, event, &output_tx).await {
                        return LoopExit::Disconnected;
                    }
                }

                Some(output) = output_rx.recv() => {
                    if !self.handle_output(tunnel, output).await {
                        return LoopExit::Disconnected;
                    }
                }
            }
        }
    }

    /// Returns false once the tunnel is unusable
    async fn handle_event(
        &mut self,
        tunnel: &mut ActiveTunnel,
        event: TunnelEvent,
        output_tx: &mpsc::Sender<PtyOutput>,
    ) -> bool {
        let sent = match event {
            TunnelEvent::StartShell { session_id, size } => {
                self.start_shell(tunnel, session_id, size, output_tx).await
            }

            TunnelEvent::Data { session_id, data } => {
                if let Err(e) = self.pty.write(&session_id, data.as_bytes()) {
                    tracing::warn!("Failed to write to session {}: {}", session_id, e);
                }
                Ok(())
            }

            TunnelEvent::Resize { session_id, size } => {
                if let Err(e) = self.pty.resize(&session_id, size) {
                    tracing::warn!("Failed to resize session {}: {}", session_id, e);
                }
                Ok(())
            }

            // Relay already dropped the session; no echo
            TunnelEvent::CloseShell { session_id } => {
                tracing::info!("Relay closed session {}", session_id);
                self.close_session(&session_id).await;
                Ok(())
            }

            TunnelEvent::Ping => {
                tracing::trace!("Ping received, sending pong");
                tunnel.send_pong().await
            }

            TunnelEvent::Disconnected => return false,
        };

        match sent {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to send to relay: {}", e);
                false
            }
        }
    }

    async fn start_shell(
        &mut self,
        tunnel: &mut ActiveTunnel,
        session_id: SessionId,
        size: TerminalSize,
        output_tx: &mpsc::Sender<PtyOutput>,
    ) -> Result<(), ConnectionError> {
        tracing::info!("Starting shell for session {}", session_id);

        match self.pty.spawn(session_id.clone(), size) {
            Ok(reader) => {
                let cancel_token = CancellationToken::new();
                let handle = spawn_pty_reader(
                    session_id.clone(),
                    reader,
                    output_tx.clone(),
                    cancel_token.clone(),
                );
                self.readers.insert(session_id, (handle, cancel_token));
                Ok(())
            }
            Err(e) => {
                tracing::error!("Failed to start shell for session {}: {:#}", session_id, e);
                tunnel
                    .send_error(&session_id, format!("Failed to start shell: {:#}", e))
                    .await
            }
        }
    }

    async fn handle_output(&mut self, tunnel: &mut ActiveTunnel, output: PtyOutput) -> bool {
        let sent = match output {
            PtyOutput::Data { session_id, data } => {
                if !self.pty.contains(&session_id) {
                    return true;
                }
                tunnel.send_data(&session_id, data).await
            }
            PtyOutput::Exited { session_id } => {
                // Sessions closed by the relay are already gone
                if !self.pty.contains(&session_id) {
                    return true;
                }
                tracing::info!("Shell for session {} exited", session_id);
                self.close_session(&session_id).await;
                tunnel.send_close_shell(&session_id).await
            }
        };

        match sent {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to send to relay: {}", e);
                false
            }
        }
    }

    /// Kill a session's shell and reap its reader
    async fn close_session(&mut self, session_id: &SessionId) {
        if let Some(code) = self.pty.close(session_id) {
            tracing::debug!("Session {} exited with code {}", session_id, code);
        }

        if let Some((handle, cancel_token)) = self.readers.remove(session_id) {
            cancel_token.cancel();
            let _ = tokio::time::timeout(READER_SHUTDOWN_GRACE, handle).await;
            tracing::debug!("Reader task cleaned up for session {}", session_id);
        }
    }

    /// Kill every shell, returning how many were live
    pub async fn close_all_sessions(&mut self) -> usize {
        let ids = self.pty.list_sessions();
        for id in &ids {
            self.close_session(id).await;
        }
        // Readers whose shells already exited
        for (_, (handle, cancel_token)) in self.readers.drain() {
            cancel_token.cancel();
            handle.abort();
        }
        ids.len()
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.pty.len()
    }
}

/// Run an agent until cancelled
pub async fn run(config: AgentConfig, cancel: CancellationToken) -> Result<()> {
    let mut runtime = AgentRuntime::new(config);
    tracing::info!("Agent node name: {}", runtime.node_name());
    runtime.run(cancel).await
}
