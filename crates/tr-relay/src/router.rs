//! Frame routing between agents and operators
//!
//! One [`AgentLink`] or [`OperatorLink`] exists per socket and is driven by
//! that socket's reader task, so frames from one peer are handled strictly in
//! arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use tr_core::RelayError;
use tr_protocol::{AgentId, Frame, SessionId};

use crate::connection::{PeerHandle, TrySend};
use crate::coordinator::Attached;
use crate::lifecycle;
use crate::state::RelayState;

/// Label for agents that give no name in the frame or headers
const UNNAMED_NODE: &str = "unknown";

/// Sent to an operator whose outbound queue overflowed
pub const SLOW_OPERATOR: &str = "Session closed: operator not reading output";

/// Routing state for one agent socket
pub struct AgentLink {
    state: Arc<RelayState>,
    handle: PeerHandle,
    peer_addr: SocketAddr,
    /// Node name from the `x-node-name` connect header
    header_node_name: String,
    /// Credential from the `x-api-key` connect header
    api_key: Option<String>,
    /// Set once the agent has registered
    agent_id: Option<AgentId>,
}

impl AgentLink {
    pub fn new(
        state: Arc<RelayState>,
        handle: PeerHandle,
        peer_addr: SocketAddr,
        header_node_name: Option<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            state,
            handle,
            peer_addr,
            header_node_name: header_node_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| UNNAMED_NODE.to_string()),
            api_key,
            agent_id: None,
        }
    }

    /// Agent id, once registered
    pub fn agent_id(&self) -> Option<&AgentId> {
        self.agent_id.as_ref()
    }

    /// Route one text message received from the agent
    pub async fn handle_text(&mut self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                let err = RelayError::from(e);
                tracing::warn!("Dropping frame from agent {}: {}", self.label(), err);
                return;
            }
        };

        match frame {
            Frame::Register { node_name } => self.register(node_name).await,

            Frame::Pong => {
                if let Some(agent_id) = &self.agent_id {
                    self.state.coordinator.record_pong(agent_id);
                }
            }

            Frame::Data { .. } | Frame::CloseShell { .. } | Frame::Error { .. } => {
                self.forward(frame, text).await
            }

            other => {
                tracing::warn!(
                    "Unexpected {} frame from agent {}",
                    other.frame_type().as_str(),
                    self.label()
                );
            }
        }
    }

    /// Cascade the agent's disconnect. Safe to call on an unregistered link.
    pub async fn close(self) -> usize {
        match &self.agent_id {
            Some(agent_id) => lifecycle::agent_closed(&self.state, agent_id).await,
            None => {
                tracing::debug!("Unregistered agent connection from {} closed", self.peer_addr);
                0
            }
        }
    }

    async fn register(&mut self, node_name: Option<String>) {
        if let Some(agent_id) = &self.agent_id {
            tracing::debug!("Agent {} registered again, re-acknowledging", agent_id);
            let ack = Frame::Registered {
                agent_id: agent_id.clone(),
            };
            self.handle.send(&ack).await;
            return;
        }

        let node_name = node_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.header_node_name.clone());

        let agent_id = self
            .state
            .coordinator
            .register_agent(node_name.clone(), self.handle.clone(), self.api_key.clone())
            .await;

        tracing::info!(
            "Agent registered: {} ({}) from {}",
            node_name,
            agent_id,
            self.peer_addr
        );
        self.agent_id = Some(agent_id);
    }

    /// Forward an agent frame verbatim to the operator of its session
    async fn forward(&self, frame: Frame, text: &str) {
        let Some(agent_id) = &self.agent_id else {
            tracing::warn!(
                "Dropping {} frame from {} sent before registering",
                frame.frame_type().as_str(),
                self.peer_addr
            );
            return;
        };

        let Some(session_id) = frame.session_id().cloned() else {
            tracing::warn!(
                "Dropping {} frame from agent {} without sessionId",
                frame.frame_type().as_str(),
                agent_id
            );
            return;
        };

        let operator = match self
            .state
            .coordinator
            .route_to_operator(agent_id, &session_id)
            .await
        {
            Ok(operator) => operator,
            Err(e) => {
                tracing::debug!(
                    "Dropping {} from agent {}: {}",
                    frame.frame_type().as_str(),
                    agent_id,
                    e
                );
                return;
            }
        };

        if matches!(frame, Frame::CloseShell { .. }) {
            if !operator.close_with_text(text.to_string()) {
                tracing::debug!("Operator for session {} already gone", session_id);
            }
            lifecycle::shell_exited(&self.state, &session_id).await;
            return;
        }

        // Never wait on one operator here: this task reads for every
        // session the agent hosts.
        match operator.try_send_text(text.to_string()) {
            TrySend::Queued => {}
            TrySend::Closed => {
                tracing::debug!("Operator for session {} already gone", session_id);
            }
            TrySend::Full => {
                tracing::warn!(
                    "Operator for session {} is not keeping up, closing the session",
                    session_id
                );
                let notice = Frame::error(SLOW_OPERATOR).with_session(session_id.clone());
                operator.close_with(&notice);
                lifecycle::operator_closed(&self.state, &session_id).await;
            }
        }
    }

    fn label(&self) -> String {
        match &self.agent_id {
            Some(id) => id.to_string(),
            None => self.peer_addr.to_string(),
        }
    }
}

/// Routing state for one attached operator socket
pub struct OperatorLink {
    state: Arc<RelayState>,
    session_id: SessionId,
    agent_id: AgentId,
}

/// What the operator socket should do after a frame was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorFlow {
    Continue,
    Close,
}

impl OperatorLink {
    /// Attach an operator socket to an agent.
    ///
    /// On success the operator has been sent `connected` and the agent
    /// `start_shell`; both frames are queued together or not at all. On
    /// failure nothing was registered and nothing was sent.
    pub async fn attach(
        state: Arc<RelayState>,
        handle: PeerHandle,
        agent_id: AgentId,
    ) -> Result<Self, RelayError> {
        let size = state.config.default_size;
        let Attached {
            session_id,
            node_name,
        } = state.coordinator.attach(&agent_id, handle, size).await?;

        tracing::info!(
            "Operator session started: {} -> {} ({})",
            session_id,
            node_name,
            agent_id
        );

        Ok(Self {
            state,
            session_id,
            agent_id,
        })
    }

    /// Session this operator is attached to
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Route one text message received from the operator
    pub async fn handle_text(&self, text: &str) -> OperatorFlow {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                let err = RelayError::from(e);
                tracing::warn!(
                    "Dropping frame from operator of session {}: {}",
                    self.session_id,
                    err
                );
                return OperatorFlow::Continue;
            }
        };

        match frame {
            Frame::Data { .. } | Frame::Resize { .. } => {
                self.forward(frame.with_session(self.session_id.clone())).await;
                OperatorFlow::Continue
            }

            Frame::CloseShell { .. } | Frame::Disconnect => OperatorFlow::Close,

            other => {
                tracing::debug!(
                    "Ignoring {} frame from operator of session {}",
                    other.frame_type().as_str(),
                    self.session_id
                );
                OperatorFlow::Continue
            }
        }
    }

    /// Tear the session down from the operator side
    pub async fn close(self) -> bool {
        lifecycle::operator_closed(&self.state, &self.session_id).await
    }

    async fn forward(&self, frame: Frame) {
        match self.state.coordinator.route_to_agent(&self.session_id).await {
            Some(agent) => {
                if !agent.send(&frame).await {
                    tracing::debug!(
                        "Agent {} gone, dropping {} for session {}",
                        self.agent_id,
                        frame.frame_type().as_str(),
                        self.session_id
                    );
                }
            }
            None => {
                tracing::debug!(
                    "Dropping {} for closed session {}",
                    frame.frame_type().as_str(),
                    self.session_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tr_core::config::RelayConfig;

    use crate::connection::Outbound;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Frame {
        match rx.try_recv().unwrap() {
            Outbound::Text(text) => Frame::decode(&text).unwrap(),
            Outbound::Close => panic!("Expected frame, got close"),
        }
    }

    fn next_text(rx: &mut mpsc::Receiver<Outbound>) -> String {
        match rx.try_recv().unwrap() {
            Outbound::Text(text) => text,
            Outbound::Close => panic!("Expected text, got close"),
        }
    }

    async fn registered_agent(
        state: &Arc<RelayState>,
    ) -> (AgentLink, mpsc::Receiver<Outbound>, AgentId) {
        let (handle, mut rx) = state.new_peer();
        let mut link = AgentLink::new(
            Arc::clone(state),
            handle,
            peer(),
            Some("header-name".into()),
            Some("secret".into()),
        );
        link.handle_text(r#"{"type":"register","nodeName":"web-01"}"#)
            .await;
        let agent_id = match next_frame(&mut rx) {
            Frame::Registered { agent_id } => agent_id,
            other => panic!("Expected registered, got {:?}", other),
        };
        (link, rx, agent_id)
    }

    async fn attached_operator(
        state: &Arc<RelayState>,
        agent_id: &AgentId,
    ) -> (OperatorLink, mpsc::Receiver<Outbound>) {
        let (handle, mut rx) = state.new_peer();
        let link = OperatorLink::attach(Arc::clone(state), handle, agent_id.clone())
            .await
            .unwrap();
        let _connected = next_frame(&mut rx);
        (link, rx)
    }

    #[tokio::test]
    async fn test_register_uses_frame_node_name() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (link, _rx, agent_id) = registered_agent(&state).await;

        assert_eq!(link.agent_id(), Some(&agent_id));
        let agent = state.coordinator.agents.lookup(&agent_id).unwrap();
        assert_eq!(agent.node_name, "web-01");
        assert_eq!(agent.api_key.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_register_falls_back_to_header_name() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (handle, _rx) = state.new_peer();
        let mut link = AgentLink::new(
            Arc::clone(&state),
            handle,
            peer(),
            Some("header-name".into()),
            None,
        );

        link.handle_text(r#"{"type":"register"}"#).await;

        let agent_id = link.agent_id().unwrap().clone();
        assert_eq!(
            state.coordinator.agents.lookup(&agent_id).unwrap().node_name,
            "header-name"
        );
    }

    #[tokio::test]
    async fn test_repeated_register_reacknowledges() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (mut link, mut rx, agent_id) = registered_agent(&state).await;

        link.handle_text(r#"{"type":"register","nodeName":"other"}"#)
            .await;

        assert_eq!(next_frame(&mut rx), Frame::Registered { agent_id });
        assert_eq!(state.coordinator.agents.len(), 1);
    }

    #[tokio::test]
    async fn test_agent_frames_before_register_are_dropped() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (handle, mut rx) = state.new_peer();
        let mut link = AgentLink::new(Arc::clone(&state), handle, peer(), None, None);

        link.handle_text(r#"{"type":"data","sessionId":"s1","data":"x"}"#)
            .await;

        assert!(rx.try_recv().is_err());
        assert!(link.agent_id().is_none());
        assert_eq!(link.close().await, 0);
    }

    #[tokio::test]
    async fn test_nameless_agent_gets_placeholder() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (handle, _rx) = state.new_peer();
        let mut link = AgentLink::new(Arc::clone(&state), handle, peer(), Some(String::new()), None);

        link.handle_text(r#"{"type":"register"}"#).await;

        let agent_id = link.agent_id().cloned().unwrap();
        assert_eq!(
            state.coordinator.agents.lookup(&agent_id).unwrap().node_name,
            "unknown"
        );
    }

    #[tokio::test]
    async fn test_operator_frames_are_retagged() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (_agent, mut arx, agent_id) = registered_agent(&state).await;
        let (operator, _orx) = attached_operator(&state, &agent_id).await;
        let sid = operator.session_id().clone();
        let _start = next_frame(&mut arx);

        let flow = operator
            .handle_text(r#"{"type":"resize","cols":120,"rows":40}"#)
            .await;
        assert_eq!(flow, OperatorFlow::Continue);
        assert_eq!(
            next_frame(&mut arx),
            Frame::Resize {
                session_id: Some(sid.clone()),
                cols: 120,
                rows: 40
            }
        );

        operator
            .handle_text(r#"{"type":"data","sessionId":"spoofed","data":"ls\n"}"#)
            .await;
        assert_eq!(
            next_frame(&mut arx),
            Frame::Data {
                session_id: Some(sid),
                data: "ls\n".into()
            }
        );
    }

    #[tokio::test]
    async fn test_agent_data_forwarded_verbatim() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (mut agent, _arx, agent_id) = registered_agent(&state).await;
        let (operator, mut orx) = attached_operator(&state, &agent_id).await;

        let raw = format!(
            r#"{{"type":"data","sessionId":"{}","data":"hi\r\n","extra":1}}"#,
            operator.session_id()
        );
        agent.handle_text(&raw).await;

        assert_eq!(next_text(&mut orx), raw);
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_are_dropped() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (mut agent, mut arx, agent_id) = registered_agent(&state).await;
        let (operator, mut orx) = attached_operator(&state, &agent_id).await;
        let _start = next_frame(&mut arx);

        agent.handle_text("{not json").await;
        agent.handle_text(r#"{"type":"bogus"}"#).await;
        agent.handle_text(r#"{"type":"data","data":"no session"}"#).await;
        agent
            .handle_text(r#"{"type":"data","sessionId":"session-stale","data":"x"}"#)
            .await;
        assert_eq!(operator.handle_text("[]").await, OperatorFlow::Continue);

        assert!(orx.try_recv().is_err());
        assert!(arx.try_recv().is_err());
        assert_eq!(state.coordinator.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_session_frames_are_dropped() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (_a, _arx, a_id) = registered_agent(&state).await;
        let (mut b, _brx, _b_id) = registered_agent(&state).await;
        let (operator, mut orx) = attached_operator(&state, &a_id).await;

        let raw = format!(
            r#"{{"type":"data","sessionId":"{}","data":"hijack"}}"#,
            operator.session_id()
        );
        b.handle_text(&raw).await;

        assert!(orx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_agent_close_shell_forwards_then_closes() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (mut agent, _arx, agent_id) = registered_agent(&state).await;
        let (operator, mut orx) = attached_operator(&state, &agent_id).await;

        let raw = format!(
            r#"{{"type":"close_shell","sessionId":"{}"}}"#,
            operator.session_id()
        );
        agent.handle_text(&raw).await;

        assert_eq!(next_text(&mut orx), raw);
        assert_eq!(orx.try_recv().unwrap(), Outbound::Close);
        assert!(state.coordinator.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_stuck_operator_does_not_stall_other_sessions() {
        let state = Arc::new(RelayState::new(RelayConfig {
            outbound_queue: 2,
            ..RelayConfig::default()
        }));
        let (mut agent, mut arx, agent_id) = registered_agent(&state).await;
        let (stuck, mut stuck_rx) = attached_operator(&state, &agent_id).await;
        let _start = next_frame(&mut arx);
        let (healthy, mut healthy_rx) = attached_operator(&state, &agent_id).await;
        let _start = next_frame(&mut arx);

        let stuck_sid = stuck.session_id().clone();
        let to_stuck = format!(r#"{{"type":"data","sessionId":"{}","data":"x"}}"#, stuck_sid);
        let to_healthy = format!(
            r#"{{"type":"data","sessionId":"{}","data":"still here"}}"#,
            healthy.session_id()
        );

        // Nothing drains the stuck operator's queue.
        for _ in 0..4 {
            tokio::time::timeout(std::time::Duration::from_secs(1), agent.handle_text(&to_stuck))
                .await
                .expect("agent reader blocked on a full operator queue");
        }
        tokio::time::timeout(std::time::Duration::from_secs(1), agent.handle_text(&to_healthy))
            .await
            .expect("agent reader blocked on a full operator queue");

        assert_eq!(next_text(&mut healthy_rx), to_healthy);

        assert_eq!(next_text(&mut stuck_rx), to_stuck);
        assert_eq!(next_text(&mut stuck_rx), to_stuck);
        assert_eq!(
            next_frame(&mut stuck_rx),
            Frame::error(SLOW_OPERATOR).with_session(stuck_sid.clone())
        );
        assert_eq!(stuck_rx.try_recv().unwrap(), Outbound::Close);
        assert!(stuck_rx.try_recv().is_err());

        assert_eq!(next_frame(&mut arx), Frame::close_shell(stuck_sid.clone()));
        assert!(arx.try_recv().is_err());
        assert_eq!(state.coordinator.sessions.len(), 1);
        assert!(state
            .coordinator
            .route_to_operator(&agent_id, &stuck_sid)
            .await
            .is_err());

        // The stuck operator's own teardown later finds nothing left to do.
        assert!(!stuck.close().await);
    }

    #[tokio::test]
    async fn test_operator_disconnect_requests_close() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (_agent, mut arx, agent_id) = registered_agent(&state).await;
        let (operator, _orx) = attached_operator(&state, &agent_id).await;
        let sid = operator.session_id().clone();
        let _start = next_frame(&mut arx);

        assert_eq!(
            operator.handle_text(r#"{"type":"disconnect"}"#).await,
            OperatorFlow::Close
        );
        assert!(operator.close().await);

        assert_eq!(next_frame(&mut arx), Frame::close_shell(sid));
        assert!(state.coordinator.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_pong_refreshes_keepalive() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (mut agent, _rx, agent_id) = registered_agent(&state).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        agent.handle_text(r#"{"type":"pong"}"#).await;

        let silent = state
            .coordinator
            .agents
            .lookup(&agent_id)
            .unwrap()
            .silent_for();
        assert!(silent < std::time::Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_attach_to_ghost_fails_cleanly() {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let (handle, mut rx) = state.new_peer();

        let result = OperatorLink::attach(Arc::clone(&state), handle, AgentId::new("ghost")).await;

        assert!(matches!(result, Err(RelayError::AgentOffline(_))));
        assert!(rx.try_recv().is_err());
        assert!(state.coordinator.sessions.is_empty());
    }
}
