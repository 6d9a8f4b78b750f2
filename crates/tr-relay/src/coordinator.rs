//! State coordinator for cross-registry atomicity
//!
//! The `StateCoordinator` wraps the agent registry and the session registry
//! behind a single RwLock so that operations spanning both cannot be
//! interleaved.
//!
//! # Atomicity Model
//!
//! Routing lookups take a read lock. Anything that adds or removes entries in
//! both registries (attaching, closing a session, disconnecting an agent)
//! takes the write lock.
//!
//! This rules out races such as:
//! - An operator attaching to an agent whose cascade is already running
//! - A session being routed to after its agent was removed
//! - Agent close and operator close both trying to tear down the same session
//!
//! No lock is ever held across a socket write. Frames that must be queued
//! while the lock is held go through [`PeerHandle::try_send`] or a slot
//! claimed with [`PeerHandle::try_reserve`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tr_core::RelayError;
use tr_protocol::{AgentId, Frame, SessionId, TerminalSize};

use crate::connection::{AgentConnection, AgentRegistry, AgentSummary, Outbound, PeerHandle};
use crate::session::{SessionRegistry, UserSession};

/// Result of a successful attach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
    pub session_id: SessionId,
    pub node_name: String,
}

/// Health of an agent as seen by the keepalive sweep
#[derive(Debug, Clone)]
pub enum Liveness {
    /// Answered recently enough; gets another ping
    Alive(PeerHandle),
    /// Went silent past the pong timeout
    Stale(PeerHandle),
}

/// Point-in-time counters and agent listing
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub agents: Vec<AgentSummary>,
    pub active_sessions: usize,
}

/// Coordinates access to agents and sessions with cross-registry atomicity.
pub struct StateCoordinator {
    /// Pure coordination lock; protects no data itself.
    inner: RwLock<()>,

    /// Registered agents
    pub agents: Arc<AgentRegistry>,

    /// Live sessions
    pub sessions: Arc<SessionRegistry>,
}

impl StateCoordinator {
    /// Create a coordinator with empty registries.
    pub fn new() -> Self {
        Self::with_registries(Arc::new(AgentRegistry::new()), Arc::new(SessionRegistry::new()))
    }

    /// Create a coordinator over existing registries.
    pub fn with_registries(agents: Arc<AgentRegistry>, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            inner: RwLock::new(()),
            agents,
            sessions,
        }
    }

    /// Acquire a read lock for a consistent view across both registries.
    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read().await
    }

    /// Acquire the write lock for an operation touching both registries.
    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write().await
    }

    /// Register an agent and queue its `registered` acknowledgment.
    ///
    /// The ack is queued under the lock, so it is always the first frame the
    /// agent sees from the relay.
    pub async fn register_agent(
        &self,
        node_name: String,
        handle: PeerHandle,
        api_key: Option<String>,
    ) -> AgentId {
        let _lock = self.write().await;

        let agent_id = self.agents.register(node_name, handle.clone(), api_key);
        if !handle.try_send(&Frame::Registered {
            agent_id: agent_id.clone(),
        }) {
            tracing::warn!("Could not queue registered ack for agent {}", agent_id);
        }
        agent_id
    }

    /// Attach an operator to an agent.
    ///
    /// Creates the session, tells the operator it is connected and asks the
    /// agent for a shell. Either all of that happens or nothing does.
    pub async fn attach(
        &self,
        agent_id: &AgentId,
        operator: PeerHandle,
        size: TerminalSize,
    ) -> Result<Attached, RelayError> {
        let _lock = self.write().await;

        let (agent, node_name) = match self.agents.lookup(agent_id) {
            Some(a) if a.is_online() => (a.handle().clone(), a.node_name.clone()),
            _ => return Err(RelayError::AgentOffline(agent_id.clone())),
        };

        let session_id = self.sessions.create(&self.agents, agent_id, operator.clone())?;

        let connected = Frame::Connected {
            session_id: Some(session_id.clone()),
            node_name: Some(node_name.clone()),
        };
        let encoded = connected.encode().and_then(|connected| {
            Frame::start_shell(session_id.clone(), size)
                .encode()
                .map(|start_shell| (connected, start_shell))
        });
        let (connected, start_shell) = match encoded {
            Ok(frames) => frames,
            Err(e) => {
                self.sessions.destroy(&self.agents, &session_id);
                return Err(e.into());
            }
        };

        // Both slots are claimed before either frame is queued.
        let Some(operator_slot) = operator.try_reserve() else {
            self.sessions.destroy(&self.agents, &session_id);
            return Err(RelayError::TransportFault(format!(
                "operator for session {} is not accepting frames",
                session_id
            )));
        };
        let Some(agent_slot) = agent.try_reserve() else {
            drop(operator_slot);
            self.sessions.destroy(&self.agents, &session_id);
            return Err(RelayError::AgentOffline(agent_id.clone()));
        };
        operator_slot.send(Outbound::Text(connected));
        agent_slot.send(Outbound::Text(start_shell));

        self.sessions.activate(&session_id);
        Ok(Attached {
            session_id,
            node_name,
        })
    }

    /// Handle of the agent hosting a session
    pub async fn route_to_agent(&self, session_id: &SessionId) -> Option<PeerHandle> {
        let _lock = self.read().await;
        let agent_id = self.sessions.agent_of(session_id)?;
        self.agents.handle(&agent_id)
    }

    /// Operator handle for a session, provided `agent_id` actually hosts it
    pub async fn route_to_operator(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
    ) -> Result<PeerHandle, RelayError> {
        let _lock = self.read().await;
        let session = self
            .sessions
            .lookup(session_id)
            .ok_or_else(|| RelayError::UnknownSession(session_id.clone()))?;
        if &session.agent_id != agent_id {
            return Err(RelayError::UnknownSession(session_id.clone()));
        }
        Ok(session.operator.clone())
    }

    /// Destroy one session.
    ///
    /// Returns the removed session and its agent's handle, or `None` if some
    /// other path already removed it.
    pub async fn close_session(
        &self,
        session_id: &SessionId,
    ) -> Option<(UserSession, Option<PeerHandle>)> {
        let _lock = self.write().await;
        let session = self.sessions.destroy(&self.agents, session_id)?;
        let agent = self.agents.handle(&session.agent_id);
        Some((session, agent))
    }

    /// Atomically remove an agent and every session it hosts.
    ///
    /// Sessions go first so no reader ever sees a session whose agent is
    /// gone. Calling this twice for the same agent yields nothing the second
    /// time.
    pub async fn atomic_disconnect(
        &self,
        agent_id: &AgentId,
    ) -> (Option<AgentConnection>, Vec<UserSession>) {
        let _lock = self.write().await;

        let sessions = self.sessions.remove_by_agent(agent_id);
        let agent = self.agents.unregister(agent_id);

        (agent, sessions)
    }

    /// Flag an agent as closing so it stops accepting attaches
    pub async fn mark_closing(&self, agent_id: &AgentId) -> bool {
        let _lock = self.write().await;
        self.agents.mark_closing(agent_id)
    }

    /// Refresh an agent's keepalive timestamp
    pub fn record_pong(&self, agent_id: &AgentId) -> bool {
        self.agents.record_pong(agent_id)
    }

    /// Consistent view of agents and session count
    pub async fn snapshot(&self) -> Snapshot {
        let _lock = self.read().await;
        Snapshot {
            agents: self.agents.list(),
            active_sessions: self.sessions.len(),
        }
    }

    /// Classify every registered agent for the keepalive sweep
    pub async fn keepalive_targets(&self, timeout: Duration) -> Vec<(AgentId, Liveness)> {
        let _lock = self.read().await;
        self.agents
            .ids()
            .into_iter()
            .filter_map(|id| {
                let agent = self.agents.lookup(&id)?;
                let handle = agent.handle().clone();
                let liveness = if agent.silent_for() > timeout {
                    Liveness::Stale(handle)
                } else {
                    Liveness::Alive(handle)
                };
                drop(agent);
                Some((id, liveness))
            })
            .collect()
    }

    /// Remove everything, returning the agents and sessions that were live.
    pub async fn drain(&self) -> (Vec<AgentConnection>, Vec<UserSession>) {
        let _lock = self.write().await;

        let sessions: Vec<UserSession> = self
            .sessions
            .ids()
            .iter()
            .filter_map(|id| self.sessions.destroy(&self.agents, id))
            .collect();
        let agents: Vec<AgentConnection> = self
            .agents
            .ids()
            .iter()
            .filter_map(|id| self.agents.unregister(id))
            .collect();

        (agents, sessions)
    }
}

impl Default for StateCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn test_handle() -> (PeerHandle, mpsc::Receiver<Outbound>) {
        PeerHandle::new(8, &CancellationToken::new())
    }

    fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> Frame {
        match rx.try_recv().unwrap() {
            Outbound::Text(text) => Frame::decode(&text).unwrap(),
            Outbound::Close => panic!("Expected frame, got close"),
        }
    }

    #[tokio::test]
    async fn test_register_queues_ack() {
        let coordinator = StateCoordinator::new();
        let (agent, mut arx) = test_handle();

        let id = coordinator.register_agent("web-01".into(), agent, None).await;

        assert_eq!(next_frame(&mut arx), Frame::Registered { agent_id: id });
        assert_eq!(coordinator.agents.len(), 1);
    }

    #[tokio::test]
    async fn test_attach_notifies_both_sides() {
        let coordinator = StateCoordinator::new();
        let (agent, mut arx) = test_handle();
        let (operator, mut orx) = test_handle();
        let agent_id = coordinator.register_agent("web-01".into(), agent, None).await;
        next_frame(&mut arx);

        let attached = coordinator
            .attach(&agent_id, operator, TerminalSize::default())
            .await
            .unwrap();

        assert_eq!(attached.node_name, "web-01");
        assert_eq!(
            next_frame(&mut orx),
            Frame::Connected {
                session_id: Some(attached.session_id.clone()),
                node_name: Some("web-01".into()),
            }
        );
        assert_eq!(
            next_frame(&mut arx),
            Frame::start_shell(attached.session_id.clone(), TerminalSize::new(80, 24))
        );
        assert_eq!(coordinator.sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_attach_unknown_agent_changes_nothing() {
        let coordinator = StateCoordinator::new();
        let (operator, mut orx) = test_handle();

        let result = coordinator
            .attach(&AgentId::new("ghost"), operator, TerminalSize::default())
            .await;

        assert!(matches!(result, Err(RelayError::AgentOffline(_))));
        assert!(coordinator.sessions.is_empty());
        assert!(orx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_attach_rolls_back_when_agent_queue_full() {
        let coordinator = StateCoordinator::new();
        let (agent, _arx) = PeerHandle::new(1, &CancellationToken::new());
        let (operator, mut orx) = test_handle();
        // The registered ack fills the single slot.
        let agent_id = coordinator.register_agent("web-01".into(), agent, None).await;

        let result = coordinator
            .attach(&agent_id, operator.clone(), TerminalSize::default())
            .await;

        assert!(matches!(result, Err(RelayError::AgentOffline(_))));
        // The operator never saw a connected frame for the dropped session.
        assert!(orx.try_recv().is_err());
        assert!(operator.try_reserve().is_some());
        assert!(coordinator.sessions.is_empty());
        assert!(coordinator
            .agents
            .lookup(&agent_id)
            .unwrap()
            .sessions()
            .is_empty());
    }

    #[tokio::test]
    async fn test_route_to_operator_checks_owner() {
        let coordinator = StateCoordinator::new();
        let (a, _arx) = test_handle();
        let (b, _brx) = test_handle();
        let (operator, _orx) = test_handle();
        let a_id = coordinator.register_agent("a".into(), a, None).await;
        let b_id = coordinator.register_agent("b".into(), b, None).await;
        let attached = coordinator
            .attach(&a_id, operator, TerminalSize::default())
            .await
            .unwrap();

        assert!(coordinator
            .route_to_operator(&a_id, &attached.session_id)
            .await
            .is_ok());
        assert!(matches!(
            coordinator.route_to_operator(&b_id, &attached.session_id).await,
            Err(RelayError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_close_session_is_idempotent() {
        let coordinator = StateCoordinator::new();
        let (agent, _arx) = test_handle();
        let (operator, _orx) = test_handle();
        let agent_id = coordinator.register_agent("web-01".into(), agent, None).await;
        let attached = coordinator
            .attach(&agent_id, operator, TerminalSize::default())
            .await
            .unwrap();

        let (session, agent) = coordinator.close_session(&attached.session_id).await.unwrap();
        assert_eq!(session.agent_id, agent_id);
        assert!(agent.is_some());

        assert!(coordinator.close_session(&attached.session_id).await.is_none());
        assert!(coordinator.route_to_agent(&attached.session_id).await.is_none());
    }

    #[tokio::test]
    async fn test_atomic_disconnect_removes_agent_and_sessions() {
        let coordinator = StateCoordinator::new();
        let (agent, _arx) = test_handle();
        let agent_id = coordinator.register_agent("web-01".into(), agent, None).await;

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (operator, orx) = test_handle();
            coordinator
                .attach(&agent_id, operator, TerminalSize::default())
                .await
                .unwrap();
            receivers.push(orx);
        }

        let (agent, sessions) = coordinator.atomic_disconnect(&agent_id).await;

        assert!(agent.is_some());
        assert_eq!(sessions.len(), 3);
        assert!(coordinator.agents.is_empty());
        assert!(coordinator.sessions.is_empty());

        let (agent, sessions) = coordinator.atomic_disconnect(&agent_id).await;
        assert!(agent.is_none());
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn test_keepalive_targets_flags_silent_agents() {
        let coordinator = StateCoordinator::new();
        let (agent, _arx) = test_handle();
        coordinator.register_agent("web-01".into(), agent, None).await;

        let targets = coordinator.keepalive_targets(Duration::from_secs(60)).await;
        assert!(matches!(targets[0].1, Liveness::Alive(_)));

        // Registration counts as the first pong.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let targets = coordinator
            .keepalive_targets(Duration::from_millis(5))
            .await;
        assert_eq!(targets.len(), 1);
        assert!(matches!(targets[0].1, Liveness::Stale(_)));
    }

    #[tokio::test]
    async fn test_snapshot_and_drain() {
        let coordinator = StateCoordinator::new();
        let (agent, _arx) = test_handle();
        let (operator, _orx) = test_handle();
        let agent_id = coordinator.register_agent("web-01".into(), agent, None).await;
        coordinator
            .attach(&agent_id, operator, TerminalSize::default())
            .await
            .unwrap();

        let snapshot = coordinator.snapshot().await;
        assert_eq!(snapshot.agents.len(), 1);
        assert_eq!(snapshot.agents[0].active_sessions, 1);
        assert_eq!(snapshot.active_sessions, 1);

        let (agents, sessions) = coordinator.drain().await;
        assert_eq!(agents.len(), 1);
        assert_eq!(sessions.len(), 1);
        assert!(coordinator.snapshot().await.agents.is_empty());
    }
}
