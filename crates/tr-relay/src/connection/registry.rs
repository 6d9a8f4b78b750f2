//! Agent registry
//!
//! Tracks every registered agent connection and the ids of the sessions it
//! hosts. Sessions are referenced by id only; the session records themselves
//! live in the [`SessionRegistry`](crate::session::SessionRegistry).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::mapref::one::Ref;
use dashmap::DashMap;

use tr_protocol::{AgentId, SessionId};

use super::handle::PeerHandle;

/// Liveness state of an agent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Socket open, no `register` frame seen yet
    Connecting,
    /// Registered and routable
    Registered,
    /// Close observed, cascade pending
    Closing,
    /// Removed from the registry
    Closed,
}

/// One registered agent
#[derive(Debug)]
pub struct AgentConnection {
    /// Agent identifier
    pub id: AgentId,
    /// Operator-facing label, not necessarily unique
    pub node_name: String,
    /// When the agent registered
    pub connected_at: DateTime<Utc>,
    /// Pass-through credential from the connect headers. Never validated here.
    pub api_key: Option<String>,
    handle: PeerHandle,
    sessions: HashSet<SessionId>,
    state: LinkState,
    registered_at: Instant,
    /// Milliseconds after `registered_at` of the latest pong
    last_pong_ms: AtomicU64,
}

impl AgentConnection {
    fn new(id: AgentId, node_name: String, handle: PeerHandle, api_key: Option<String>) -> Self {
        Self {
            id,
            node_name,
            connected_at: Utc::now(),
            api_key,
            handle,
            sessions: HashSet::new(),
            state: LinkState::Registered,
            registered_at: Instant::now(),
            last_pong_ms: AtomicU64::new(0),
        }
    }

    /// Outbound handle to the agent's socket
    pub fn handle(&self) -> &PeerHandle {
        &self.handle
    }

    /// Current liveness state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Ids of the sessions this agent hosts
    pub fn sessions(&self) -> &HashSet<SessionId> {
        &self.sessions
    }

    /// Registered and its socket still accepts frames
    pub fn is_online(&self) -> bool {
        self.state == LinkState::Registered && self.handle.is_open()
    }

    /// Record a keepalive acknowledgment
    pub fn record_pong(&self) {
        let offset = self.registered_at.elapsed().as_millis() as u64;
        self.last_pong_ms.fetch_max(offset, Ordering::Relaxed);
    }

    /// Time since the last pong (or since registration)
    pub fn silent_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_pong_ms.load(Ordering::Relaxed));
        self.registered_at.elapsed().saturating_sub(last)
    }

    /// Summary used by the control surface
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            node_name: self.node_name.clone(),
            connected_at: self.connected_at,
            active_sessions: self.sessions.len(),
            online: self.is_online(),
        }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.state = LinkState::Closed;
    }
}

/// Point-in-time view of one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSummary {
    pub id: AgentId,
    pub node_name: String,
    pub connected_at: DateTime<Utc>,
    pub active_sessions: usize,
    pub online: bool,
}

/// Registry of connected agents
pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentConnection>,
}

impl AgentRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Register an agent under a freshly minted id
    pub fn register(
        &self,
        node_name: impl Into<String>,
        handle: PeerHandle,
        api_key: Option<String>,
    ) -> AgentId {
        let mut id = AgentId::generate();
        while self.agents.contains_key(&id) {
            id = AgentId::generate();
        }

        let agent = AgentConnection::new(id.clone(), node_name.into(), handle, api_key);
        self.agents.insert(id.clone(), agent);
        id
    }

    /// Look up an agent. The guard must not be held across an `.await`.
    pub fn lookup(&self, id: &AgentId) -> Option<Ref<'_, AgentId, AgentConnection>> {
        self.agents.get(id)
    }

    /// Clone of an agent's outbound handle
    pub fn handle(&self, id: &AgentId) -> Option<PeerHandle> {
        self.agents.get(id).map(|a| a.handle.clone())
    }

    /// Remove an agent. Unregistering an unknown id is a no-op.
    pub fn unregister(&self, id: &AgentId) -> Option<AgentConnection> {
        self.agents.remove(id).map(|(_, mut agent)| {
            agent.mark_closed();
            agent
        })
    }

    /// Mark an agent as closing so it is listed offline until reaped
    pub fn mark_closing(&self, id: &AgentId) -> bool {
        match self.agents.get_mut(id) {
            Some(mut agent) if agent.state == LinkState::Registered => {
                agent.state = LinkState::Closing;
                true
            }
            _ => false,
        }
    }

    /// Add a hosted session id. Fails if the agent is absent or offline.
    pub fn add_session(&self, id: &AgentId, session_id: SessionId) -> bool {
        match self.agents.get_mut(id) {
            Some(mut agent) if agent.is_online() => {
                agent.sessions.insert(session_id);
                true
            }
            _ => false,
        }
    }

    /// Drop a hosted session id
    pub fn remove_session(&self, id: &AgentId, session_id: &SessionId) -> bool {
        self.agents
            .get_mut(id)
            .map(|mut agent| agent.sessions.remove(session_id))
            .unwrap_or(false)
    }

    /// Refresh an agent's keepalive timestamp
    pub fn record_pong(&self, id: &AgentId) -> bool {
        match self.agents.get(id) {
            Some(agent) => {
                agent.record_pong();
                true
            }
            None => false,
        }
    }

    /// Snapshot of every agent
    pub fn list(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> = self.agents.iter().map(|a| a.summary()).collect();
        agents.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        agents
    }

    /// Ids of every registered agent
    pub fn ids(&self) -> Vec<AgentId> {
        self.agents.iter().map(|a| a.key().clone()).collect()
    }

    /// Number of registered agents
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
