//! Session registry implementation

use chrono::{DateTime, Utc};
use dashmap::mapref::one::Ref;
use dashmap::DashMap;

use tr_core::RelayError;
use tr_protocol::{AgentId, SessionId};

use crate::connection::{AgentRegistry, PeerHandle};

/// Lifecycle of a user session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, `start_shell` not yet delivered to the agent
    Requested,
    /// Shell requested and frames are flowing
    Active,
    /// Teardown in progress
    Closing,
    /// Removed from the registry
    Closed,
}

/// One operator attached to one shell on one agent
#[derive(Debug)]
pub struct UserSession {
    /// Session identifier
    pub id: SessionId,
    /// Agent hosting the shell
    pub agent_id: AgentId,
    /// Outbound handle to the operator's socket
    pub operator: PeerHandle,
    /// When the operator attached
    pub created_at: DateTime<Utc>,
    state: SessionState,
}

impl UserSession {
    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }
}

/// Registry of all live sessions across all agents
///
/// The agent side of the relation (each agent's set of hosted session ids) is
/// kept in the [`AgentRegistry`]. The two maps are always touched one after
/// the other, never with both guards held.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, UserSession>,
}

impl SessionRegistry {
    /// Create a new session registry
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create a session on `agent_id` for the given operator.
    ///
    /// Fails with [`RelayError::AgentOffline`] if the agent is not registered
    /// or is no longer accepting frames.
    pub fn create(
        &self,
        agents: &AgentRegistry,
        agent_id: &AgentId,
        operator: PeerHandle,
    ) -> Result<SessionId, RelayError> {
        let mut id = SessionId::generate();
        while self.sessions.contains_key(&id) {
            id = SessionId::generate();
        }

        if !agents.add_session(agent_id, id.clone()) {
            return Err(RelayError::AgentOffline(agent_id.clone()));
        }

        self.sessions.insert(
            id.clone(),
            UserSession {
                id: id.clone(),
                agent_id: agent_id.clone(),
                operator,
                created_at: Utc::now(),
                state: SessionState::Requested,
            },
        );
        Ok(id)
    }

    /// Move a requested session to active
    pub fn activate(&self, id: &SessionId) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut session) if session.state == SessionState::Requested => {
                session.state = SessionState::Active;
                true
            }
            _ => false,
        }
    }

    /// Look up a session. The guard must not be held across an `.await`.
    pub fn lookup(&self, id: &SessionId) -> Option<Ref<'_, SessionId, UserSession>> {
        self.sessions.get(id)
    }

    /// Agent hosting a session
    pub fn agent_of(&self, id: &SessionId) -> Option<AgentId> {
        self.sessions.get(id).map(|s| s.agent_id.clone())
    }

    /// Operator handle of a session
    pub fn operator(&self, id: &SessionId) -> Option<PeerHandle> {
        self.sessions.get(id).map(|s| s.operator.clone())
    }

    /// Remove a session and unlink it from its agent.
    ///
    /// Destroying an unknown id is a no-op, so every teardown path may call
    /// this without coordinating with the others.
    pub fn destroy(&self, agents: &AgentRegistry, id: &SessionId) -> Option<UserSession> {
        let (_, mut session) = self.sessions.remove(id)?;
        session.state = SessionState::Closing;
        agents.remove_session(&session.agent_id, id);
        session.state = SessionState::Closed;
        Some(session)
    }

    /// Remove every session hosted by an agent
    pub fn remove_by_agent(&self, agent_id: &AgentId) -> Vec<UserSession> {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| &s.agent_id == agent_id)
            .map(|s| s.key().clone())
            .collect();

        ids.iter()
            .filter_map(|id| self.sessions.remove(id))
            .map(|(_, mut session)| {
                session.state = SessionState::Closed;
                session
            })
            .collect()
    }

    /// Ids of every live session
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
