//! Session and agent teardown
//!
//! Every path that ends a session funnels through here. Removal from the
//! registries is idempotent, so when an agent close races an operator close
//! only the first caller finds anything to notify.

use tr_protocol::{AgentId, Frame, SessionId};

use crate::state::RelayState;

/// Message sent to operators when the relay itself is going away
pub const SHUTDOWN_MESSAGE: &str = "Relay shutting down";

/// Cascade an agent's disconnect to every session it hosted.
///
/// Each affected operator gets a `close_shell` for its session as its last
/// frame and then has its socket closed. The frame goes into the operator's
/// reserved final slot, so a backed-up queue cannot drop it. Returns the
/// number of sessions torn down.
pub async fn agent_closed(state: &RelayState, agent_id: &AgentId) -> usize {
    let (agent, sessions) = state.coordinator.atomic_disconnect(agent_id).await;

    for session in &sessions {
        if !session
            .operator
            .close_with(&Frame::close_shell(session.id.clone()))
        {
            tracing::debug!(
                "Operator for session {} already closing, no close_shell sent",
                session.id
            );
        }
    }

    if let Some(agent) = agent {
        agent.handle().close();
        tracing::info!(
            "Agent {} ({}) disconnected, closed {} session(s)",
            agent.id,
            agent.node_name,
            sessions.len()
        );
    }

    sessions.len()
}

/// Tear down a session after its operator detached or asked to close.
///
/// The agent is told to close the shell, best effort. Returns false if the
/// session was already gone.
pub async fn operator_closed(state: &RelayState, session_id: &SessionId) -> bool {
    let Some((session, agent)) = state.coordinator.close_session(session_id).await else {
        return false;
    };

    if let Some(agent) = agent {
        if !agent.try_send(&Frame::close_shell(session.id.clone())) {
            tracing::warn!(
                "Failed to send close_shell to agent {} for session {}",
                session.agent_id,
                session.id
            );
        }
    }

    tracing::info!("Operator left session {} on agent {}", session.id, session.agent_id);
    true
}

/// Tear down a session whose shell ended on the agent.
///
/// The `close_shell` itself has already been forwarded to the operator; this
/// only removes the session and closes the operator's socket behind it.
pub async fn shell_exited(state: &RelayState, session_id: &SessionId) -> bool {
    let Some((session, _agent)) = state.coordinator.close_session(session_id).await else {
        return false;
    };

    session.operator.close();
    tracing::info!("Shell for session {} exited on agent {}", session.id, session.agent_id);
    true
}

/// Drop every agent and session, telling operators why.
pub async fn shutdown(state: &RelayState) {
    let (agents, sessions) = state.coordinator.drain().await;

    for session in &sessions {
        let notice = Frame::error(SHUTDOWN_MESSAGE).with_session(session.id.clone());
        if !session.operator.close_with(&notice) {
            tracing::debug!(
                "Operator for session {} already closing, no shutdown notice sent",
                session.id
            );
        }
    }
    for agent in &agents {
        agent.handle().close();
    }

    tracing::info!(
        "Closed {} agent(s) and {} session(s) for shutdown",
        agents.len(),
        sessions.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tr_core::config::RelayConfig;
    use tr_protocol::TerminalSize;

    use crate::connection::{Outbound, PeerHandle};

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    fn text(frame: Frame) -> Outbound {
        Outbound::Text(frame.encode().unwrap())
    }

    async fn setup(
        state: &RelayState,
    ) -> (AgentId, mpsc::Receiver<Outbound>, PeerHandle) {
        let (agent, arx) = state.new_peer();
        let agent_id = state
            .coordinator
            .register_agent("web-01".into(), agent.clone(), None)
            .await;
        (agent_id, arx, agent)
    }

    #[tokio::test]
    async fn test_agent_closed_cascades_to_every_operator() {
        let state = RelayState::new(RelayConfig::default());
        let (agent_id, _arx, _agent) = setup(&state).await;

        let mut operators = Vec::new();
        for _ in 0..3 {
            let (operator, mut orx) = state.new_peer();
            let attached = state
                .coordinator
                .attach(&agent_id, operator, TerminalSize::default())
                .await
                .unwrap();
            drain(&mut orx);
            operators.push((attached.session_id, orx));
        }

        assert_eq!(agent_closed(&state, &agent_id).await, 3);

        for (session_id, mut orx) in operators {
            assert_eq!(
                drain(&mut orx),
                vec![text(Frame::close_shell(session_id)), Outbound::Close]
            );
        }
        assert!(state.coordinator.agents.is_empty());
        assert!(state.coordinator.sessions.is_empty());

        // A second cascade for the same agent finds nothing.
        assert_eq!(agent_closed(&state, &agent_id).await, 0);
    }

    #[tokio::test]
    async fn test_agent_closed_reaches_backed_up_operator() {
        let state = RelayState::new(RelayConfig {
            outbound_queue: 2,
            ..RelayConfig::default()
        });
        let (agent_id, _arx, _agent) = setup(&state).await;
        let (operator, mut orx) = state.new_peer();
        let attached = state
            .coordinator
            .attach(&agent_id, operator.clone(), TerminalSize::default())
            .await
            .unwrap();

        // connected plus one data frame leaves no ordinary room
        assert!(operator.try_send(&Frame::Data {
            session_id: Some(attached.session_id.clone()),
            data: "x".into(),
        }));
        assert!(!operator.try_send(&Frame::Ping));

        assert_eq!(agent_closed(&state, &agent_id).await, 1);

        let out = drain(&mut orx);
        assert_eq!(out.len(), 4);
        assert_eq!(
            out[2..],
            [text(Frame::close_shell(attached.session_id)), Outbound::Close]
        );
        assert!(operator.is_open());
    }

    #[tokio::test]
    async fn test_operator_closed_notifies_agent() {
        let state = RelayState::new(RelayConfig::default());
        let (agent_id, mut arx, _agent) = setup(&state).await;
        let (operator, _orx) = state.new_peer();
        let attached = state
            .coordinator
            .attach(&agent_id, operator, TerminalSize::default())
            .await
            .unwrap();
        drain(&mut arx);

        assert!(operator_closed(&state, &attached.session_id).await);
        assert_eq!(
            drain(&mut arx),
            vec![text(Frame::close_shell(attached.session_id.clone()))]
        );

        assert!(!operator_closed(&state, &attached.session_id).await);
        assert!(drain(&mut arx).is_empty());
    }

    #[tokio::test]
    async fn test_shell_exited_closes_operator_only() {
        let state = RelayState::new(RelayConfig::default());
        let (agent_id, mut arx, _agent) = setup(&state).await;
        let (operator, mut orx) = state.new_peer();
        let attached = state
            .coordinator
            .attach(&agent_id, operator, TerminalSize::default())
            .await
            .unwrap();
        drain(&mut arx);
        drain(&mut orx);

        assert!(shell_exited(&state, &attached.session_id).await);

        assert_eq!(drain(&mut orx), vec![Outbound::Close]);
        assert!(drain(&mut arx).is_empty());
        assert_eq!(state.coordinator.agents.list()[0].active_sessions, 0);
    }

    #[tokio::test]
    async fn test_shutdown_notifies_operators() {
        let state = RelayState::new(RelayConfig::default());
        let (agent_id, mut arx, _agent) = setup(&state).await;
        let (operator, mut orx) = state.new_peer();
        let attached = state
            .coordinator
            .attach(&agent_id, operator, TerminalSize::default())
            .await
            .unwrap();
        drain(&mut arx);
        drain(&mut orx);

        shutdown(&state).await;

        assert_eq!(
            drain(&mut orx),
            vec![
                text(Frame::error(SHUTDOWN_MESSAGE).with_session(attached.session_id)),
                Outbound::Close
            ]
        );
        assert_eq!(drain(&mut arx), vec![Outbound::Close]);
        assert!(state.coordinator.agents.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_notice_survives_full_queue() {
        let state = RelayState::new(RelayConfig {
            outbound_queue: 1,
            ..RelayConfig::default()
        });
        let (agent_id, _arx, _agent) = setup(&state).await;
        let (operator, mut orx) = state.new_peer();
        let attached = state
            .coordinator
            .attach(&agent_id, operator.clone(), TerminalSize::default())
            .await
            .unwrap();
        assert!(!operator.try_send(&Frame::Ping));

        shutdown(&state).await;

        let out = drain(&mut orx);
        assert_eq!(
            out[1..],
            [
                text(Frame::error(SHUTDOWN_MESSAGE).with_session(attached.session_id)),
                Outbound::Close
            ]
        );
    }
}
