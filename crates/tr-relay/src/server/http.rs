//! Read-only control endpoints

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};

use crate::connection::AgentSummary;
use crate::state::RelayState;

/// Body of `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub connected_agents: usize,
    pub active_sessions: usize,
}

/// One element of `GET /agents`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEntry {
    pub id: String,
    pub node_name: String,
    /// RFC 3339, millisecond precision, UTC
    pub connected_at: String,
    pub active_sessions: usize,
    pub online: bool,
}

impl From<AgentSummary> for AgentEntry {
    fn from(agent: AgentSummary) -> Self {
        Self {
            id: agent.id.to_string(),
            node_name: agent.node_name,
            connected_at: agent.connected_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            active_sessions: agent.active_sessions,
            online: agent.online,
        }
    }
}

/// `GET /health`
pub async fn health(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    let snapshot = state.coordinator.snapshot().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        connected_agents: snapshot.agents.len(),
        active_sessions: snapshot.active_sessions,
    })
}

/// `GET /agents`
pub async fn agents(State(state): State<Arc<RelayState>>) -> Json<Vec<AgentEntry>> {
    let snapshot = state.coordinator.snapshot().await;
    Json(snapshot.agents.into_iter().map(AgentEntry::from).collect())
}

/// Anything else
pub async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}
