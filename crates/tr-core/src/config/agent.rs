//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::relay::BackoffConfig;
use super::serde_utils::duration_secs;

/// Configuration for the remote agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// WebSocket URL of the relay's agent endpoint
    pub relay_url: String,

    /// Node name shown to operators (defaults to hostname)
    pub node_name: Option<String>,

    /// API key forwarded in the `x-api-key` header
    pub api_key: Option<String>,

    /// Default shell to spawn
    pub default_shell: Option<String>,

    /// Default environment variables for sessions
    pub default_env: Vec<(String, String)>,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,

    /// Connection timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:3004/agent".to_string(),
            node_name: None,
            api_key: None,
            default_shell: None,
            default_env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Get the node name, falling back to hostname
    pub fn node_name(&self) -> String {
        self.node_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| gethostname::gethostname().to_string_lossy().into_owned())
    }
}
