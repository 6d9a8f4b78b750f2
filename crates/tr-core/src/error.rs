//! Core error types for term-relay

use std::path::PathBuf;

use thiserror::Error;
use tr_protocol::{AgentId, ProtocolError, SessionId};

/// Failures the relay can hit while serving one connection or session.
///
/// None of these are fatal to the relay process.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Attach target is not registered or its transport is not open
    #[error("Agent not connected or offline: {0}")]
    AgentOffline(AgentId),

    /// Frame failed to parse or validate; the connection stays open
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] ProtocolError),

    /// Frame references a session that is not registered
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// Socket-level failure, handled like a close
    #[error("Transport fault: {0}")]
    TransportFault(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_offline_message() {
        let err = RelayError::AgentOffline(AgentId::new("ghost"));
        assert_eq!(err.to_string(), "Agent not connected or offline: ghost");
    }

    #[test]
    fn test_protocol_error_converts_to_malformed() {
        let err: RelayError = ProtocolError::MissingType.into();
        assert!(matches!(err, RelayError::MalformedFrame(_)));
    }
}
