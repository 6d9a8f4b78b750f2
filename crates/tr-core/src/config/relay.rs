//! Relay configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use tr_protocol::TerminalSize;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the relay daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind the HTTP/WebSocket listener to
    pub bind_address: String,

    /// Interval between keepalive pings sent to each registered agent
    #[serde(with = "duration_secs")]
    pub ping_interval: Duration,

    /// How long an agent may go without answering a ping before it is
    /// force-closed
    #[serde(with = "duration_secs")]
    pub pong_timeout: Duration,

    /// Capacity of each connection's outbound frame queue
    pub outbound_queue: usize,

    /// Terminal size requested in `start_shell` until the operator resizes
    pub default_size: TerminalSize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3004".to_string(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(90),
            outbound_queue: 256,
            default_size: TerminalSize::default(),
        }
    }
}

impl RelayConfig {
    /// Check the keepalive and queue settings for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "ping_interval must be greater than zero".to_string(),
            ));
        }
        if self.pong_timeout <= self.ping_interval {
            return Err(ConfigError::Invalid(format!(
                "pong_timeout ({:?}) must exceed ping_interval ({:?})",
                self.pong_timeout, self.ping_interval
            )));
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Replace the port of the bind address
    pub fn with_port(mut self, port: u16) -> Self {
        let host = self
            .bind_address
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| self.bind_address.clone());
        self.bind_address = format!("{}:{}", host, port);
        self
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
