//! Global relay state

use tokio_util::sync::CancellationToken;

use tr_core::config::RelayConfig;

use crate::connection::{Outbound, PeerHandle};
use crate::coordinator::StateCoordinator;

/// Global state for the relay daemon
pub struct RelayState {
    /// Configuration
    pub config: RelayConfig,
    /// Agents and sessions
    pub coordinator: StateCoordinator,
    /// Root token every connection's token descends from
    pub shutdown: CancellationToken,
}

impl RelayState {
    /// Create new relay state
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            coordinator: StateCoordinator::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Outbound handle for a freshly upgraded socket
    pub fn new_peer(&self) -> (PeerHandle, tokio::sync::mpsc::Receiver<Outbound>) {
        PeerHandle::new(self.config.outbound_queue, &self.shutdown)
    }
}
