//! Agent keepalive monitoring
//!
//! Every registered agent is pinged on a fixed interval. An agent that has
//! not answered with a `pong` within the timeout is marked closing and its
//! socket is aborted; the socket handler then runs the normal disconnect
//! cascade.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use tr_core::config::RelayConfig;
use tr_protocol::Frame;

use crate::coordinator::Liveness;
use crate::state::RelayState;

/// Pings agents and reaps the ones that stop answering
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor {
    /// Ping interval
    pub interval: Duration,
    /// Pong timeout
    pub timeout: Duration,
}

/// Outcome of one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub reaped: usize,
}

impl HealthMonitor {
    /// Create a new health monitor
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Monitor using the relay's keepalive settings
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.ping_interval, config.pong_timeout)
    }

    /// Spawn the monitor loop
    pub fn spawn(
        self,
        state: Arc<RelayState>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(state, cancel).await })
    }

    /// Run until cancelled
    pub async fn run(self, state: Arc<RelayState>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Starting keepalive monitor (interval: {:?}, timeout: {:?})",
            self.interval,
            self.timeout
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(&state).await;
                    if report.reaped > 0 {
                        tracing::info!("Reaped {} unresponsive agent(s)", report.reaped);
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Keepalive monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Ping every live agent and abort the silent ones
    pub async fn sweep(&self, state: &RelayState) -> SweepReport {
        let mut report = SweepReport::default();

        for (agent_id, liveness) in state.coordinator.keepalive_targets(self.timeout).await {
            match liveness {
                Liveness::Alive(handle) => {
                    if handle.try_send(&Frame::Ping) {
                        report.pinged += 1;
                    } else {
                        tracing::debug!("Could not queue ping for agent {}", agent_id);
                    }
                }
                Liveness::Stale(handle) => {
                    tracing::warn!(
                        "Agent {} missed keepalive for over {:?}, closing",
                        agent_id,
                        self.timeout
                    );
                    state.coordinator.mark_closing(&agent_id).await;
                    handle.abort();
                    report.reaped += 1;
                }
            }
        }

        report
    }
}
