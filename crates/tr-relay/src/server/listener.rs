//! HTTP/WebSocket listener
//!
//! Serves the agent and operator socket endpoints plus the control surface,
//! and drives graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::lifecycle::{self, HealthMonitor};
use crate::server::handler::{agent_ws, terminal_ws, unknown_endpoint};
use crate::server::http;
use crate::state::RelayState;

/// Time given to sockets to flush their close frames during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Build the relay's router
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/agent", get(agent_ws))
        .route("/terminal", get(terminal_ws))
        .route("/health", get(http::health))
        .route("/agents", get(http::agents))
        .fallback(unknown_endpoint)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Relay server bound to a local address
pub struct RelayServer {
    state: Arc<RelayState>,
    listener: TcpListener,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Bind the listener. `cancel` triggers graceful shutdown.
    pub async fn bind(state: Arc<RelayState>, cancel: CancellationToken) -> Result<Self> {
        let bind_addr = state.config.bind_address.clone();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        Ok(Self {
            state,
            listener,
            cancel,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until cancelled
    pub async fn run(self) -> Result<()> {
        let local_addr = self.local_addr()?;
        tracing::info!("Relay listening on {}", local_addr);
        tracing::info!("  Agent endpoint:    ws://{}/agent", local_addr);
        tracing::info!("  Operator endpoint: ws://{}/terminal?agentId=...", local_addr);

        let monitor = HealthMonitor::from_config(&self.state.config)
            .spawn(Arc::clone(&self.state), self.state.shutdown.clone());

        let router = build_router(Arc::clone(&self.state));
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();

        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::info!("Relay shutting down");
            lifecycle::shutdown(&state).await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            state.shutdown.cancel();
        })
        .await
        .context("Relay server failed")?;

        self.state.shutdown.cancel();
        let _ = monitor.await;

        tracing::info!("Relay stopped");
        Ok(())
    }
}
