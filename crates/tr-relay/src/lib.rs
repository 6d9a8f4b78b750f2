//! tr-relay: Rendezvous relay between NAT'd agents and operator terminals
//!
//! Agents dial in over WebSocket and register; operators attach to an agent
//! by id and get a dedicated shell session on it. The relay keeps both
//! registries, routes frames between the two sides and tears sessions down
//! when either side goes away.

pub mod connection;
pub mod coordinator;
pub mod lifecycle;
pub mod router;
pub mod server;
pub mod session;
pub mod state;

pub use coordinator::StateCoordinator;
pub use server::RelayServer;
pub use state::RelayState;
