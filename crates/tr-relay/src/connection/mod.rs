//! Connection management

mod handle;
mod registry;

pub use handle::{Outbound, PeerHandle, TrySend};
pub use registry::{AgentConnection, AgentRegistry, AgentSummary, LinkState};
