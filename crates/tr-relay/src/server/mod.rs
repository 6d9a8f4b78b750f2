//! WebSocket and HTTP server

mod handler;
pub mod http;
mod listener;

pub use handler::{
    agent_ws, terminal_ws, unknown_endpoint, TerminalParams, AGENT_OFFLINE, API_KEY_HEADER,
    MISSING_AGENT_ID, NODE_NAME_HEADER, UNKNOWN_ENDPOINT,
};
pub use listener::{build_router, RelayServer};
