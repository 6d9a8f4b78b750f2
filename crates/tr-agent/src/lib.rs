//! tr-agent: Remote node agent for term-relay
//!
//! The agent runs on the machine being administered. It dials out to the
//! relay over WebSocket, registers under a node name, and serves one local
//! shell per session the relay opens.

pub mod pty;
pub mod runtime;
pub mod tunnel;

pub use runtime::{run, AgentRuntime, LoopExit};
