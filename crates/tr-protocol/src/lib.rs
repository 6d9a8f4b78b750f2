//! tr-protocol: Wire protocol for term-relay session multiplexing
//!
//! This crate defines the JSON frame vocabulary exchanged between the relay,
//! the agents that dial into it, and the operators attaching terminals.

pub mod codec;
pub mod error;
pub mod frame;
pub mod ids;

pub use codec::MAX_FRAME_SIZE;
pub use error::ProtocolError;
pub use frame::{Frame, FrameType, TerminalSize};
pub use ids::{AgentId, SessionId};
