//! Frame types for the term-relay protocol
//!
//! Every frame is a JSON object with a `type` discriminator. Field names are
//! camelCase on the wire (`sessionId`, `nodeName`, `agentId`).
//!
//! # Message Flow
//!
//! 1. Agent connects to `/agent` and sends `register`
//! 2. Relay responds with `registered { agentId }`
//! 3. Relay sends `ping` periodically, agent responds with `pong`
//! 4. Operator connects to `/terminal?agentId=...`; relay answers `connected`
//!    and sends the agent `start_shell`
//! 5. Terminal I/O: `data` frames flow in both directions, tagged with the
//!    session id; `resize` flows operator → agent
//! 6. Session end: `close_shell` (either side)
//!
//! The `connect`, `disconnect` and `disconnected` variants belong to the
//! sibling SSH proxy, which speaks the same operator-facing vocabulary. They
//! are modelled here so a single client can parse both services.

use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, SessionId};

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of columns
    pub cols: u16,
    /// Number of rows
    pub rows: u16,
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Default terminal size (80x24), used until the first resize
    pub fn default_size() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::default_size()
    }
}

/// Frame type discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Register,
    Registered,
    StartShell,
    Data,
    Resize,
    CloseShell,
    Error,
    Ping,
    Pong,
    Connected,
    Connect,
    Disconnect,
    Disconnected,
}

impl FrameType {
    /// Wire name of this frame type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Registered => "registered",
            Self::StartShell => "start_shell",
            Self::Data => "data",
            Self::Resize => "resize",
            Self::CloseShell => "close_shell",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Connected => "connected",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Disconnected => "disconnected",
        }
    }

    /// Parse a wire name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "register" => Some(Self::Register),
            "registered" => Some(Self::Registered),
            "start_shell" => Some(Self::StartShell),
            "data" => Some(Self::Data),
            "resize" => Some(Self::Resize),
            "close_shell" => Some(Self::CloseShell),
            "error" => Some(Self::Error),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "connected" => Some(Self::Connected),
            "connect" => Some(Self::Connect),
            "disconnect" => Some(Self::Disconnect),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// Protocol frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Agent registration. The node name falls back to the `x-node-name`
    /// connect header when absent.
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_name: Option<String>,
    },

    /// Registration acknowledgment carrying the freshly minted agent id
    Registered { agent_id: AgentId },

    /// Ask the agent to spawn a shell for a session
    StartShell {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },

    /// Terminal data. Operators may omit the session id; the relay re-tags.
    Data {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        data: String,
    },

    /// Terminal resize
    Resize {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        cols: u16,
        rows: u16,
    },

    /// Close a session's shell
    CloseShell {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Error report
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        error: String,
    },

    /// Liveness probe
    Ping,

    /// Liveness acknowledgment
    Pong,

    /// Attach succeeded (operator-facing)
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_name: Option<String>,
    },

    /// SSH proxy: open a session from a stored credential
    Connect {
        credential_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },

    /// SSH proxy: operator asks to end the session
    Disconnect,

    /// SSH proxy: the remote side ended the session
    Disconnected,
}

impl Frame {
    /// Get the frame type for this frame
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Register { .. } => FrameType::Register,
            Frame::Registered { .. } => FrameType::Registered,
            Frame::StartShell { .. } => FrameType::StartShell,
            Frame::Data { .. } => FrameType::Data,
            Frame::Resize { .. } => FrameType::Resize,
            Frame::CloseShell { .. } => FrameType::CloseShell,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping => FrameType::Ping,
            Frame::Pong => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Disconnect => FrameType::Disconnect,
            Frame::Disconnected => FrameType::Disconnected,
        }
    }

    /// Session id carried by this frame, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Frame::StartShell { session_id, .. } => Some(session_id),
            Frame::Data { session_id, .. }
            | Frame::Resize { session_id, .. }
            | Frame::CloseShell { session_id }
            | Frame::Error { session_id, .. }
            | Frame::Connected { session_id, .. } => session_id.as_ref(),
            _ => None,
        }
    }

    /// Return this frame re-tagged with the given session id.
    ///
    /// Frames that carry no session id are returned unchanged.
    pub fn with_session(mut self, id: SessionId) -> Self {
        match &mut self {
            Frame::StartShell { session_id, .. } => *session_id = id,
            Frame::Data { session_id, .. }
            | Frame::Resize { session_id, .. }
            | Frame::CloseShell { session_id }
            | Frame::Error { session_id, .. }
            | Frame::Connected { session_id, .. } => *session_id = Some(id),
            _ => {}
        }
        self
    }

    /// `start_shell` for a session with the given initial size
    pub fn start_shell(session_id: SessionId, size: TerminalSize) -> Self {
        Frame::StartShell {
            session_id,
            cols: size.cols,
            rows: size.rows,
        }
    }

    /// `close_shell` for a session
    pub fn close_shell(session_id: SessionId) -> Self {
        Frame::CloseShell {
            session_id: Some(session_id),
        }
    }

    /// Untagged error frame
    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            session_id: None,
            error: message.into(),
        }
    }
}
