//! Local pseudo-terminals for relay sessions

mod manager;
mod reader;

pub use manager::{validate_shell, PtyManager};
pub use reader::{spawn_pty_reader, PtyOutput, Utf8Chunker};
