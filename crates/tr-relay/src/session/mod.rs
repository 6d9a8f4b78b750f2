//! Session management

mod manager;

pub use manager::{SessionRegistry, SessionState, UserSession};
