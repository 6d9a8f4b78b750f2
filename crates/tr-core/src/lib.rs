//! tr-core: Core configuration and error types for term-relay
//!
//! This crate provides the configuration structures and the error taxonomy
//! shared by the relay daemon and the agent.

pub mod config;
pub mod error;

pub use error::{ConfigError, RelayError};
