//! Connection lifecycle: keepalive and teardown

pub mod keepalive;
pub mod teardown;

pub use keepalive::{HealthMonitor, SweepReport};
pub use teardown::{agent_closed, operator_closed, shell_exited, shutdown};
