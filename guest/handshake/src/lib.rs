//! Guest networking bootstrap agent.
//!
//! Runs once at VM startup: recreates the isolated network namespace,
//! answers the host handshake over vsock, dials the data channel, starts the
//! detached isolation helper and hands the data channel to the network switch.

pub mod agent;
pub mod config;
pub mod dialer;
pub mod error;
pub mod handshake;
pub mod isolation;
pub mod namespace;
pub mod switch;
#[cfg(target_os = "linux")]
pub mod vsock;

pub use agent::{Agent, Bootstrap, Stage};
pub use config::{AgentConfig, DialPolicy};
pub use error::{AgentError, Result};
