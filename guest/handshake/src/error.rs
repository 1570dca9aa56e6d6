//! Error types for the guest handshake agent.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Every failure the agent can hit between startup and the switch exiting.
///
/// All of these are terminal. Nothing is retried except the data-channel
/// dial, which only surfaces [`AgentError::Dial`] once its policy is spent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing or invalid startup parameter
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("creating new namespace failed: {name}: {source}")]
    NamespaceCreate {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake listen on port {port} failed: {source}")]
    Listen {
        port: u32,
        #[source]
        source: std::io::Error,
    },

    /// The listener stopped before any host completed the exchange.
    #[error("handshake aborted: {0}")]
    HandshakeAborted(String),

    #[error("cannot connect to host {endpoint} after {attempts} attempt(s): {source}")]
    Dial {
        endpoint: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("could not start the unshare process: {0}")]
    IsolationSpawn(#[source] std::io::Error),

    #[error("failed to write pid file {}: {source}", .path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not start the child process: {0}")]
    SwitchSpawn(#[source] std::io::Error),

    #[error("vm-switch exited with error: {status}")]
    SwitchExited { status: ExitStatus },

    #[error("vm-switch supervisor panicked")]
    SupervisorPanicked,

    /// Operation needs a Linux guest
    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::Error> for AgentError {
    fn from(err: nix::Error) -> Self {
        AgentError::Io(err.into())
    }
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
