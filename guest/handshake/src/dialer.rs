//! Data-channel dialer.
//!
//! After the handshake the agent dials the host once more; that connection
//! carries the switch's traffic and is handed to the switch child as a raw
//! descriptor.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::thread;

use tracing::{debug, info, warn};

use crate::config::DialPolicy;
use crate::error::{AgentError, Result};

/// Outbound transport for the data channel.
pub trait Connector {
    type Stream: Into<OwnedFd>;

    fn connect(&self) -> io::Result<Self::Stream>;

    /// Human-readable remote endpoint, used in logs and errors.
    fn endpoint(&self) -> String;
}

/// Connects to a vsock port on the host.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub struct VsockConnector {
    pub cid: u32,
    pub port: u32,
}

#[cfg(target_os = "linux")]
impl Connector for VsockConnector {
    type Stream = crate::vsock::VsockStream;

    fn connect(&self) -> io::Result<Self::Stream> {
        crate::vsock::VsockStream::connect(self.cid, self.port)
    }

    fn endpoint(&self) -> String {
        format!("vsock://{}:{}", self.cid, self.port)
    }
}

/// The established data-plane connection.
///
/// Owns the only descriptor for the socket. Consumed by the switch launcher.
#[derive(Debug)]
pub struct DataChannel {
    fd: OwnedFd,
    endpoint: String,
}

impl DataChannel {
    pub fn new(fd: OwnedFd, endpoint: impl Into<String>) -> Self {
        Self {
            fd,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for DataChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Dial the host, retrying with backoff until `policy` is exhausted.
pub fn dial_data_channel<C: Connector>(connector: &C, policy: &DialPolicy) -> Result<DataChannel> {
    let endpoint = connector.endpoint();

    if !policy.grace.is_zero() {
        debug!(grace = ?policy.grace, "Waiting before dialing host");
        thread::sleep(policy.grace);
    }

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connector.connect() {
            Ok(stream) => {
                info!(endpoint = %endpoint, attempt, "Dialed host data channel");
                return Ok(DataChannel::new(stream.into(), endpoint));
            }
            Err(source) if attempt >= max_attempts => {
                return Err(AgentError::Dial {
                    endpoint,
                    attempts: attempt,
                    source,
                });
            }
            Err(e) => {
                let wait = policy.backoff(attempt);
                warn!(
                    endpoint = %endpoint,
                    attempt,
                    error = %e,
                    retry_in = ?wait,
                    "Dial to host failed, retrying"
                );
                thread::sleep(wait);
            }
        }
    }
}
