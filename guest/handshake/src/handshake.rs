//! Host handshake listener.
//!
//! The host proves the guest agent is up by connecting to the handshake port
//! and reading a fixed identification phrase. The listener serves exactly one
//! successful exchange, then stops and signals the main flow once.

use std::io::{self, Write};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::config::SEED_PHRASE;
use crate::error::{AgentError, Result};

/// Source of inbound handshake connections.
pub trait Acceptor: Send + 'static {
    type Stream: Write;

    /// Block until a peer connects; returns the stream and a peer description.
    fn accept_peer(&self) -> io::Result<(Self::Stream, String)>;
}

#[cfg(target_os = "linux")]
impl Acceptor for crate::vsock::VsockListener {
    type Stream = crate::vsock::VsockStream;

    fn accept_peer(&self) -> io::Result<(Self::Stream, String)> {
        self.accept()
    }
}

/// Write the identification phrase and nothing else.
pub fn write_identification<W: Write>(conn: &mut W) -> io::Result<()> {
    conn.write_all(SEED_PHRASE.as_bytes())?;
    conn.flush()
}

/// Accept one connection and complete the exchange on it.
///
/// The connection is closed when this returns, whether or not the write
/// succeeded.
pub fn serve_one_handshake<A: Acceptor>(acceptor: &A) -> Result<String> {
    let (mut conn, peer) = acceptor.accept_peer().map_err(|e| {
        error!(error = %e, "Handshake connection accept failed");
        AgentError::HandshakeAborted(format!("connection accept: {}", e))
    })?;

    write_identification(&mut conn).map_err(|e| {
        error!(peer = %peer, error = %e, "Writing handshake phrase failed");
        AgentError::HandshakeAborted(format!("writing phrase to {}: {}", peer, e))
    })?;

    info!(peer = %peer, "Successful handshake with host switch");
    Ok(peer)
}

/// One-shot completion signal from the listener thread.
#[derive(Debug)]
pub struct HandshakeSignal {
    rx: mpsc::Receiver<Result<String>>,
    handle: JoinHandle<()>,
}

impl HandshakeSignal {
    /// Block until the listener finishes. Returns the peer that completed
    /// the handshake. No timeout: a healthy listener may wait forever.
    pub fn wait(self) -> Result<String> {
        let outcome = self.rx.recv().unwrap_or_else(|_| {
            Err(AgentError::HandshakeAborted(
                "listener exited without signalling".to_string(),
            ))
        });
        // The listener returns right after sending, so this does not block.
        if self.handle.join().is_err() {
            return Err(AgentError::HandshakeAborted(
                "listener thread panicked".to_string(),
            ));
        }
        outcome
    }
}

/// Run the handshake on a dedicated thread.
pub fn spawn_handshake_listener<A: Acceptor>(acceptor: A) -> Result<HandshakeSignal> {
    // Capacity 1: the single send never blocks, even if nobody waits.
    let (tx, rx) = mpsc::sync_channel(1);
    let handle = thread::Builder::new()
        .name("handshake".to_string())
        .spawn(move || {
            let outcome = serve_one_handshake(&acceptor);
            let _ = tx.send(outcome);
        })?;
    Ok(HandshakeSignal { rx, handle })
}
