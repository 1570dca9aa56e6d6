//! Minimal AF_VSOCK stream sockets on top of nix.
//!
//! Only what the agent needs: a listener bound to any CID and a blocking
//! connect to the host. Every descriptor is created close-on-exec; the
//! switch launcher clears the flag on the one descriptor it hands down.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::sys::socket::{
    accept4, bind, connect, getpeername, listen, socket, AddressFamily, Backlog, SockFlag,
    SockType, VsockAddr,
};

/// Wildcard CID for listening.
pub const CID_ANY: u32 = libc::VMADDR_CID_ANY;

/// Well-known CID of the hypervisor host.
pub const CID_HOST: u32 = libc::VMADDR_CID_HOST;

fn new_socket() -> io::Result<OwnedFd> {
    Ok(socket(
        AddressFamily::Vsock,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?)
}

fn describe(addr: &VsockAddr) -> String {
    format!("vsock://{}:{}", addr.cid(), addr.port())
}

/// A listening vsock socket.
#[derive(Debug)]
pub struct VsockListener {
    fd: OwnedFd,
    port: u32,
}

impl VsockListener {
    /// Bind and listen on `port` for connections from `cid`.
    pub fn bind(cid: u32, port: u32) -> io::Result<Self> {
        let fd = new_socket()?;
        let addr = VsockAddr::new(cid, port);
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(4)?)?;
        Ok(Self { fd, port })
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// Block until a peer connects. Returns the stream and the peer address.
    pub fn accept(&self) -> io::Result<(VsockStream, String)> {
        let raw = accept4(self.fd.as_raw_fd(), SockFlag::SOCK_CLOEXEC)?;
        // SAFETY: accept4 returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let peer = getpeername::<VsockAddr>(fd.as_raw_fd())
            .map(|addr| describe(&addr))
            .unwrap_or_else(|_| "vsock://unknown".to_string());
        Ok((VsockStream::from(fd), peer))
    }
}

/// A connected vsock stream.
#[derive(Debug)]
pub struct VsockStream {
    inner: File,
}

impl VsockStream {
    /// Blocking connect to `cid:port`.
    pub fn connect(cid: u32, port: u32) -> io::Result<Self> {
        let fd = new_socket()?;
        connect(fd.as_raw_fd(), &VsockAddr::new(cid, port))?;
        Ok(Self::from(fd))
    }
}

impl From<OwnedFd> for VsockStream {
    fn from(fd: OwnedFd) -> Self {
        Self {
            inner: File::from(fd),
        }
    }
}

impl From<VsockStream> for OwnedFd {
    fn from(stream: VsockStream) -> Self {
        OwnedFd::from(stream.inner)
    }
}

impl AsFd for VsockStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Read for VsockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for VsockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
