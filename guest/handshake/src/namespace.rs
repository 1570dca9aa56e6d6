//! Named network namespace management.
//!
//! A named namespace is a bind mount of a namespace file onto
//! `<netns_dir>/<name>`, the layout `ip netns` uses. The bind mount keeps the
//! namespace alive after the thread that created it is gone, and lets
//! `nsenter -n<path>` find it by path.

use std::fmt;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{AgentError, Result};

/// Backend that can delete and create named network namespaces.
pub trait NamespaceOps {
    /// Reference to a created namespace.
    type Handle;

    /// Remove the namespace called `name`. Absence is reported as an error.
    fn delete_named(&self, name: &str) -> io::Result<()>;

    /// Create a fresh namespace called `name`.
    fn create_named(&self, name: &str) -> io::Result<Self::Handle>;
}

/// Open reference to a named network namespace.
#[derive(Debug)]
pub struct NetnsHandle {
    path: PathBuf,
    fd: OwnedFd,
}

impl NetnsHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for NetnsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl fmt::Display for NetnsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use std::os::fd::AsRawFd;
        write!(f, "NsHandle({}: {})", self.fd.as_raw_fd(), self.path.display())
    }
}

/// Delete any namespace left over under `name`.
///
/// Errors are only logged: a missing namespace is the common case and must
/// never stop the fresh one from being created.
pub fn remove_stale_namespace<O: NamespaceOps>(ops: &O, name: &str) {
    match ops.delete_named(name) {
        Ok(()) => debug!(namespace = name, "Removed stale namespace"),
        Err(e) => debug!(namespace = name, error = %e, "No stale namespace removed"),
    }
}

/// Delete-then-create the namespace called `name`.
pub fn configure_namespace<O: NamespaceOps>(ops: &O, name: &str) -> Result<O::Handle> {
    remove_stale_namespace(ops, name);

    let handle = ops
        .create_named(name)
        .map_err(|source| AgentError::NamespaceCreate {
            name: name.to_string(),
            source,
        })?;

    info!(namespace = name, "Created a new network namespace");
    Ok(handle)
}

/// Named namespaces stored as bind mounts under one directory.
#[derive(Debug, Clone)]
pub struct NetnsDir {
    root: PathBuf,
}

impl NetnsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[cfg(target_os = "linux")]
impl NamespaceOps for NetnsDir {
    type Handle = NetnsHandle;

    fn delete_named(&self, name: &str) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::mount::{umount2, MntFlags};

        let path = self.path_of(name);
        match umount2(&path, MntFlags::MNT_DETACH) {
            // EINVAL: a leftover file that is no longer a mount point
            Ok(()) | Err(Errno::EINVAL) => {}
            Err(e) => return Err(e.into()),
        }
        std::fs::remove_file(&path)
    }

    fn create_named(&self, name: &str) -> io::Result<NetnsHandle> {
        use std::fs::{File, OpenOptions};
        use std::os::unix::fs::OpenOptionsExt;

        std::fs::create_dir_all(&self.root)?;

        let path = self.path_of(name);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o444)
            .open(&path)?;

        // Network namespace membership is per thread: unsharing on a scratch
        // thread leaves the rest of the agent where it was.
        let target = path.clone();
        let created = std::thread::Builder::new()
            .name(format!("netns-{}", name))
            .spawn(move || bind_new_netns(&target))?
            .join()
            .map_err(|_| io::Error::other("namespace creation thread panicked"))?;

        if let Err(e) = created {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        let fd = OwnedFd::from(File::open(&path)?);
        Ok(NetnsHandle { path, fd })
    }
}

/// Unshare the calling thread's network namespace and pin it at `target`.
#[cfg(target_os = "linux")]
fn bind_new_netns(target: &Path) -> io::Result<()> {
    use nix::mount::{mount, MsFlags};
    use nix::sched::{unshare, CloneFlags};
    use nix::unistd::gettid;

    unshare(CloneFlags::CLONE_NEWNET)?;

    let source = format!("/proc/self/task/{}/ns/net", gettid());
    mount(
        Some(source.as_str()),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )?;
    Ok(())
}
