//! Handoff of the data channel to the network switch.
//!
//! The switch is started with the data-channel socket as descriptor 3 and
//! its output in a log file. The agent keeps no copy of the socket once the
//! child is running; the child's exit status becomes the agent's own result.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;

use tracing::{error, info};

use crate::config::AgentConfig;
use crate::dialer::DataChannel;
use crate::error::{AgentError, Result};

/// Descriptor number the switch expects its data-plane socket on.
pub const DATA_CHANNEL_FD: RawFd = 3;

#[derive(Debug, Clone)]
pub struct SwitchLauncher {
    child_path: PathBuf,
    log_path: PathBuf,
}

impl SwitchLauncher {
    pub fn new(child_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            child_path: child_path.into(),
            log_path: log_path.into(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(&config.child_path, &config.switch_log)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Start the switch with `channel` as its descriptor 3.
    ///
    /// When `netns` is given the child joins that network namespace before
    /// exec, so it never runs in the agent's own namespace.
    pub fn launch(&self, channel: DataChannel, netns: Option<BorrowedFd<'_>>) -> Result<SwitchProcess> {
        let mut cmd = Command::new(&self.child_path);
        cmd.arg("-debug").stdin(Stdio::null());

        match open_log(&self.log_path) {
            Ok((stdout, stderr)) => {
                cmd.stdout(stdout).stderr(stderr);
            }
            Err(e) => {
                error!(path = %self.log_path.display(), error = %e, "Failed to create log file for vm-switch");
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let channel_fd = channel.as_fd().as_raw_fd();
        let netns_fd = netns.map(|fd| fd.as_raw_fd());

        // SAFETY: the hook runs in the forked child and only issues
        // setns/dup2/fcntl, which are async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(ns) = netns_fd {
                    enter_netns(ns)?;
                }
                inherit_as(channel_fd, DATA_CHANNEL_FD)
            });
        }

        let child = cmd.spawn().map_err(AgentError::SwitchSpawn)?;

        // Close the parent's copies: the log handles live in `cmd`, and the
        // child now holds the only reference to the data channel.
        drop(cmd);
        let endpoint = channel.endpoint().to_string();
        drop(channel);

        info!(
            pid = child.id(),
            endpoint = %endpoint,
            "Successfully started the child process vm-switch"
        );
        Ok(SwitchProcess { child })
    }
}

fn open_log(path: &Path) -> io::Result<(File, File)> {
    let stdout = File::create(path)?;
    let stderr = stdout.try_clone()?;
    Ok((stdout, stderr))
}

/// Make `fd` available as `target` across exec.
fn inherit_as(fd: RawFd, target: RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use nix::unistd::dup2;

    if fd == target {
        // dup2 onto itself would keep close-on-exec set.
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        dup2(fd, target)?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn enter_netns(fd: RawFd) -> io::Result<()> {
    use nix::sched::{setns, CloneFlags};

    // SAFETY: the namespace handle stays open in the parent until spawn returns.
    let ns = unsafe { BorrowedFd::borrow_raw(fd) };
    setns(ns, CloneFlags::CLONE_NEWNET)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enter_netns(_fd: RawFd) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "network namespaces need Linux",
    ))
}

/// A running switch child.
#[derive(Debug)]
pub struct SwitchProcess {
    child: Child,
}

impl SwitchProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Wait for the switch on a supervisor thread and join it.
    ///
    /// Succeeds only if the switch exits cleanly.
    pub fn supervise(self) -> Result<()> {
        let child = self.child;
        let supervisor = thread::Builder::new()
            .name("vm-switch-wait".to_string())
            .spawn(move || wait_for_exit(child))?;
        supervisor
            .join()
            .map_err(|_| AgentError::SupervisorPanicked)?
    }
}

fn wait_for_exit(mut child: Child) -> Result<()> {
    let pid = child.id();
    let status = child.wait()?;
    if status.success() {
        info!(pid, "vm-switch exited cleanly");
        Ok(())
    } else {
        error!(pid, status = %status, "vm-switch exited with error");
        Err(AgentError::SwitchExited { status })
    }
}
