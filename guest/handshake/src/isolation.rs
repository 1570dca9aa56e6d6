//! Isolation launcher.
//!
//! Entering a namespace cannot be undone reliably inside a multi-threaded
//! process, so namespace entry happens in a separate helper process:
//! `nsenter` joins the named network namespace, then `unshare` creates new
//! PID and mount namespaces (propagation `slave`, forked so the payload is
//! PID 1 there) and runs the caller's argument inside them.
//!
//! The helper is detached. The agent records its PID and never waits on or
//! signals it; whatever supervises the VM owns its liveness.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::info;

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};

/// Flags passed to `unshare` ahead of the caller's argument.
const UNSHARE_FLAGS: [&str; 5] = ["--pid", "--mount-proc", "--fork", "--propagation", "slave"];

/// A started helper the agent will not supervise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachedProcess {
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct IsolationLauncher {
    nsenter: PathBuf,
    unshare: PathBuf,
    netns_path: PathBuf,
    pid_file: PathBuf,
}

impl IsolationLauncher {
    pub fn new(
        nsenter: impl Into<PathBuf>,
        unshare: impl Into<PathBuf>,
        netns_path: impl Into<PathBuf>,
        pid_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            nsenter: nsenter.into(),
            unshare: unshare.into(),
            netns_path: netns_path.into(),
            pid_file: pid_file.into(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            &config.nsenter_path,
            &config.unshare_path,
            config.netns_path(),
            &config.pid_file,
        )
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Build the helper command line. Standard streams pass straight through.
    pub fn command(&self, unshare_arg: &str) -> Command {
        let mut net = OsString::from("-n");
        net.push(&self.netns_path);

        let mut cmd = Command::new(&self.nsenter);
        cmd.arg(net)
            .arg("-F")
            .arg(&self.unshare)
            .args(UNSHARE_FLAGS)
            .arg(unshare_arg)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }

    /// Start the helper and publish its PID.
    ///
    /// The PID file is only touched once the spawn has succeeded.
    pub fn launch(&self, unshare_arg: &str) -> Result<DetachedProcess> {
        let child = self
            .command(unshare_arg)
            .spawn()
            .map_err(AgentError::IsolationSpawn)?;
        let pid = child.id();
        // Dropping the handle neither waits on nor kills the helper.
        drop(child);

        write_pid_file(&self.pid_file, pid)?;

        info!(pid, unshare_arg, pid_file = %self.pid_file.display(), "Unshare process started");
        Ok(DetachedProcess { pid })
    }
}

/// Overwrite `path` with `pid` as plain decimal text.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?;
        file.write_all(pid.to_string().as_bytes())
    };
    write().map_err(|source| AgentError::PidFile {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher(nsenter: &str, pid_file: &Path) -> IsolationLauncher {
        IsolationLauncher::new(nsenter, "/usr/bin/unshare", "/run/netns/rd1", pid_file)
    }

    #[test]
    fn test_command_line() {
        let l = launcher("/usr/bin/nsenter", Path::new("/run/wsl-init.pid"));
        let cmd = l.command("/sbin/init");
        assert_eq!(cmd.get_program(), "/usr/bin/nsenter");
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "-n/run/netns/rd1",
                "-F",
                "/usr/bin/unshare",
                "--pid",
                "--mount-proc",
                "--fork",
                "--propagation",
                "slave",
                "/sbin/init",
            ]
        );
    }

    #[test]
    fn test_from_config_uses_namespace_path() {
        let mut config = AgentConfig::new("/bin/switch", "/init");
        config.namespace = "other".to_string();
        let l = IsolationLauncher::from_config(&config);
        let args: Vec<_> = l.command("x").get_args().map(|a| a.to_owned()).collect();
        assert_eq!(args[0], "-n/run/netns/other");
        assert_eq!(l.pid_file(), Path::new("/run/wsl-init.pid"));
    }

    #[test]
    fn test_launch_writes_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("init.pid");

        let process = launcher("true", &pid_file).launch("/init").unwrap();

        let contents = std::fs::read_to_string(&pid_file).unwrap();
        assert_eq!(contents, process.pid.to_string());
    }

    #[test]
    fn test_spawn_failure_leaves_pid_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("init.pid");
        std::fs::write(&pid_file, "previous").unwrap();

        let err = launcher("/nonexistent/nsenter", &pid_file)
            .launch("/init")
            .unwrap_err();
        assert!(matches!(err, AgentError::IsolationSpawn(_)));
        assert_eq!(std::fs::read_to_string(&pid_file).unwrap(), "previous");
    }

    #[test]
    fn test_spawn_failure_creates_no_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("init.pid");

        assert!(launcher("/nonexistent/nsenter", &pid_file).launch("/init").is_err());
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_pid_file_is_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("init.pid");
        std::fs::write(&pid_file, "1234567890").unwrap();

        write_pid_file(&pid_file, 42).unwrap();
        assert_eq!(std::fs::read_to_string(&pid_file).unwrap(), "42");
    }

    #[test]
    fn test_pid_file_in_missing_dir_fails() {
        let err = write_pid_file(Path::new("/nonexistent/dir/init.pid"), 1).unwrap_err();
        assert!(matches!(err, AgentError::PidFile { .. }));
    }
}
