//! Agent configuration and the well-known constants shared with the host.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Vsock port the host connects to for the handshake.
pub const HANDSHAKE_VSOCK_PORT: u32 = 6669;

/// Vsock port on the host the data channel is dialed to.
pub const DATA_VSOCK_PORT: u32 = 6655;

/// Identification phrase written to the host on the handshake connection.
pub const SEED_PHRASE: &str = "github.com/rancher-sandbox/rancher-desktop-networking";

/// Name of the isolated network namespace.
pub const DEFAULT_NAMESPACE: &str = "rd1";

/// Directory holding bind-mounted named network namespaces.
pub const DEFAULT_NETNS_DIR: &str = "/run/netns";

/// Where the isolation process PID is published.
pub const DEFAULT_PID_FILE: &str = "/run/wsl-init.pid";

/// Where the switch child's stdout and stderr go.
pub const DEFAULT_SWITCH_LOG: &str = "/var/logs/vm-switch.log";

pub const DEFAULT_NSENTER: &str = "/usr/bin/nsenter";
pub const DEFAULT_UNSHARE: &str = "/usr/bin/unshare";

/// Retry policy for dialing the data channel.
///
/// The host may not be accepting on the data port the moment the handshake
/// completes, so the dial is retried with exponential backoff instead of
/// sleeping a fixed interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPolicy {
    /// Delay before the first attempt.
    pub grace: Duration,
    /// Total number of connection attempts, at least 1.
    pub max_attempts: u32,
    /// Wait after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single wait.
    pub max_backoff: Duration,
}

impl Default for DialPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::ZERO,
            max_attempts: 10,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl DialPolicy {
    /// Wait to apply after the given failed attempt (1-based).
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let shift = failed_attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Everything the agent needs to run one bootstrap.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Path to the network switch binary.
    pub child_path: PathBuf,
    /// Argument handed to `unshare` inside the isolated context.
    pub unshare_arg: String,
    pub namespace: String,
    pub netns_dir: PathBuf,
    pub handshake_port: u32,
    pub data_port: u32,
    pub pid_file: PathBuf,
    pub switch_log: PathBuf,
    pub nsenter_path: PathBuf,
    pub unshare_path: PathBuf,
    pub dial: DialPolicy,
}

impl AgentConfig {
    /// Config with every well-known default and the two required parameters.
    pub fn new(child_path: impl Into<PathBuf>, unshare_arg: impl Into<String>) -> Self {
        Self {
            child_path: child_path.into(),
            unshare_arg: unshare_arg.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            netns_dir: PathBuf::from(DEFAULT_NETNS_DIR),
            handshake_port: HANDSHAKE_VSOCK_PORT,
            data_port: DATA_VSOCK_PORT,
            pid_file: PathBuf::from(DEFAULT_PID_FILE),
            switch_log: PathBuf::from(DEFAULT_SWITCH_LOG),
            nsenter_path: PathBuf::from(DEFAULT_NSENTER),
            unshare_path: PathBuf::from(DEFAULT_UNSHARE),
            dial: DialPolicy::default(),
        }
    }

    /// Reject configurations the agent must not start with.
    pub fn validate(&self) -> Result<()> {
        if self.child_path.as_os_str().is_empty() {
            return Err(AgentError::Config(
                "path to the child sub process must be provided".to_string(),
            ));
        }
        if self.unshare_arg.is_empty() {
            return Err(AgentError::Config(
                "unshare program arg must be provided".to_string(),
            ));
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(AgentError::Config(format!(
                "invalid namespace name: '{}'",
                self.namespace
            )));
        }
        if self.handshake_port == self.data_port {
            return Err(AgentError::Config(format!(
                "handshake and data ports must differ (both {})",
                self.data_port
            )));
        }
        if self.dial.max_attempts == 0 {
            return Err(AgentError::Config(
                "dial policy needs at least one attempt".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the bind-mounted namespace file.
    pub fn netns_path(&self) -> PathBuf {
        self.netns_dir.join(&self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::new("/usr/local/bin/vm-switch", "/init");
        assert_eq!(config.namespace, "rd1");
        assert_eq!(config.handshake_port, 6669);
        assert_eq!(config.data_port, 6655);
        assert_eq!(config.pid_file, PathBuf::from("/run/wsl-init.pid"));
        assert_eq!(config.netns_path(), PathBuf::from("/run/netns/rd1"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_child_path_rejected() {
        let config = AgentConfig::new("", "/init");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert!(err.to_string().contains("child sub process"));
    }

    #[test]
    fn test_missing_unshare_arg_rejected() {
        let config = AgentConfig::new("/usr/local/bin/vm-switch", "");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unshare program arg"));
    }

    #[test]
    fn test_namespace_with_slash_rejected() {
        let mut config = AgentConfig::new("/bin/switch", "/init");
        config.namespace = "../etc".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_same_ports_rejected() {
        let mut config = AgentConfig::new("/bin/switch", "/init");
        config.data_port = config.handshake_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_seed_phrase_is_ascii() {
        assert!(SEED_PHRASE.is_ascii());
        assert_eq!(SEED_PHRASE.len(), 53);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = DialPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_secs(1));
        assert_eq!(policy.backoff(4), Duration::from_secs(2));
        assert_eq!(policy.backoff(40), Duration::from_secs(2));
    }
}
