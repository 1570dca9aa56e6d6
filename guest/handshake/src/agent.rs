//! Bootstrap state machine.
//!
//! ```text
//! Init -> NamespaceReady -> HandshakeDone -> ChannelDialed
//!      -> IsolationLaunched -> SwitchRunning -> Success | Failed
//! ```
//!
//! Each stage runs only after the previous one succeeded. Any error moves
//! straight to `Failed`; nothing already started is rolled back.

use std::fmt;

use tracing::{error, info};

use crate::dialer::DataChannel;
use crate::error::Result;
use crate::isolation::DetachedProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    NamespaceReady,
    HandshakeDone,
    ChannelDialed,
    IsolationLaunched,
    SwitchRunning,
    Success,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::NamespaceReady => "namespace-ready",
            Self::HandshakeDone => "handshake-done",
            Self::ChannelDialed => "channel-dialed",
            Self::IsolationLaunched => "isolation-launched",
            Self::SwitchRunning => "switch-running",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl Stage {
    /// The stage entered when the next step succeeds.
    fn next(self) -> Stage {
        match self {
            Self::Init => Self::NamespaceReady,
            Self::NamespaceReady => Self::HandshakeDone,
            Self::HandshakeDone => Self::ChannelDialed,
            Self::ChannelDialed => Self::IsolationLaunched,
            Self::IsolationLaunched => Self::SwitchRunning,
            Self::SwitchRunning => Self::Success,
            terminal => terminal,
        }
    }
}

/// The side effects behind each stage.
pub trait Bootstrap {
    type Namespace;
    type Switch;

    fn prepare_namespace(&mut self) -> Result<Self::Namespace>;

    /// Block until the host has completed the handshake.
    fn await_handshake(&mut self) -> Result<()>;

    fn dial_data_channel(&mut self) -> Result<DataChannel>;

    fn launch_isolation(&mut self, namespace: &Self::Namespace) -> Result<DetachedProcess>;

    /// Start the switch; takes ownership of the data channel.
    fn start_switch(
        &mut self,
        namespace: &Self::Namespace,
        channel: DataChannel,
    ) -> Result<Self::Switch>;

    /// Block until the switch exits.
    fn supervise_switch(&mut self, switch: Self::Switch) -> Result<()>;
}

/// Drives a [`Bootstrap`] through the stages in order.
#[derive(Debug)]
pub struct Agent<B> {
    bootstrap: B,
    stage: Stage,
    failed_at: Option<Stage>,
}

impl<B: Bootstrap> Agent<B> {
    pub fn new(bootstrap: B) -> Self {
        Self {
            bootstrap,
            stage: Stage::Init,
            failed_at: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// The stage that was being attempted when the run failed.
    pub fn failed_at(&self) -> Option<Stage> {
        self.failed_at
    }

    pub fn into_inner(self) -> B {
        self.bootstrap
    }

    /// Run every stage. The result is the switch's exit outcome, or the
    /// first error hit on the way there.
    pub fn run(&mut self) -> Result<()> {
        let result = self.drive();
        match &result {
            Ok(()) => {
                self.stage = Stage::Success;
                info!("Handshake process done");
            }
            Err(e) => {
                let attempting = self.stage.next();
                error!(
                    completed = %self.stage,
                    attempting = %attempting,
                    error = %e,
                    "Bootstrap failed"
                );
                self.failed_at = Some(attempting);
                self.stage = Stage::Failed;
            }
        }
        result
    }

    fn drive(&mut self) -> Result<()> {
        let namespace = self.bootstrap.prepare_namespace()?;
        self.advance(Stage::NamespaceReady);

        self.bootstrap.await_handshake()?;
        self.advance(Stage::HandshakeDone);

        let channel = self.bootstrap.dial_data_channel()?;
        self.advance(Stage::ChannelDialed);

        let isolation = self.bootstrap.launch_isolation(&namespace)?;
        info!(pid = isolation.pid, "Isolation process detached");
        self.advance(Stage::IsolationLaunched);

        let switch = self.bootstrap.start_switch(&namespace, channel)?;
        self.advance(Stage::SwitchRunning);

        self.bootstrap.supervise_switch(switch)
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "stage went backwards: {} -> {}", self.stage, next);
        info!(from = %self.stage, to = %next, "Bootstrap stage complete");
        self.stage = next;
    }
}

#[cfg(target_os = "linux")]
pub use guest::{run, GuestBootstrap};

#[cfg(target_os = "linux")]
mod guest {
    use std::os::fd::AsFd;

    use tracing::{error, info};

    use super::{Agent, Bootstrap};
    use crate::config::AgentConfig;
    use crate::dialer::{dial_data_channel, DataChannel, VsockConnector};
    use crate::error::{AgentError, Result};
    use crate::handshake::spawn_handshake_listener;
    use crate::isolation::{DetachedProcess, IsolationLauncher};
    use crate::namespace::{configure_namespace, NetnsDir, NetnsHandle};
    use crate::switch::{SwitchLauncher, SwitchProcess};
    use crate::vsock::{VsockListener, CID_ANY, CID_HOST};

    /// Real guest side effects: vsock, `/run/netns`, nsenter/unshare and
    /// the switch binary.
    #[derive(Debug)]
    pub struct GuestBootstrap {
        config: AgentConfig,
        namespaces: NetnsDir,
    }

    impl GuestBootstrap {
        pub fn new(config: AgentConfig) -> Self {
            let namespaces = NetnsDir::new(&config.netns_dir);
            Self { config, namespaces }
        }
    }

    impl Bootstrap for GuestBootstrap {
        type Namespace = NetnsHandle;
        type Switch = SwitchProcess;

        fn prepare_namespace(&mut self) -> Result<NetnsHandle> {
            let handle = configure_namespace(&self.namespaces, &self.config.namespace)?;
            info!(namespace = %handle, "Namespace ready");
            Ok(handle)
        }

        fn await_handshake(&mut self) -> Result<()> {
            let port = self.config.handshake_port;
            let listener = VsockListener::bind(CID_ANY, port)
                .map_err(|source| AgentError::Listen { port, source })?;
            info!(port = listener.port(), "Starting handshake");

            spawn_handshake_listener(listener)?.wait()?;
            Ok(())
        }

        fn dial_data_channel(&mut self) -> Result<DataChannel> {
            let connector = VsockConnector {
                cid: CID_HOST,
                port: self.config.data_port,
            };
            dial_data_channel(&connector, &self.config.dial)
        }

        fn launch_isolation(&mut self, _namespace: &NetnsHandle) -> Result<DetachedProcess> {
            IsolationLauncher::from_config(&self.config).launch(&self.config.unshare_arg)
        }

        fn start_switch(
            &mut self,
            namespace: &NetnsHandle,
            channel: DataChannel,
        ) -> Result<SwitchProcess> {
            SwitchLauncher::from_config(&self.config).launch(channel, Some(namespace.as_fd()))
        }

        fn supervise_switch(&mut self, switch: SwitchProcess) -> Result<()> {
            switch.supervise()
        }
    }

    /// Validate `config` and run the whole bootstrap. Every failure is
    /// logged here; callers only map the result to an exit code.
    pub fn run(config: AgentConfig) -> Result<()> {
        config
            .validate()
            .inspect_err(|e| error!(error = %e, "Invalid configuration"))?;
        Agent::new(GuestBootstrap::new(config)).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AgentError;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::process::ExitStatus;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FailAt {
        Nowhere,
        Namespace,
        Handshake,
        Dial,
        Isolation,
        SwitchStart,
        SwitchExit,
    }

    /// Records every call so ordering can be asserted.
    struct RecordingBootstrap {
        fail_at: FailAt,
        calls: Vec<&'static str>,
        channel_handed_over: bool,
    }

    impl RecordingBootstrap {
        fn new(fail_at: FailAt) -> Self {
            Self {
                fail_at,
                calls: Vec::new(),
                channel_handed_over: false,
            }
        }

        fn step(&mut self, name: &'static str, here: FailAt) -> Result<()> {
            self.calls.push(name);
            if self.fail_at == here {
                return Err(AgentError::Io(std::io::Error::other(format!("{name} failed"))));
            }
            Ok(())
        }
    }

    impl Bootstrap for RecordingBootstrap {
        type Namespace = &'static str;
        type Switch = u32;

        fn prepare_namespace(&mut self) -> Result<&'static str> {
            self.step("namespace", FailAt::Namespace)?;
            Ok("rd1")
        }

        fn await_handshake(&mut self) -> Result<()> {
            self.step("handshake", FailAt::Handshake)
        }

        fn dial_data_channel(&mut self) -> Result<DataChannel> {
            self.step("dial", FailAt::Dial)?;
            let (ours, _host) = UnixStream::pair()?;
            Ok(DataChannel::new(OwnedFd::from(ours), "pair"))
        }

        fn launch_isolation(&mut self, namespace: &&'static str) -> Result<DetachedProcess> {
            assert_eq!(*namespace, "rd1");
            self.step("isolation", FailAt::Isolation)?;
            Ok(DetachedProcess { pid: 100 })
        }

        fn start_switch(&mut self, _namespace: &&'static str, channel: DataChannel) -> Result<u32> {
            self.step("switch", FailAt::SwitchStart)?;
            assert_eq!(channel.endpoint(), "pair");
            self.channel_handed_over = true;
            Ok(200)
        }

        fn supervise_switch(&mut self, switch: u32) -> Result<()> {
            assert_eq!(switch, 200);
            self.calls.push("wait");
            if self.fail_at == FailAt::SwitchExit {
                use std::os::unix::process::ExitStatusExt;
                return Err(AgentError::SwitchExited {
                    status: ExitStatus::from_raw(1 << 8),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_successful_run_is_strictly_ordered() {
        let mut agent = Agent::new(RecordingBootstrap::new(FailAt::Nowhere));
        assert_eq!(agent.stage(), Stage::Init);
        agent.run().unwrap();
        assert_eq!(agent.stage(), Stage::Success);

        let fake = agent.into_inner();
        assert_eq!(
            fake.calls,
            vec!["namespace", "handshake", "dial", "isolation", "switch", "wait"]
        );
        assert!(fake.channel_handed_over);
    }

    #[test]
    fn test_dial_failure_stops_before_isolation() {
        let mut agent = Agent::new(RecordingBootstrap::new(FailAt::Dial));
        assert!(agent.run().is_err());
        assert_eq!(agent.stage(), Stage::Failed);
        assert_eq!(agent.into_inner().calls, vec!["namespace", "handshake", "dial"]);
    }

    #[test]
    fn test_namespace_failure_stops_everything() {
        let mut agent = Agent::new(RecordingBootstrap::new(FailAt::Namespace));
        assert!(agent.run().is_err());
        assert_eq!(agent.into_inner().calls, vec!["namespace"]);
    }

    #[test]
    fn test_handshake_failure_never_dials() {
        let mut agent = Agent::new(RecordingBootstrap::new(FailAt::Handshake));
        assert!(agent.run().is_err());
        assert_eq!(agent.into_inner().calls, vec!["namespace", "handshake"]);
    }

    #[test]
    fn test_isolation_failure_never_starts_switch() {
        let mut agent = Agent::new(RecordingBootstrap::new(FailAt::Isolation));
        assert!(agent.run().is_err());
        let fake = agent.into_inner();
        assert_eq!(fake.calls, vec!["namespace", "handshake", "dial", "isolation"]);
        assert!(!fake.channel_handed_over);
    }

    #[test]
    fn test_switch_start_failure_is_terminal() {
        let mut agent = Agent::new(RecordingBootstrap::new(FailAt::SwitchStart));
        assert!(agent.run().is_err());
        assert_eq!(agent.stage(), Stage::Failed);
        assert!(!agent.into_inner().calls.contains(&"wait"));
    }

    #[test]
    fn test_switch_exit_error_is_agent_result() {
        let mut agent = Agent::new(RecordingBootstrap::new(FailAt::SwitchExit));
        let err = agent.run().unwrap_err();
        assert!(matches!(err, AgentError::SwitchExited { .. }));
        assert_eq!(agent.stage(), Stage::Failed);
    }

    /// Collects formatted log output for one test.
    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    impl CapturedLogs {
        fn capture<T>(&self, f: impl FnOnce() -> T) -> T {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(self.clone())
                .with_ansi(false)
                .finish();
            tracing::subscriber::with_default(subscriber, f)
        }

        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_failed_at_names_the_attempted_stage() {
        let mut agent = Agent::new(RecordingBootstrap::new(FailAt::Dial));
        assert_eq!(agent.failed_at(), None);

        let logs = CapturedLogs::default();
        assert!(logs.capture(|| agent.run()).is_err());
        assert_eq!(agent.failed_at(), Some(Stage::ChannelDialed));

        let text = logs.text();
        assert_eq!(text.matches("Bootstrap failed").count(), 1);
        assert!(text.contains("completed=handshake-done"));
        assert!(text.contains("attempting=channel-dialed"));
    }

    #[test]
    fn test_switch_exit_is_attributed_to_supervision() {
        let mut agent = Agent::new(RecordingBootstrap::new(FailAt::SwitchExit));
        assert!(agent.run().is_err());
        assert_eq!(agent.failed_at(), Some(Stage::Success));

        let mut agent = Agent::new(RecordingBootstrap::new(FailAt::Namespace));
        assert!(agent.run().is_err());
        assert_eq!(agent.failed_at(), Some(Stage::NamespaceReady));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_invalid_config_is_logged_once() {
        let logs = CapturedLogs::default();
        let err = logs
            .capture(|| run(crate::config::AgentConfig::new("", "/init")))
            .unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));

        let text = logs.text();
        assert_eq!(text.lines().filter(|l| l.contains("ERROR")).count(), 1);
        assert!(text.contains("Invalid configuration"));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::NamespaceReady.to_string(), "namespace-ready");
        assert_eq!(Stage::SwitchRunning.to_string(), "switch-running");
        assert!(Stage::HandshakeDone < Stage::ChannelDialed);
    }
}
