//! Guest handshake agent.
//!
//! Establishes the vsock path to the host and hands it to the network switch
//! running in the isolated `rd1` namespace. Exits with the switch's outcome.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use rdnet_guest_handshake::config::{
    AgentConfig, DEFAULT_NAMESPACE, DEFAULT_PID_FILE, DEFAULT_SWITCH_LOG,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "rdnet-handshake")]
#[command(about = "Bootstrap the guest side of the host networking tunnel")]
struct Args {
    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Path to the network switch binary started inside the namespace
    #[arg(long, env = "RDNET_CHILD_PATH")]
    child_path: Option<PathBuf>,

    /// Argument for the unshare program
    #[arg(long, env = "RDNET_UNSHARE_ARG")]
    unshare_arg: Option<String>,

    /// Network namespace name
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// File the isolation process PID is written to
    #[arg(long, default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,

    /// File the switch output is redirected to
    #[arg(long, default_value = DEFAULT_SWITCH_LOG)]
    switch_log: PathBuf,

    /// Attempts made to dial the host data port
    #[arg(long, default_value_t = 10)]
    dial_attempts: u32,
}

impl Args {
    fn into_config(self) -> AgentConfig {
        // Missing values are rejected by AgentConfig::validate.
        let mut config = AgentConfig::new(
            self.child_path.unwrap_or_default(),
            self.unshare_arg.unwrap_or_default(),
        );
        config.namespace = self.namespace;
        config.pid_file = self.pid_file;
        config.switch_log = self.switch_log;
        config.dial.max_attempts = self.dial_attempts;
        config
    }
}

fn main() {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    info!("Handshake agent starting (PID {})", process::id());

    // Failures are logged where they happen.
    if run(args.into_config()).is_err() {
        process::exit(1);
    }
}

#[cfg(target_os = "linux")]
fn run(config: AgentConfig) -> rdnet_guest_handshake::Result<()> {
    rdnet_guest_handshake::agent::run(config)
}

#[cfg(not(target_os = "linux"))]
fn run(config: AgentConfig) -> rdnet_guest_handshake::Result<()> {
    let result = config.validate().and(Err(rdnet_guest_handshake::AgentError::Unsupported(
        "the handshake agent is a Linux-only binary meant to run inside a VM",
    )));
    if let Err(e) = &result {
        tracing::error!("{}", e);
    }
    result
}
