//! vipkeeper - etcd VIP network checkpointer
//!
//! Runs on every control-plane host next to a self-hosted etcd cluster and
//! keeps the etcd virtual IP working while members move between hosts and
//! while hosts reboot.
//!
//! # Usage
//!
//! ```bash
//! # Fan the VIP out to the running members, checkpointing the member list
//! vipkeeper --mode endpoints --vip 10.3.0.15
//!
//! # Checkpoint the kube-proxy nat rules and restore them on boot
//! vipkeeper --mode iptables
//!
//! # Restore the last checkpoint and exit
//! vipkeeper --mode iptables --recover-only
//!
//! # Settings from a JSON file, flags override
//! vipkeeper --config /etc/vipkeeper.json --interval 30
//! ```
//!
//! # Logging
//!
//! `RUST_LOG` selects the log level (default `info`); `--log-json` switches
//! to one JSON object per line.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vipkeeper::core::discovery::KubeDiscovery;
use vipkeeper::core::iptables::Serialized;
use vipkeeper::{Checkpointer, Config, Mode, Result};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "vipkeeper")]
#[command(version = build::PKG_VERSION, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Keeps the etcd virtual IP routable across member moves and restarts", long_about = None)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Checkpoint mode
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,
    /// Virtual IP the fan-out rules answer for (endpoints mode)
    #[arg(long)]
    vip: Option<IpAddr>,
    /// etcd client port
    #[arg(long, value_name = "PORT")]
    client_port: Option<u16>,
    /// Directory holding the checkpoint files
    #[arg(long, value_name = "DIR")]
    checkpoint_dir: Option<PathBuf>,
    /// Seconds between refreshes
    #[arg(long, value_name = "SECONDS")]
    interval: Option<u64>,
    /// Restore the last checkpoint and exit
    #[arg(long)]
    recover_only: bool,
    /// Name of the dedicated nat chain
    #[arg(long, value_name = "NAME")]
    chain: Option<String>,
    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Config file (or defaults) with the given flags applied on top.
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(vip) = self.vip {
            config.vip = Some(vip);
        }
        if let Some(port) = self.client_port {
            config.client_port = port;
        }
        if let Some(dir) = self.checkpoint_dir {
            config.checkpoint_dir = dir;
        }
        if let Some(secs) = self.interval {
            config.interval_secs = secs;
        }
        if self.recover_only {
            config.recover_only = true;
        }
        if let Some(chain) = self.chain {
            config.chain = chain;
        }
        Ok(config)
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, hint = e.hint(), "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.into_config()?;
    config.validate()?;
    vipkeeper::utils::ensure_checkpoint_dir(&config.checkpoint_dir)?;

    if !vipkeeper::elevation::is_root() {
        warn!("Not running as root; set VIPKEEPER_ELEVATION_METHOD=sudo if iptables calls fail");
    }

    info!(
        version = build::PKG_VERSION,
        commit = build::SHORT_COMMIT,
        mode = %config.mode,
        "vipkeeper starting"
    );

    let ipt = Arc::new(Serialized::new(config.executor()));
    let mut checkpointer = Checkpointer::new(config.clone(), ipt);
    if matches!(config.mode, Mode::Endpoints | Mode::Hosts) {
        let discovery = KubeDiscovery::in_cluster(&config.namespace, config.client_port)?;
        checkpointer = checkpointer.with_discovery(Arc::new(discovery));
    }

    tokio::select! {
        result = checkpointer.run() => result,
        () = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    }
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
