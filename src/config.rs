use crate::core::error::{Error, Result};
use crate::core::filter::BUILTIN_CHAINS;
use crate::core::iptables::{ChainName, IptablesCommand, MAX_CHAIN_NAME_LEN};
use crate::core::nat::DEFAULT_CHAIN;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of all checkpoint files
pub const DEFAULT_CHECKPOINT_DIR: &str = "/etc/kubernetes/selfhosted-etcd";

/// Long-running checkpoint mode
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// Keep the VIP fan-out rules in sync with the running members
    #[default]
    Endpoints,
    /// Save and restore the kube-proxy nat rules
    Iptables,
    /// Write a hosts file for the running members
    Hosts,
}

/// Process configuration
///
/// Every field has a default, so a config file only needs to name what it
/// changes. CLI flags are applied on top of the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: Mode,
    /// IPv4 virtual IP clients connect to. Required in endpoints mode.
    #[serde(default)]
    pub vip: Option<IpAddr>,
    /// etcd client port, used both for the VIP and for member endpoints
    #[serde(default = "default_client_port")]
    pub client_port: u16,
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Exit after restoring the last checkpoint instead of looping
    #[serde(default)]
    pub recover_only: bool,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_label_selector")]
    pub label_selector: String,
    /// Used in hosts-file names: `<pod>.<cluster_name>.<namespace>.svc.cluster.local`
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default = "default_chain")]
    pub chain: String,
    #[serde(default = "default_iptables")]
    pub iptables: String,
    #[serde(default = "default_iptables_save")]
    pub iptables_save: String,
    #[serde(default = "default_iptables_restore")]
    pub iptables_restore: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            vip: None,
            client_port: default_client_port(),
            checkpoint_dir: default_checkpoint_dir(),
            interval_secs: default_interval_secs(),
            recover_only: false,
            namespace: default_namespace(),
            label_selector: default_label_selector(),
            cluster_name: default_cluster_name(),
            chain: default_chain(),
            iptables: default_iptables(),
            iptables_save: default_iptables_save(),
            iptables_restore: default_iptables_restore(),
        }
    }
}

fn default_client_port() -> u16 {
    2379
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CHECKPOINT_DIR)
}

fn default_interval_secs() -> u64 {
    60
}

fn default_namespace() -> String {
    "kube-system".to_string()
}

fn default_label_selector() -> String {
    "etcd_cluster=kube-etcd,app=etcd".to_string()
}

fn default_cluster_name() -> String {
    "kube-etcd".to_string()
}

fn default_chain() -> String {
    DEFAULT_CHAIN.to_string()
}

fn default_iptables() -> String {
    "iptables".to_string()
}

fn default_iptables_save() -> String {
    "iptables-save".to_string()
}

fn default_iptables_restore() -> String {
    "iptables-restore".to_string()
}

impl Config {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Rejects settings the checkpoint loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(Error::Config("interval must be at least 1 second".into()));
        }
        if self.chain.is_empty() {
            return Err(Error::Config("chain name must not be empty".into()));
        }
        if self.chain.len() > MAX_CHAIN_NAME_LEN {
            return Err(Error::Config(format!(
                "chain name '{}' exceeds {MAX_CHAIN_NAME_LEN} characters",
                self.chain
            )));
        }
        if self.chain.chars().any(char::is_whitespace) {
            return Err(Error::Config(format!(
                "chain name '{}' contains whitespace",
                self.chain
            )));
        }
        if BUILTIN_CHAINS.contains(&self.chain.as_str()) {
            return Err(Error::Config(format!(
                "chain name '{}' is a built-in chain; the fan-out chain must be dedicated",
                self.chain
            )));
        }
        match self.vip {
            None if self.mode == Mode::Endpoints => {
                return Err(Error::Config("endpoints mode requires a VIP".into()));
            }
            // The executor only drives the IPv4 iptables binaries
            Some(IpAddr::V6(vip)) => {
                return Err(Error::Config(format!("VIP {vip} is not an IPv4 address")));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// VIP address and client port, if a VIP is configured.
    pub fn vip_addr(&self) -> Option<SocketAddr> {
        self.vip.map(|ip| SocketAddr::new(ip, self.client_port))
    }

    pub fn chain_name(&self) -> ChainName {
        ChainName::new(self.chain.clone())
    }

    pub fn executor(&self) -> IptablesCommand {
        IptablesCommand::new(&self.iptables, &self.iptables_save, &self.iptables_restore)
    }
}
