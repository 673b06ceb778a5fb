//! Recovery and periodic refresh loops
//!
//! Each mode first recovers from its checkpoint, then refreshes it on a fixed
//! interval:
//!
//! - **endpoints**: re-apply the last endpoint list, then keep discovering,
//!   persisting and applying the running members.
//! - **iptables**: load the last filtered nat snapshot, then keep dumping,
//!   filtering and persisting the live table.
//! - **hosts**: keep writing a hosts file for the running members.
//!
//! A failed recovery is fatal. A failed refresh is logged and retried on the
//! next tick.

use crate::config::{Config, Mode};
use crate::core::Endpoint;
use crate::core::checkpoint::{CheckpointStore, EndpointSnapshot};
use crate::core::discovery::{Discovery, Member};
use crate::core::error::{Error, Result};
use crate::core::filter::{RuleTableFilter, ensure_kube_entry_jumps};
use crate::core::iptables::{CounterPolicy, Executor, FlushPolicy, Serialized};
use crate::core::nat::NatRuleSynthesizer;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Drives one checkpoint mode against a shared executor.
pub struct Checkpointer<E, D> {
    config: Config,
    ipt: Arc<Serialized<E>>,
    discovery: Option<Arc<D>>,
    store: CheckpointStore,
    filter: RuleTableFilter,
}

impl<E: Executor, D: Discovery> Checkpointer<E, D> {
    pub fn new(config: Config, ipt: Arc<Serialized<E>>) -> Self {
        let store = CheckpointStore::new(&config.checkpoint_dir);
        let filter = RuleTableFilter::new(&config.chain_name());
        Self {
            config,
            ipt,
            discovery: None,
            store,
            filter,
        }
    }

    /// Required by the endpoints and hosts modes.
    pub fn with_discovery(mut self, discovery: Arc<D>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    fn discovery(&self) -> Result<&D> {
        self.discovery.as_deref().ok_or_else(|| {
            Error::Config(format!("{} mode requires member discovery", self.config.mode))
        })
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Runs the configured mode. Returns only on an invalid config or a
    /// recovery failure, or after recovery when `recover_only` is set.
    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;
        info!(mode = %self.config.mode, dir = %self.store.dir().display(), "starting");
        match self.config.mode {
            Mode::Endpoints => self.run_endpoints().await,
            Mode::Iptables => self.run_iptables().await,
            Mode::Hosts => self.run_hosts().await,
        }
    }

    fn synthesizer(&self) -> Result<NatRuleSynthesizer> {
        let vip = self
            .config
            .vip_addr()
            .ok_or_else(|| Error::Config("endpoints mode requires a VIP".into()))?;
        Ok(NatRuleSynthesizer::new(self.config.chain_name(), vip))
    }

    /// Interval whose first tick is one period from now.
    async fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        ticker
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Endpoints mode
    // ═══════════════════════════════════════════════════════════════════════

    /// Wires the VIP into the dedicated chain and re-applies the last
    /// checkpointed endpoints, if any.
    pub async fn recover_endpoints(&self) -> Result<Option<EndpointSnapshot>> {
        let syn = self.synthesizer()?;
        syn.ensure_ingress(&*self.ipt).await?;

        let snapshot = self.store.read_endpoints()?;
        match &snapshot {
            Some(snapshot) => {
                let endpoints = ipv4_only(snapshot.endpoints.clone());
                syn.apply(&*self.ipt, &endpoints).await?;
                info!(
                    endpoints = snapshot.endpoints.len(),
                    "restored fan-out rules from checkpoint"
                );
            }
            None => info!("no endpoint checkpoint yet, waiting for first refresh"),
        }
        Ok(snapshot)
    }

    /// Discovers the running members, persists them, and applies them.
    ///
    /// A failed persist does not prevent the apply; its error is returned
    /// once the apply succeeded.
    pub async fn endpoints_tick(&self) -> Result<()> {
        let syn = self.synthesizer()?;
        let endpoints = self
            .discovery()?
            .list_running_endpoints(&self.config.label_selector)
            .await?;
        debug!(?endpoints, "discovered endpoints");

        let snapshot = EndpointSnapshot::new(ipv4_only(endpoints));
        let persisted = self.store.write_endpoints(&snapshot);
        syn.apply(&*self.ipt, &snapshot.endpoints).await?;
        persisted
    }

    pub async fn run_endpoints(&self) -> Result<()> {
        self.recover_endpoints().await?;
        if self.config.recover_only {
            return Ok(());
        }

        let mut ticker = self.ticker().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.endpoints_tick().await {
                warn!(error = %e, hint = e.hint(), "endpoint refresh failed");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Iptables mode
    // ═══════════════════════════════════════════════════════════════════════

    /// Loads the last nat snapshot without flushing foreign chains or
    /// restoring counters. Returns `false` when there was nothing to load.
    pub async fn recover_iptables(&self) -> Result<bool> {
        let Some(snapshot) = self.store.read_firewall()? else {
            info!("no iptables checkpoint yet, nothing to restore");
            return Ok(false);
        };
        if snapshot.is_empty() {
            info!("iptables checkpoint is empty, nothing to restore");
            return Ok(false);
        }

        self.ipt
            .load_all(&snapshot, FlushPolicy::NoFlush, CounterPolicy::NoRestore)
            .await?;
        ensure_kube_entry_jumps(&*self.ipt).await?;

        info!(
            bytes = snapshot.len(),
            digest = %crate::utils::digest(&snapshot),
            "restored nat rules from checkpoint"
        );
        Ok(true)
    }

    /// Dumps, filters and persists the live nat table.
    ///
    /// A dump without a nat table keeps the previous checkpoint.
    pub async fn iptables_tick(&self) -> Result<()> {
        let dump = self.ipt.dump_all().await?;
        let filtered = self.filter.filter(&dump)?;
        if filtered.is_empty() {
            debug!("no nat table in dump, keeping previous checkpoint");
            return Ok(());
        }
        self.store.write_firewall(&filtered)
    }

    pub async fn run_iptables(&self) -> Result<()> {
        self.recover_iptables().await?;
        if self.config.recover_only {
            return Ok(());
        }

        let mut ticker = self.ticker().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.iptables_tick().await {
                warn!(error = %e, hint = e.hint(), "iptables checkpoint failed");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Hosts mode
    // ═══════════════════════════════════════════════════════════════════════

    /// Writes the hosts checkpoint for the running members. An empty member
    /// list keeps the previous file.
    pub async fn hosts_tick(&self) -> Result<()> {
        let members = self
            .discovery()?
            .list_running_members(&self.config.label_selector)
            .await?;
        if members.is_empty() {
            debug!("no running members, keeping previous hosts checkpoint");
            return Ok(());
        }

        let hosts = render_hosts(&members, &self.config.cluster_name, &self.config.namespace);
        self.store.write_hosts(hosts.as_bytes())
    }

    /// Hosts mode has nothing to recover; `recover_only` returns at once.
    pub async fn run_hosts(&self) -> Result<()> {
        if self.config.recover_only {
            return Ok(());
        }

        let mut ticker = self.ticker().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.hosts_tick().await {
                warn!(error = %e, "hosts checkpoint failed");
            }
        }
    }
}

/// Drops endpoints the IPv4 nat table cannot translate to.
fn ipv4_only(mut endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
    endpoints.retain(|endpoint| {
        let keep = endpoint.is_ipv4();
        if !keep {
            warn!(%endpoint, "skipping non-IPv4 endpoint");
        }
        keep
    });
    endpoints
}

/// One `<ip> <pod>.<cluster>.<namespace>.svc.cluster.local` line per member.
pub fn render_hosts(members: &[Member], cluster_name: &str, namespace: &str) -> String {
    let mut out = String::new();
    for member in members {
        let _ = writeln!(
            out,
            "{} {}.{cluster_name}.{namespace}.svc.cluster.local",
            member.endpoint.ip(),
            member.name
        );
    }
    out
}
