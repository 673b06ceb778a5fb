//! Fan-out of the virtual IP to the current endpoint set
//!
//! Traffic for the VIP is jumped from `PREROUTING` and `OUTPUT` into a
//! dedicated nat chain. That chain holds one DNAT rule per endpoint, each
//! guarded by an independent `statistic --mode random` match.
//!
//! # Rule order
//!
//! Rules are inserted at the head of the chain, one per endpoint, in input
//! order, with probability `1/(i+1)` for the rule built from `endpoints[i]`.
//! Head insertion reverses the order, so the chain reads top to bottom:
//!
//! ```text
//! endpoints[N-1]  p = 1/N
//! endpoints[N-2]  p = 1/(N-1)
//! ...
//! endpoints[0]    p = 1      (unconditional)
//! ```
//!
//! A new connection reaches rule `k` (0-based from the top) with probability
//! `(N-k)/N` and matches it with probability `1/(N-k)`, so every endpoint is
//! chosen with probability exactly `1/N`. Appending instead of inserting
//! would put the unconditional rule first and send everything to one
//! endpoint.
//!
//! After insertion the chain holds the new rules on top of whatever the
//! previous apply left behind; those are trimmed by deleting rule `N+1`
//! (1-based) until the executor reports it absent.

use crate::core::Endpoint;
use crate::core::error::Result;
use crate::core::iptables::{ChainName, Executor, RulePosition, Table};
use std::net::SocketAddr;
use tracing::{debug, info};

/// Default name of the dedicated fan-out chain
pub const DEFAULT_CHAIN: &str = "SELF-HOSTED-ETCD";

/// Builds and applies the VIP fan-out rules.
#[derive(Debug, Clone)]
pub struct NatRuleSynthesizer {
    chain: ChainName,
    vip: SocketAddr,
}

impl NatRuleSynthesizer {
    pub fn new(chain: ChainName, vip: SocketAddr) -> Self {
        Self { chain, vip }
    }

    pub fn chain(&self) -> &ChainName {
        &self.chain
    }

    pub fn vip(&self) -> SocketAddr {
        self.vip
    }

    /// Match probability of the rule built from `endpoints[index]`.
    pub fn probability(index: usize) -> f64 {
        1.0 / (index + 1) as f64
    }

    /// Arguments of the jump rule placed in each ingress chain.
    pub fn jump_rule_args(&self) -> Vec<String> {
        let ip = self.vip.ip().to_string();
        let port = self.vip.port().to_string();
        let args: [&str; 14] = [
            "-p",
            "tcp",
            "-d",
            &ip,
            "-m",
            "tcp",
            "--dport",
            &port,
            "-m",
            "state",
            "--state",
            "NEW",
            "-j",
            self.chain.as_str(),
        ];
        args.iter().map(ToString::to_string).collect()
    }

    /// Arguments of the DNAT rule built from `endpoints[index]`.
    pub fn fan_out_rule_args(index: usize, endpoint: &Endpoint) -> Vec<String> {
        let probability = format!("{:.5}", Self::probability(index));
        let destination = endpoint.to_string();
        let args: [&str; 18] = [
            "-p",
            "tcp",
            "-m",
            "tcp",
            "-m",
            "state",
            "--state",
            "NEW",
            "-m",
            "statistic",
            "--mode",
            "random",
            "--probability",
            &probability,
            "-j",
            "DNAT",
            "--to-destination",
            &destination,
        ];
        args.iter().map(ToString::to_string).collect()
    }

    /// Ensures the dedicated chain exists and that `PREROUTING` and `OUTPUT`
    /// jump into it for new TCP connections to the VIP.
    ///
    /// Idempotent; must run before fan-out rules have any effect.
    ///
    /// # Errors
    ///
    /// Returns the first executor failure.
    pub async fn ensure_ingress<E: Executor + ?Sized>(&self, ipt: &E) -> Result<()> {
        ipt.ensure_chain(Table::Nat, &self.chain).await?;

        let args = self.jump_rule_args();
        for ingress in [ChainName::prerouting(), ChainName::output()] {
            let created = ipt
                .ensure_rule(RulePosition::Prepend, Table::Nat, &ingress, &args)
                .await?;
            if created {
                info!(chain = %ingress, vip = %self.vip, target = %self.chain, "added jump rule");
            }
        }
        Ok(())
    }

    /// Makes the dedicated chain hold exactly one fan-out rule per endpoint.
    ///
    /// An empty list leaves the chain empty, so VIP traffic falls through
    /// untranslated.
    ///
    /// # Errors
    ///
    /// Any executor failure aborts the apply; the chain may be left partially
    /// updated until the next successful apply.
    pub async fn apply<E: Executor + ?Sized>(&self, ipt: &E, endpoints: &[Endpoint]) -> Result<()> {
        ipt.ensure_chain(Table::Nat, &self.chain).await?;

        for (i, endpoint) in endpoints.iter().enumerate() {
            let args = Self::fan_out_rule_args(i, endpoint);
            ipt.insert_rule(Table::Nat, &self.chain, &args).await?;
        }

        let removed = self.trim(ipt, endpoints.len()).await?;

        info!(
            chain = %self.chain,
            endpoints = endpoints.len(),
            removed,
            "applied fan-out rules"
        );
        Ok(())
    }

    /// Deletes every rule after the first `keep`. Returns how many went.
    async fn trim<E: Executor + ?Sized>(&self, ipt: &E, keep: usize) -> Result<usize> {
        let position = keep + 1;
        let mut removed = 0;
        loop {
            match ipt.delete_rule(Table::Nat, &self.chain, position).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => break,
                Err(e) => return Err(e),
            }
        }
        debug!(chain = %self.chain, position, removed, "trimmed stale rules");
        Ok(removed)
    }
}
