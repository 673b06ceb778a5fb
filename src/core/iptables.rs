//! Firewall executor capability
//!
//! The [`Executor`] trait is the only way the rest of the crate touches the
//! kernel rule tables. [`IptablesCommand`] drives the real `iptables`,
//! `iptables-save` and `iptables-restore` binaries; tests use an in-memory
//! fake (see `core::test_helpers`).
//!
//! Rule-table mutation is not atomic across chains, so every executor shared
//! between the checkpoint modes is wrapped in [`Serialized`], which funnels
//! all calls through a single critical section.
//!
//! [`Serialized`] only orders calls within one process. Each mode normally
//! runs as its own process, so across processes the ordering comes from the
//! xtables lock: every `iptables` and `iptables-restore` invocation passes
//! `-w` and waits for the lock instead of failing on contention.

use crate::core::error::{Error, ErrorKind, IptablesErrorPattern, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::{Output, Stdio};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Longest chain name iptables accepts
pub const MAX_CHAIN_NAME_LEN: usize = 28;

/// Netfilter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Table {
    Nat,
    Filter,
    Mangle,
}

impl Table {
    pub const fn as_str(self) -> &'static str {
        match self {
            Table::Nat => "nat",
            Table::Filter => "filter",
            Table::Mangle => "mangle",
        }
    }
}

/// A named rule chain within a table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainName(String);

impl ChainName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn prerouting() -> Self {
        Self::new("PREROUTING")
    }

    pub fn output() -> Self {
        Self::new("OUTPUT")
    }
}

impl fmt::Display for ChainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where `ensure_rule` places a missing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePosition {
    Prepend,
    Append,
}

impl RulePosition {
    const fn flag(self) -> &'static str {
        match self {
            RulePosition::Prepend => "-I",
            RulePosition::Append => "-A",
        }
    }
}

/// Whether `load_all` flushes the tables it touches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    Flush,
    NoFlush,
}

/// Whether `load_all` restores packet/byte counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterPolicy {
    Restore,
    NoRestore,
}

/// Chain and rule CRUD plus whole-table dump/load.
///
/// Rule numbers are 1-based, matching `iptables -D <chain> <n>`.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Creates the chain if absent. Returns `true` when it was created.
    async fn ensure_chain(&self, table: Table, chain: &ChainName) -> Result<bool>;

    /// Adds the rule at `position` unless an identical rule exists.
    /// Returns `true` when it was created.
    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &ChainName,
        args: &[String],
    ) -> Result<bool>;

    /// Inserts the rule at the head of the chain, even if an identical rule
    /// exists further down.
    async fn insert_rule(&self, table: Table, chain: &ChainName, args: &[String]) -> Result<()>;

    /// Deletes rule number `rule_number`. Fails with [`Error::NotFound`] when
    /// the chain has fewer rules.
    async fn delete_rule(&self, table: Table, chain: &ChainName, rule_number: usize) -> Result<()>;

    /// Returns the full `iptables-save` text of every table.
    async fn dump_all(&self) -> Result<Vec<u8>>;

    /// Loads `iptables-save` formatted text.
    async fn load_all(&self, data: &[u8], flush: FlushPolicy, counters: CounterPolicy)
    -> Result<()>;
}

#[async_trait]
impl<E: Executor + ?Sized> Executor for Arc<E> {
    async fn ensure_chain(&self, table: Table, chain: &ChainName) -> Result<bool> {
        (**self).ensure_chain(table, chain).await
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &ChainName,
        args: &[String],
    ) -> Result<bool> {
        (**self).ensure_rule(position, table, chain, args).await
    }

    async fn insert_rule(&self, table: Table, chain: &ChainName, args: &[String]) -> Result<()> {
        (**self).insert_rule(table, chain, args).await
    }

    async fn delete_rule(&self, table: Table, chain: &ChainName, rule_number: usize) -> Result<()> {
        (**self).delete_rule(table, chain, rule_number).await
    }

    async fn dump_all(&self) -> Result<Vec<u8>> {
        (**self).dump_all().await
    }

    async fn load_all(
        &self,
        data: &[u8],
        flush: FlushPolicy,
        counters: CounterPolicy,
    ) -> Result<()> {
        (**self).load_all(data, flush, counters).await
    }
}

/// Serializes every call into the wrapped executor.
pub struct Serialized<E> {
    inner: E,
    section: Mutex<()>,
}

impl<E: Executor> Serialized<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            section: Mutex::new(()),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: Executor> Executor for Serialized<E> {
    async fn ensure_chain(&self, table: Table, chain: &ChainName) -> Result<bool> {
        let _section = self.section.lock().await;
        self.inner.ensure_chain(table, chain).await
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &ChainName,
        args: &[String],
    ) -> Result<bool> {
        let _section = self.section.lock().await;
        self.inner.ensure_rule(position, table, chain, args).await
    }

    async fn insert_rule(&self, table: Table, chain: &ChainName, args: &[String]) -> Result<()> {
        let _section = self.section.lock().await;
        self.inner.insert_rule(table, chain, args).await
    }

    async fn delete_rule(&self, table: Table, chain: &ChainName, rule_number: usize) -> Result<()> {
        let _section = self.section.lock().await;
        self.inner.delete_rule(table, chain, rule_number).await
    }

    async fn dump_all(&self) -> Result<Vec<u8>> {
        let _section = self.section.lock().await;
        self.inner.dump_all().await
    }

    async fn load_all(
        &self,
        data: &[u8],
        flush: FlushPolicy,
        counters: CounterPolicy,
    ) -> Result<()> {
        let _section = self.section.lock().await;
        self.inner.load_all(data, flush, counters).await
    }
}

/// Production executor backed by the iptables command-line tools
#[derive(Debug, Clone)]
pub struct IptablesCommand {
    iptables: String,
    save: String,
    restore: String,
}

impl Default for IptablesCommand {
    fn default() -> Self {
        Self::new("iptables", "iptables-save", "iptables-restore")
    }
}

impl IptablesCommand {
    pub fn new(
        iptables: impl Into<String>,
        save: impl Into<String>,
        restore: impl Into<String>,
    ) -> Self {
        Self {
            iptables: iptables.into(),
            save: save.into(),
            restore: restore.into(),
        }
    }

    async fn run(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<Output> {
        debug!(program, ?args, "running");

        let mut child = crate::elevation::iptables_command(program, args)?
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn {program}: {e}")))?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data).await?;
            // Close stdin so the child sees EOF
            drop(pipe);
        }

        Ok(child.wait_with_output().await?)
    }

    async fn run_iptables(&self, args: &[&str]) -> Result<Output> {
        self.run(&self.iptables, args, None).await
    }

    fn failure(&self, program: &str, output: &Output) -> (ErrorKind, Error) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.status.code();
        (
            IptablesErrorPattern::classify(&stderr, code),
            Error::iptables(program, &stderr, code),
        )
    }
}

/// Builds `-w -t <table> <op> <chain> [extra...] [rule args...]`
pub(crate) fn rule_command<'a>(
    table: Table,
    op: &'a str,
    chain: &'a ChainName,
    extra: &[&'a str],
    args: &'a [String],
) -> Vec<&'a str> {
    let mut cmd = vec!["-w", "-t", table.as_str(), op, chain.as_str()];
    cmd.extend_from_slice(extra);
    cmd.extend(args.iter().map(String::as_str));
    cmd
}

/// Builds `-w [--noflush] [--counters]`
pub(crate) fn restore_flags(flush: FlushPolicy, counters: CounterPolicy) -> Vec<&'static str> {
    let mut flags = vec!["-w"];
    if flush == FlushPolicy::NoFlush {
        flags.push("--noflush");
    }
    if counters == CounterPolicy::Restore {
        flags.push("--counters");
    }
    flags
}

#[async_trait]
impl Executor for IptablesCommand {
    async fn ensure_chain(&self, table: Table, chain: &ChainName) -> Result<bool> {
        let output = self
            .run_iptables(&rule_command(table, "-N", chain, &[], &[]))
            .await?;
        if output.status.success() {
            return Ok(true);
        }

        match self.failure(&self.iptables, &output) {
            (ErrorKind::AlreadyExists, _) => Ok(false),
            (_, err) => Err(err),
        }
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &ChainName,
        args: &[String],
    ) -> Result<bool> {
        let check = self
            .run_iptables(&rule_command(table, "-C", chain, &[], args))
            .await?;
        if check.status.success() {
            return Ok(false);
        }
        // -C exits 1 when the rule is absent; anything else is a real error
        if check.status.code() != Some(1) {
            return Err(self.failure(&self.iptables, &check).1);
        }

        let output = self
            .run_iptables(&rule_command(table, position.flag(), chain, &[], args))
            .await?;
        if output.status.success() {
            Ok(true)
        } else {
            Err(self.failure(&self.iptables, &output).1)
        }
    }

    async fn insert_rule(&self, table: Table, chain: &ChainName, args: &[String]) -> Result<()> {
        let output = self
            .run_iptables(&rule_command(table, "-I", chain, &["1"], args))
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.failure(&self.iptables, &output).1)
        }
    }

    async fn delete_rule(&self, table: Table, chain: &ChainName, rule_number: usize) -> Result<()> {
        let number = rule_number.to_string();
        let output = self
            .run_iptables(&rule_command(table, "-D", chain, &[number.as_str()], &[]))
            .await?;
        if output.status.success() {
            return Ok(());
        }

        match self.failure(&self.iptables, &output) {
            (ErrorKind::NotFound, _) => Err(Error::NotFound(format!(
                "rule {rule_number} in {table} chain {chain}"
            ))),
            (_, err) => Err(err),
        }
    }

    async fn dump_all(&self) -> Result<Vec<u8>> {
        let output = self.run(&self.save, &[], None).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(self.failure(&self.save, &output).1)
        }
    }

    async fn load_all(
        &self,
        data: &[u8],
        flush: FlushPolicy,
        counters: CounterPolicy,
    ) -> Result<()> {
        let flags = restore_flags(flush, counters);
        let output = self.run(&self.restore, &flags, Some(data)).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(self.failure(&self.restore, &output).1)
        }
    }
}
