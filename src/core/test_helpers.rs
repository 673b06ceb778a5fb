//! Shared test utilities for core module tests
//!
//! Provides in-memory stand-ins for the firewall executor and the discovery
//! collaborator so synthesizer and orchestrator logic can be tested without
//! iptables or a cluster. This module is only compiled in test mode.

use crate::core::Endpoint;
use crate::core::discovery::{Discovery, Member};
use crate::core::error::{Error, Result};
use crate::core::iptables::{
    ChainName, CounterPolicy, Executor, FlushPolicy, RulePosition, Table,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("VIPKEEPER_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("VIPKEEPER_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Tables rendered by [`FakeExecutor::dump_text`], in this order
const DUMP_ORDER: [Table; 2] = [Table::Nat, Table::Filter];

#[derive(Debug, Clone)]
struct FakeChain {
    name: String,
    /// `Some` for built-in chains
    policy: Option<String>,
    rules: Vec<String>,
}

impl FakeChain {
    fn builtin(name: &str) -> Self {
        Self {
            name: name.to_string(),
            policy: Some("ACCEPT".to_string()),
            rules: Vec::new(),
        }
    }

    fn user(name: &str) -> Self {
        Self {
            name: name.to_string(),
            policy: None,
            rules: Vec::new(),
        }
    }
}

fn builtin_chains(table: Table) -> Vec<FakeChain> {
    let names: &[&str] = match table {
        Table::Nat => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        Table::Filter => &["INPUT", "FORWARD", "OUTPUT"],
        Table::Mangle => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
    };
    names.iter().map(|n| FakeChain::builtin(n)).collect()
}

/// One recorded `load_all` call
#[derive(Debug, Clone)]
pub struct LoadCall {
    pub data: Vec<u8>,
    pub flush: FlushPolicy,
    pub counters: CounterPolicy,
}

#[derive(Debug, Default)]
struct FakeState {
    tables: HashMap<Table, Vec<FakeChain>>,
    inserts_left: Option<usize>,
    fail_ensure: bool,
    fail_dump: bool,
    fail_load: bool,
    delete_calls: usize,
    loads: Vec<LoadCall>,
}

impl FakeState {
    fn chain_mut(&mut self, table: Table, chain: &str) -> Option<&mut FakeChain> {
        self.tables
            .get_mut(&table)?
            .iter_mut()
            .find(|c| c.name == chain)
    }
}

/// In-memory executor modelling nat and filter tables with ordered rules.
///
/// Rules are stored as their arguments joined by single spaces, which is
/// also how they appear after `-A <chain>` in [`FakeExecutor::dump_text`].
#[derive(Debug)]
pub struct FakeExecutor {
    state: Mutex<FakeState>,
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeExecutor {
    pub fn new() -> Self {
        let mut state = FakeState::default();
        for table in DUMP_ORDER {
            state.tables.insert(table, builtin_chains(table));
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Rules of `chain` from top to bottom; empty when the chain is absent.
    pub fn rules(&self, table: Table, chain: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .chain_mut(table, chain)
            .map(|c| c.rules.clone())
            .unwrap_or_default()
    }

    pub fn chain_exists(&self, table: Table, chain: &str) -> bool {
        self.state.lock().unwrap().chain_mut(table, chain).is_some()
    }

    /// Creates a user chain for test setup.
    pub fn add_chain(&self, table: Table, chain: &str) {
        let mut state = self.state.lock().unwrap();
        if state.chain_mut(table, chain).is_none() {
            state
                .tables
                .entry(table)
                .or_insert_with(|| builtin_chains(table))
                .push(FakeChain::user(chain));
        }
    }

    /// Appends a rule for test setup, creating the chain if needed.
    pub fn append(&self, table: Table, chain: &str, rule: &str) {
        self.add_chain(table, chain);
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state.chain_mut(table, chain) {
            c.rules.push(rule.to_string());
        }
    }

    /// Lets `n` more inserts succeed, then fails every insert.
    pub fn fail_inserts_after(&self, n: usize) {
        self.state.lock().unwrap().inserts_left = Some(n);
    }

    pub fn fail_ensures(&self, fail: bool) {
        self.state.lock().unwrap().fail_ensure = fail;
    }

    pub fn fail_dumps(&self, fail: bool) {
        self.state.lock().unwrap().fail_dump = fail;
    }

    pub fn fail_loads(&self, fail: bool) {
        self.state.lock().unwrap().fail_load = fail;
    }

    pub fn delete_calls(&self) -> usize {
        self.state.lock().unwrap().delete_calls
    }

    pub fn loads(&self) -> Vec<LoadCall> {
        self.state.lock().unwrap().loads.clone()
    }

    /// Renders the current tables the way `iptables-save` does.
    pub fn dump_text(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut out = String::from("# Generated by iptables-save (fake)\n");
        for table in DUMP_ORDER {
            let Some(chains) = state.tables.get(&table) else {
                continue;
            };
            out.push_str(&format!("*{table}\n"));
            for chain in chains {
                let policy = chain.policy.as_deref().unwrap_or("-");
                out.push_str(&format!(":{} {policy} [0:0]\n", chain.name));
            }
            for chain in chains {
                for rule in &chain.rules {
                    out.push_str(&format!("-A {} {rule}\n", chain.name));
                }
            }
            out.push_str("COMMIT\n");
        }
        out.push_str("# Completed\n");
        out
    }
}

fn injected(program: &str) -> Error {
    Error::iptables(program, "injected failure", Some(4))
}

fn no_such_chain() -> Error {
    Error::iptables(
        "iptables",
        "iptables: No chain/target/match by that name.",
        Some(1),
    )
}

fn restore_error(line: &str) -> Error {
    Error::iptables("iptables-restore", &format!("line failed: {line}"), Some(2))
}

/// Applies `iptables-restore` input to a copy of `tables`; the copy replaces
/// the original only if every table committed.
fn restore(
    tables: &mut HashMap<Table, Vec<FakeChain>>,
    text: &str,
    flush: FlushPolicy,
) -> Result<()> {
    let mut staged = tables.clone();
    let mut current: Option<Table> = None;

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('*') {
            if current.is_some() {
                return Err(restore_error(line));
            }
            let table: Table = name.parse().map_err(|_| restore_error(line))?;
            if flush == FlushPolicy::Flush {
                staged.insert(table, builtin_chains(table));
            }
            current = Some(table);
            continue;
        }

        let table = current.ok_or_else(|| restore_error(line))?;
        if line == "COMMIT" {
            current = None;
            continue;
        }
        let chains = staged
            .entry(table)
            .or_insert_with(|| builtin_chains(table));

        if let Some(decl) = line.strip_prefix(':') {
            let mut tokens = decl.split_whitespace();
            let name = tokens.next().ok_or_else(|| restore_error(line))?;
            let policy = tokens.next().unwrap_or("-");
            match chains.iter_mut().find(|c| c.name == name) {
                Some(chain) if chain.policy.is_some() => chain.policy = Some(policy.to_string()),
                // Declaring an existing user chain flushes it, even with --noflush
                Some(chain) => chain.rules.clear(),
                None => chains.push(FakeChain::user(name)),
            }
        } else if let Some(rest) = line.strip_prefix("-A ") {
            let mut tokens = rest.split_whitespace();
            let name = tokens.next().ok_or_else(|| restore_error(line))?;
            let rule = tokens.collect::<Vec<_>>().join(" ");
            let chain = chains
                .iter_mut()
                .find(|c| c.name == name)
                .ok_or_else(|| restore_error(line))?;
            chain.rules.push(rule);
        } else {
            return Err(restore_error(line));
        }
    }

    if current.is_some() {
        return Err(restore_error("COMMIT expected"));
    }
    *tables = staged;
    Ok(())
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn ensure_chain(&self, table: Table, chain: &ChainName) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.fail_ensure {
            return Err(injected("iptables"));
        }
        if state.chain_mut(table, chain.as_str()).is_some() {
            return Ok(false);
        }
        state
            .tables
            .entry(table)
            .or_insert_with(|| builtin_chains(table))
            .push(FakeChain::user(chain.as_str()));
        Ok(true)
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &ChainName,
        args: &[String],
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.fail_ensure {
            return Err(injected("iptables"));
        }
        let rule = args.join(" ");
        let chain = state
            .chain_mut(table, chain.as_str())
            .ok_or_else(no_such_chain)?;
        if chain.rules.contains(&rule) {
            return Ok(false);
        }
        match position {
            RulePosition::Prepend => chain.rules.insert(0, rule),
            RulePosition::Append => chain.rules.push(rule),
        }
        Ok(true)
    }

    async fn insert_rule(&self, table: Table, chain: &ChainName, args: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.inserts_left {
            Some(0) => return Err(injected("iptables")),
            Some(n) => state.inserts_left = Some(n - 1),
            None => {}
        }
        let chain = state
            .chain_mut(table, chain.as_str())
            .ok_or_else(no_such_chain)?;
        chain.rules.insert(0, args.join(" "));
        Ok(())
    }

    async fn delete_rule(&self, table: Table, chain: &ChainName, rule_number: usize) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls += 1;
        let not_found = || Error::NotFound(format!("rule {rule_number} in {table} chain {chain}"));
        let rules = &mut state
            .chain_mut(table, chain.as_str())
            .ok_or_else(not_found)?
            .rules;
        if rule_number == 0 || rule_number > rules.len() {
            return Err(not_found());
        }
        rules.remove(rule_number - 1);
        Ok(())
    }

    async fn dump_all(&self) -> Result<Vec<u8>> {
        if self.state.lock().unwrap().fail_dump {
            return Err(injected("iptables-save"));
        }
        Ok(self.dump_text().into_bytes())
    }

    async fn load_all(
        &self,
        data: &[u8],
        flush: FlushPolicy,
        counters: CounterPolicy,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.loads.push(LoadCall {
            data: data.to_vec(),
            flush,
            counters,
        });
        if state.fail_load {
            return Err(injected("iptables-restore"));
        }
        restore(&mut state.tables, &String::from_utf8_lossy(data), flush)
    }
}

/// Discovery stand-in returning a settable member list
#[derive(Debug, Default)]
pub struct FakeDiscovery {
    members: Mutex<Vec<Member>>,
    failing: Mutex<bool>,
    selectors: Mutex<Vec<String>>,
}

impl FakeDiscovery {
    pub fn new(members: Vec<Member>) -> Self {
        Self {
            members: Mutex::new(members),
            ..Self::default()
        }
    }

    /// Members named `etcd-<i>` at the given addresses.
    pub fn with_endpoints(addrs: &[&str]) -> Self {
        Self::new(members(addrs))
    }

    pub fn set_members(&self, members: Vec<Member>) {
        *self.members.lock().unwrap() = members;
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// Selectors passed to every call so far.
    pub fn selectors(&self) -> Vec<String> {
        self.selectors.lock().unwrap().clone()
    }
}

#[async_trait]
impl Discovery for FakeDiscovery {
    async fn list_running_members(&self, selector: &str) -> Result<Vec<Member>> {
        self.selectors.lock().unwrap().push(selector.to_string());
        if *self.failing.lock().unwrap() {
            return Err(Error::Discovery("directory unavailable".to_string()));
        }
        Ok(self.members.lock().unwrap().clone())
    }
}

/// Parses `ip:port` strings.
pub fn endpoints(addrs: &[&str]) -> Vec<Endpoint> {
    addrs.iter().map(|a| a.parse().unwrap()).collect()
}

/// Members named `etcd-<i>` at the given addresses.
pub fn members(addrs: &[&str]) -> Vec<Member> {
    endpoints(addrs)
        .into_iter()
        .enumerate()
        .map(|(i, endpoint)| Member {
            name: format!("etcd-{i}"),
            endpoint,
        })
        .collect()
}

/// The `--to-destination` value of each rule, in chain order.
pub fn fan_out_targets(rules: &[String]) -> Vec<String> {
    rules
        .iter()
        .filter_map(|rule| {
            let mut tokens = rule.split_whitespace();
            tokens.find(|t| *t == "--to-destination")?;
            tokens.next().map(ToString::to_string)
        })
        .collect()
}
