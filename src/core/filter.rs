//! Extraction of the restorable nat subset from an `iptables-save` dump
//!
//! Restoring a full dump would flush or duplicate chains owned by other
//! subsystems sharing the nat table. The filter keeps only chain declarations
//! and rules whose text names a chain owned by kube-proxy or by vipkeeper,
//! and never keeps rules appended to the built-in top-level chains, so the
//! result can be loaded with `--noflush` without touching foreign jump rules.
//!
//! Because those jump rules are left out, a restored subset is unreachable
//! until something jumps into it again; [`ensure_kube_entry_jumps`] puts the
//! kube-proxy entry jumps back.

use crate::core::error::{ParseError, Result};
use crate::core::iptables::{ChainName, Executor, RulePosition, Table};
use tracing::info;

const NAT_TABLE_HEADER: &[u8] = b"*nat";
const COMMIT_LINE: &[u8] = b"COMMIT";

/// Chain name fragments created by kube-proxy.
///
/// The first six are fixed chain names; the rest prefix per-service chains.
/// Matching is case-sensitive substring containment.
pub const KUBE_CHAIN_FRAGMENTS: &[&str] = &[
    "KUBE-SERVICES",
    "KUBE-HOSTPORTS",
    "KUBE-NODEPORTS",
    "KUBE-POSTROUTING",
    "KUBE-MARK-MASQ",
    "KUBE-MARK-DROP",
    "KUBE-SVC-",
    "KUBE-SEP-",
    "KUBE-FW-",
    "KUBE-XLB-",
];

/// Built-in chains whose rules are never restored
pub const BUILTIN_CHAINS: &[&str] = &["PREROUTING", "POSTROUTING", "INPUT", "OUTPUT"];

/// Filters `iptables-save` output down to the recognized nat lines.
#[derive(Debug, Clone)]
pub struct RuleTableFilter {
    fragments: Vec<String>,
}

impl RuleTableFilter {
    /// Recognizes kube-proxy chains plus the given dedicated chain.
    pub fn new(dedicated_chain: &ChainName) -> Self {
        let mut fragments: Vec<String> = KUBE_CHAIN_FRAGMENTS
            .iter()
            .map(ToString::to_string)
            .collect();
        if !dedicated_chain.as_str().is_empty() {
            fragments.push(dedicated_chain.as_str().to_string());
        }
        Self { fragments }
    }

    /// Returns the `*nat` header, the recognized lines in original order, and
    /// `COMMIT`, newline-terminated.
    ///
    /// A dump without a nat table yields an empty result.
    ///
    /// # Errors
    ///
    /// Returns `Err` if another table starts before the nat table's `COMMIT`,
    /// or if `COMMIT` never appears.
    pub fn filter(&self, dump: &[u8]) -> std::result::Result<Vec<u8>, ParseError> {
        // Lines stay raw bytes so comments in any encoding survive verbatim
        let mut lines = dump
            .split(|&b| b == b'\n')
            .map(<[u8]>::trim_ascii)
            .filter(|l| !l.is_empty());

        if !lines.by_ref().any(|line| line == NAT_TABLE_HEADER) {
            return Ok(Vec::new());
        }

        let mut kept = vec![NAT_TABLE_HEADER];
        let mut committed = false;

        for line in lines {
            if line.starts_with(COMMIT_LINE) {
                kept.push(line);
                committed = true;
                break;
            }
            if line.starts_with(b"*") {
                return Err(ParseError::UnexpectedTable(
                    String::from_utf8_lossy(line).into_owned(),
                ));
            }
            if line.starts_with(b"#") || appends_to_builtin_chain(line) {
                continue;
            }
            if self.recognizes(line) {
                kept.push(line);
            }
        }

        if !committed {
            return Err(ParseError::MissingCommit);
        }

        let mut out = kept.join(&b'\n');
        out.push(b'\n');
        Ok(out)
    }

    fn recognizes(&self, line: &[u8]) -> bool {
        self.fragments.iter().any(|f| contains(line, f.as_bytes()))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn appends_to_builtin_chain(line: &[u8]) -> bool {
    let mut tokens = line
        .split(u8::is_ascii_whitespace)
        .filter(|t| !t.is_empty());
    tokens.next() == Some(b"-A".as_slice())
        && tokens
            .next()
            .is_some_and(|c| BUILTIN_CHAINS.iter().any(|b| b.as_bytes() == c))
}

/// (entry chain, built-in chain jumping into it, rule comment)
const KUBE_ENTRY_JUMPS: &[(&str, &str, &str)] = &[
    ("KUBE-SERVICES", "OUTPUT", "kubernetes service portals"),
    ("KUBE-SERVICES", "PREROUTING", "kubernetes service portals"),
    ("KUBE-POSTROUTING", "POSTROUTING", "kubernetes postrouting rules"),
];

/// Ensures the kube-proxy entry chains exist and are jumped to from the
/// built-in nat chains, the same way kube-proxy links them.
///
/// # Errors
///
/// Returns the first executor failure.
pub async fn ensure_kube_entry_jumps<E: Executor + ?Sized>(ipt: &E) -> Result<()> {
    for &(entry, from, comment) in KUBE_ENTRY_JUMPS {
        let entry = ChainName::new(entry);
        let from = ChainName::new(from);
        ipt.ensure_chain(Table::Nat, &entry).await?;

        let args: Vec<String> = ["-m", "comment", "--comment", comment, "-j", entry.as_str()]
            .iter()
            .map(ToString::to_string)
            .collect();
        if ipt
            .ensure_rule(RulePosition::Prepend, Table::Nat, &from, &args)
            .await?
        {
            info!(chain = %from, target = %entry, "restored kube-proxy jump");
        }
    }
    Ok(())
}
