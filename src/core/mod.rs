//! Core VIP fan-out and checkpoint functionality
//!
//! This module contains the types and logic that keep the etcd virtual IP
//! routable across restarts. It provides:
//!
//! - [`iptables`]: The firewall executor capability and its iptables binding
//! - [`filter`]: Extraction of the restorable nat subset from a dump
//! - [`nat`]: DNAT fan-out rule synthesis for the dedicated chain
//! - [`checkpoint`]: Atomic on-disk checkpoints
//! - [`discovery`]: Running-member lookup
//! - [`error`]: Error types for all of the above

pub mod checkpoint;
pub mod discovery;
pub mod error;
pub mod filter;
pub mod iptables;
pub mod nat;

#[cfg(test)]
pub mod test_helpers;


/// One live backend address
pub type Endpoint = std::net::SocketAddr;
