//! vipkeeper - etcd VIP network checkpointer
//!
//! Keeps a fixed virtual IP routable to the self-hosted etcd members across
//! member rescheduling and host restarts.
//!
//! # Architecture
//!
//! - [`core`] - Executor capability, nat filter, fan-out rules, checkpoints, discovery
//! - [`checkpointer`] - Recovery and periodic refresh loops per mode
//! - [`config`] - Process configuration
//! - [`elevation`] - Running iptables as root or through `sudo -n`
//! - [`utils`] - Checkpoint directory setup and payload digests
//!
//! # Persistence Guarantees
//!
//! - Checkpoints are replaced atomically (temp file, fsync, rename)
//! - Checkpoint files are `0600` inside a `0700` directory
//! - Restores never flush chains vipkeeper does not recognize

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpointer;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;

// Re-export commonly used types
pub use checkpointer::Checkpointer;
pub use config::{Config, Mode};
pub use core::error::{Error, Result};
