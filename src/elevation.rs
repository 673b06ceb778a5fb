//! Privilege elevation for iptables commands
//!
//! vipkeeper normally runs as root inside a privileged host-network pod, in
//! which case commands are executed directly. When it is started as an
//! unprivileged user (local testing, or hosts that grant iptables through
//! sudoers) the iptables binaries can be wrapped with `sudo -n`.
//!
//! # Environment Variables
//!
//! - `VIPKEEPER_ELEVATION_METHOD`: `none` (default) or `sudo`. `sudo` is only
//!   used non-interactively (`-n`); a password prompt would stall the loop.

use std::io;
use tokio::process::Command;

/// Error type for privilege elevation operations
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `VIPKEEPER_ELEVATION_METHOD`
    #[error("Invalid VIPKEEPER_ELEVATION_METHOD '{0}'. Valid options: none, sudo")]
    InvalidMethod(String),

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ElevationError> for crate::core::error::Error {
    fn from(e: ElevationError) -> Self {
        match e {
            ElevationError::Io(io) => Self::Io(io),
            other => Self::Config(other.to_string()),
        }
    }
}

/// Returns `true` when the process already has root privileges.
pub fn is_root() -> bool {
    nix::unistd::getuid().is_root()
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Builds the command used to run one of the iptables binaries.
///
/// Arguments are passed directly without shell interpretation.
pub fn iptables_command(program: &str, args: &[&str]) -> Result<Command, ElevationError> {
    if is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }

    let method = std::env::var("VIPKEEPER_ELEVATION_METHOD")
        .unwrap_or_default()
        .to_lowercase();

    match method.as_str() {
        "" | "none" => {
            let mut cmd = Command::new(program);
            cmd.args(args);
            Ok(cmd)
        }
        "sudo" => {
            if !binary_exists("sudo") {
                return Err(ElevationError::MethodNotAvailable("sudo".into()));
            }
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program).args(args);
            Ok(cmd)
        }
        _ => Err(ElevationError::InvalidMethod(method)),
    }
}
