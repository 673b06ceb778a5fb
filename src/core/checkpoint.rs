//! Durable checkpoint files
//!
//! Every write goes to a temporary file in the checkpoint directory, is
//! flushed to storage, and is then renamed over the destination. A crash at
//! any point leaves either the previous file or the new one, never a mix.

use crate::core::Endpoint;
use crate::core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Last known endpoint list
pub const ENDPOINTS_FILE: &str = "endpoints";
/// Filtered nat table dump
pub const IPTABLES_FILE: &str = "iptables.checkpoint";
/// Hosts-file lines for the running members
pub const HOSTS_FILE: &str = "etcd-hosts.checkpoint";

/// The ordered endpoint list at one point in time.
///
/// Serialized as `{"endpoints":["10.0.0.1:2379",...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSnapshot {
    pub endpoints: Vec<Endpoint>,
}

impl EndpointSnapshot {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

/// Reads and atomically writes the checkpoint files in one directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn write_endpoints(&self, snapshot: &EndpointSnapshot) -> Result<()> {
        let json = serde_json::to_vec(snapshot)?;
        self.write_atomic(ENDPOINTS_FILE, &json)?;
        Ok(())
    }

    /// Returns `Ok(None)` when no endpoint checkpoint has been written yet.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read or parsed.
    pub fn read_endpoints(&self) -> Result<Option<EndpointSnapshot>> {
        match self.read(ENDPOINTS_FILE)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn write_firewall(&self, data: &[u8]) -> Result<()> {
        self.write_atomic(IPTABLES_FILE, data)?;
        Ok(())
    }

    /// Returns `Ok(None)` when no firewall checkpoint has been written yet.
    pub fn read_firewall(&self) -> Result<Option<Vec<u8>>> {
        self.read(IPTABLES_FILE)
    }

    pub fn write_hosts(&self, data: &[u8]) -> Result<()> {
        self.write_atomic(HOSTS_FILE, data)?;
        Ok(())
    }

    /// Replaces `name` with `data`: temp file → fsync → rename → dir fsync.
    ///
    /// A failure before the rename leaves the previous file untouched; the
    /// temporary file is removed when it goes out of scope.
    pub fn write_atomic(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        let dest = self.path(name);

        // NamedTempFile is created 0600 on unix
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;

        tmp.persist(&dest).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::StorageFull {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::StorageFull,
                    format!("Disk full: cannot write checkpoint {}", dest.display()),
                ))
            } else {
                Error::Io(e.error)
            }
        })?;

        sync_dir(&self.dir);

        info!(
            path = %dest.display(),
            bytes = data.len(),
            digest = %crate::utils::digest(data),
            "checkpoint written"
        );
        Ok(dest)
    }

    /// Reads `name`, mapping a missing file to `Ok(None)`.
    pub fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Makes the rename itself durable.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = std::fs::File::open(dir).and_then(|d| d.sync_all()) {
            warn!("Failed to sync checkpoint directory {:?}: {}", dir, e);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}
