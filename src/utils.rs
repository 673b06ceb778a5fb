//! Utility functions for directory management and payload digests

use sha2::{Digest, Sha256};
use std::path::Path;

/// Creates the checkpoint directory (and parents) with owner-only access.
///
/// An existing directory keeps its permissions.
pub fn ensure_checkpoint_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::fs::DirBuilder;
        use std::os::unix::fs::DirBuilderExt;

        let mut builder = DirBuilder::new();
        builder.mode(0o700); // User read/write/execute only
        builder.recursive(true);
        builder.create(dir)?;
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)?;
    }

    Ok(())
}

/// SHA-256 of a checkpoint payload as lowercase hex.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
