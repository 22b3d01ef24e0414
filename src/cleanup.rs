//! Post-upload cleanup: frees staging space while keeping metadata markers

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::ledger::BACKUP_INFO_FILE;
use crate::staging::StagingArea;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Staged directories that were emptied
    pub directories: usize,
    /// Entries removed from them
    pub removed: usize,
}

/// Empty every directory under the staging root except for its metadata
/// marker. Files directly under the root, including the staging ledger,
/// are left alone.
pub async fn purge_payload(staging: &StagingArea) -> Result<CleanupSummary> {
    let root = staging.root().to_path_buf();
    let summary = tokio::task::spawn_blocking(move || purge_blocking(&root))
        .await
        .context("Cleanup task panicked")??;

    info!(
        "Cleaned {} staged directories ({} entries removed)",
        summary.directories, summary.removed
    );
    Ok(summary)
}

fn purge_blocking(root: &Path) -> Result<CleanupSummary> {
    let mut summary = CleanupSummary::default();

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summary),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", root.display()))
        }
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }

        let dir = entry.path();
        summary.directories += 1;
        for child in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
        {
            let child = child?;
            if child.file_name() == BACKUP_INFO_FILE {
                continue;
            }

            let path = child.path();
            debug!("Removing {}", path.display());
            let removed = if child.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.with_context(|| format!("Failed to remove {}", path.display()))?;
            summary.removed += 1;
        }
    }

    Ok(summary)
}
