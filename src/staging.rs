//! Layout of the local staging area
//!
//! ```text
//! <root>/backup_info.json          staging ledger
//! <root>/<key>/                    working copy of one repository
//! <root>/<key>/backup_info.json    metadata marker
//! <root>/zips/<key>.zip            archives built for upload
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ledger::BACKUP_INFO_FILE;
use crate::repository::{RepositoryDescriptor, SanitizedKey};

pub const ZIPS_DIR: &str = "zips";

/// Metadata written next to each staged working copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryMarker {
    pub name: String,
    pub name_no_owner: String,
    pub backed_up_at: DateTime<Utc>,
    pub description: String,
    pub archived: bool,
    pub is_private: bool,
}

impl RepositoryMarker {
    pub fn new(repo: &RepositoryDescriptor, backed_up_at: DateTime<Utc>) -> Self {
        Self {
            name: repo.full_name.clone(),
            name_no_owner: repo.name.clone(),
            backed_up_at,
            description: repo.description.clone(),
            archived: repo.archived,
            is_private: repo.is_private,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagingArea {
    root: PathBuf,
}

impl StagingArea {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(BACKUP_INFO_FILE)
    }

    pub fn repo_dir(&self, key: &SanitizedKey) -> PathBuf {
        self.root.join(key)
    }

    pub fn marker_path(&self, key: &SanitizedKey) -> PathBuf {
        self.repo_dir(key).join(BACKUP_INFO_FILE)
    }

    pub fn zips_dir(&self) -> PathBuf {
        self.root.join(ZIPS_DIR)
    }

    pub fn zip_path(&self, key: &SanitizedKey) -> PathBuf {
        self.zips_dir().join(format!("{}.zip", key))
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create staging directory: {}", self.root.display()))
    }

    /// Whether a working copy with content exists for `key`.
    ///
    /// A directory holding nothing but its marker, as left by cleanup, or an
    /// empty one does not count.
    pub async fn has_copy(&self, key: &SanitizedKey) -> bool {
        let mut entries = match tokio::fs::read_dir(self.repo_dir(key)).await {
            Ok(entries) => entries,
            Err(_) => return false,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_name() != BACKUP_INFO_FILE {
                return true;
            }
        }
        false
    }

    /// Remove any existing working copy for `key`
    pub async fn remove_copy(&self, key: &SanitizedKey) -> Result<()> {
        let dir = self.repo_dir(key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
    }

    pub async fn write_marker(&self, marker: &RepositoryMarker) -> Result<()> {
        let path = self.marker_path(&SanitizedKey::new(&marker.name));
        let bytes = serde_json::to_vec_pretty(marker).context("Failed to serialize marker")?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write marker: {}", path.display()))
    }

    pub async fn read_marker(&self, key: &SanitizedKey) -> Result<RepositoryMarker> {
        let path = self.marker_path(key);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read marker: {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse marker: {}", path.display()))
    }

    /// Empty the archive cache so every upload phase zips fresh copies
    pub async fn reset_zips(&self) -> Result<()> {
        let dir = self.zips_dir();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to clear {}", dir.display()))
            }
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))
    }
}
