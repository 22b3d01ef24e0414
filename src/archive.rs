//! Archiving collaborator: packs a staged working copy into a zip file

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::repository::SanitizedKey;
use crate::staging::StagingArea;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Archiver: Send + Sync {
    /// Write a zip archive of `source` to `archive`
    async fn archive(&self, source: &Path, archive: &Path) -> Result<()>;
}

/// Runs the system `zip` utility
#[derive(Debug, Clone)]
pub struct ZipCommand {
    executable: PathBuf,
}

impl ZipCommand {
    pub fn new() -> Self {
        Self {
            executable: PathBuf::from("zip"),
        }
    }
}

impl Default for ZipCommand {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Archiver for ZipCommand {
    async fn archive(&self, source: &Path, archive: &Path) -> Result<()> {
        debug!("Zipping {} into {}", source.display(), archive.display());

        let archive = if archive.is_absolute() {
            archive.to_path_buf()
        } else {
            std::env::current_dir()
                .context("Failed to resolve working directory")?
                .join(archive)
        };

        // Run inside the source so entries are stored relative to it
        let output = AsyncCommand::new(&self.executable)
            .args(["-r", "-q"])
            .arg(&archive)
            .arg(".")
            .current_dir(source)
            .output()
            .await
            .context("Failed to run zip command")?;

        if !output.status.success() {
            return Err(anyhow!(
                "zip failed for {}: {}",
                source.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Archive cache over the staging area's `zips/` folder.
///
/// Clones share one lock per key, so destinations pushing concurrently never
/// build the same archive twice.
#[derive(Clone)]
pub struct ArchiveCache {
    staging: StagingArea,
    archiver: Arc<dyn Archiver>,
    building: Arc<Mutex<HashMap<SanitizedKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ArchiveCache {
    pub fn new(staging: StagingArea, archiver: Arc<dyn Archiver>) -> Self {
        Self {
            staging,
            archiver,
            building: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_for(&self, key: &SanitizedKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut building = self.building.lock().unwrap_or_else(|e| e.into_inner());
        building.entry(key.clone()).or_default().clone()
    }

    /// Return the zip for `key`, building it if this run has not yet done so
    pub async fn archive_for(&self, key: &SanitizedKey) -> Result<PathBuf> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let zip_path = self.staging.zip_path(key);
        if tokio::fs::try_exists(&zip_path).await.unwrap_or(false) {
            return Ok(zip_path);
        }

        let source = self.staging.repo_dir(key);
        if !self.staging.has_copy(key).await {
            return Err(anyhow!("No staged copy for {} at {}", key, source.display()));
        }

        tokio::fs::create_dir_all(self.staging.zips_dir())
            .await
            .context("Failed to create zips directory")?;

        // zip appends to existing archives, so build under a temporary name
        let partial = zip_path.with_extension("zip.partial");
        let _ = tokio::fs::remove_file(&partial).await;
        self.archiver
            .archive(&source, &partial)
            .await
            .with_context(|| format!("Failed to archive {}", key))?;
        tokio::fs::rename(&partial, &zip_path)
            .await
            .with_context(|| format!("Failed to move archive into place: {}", zip_path.display()))?;

        Ok(zip_path)
    }
}
