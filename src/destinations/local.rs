//! Local folder destination: mirrors staged working copies into another directory

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};
use walkdir::WalkDir;

use super::{Destination, DestinationContext};
use crate::config::{DestinationConfig, DestinationType};
use crate::ledger::{BackupLedger, BACKUP_INFO_FILE};
use crate::repository::SanitizedKey;
use crate::staging::StagingArea;

const WRITE_PROBE: &str = ".repobackup-write-test";

pub struct LocalFolder {
    name: String,
    enabled: bool,
    path: Option<PathBuf>,
    staging: StagingArea,
    concurrency: usize,
    previous: BackupLedger,
}

impl LocalFolder {
    pub fn from_config(config: &DestinationConfig, ctx: &DestinationContext) -> Self {
        let path = config.parameter("path").map(PathBuf::from);
        let mut enabled = config.enabled;
        if path.is_none() && enabled {
            error!(destination = %config.name, "Local destination has no 'path' parameter, disabling it");
            enabled = false;
        }

        Self {
            name: config.name.clone(),
            enabled,
            path,
            staging: ctx.staging.clone(),
            concurrency: ctx.concurrency.max(1),
            previous: BackupLedger::new(),
        }
    }

    fn root(&self) -> Result<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| anyhow!("Destination '{}' has no path configured", self.name))
    }

    fn ledger_path(&self) -> Result<PathBuf> {
        Ok(self.root()?.join(BACKUP_INFO_FILE))
    }
}

#[async_trait]
impl Destination for LocalFolder {
    fn kind(&self) -> DestinationType {
        DestinationType::Local
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn connect(&mut self) -> Result<()> {
        let root = self.root()?.to_path_buf();

        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create destination folder: {}", root.display()))?;

        let metadata = tokio::fs::metadata(&root)
            .await
            .with_context(|| format!("Cannot access destination folder: {}", root.display()))?;
        if !metadata.is_dir() {
            return Err(anyhow!("Destination path is not a directory: {}", root.display()));
        }

        // Permission bits lie on some filesystems; write something instead
        let probe = root.join(WRITE_PROBE);
        tokio::fs::write(&probe, b"")
            .await
            .with_context(|| format!("Destination folder is not writable: {}", root.display()))?;
        tokio::fs::remove_file(&probe).await.ok();

        info!(destination = %self.name, "Using local folder {}", root.display());
        Ok(())
    }

    async fn previous_backup_times(&mut self) -> Result<BackupLedger> {
        let ledger = BackupLedger::load(&self.ledger_path()?).await?;
        debug!(destination = %self.name, entries = ledger.len(), "Loaded destination ledger");
        self.previous = ledger.clone();
        Ok(ledger)
    }

    async fn push(&mut self, changed: &[SanitizedKey], ledger: &BackupLedger) -> Result<()> {
        let root = self.root()?.to_path_buf();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut futures = FuturesUnordered::new();

        for key in changed {
            let semaphore = Arc::clone(&semaphore);
            let source = self.staging.repo_dir(key);
            let target = root.join(key);

            futures.push(async move {
                let _permit = semaphore.acquire_owned().await?;
                let result = tokio::task::spawn_blocking(move || copy_tree(&source, &target))
                    .await
                    .context("Copy task panicked")
                    .and_then(|r| r);
                Ok::<_, anyhow::Error>((key, result))
            });
        }

        let mut failed = Vec::new();
        while let Some(outcome) = futures.next().await {
            let (key, result) = outcome?;
            match result {
                Ok(files) => debug!(destination = %self.name, repo = %key, files, "Copied"),
                Err(e) => {
                    error!(destination = %self.name, repo = %key, error = %e, "Failed to copy repository");
                    failed.push(key);
                }
            }
        }

        let snapshot = ledger.reverted(failed.iter().copied(), &self.previous);
        snapshot
            .save(&self.ledger_path()?)
            .await
            .with_context(|| format!("Failed to store ledger for destination '{}'", self.name))?;

        info!(
            destination = %self.name,
            "Copied {} of {} repositories to {}",
            changed.len() - failed.len(),
            changed.len(),
            root.display()
        );
        self.previous = snapshot;
        Ok(())
    }
}

/// Replace `target` with a copy of `source`, returning the number of files copied
fn copy_tree(source: &Path, target: &Path) -> Result<usize> {
    // A directory purged down to its marker has nothing worth mirroring
    let has_payload = std::fs::read_dir(source)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.file_name() != BACKUP_INFO_FILE)
        })
        .unwrap_or(false);
    if !has_payload {
        return Err(anyhow!("No staged copy at {}", source.display()));
    }

    match std::fs::remove_dir_all(target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove old copy: {}", target.display()))
        }
    }

    let mut files = 0;
    for entry in WalkDir::new(source) {
        let entry = entry.with_context(|| format!("Failed to walk {}", source.display()))?;
        let relative = entry.path().strip_prefix(source)?;
        let destination = target.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&destination)
                .with_context(|| format!("Failed to create {}", destination.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &destination)?;
        } else {
            std::fs::copy(entry.path(), &destination)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            files += 1;
        }
    }
    Ok(files)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, destination: &Path) -> Result<()> {
    let pointee = std::fs::read_link(link)?;
    std::os::unix::fs::symlink(&pointee, destination)
        .with_context(|| format!("Failed to recreate symlink {}", destination.display()))
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, _destination: &Path) -> Result<()> {
    debug!("Skipping symlink {}", link.display());
    Ok(())
}
