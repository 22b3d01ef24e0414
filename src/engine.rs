//! Backup Engine - runs the inventory, download, upload and cleanup phases
//!
//! The engine owns an immutable configuration and the external collaborators
//! (inventory, fetcher, archiver, confirmation). Production code uses the
//! `gh` and `zip` executables; tests substitute their own.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::archive::{ArchiveCache, Archiver, ZipCommand};
use crate::cleanup::{self, CleanupSummary};
use crate::config::Config;
use crate::destinations::{self, Destination, DestinationContext};
use crate::download::{DownloadScheduler, DownloadSummary};
use crate::filter::FilterPolicy;
use crate::gh::{Fetcher, GhCli, SourceInventory};
use crate::prompt::{Confirm, NonInteractive, TerminalConfirm};
use crate::repository::RepositoryDescriptor;
use crate::staging::StagingArea;
use crate::upload::{UploadOrchestrator, UploadSummary};

/// Options for a full backup run
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Stop after the download phase
    pub skip_upload: bool,
}

/// Results from a complete backup run
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub download: DownloadSummary,
    pub upload: Option<UploadSummary>,
    pub cleanup: Option<CleanupSummary>,
    pub duration: Duration,
}

#[derive(Clone)]
pub struct BackupEngine {
    config: Arc<Config>,
    inventory: Arc<dyn SourceInventory>,
    fetcher: Arc<dyn Fetcher>,
    archiver: Arc<dyn Archiver>,
    confirm: Arc<dyn Confirm>,
    http: reqwest::Client,
}

impl BackupEngine {
    /// Engine backed by the `gh` CLI and the system `zip`
    pub fn new(config: Config) -> Self {
        let gh = Arc::new(GhCli::new());
        let confirm: Arc<dyn Confirm> = if config.non_interactive {
            Arc::new(NonInteractive)
        } else {
            Arc::new(TerminalConfirm)
        };

        Self::with_collaborators(config, gh.clone(), gh, Arc::new(ZipCommand::new()), confirm)
    }

    pub fn with_collaborators(
        config: Config,
        inventory: Arc<dyn SourceInventory>,
        fetcher: Arc<dyn Fetcher>,
        archiver: Arc<dyn Archiver>,
        confirm: Arc<dyn Confirm>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            inventory,
            fetcher,
            archiver,
            confirm,
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn staging(&self) -> StagingArea {
        StagingArea::new(self.config.storage_root())
    }

    /// List the source account and apply the filter policy
    pub async fn select_repositories(&self) -> Result<Vec<RepositoryDescriptor>> {
        let username = self
            .inventory
            .authenticated_user()
            .await
            .context("Failed to determine the authenticated user")?;
        info!("Authenticated as {}", username);

        let repositories = self
            .inventory
            .list_repositories()
            .await
            .context("Failed to list repositories")?;
        let total = repositories.len();

        let selected = FilterPolicy::new(username, &self.config.filters).apply(repositories);
        info!("Selected {} of {} repositories", selected.len(), total);
        Ok(selected)
    }

    /// Select repositories and bring the staging area up to date
    pub async fn download(&self) -> Result<DownloadSummary> {
        let repositories = self.select_repositories().await?;

        DownloadScheduler::new(
            self.staging(),
            Arc::clone(&self.fetcher),
            self.config.download.concurrency,
            self.config.download.force_redownload,
        )
        .run(repositories)
        .await
    }

    /// Adapters for every configured destination
    pub fn destinations(&self) -> Vec<Box<dyn Destination>> {
        destinations::build_all(&self.config.destinations, &self.destination_context())
    }

    fn destination_context(&self) -> DestinationContext {
        let staging = self.staging();
        DestinationContext {
            archives: ArchiveCache::new(staging.clone(), Arc::clone(&self.archiver)),
            staging,
            confirm: Arc::clone(&self.confirm),
            http: self.http.clone(),
            credentials_dir: self.config.credentials_root(),
            concurrency: self.config.upload.concurrency,
        }
    }

    pub async fn upload(&self, download: &DownloadSummary) -> Result<UploadSummary> {
        UploadOrchestrator::new(self.staging(), self.config.upload.concurrency)
            .with_retries(self.config.upload.retries, self.config.retry_delay())
            .run(self.destinations(), download)
            .await
    }

    pub async fn cleanup(&self) -> Result<CleanupSummary> {
        cleanup::purge_payload(&self.staging()).await
    }

    /// Connect a single named destination, running its authentication if needed
    pub async fn connect_destination(&self, name: &str) -> Result<()> {
        let mut destination = self
            .destinations()
            .into_iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| anyhow!("No destination named '{}' is configured", name))?;

        destination
            .connect()
            .await
            .with_context(|| format!("Failed to connect destination '{}'", name))
    }

    /// Full pipeline: download, upload, then optional cleanup
    pub async fn run_backup(&self, options: &BackupOptions) -> Result<BackupSummary> {
        let start_time = Instant::now();
        info!("Starting backup into {}", self.config.storage_root().display());

        let download = self.download().await?;

        if options.skip_upload {
            info!("Skipping upload phase");
            return Ok(BackupSummary {
                download,
                upload: None,
                cleanup: None,
                duration: start_time.elapsed(),
            });
        }

        let upload = self.upload(&download).await?;

        let cleanup = if self.config.cleanup.delete_data_after_upload {
            Some(self.cleanup().await?)
        } else {
            None
        };

        let summary = BackupSummary {
            download,
            upload: Some(upload),
            cleanup,
            duration: start_time.elapsed(),
        };
        info!("Backup completed in {:.2}s", summary.duration.as_secs_f64());
        Ok(summary)
    }
}
