//! Download Scheduler - brings every selected repository's staged copy up to date
//!
//! Each repository is a unit of work gated by a semaphore. Units report their
//! outcome back to the scheduler, which is the only writer of the staging
//! ledger and updates it in a single pass once every unit has finished.

use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info};

use crate::gh::Fetcher;
use crate::ledger::BackupLedger;
use crate::repository::RepositoryDescriptor;
use crate::staging::{RepositoryMarker, StagingArea};

/// What happened to one repository during the download phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// Freshly fetched this run
    Fetched,
    /// Local copy was already newer than the remote
    Current,
    /// Fetch failed; the staged copy (if any) is stale
    Failed(String),
}

/// A repository annotated with its download outcome
#[derive(Debug, Clone)]
pub struct StagedRepository {
    pub descriptor: RepositoryDescriptor,
    pub status: StageStatus,
}

impl StagedRepository {
    /// Whether the staged copy changed this run
    pub fn changed(&self) -> bool {
        self.status == StageStatus::Fetched
    }

    pub fn succeeded(&self) -> bool {
        !matches!(self.status, StageStatus::Failed(_))
    }
}

/// Result of a complete download phase
#[derive(Debug, Clone)]
pub struct DownloadSummary {
    pub repositories: Vec<StagedRepository>,
    pub ledger: BackupLedger,
    pub duration: Duration,
}

impl DownloadSummary {
    pub fn fetched(&self) -> usize {
        self.repositories.iter().filter(|r| r.changed()).count()
    }

    pub fn current(&self) -> usize {
        self.repositories
            .iter()
            .filter(|r| r.status == StageStatus::Current)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.repositories.iter().filter(|r| !r.succeeded()).count()
    }
}

pub struct DownloadScheduler {
    staging: StagingArea,
    fetcher: Arc<dyn Fetcher>,
    concurrency: usize,
    force_redownload: bool,
}

impl DownloadScheduler {
    pub fn new(
        staging: StagingArea,
        fetcher: Arc<dyn Fetcher>,
        concurrency: usize,
        force_redownload: bool,
    ) -> Self {
        Self {
            staging,
            fetcher,
            concurrency: concurrency.max(1),
            force_redownload,
        }
    }

    /// Run the download phase for `repositories` and persist the staging ledger
    pub async fn run(&self, repositories: Vec<RepositoryDescriptor>) -> Result<DownloadSummary> {
        let start_time = Instant::now();

        self.staging.ensure_root().await?;
        let mut ledger = BackupLedger::load(&self.staging.ledger_path())
            .await
            .context("Failed to load staging ledger")?;

        info!(
            "Downloading {} repositories, {} at a time, to {}",
            repositories.len(),
            self.concurrency,
            self.staging.root().display()
        );

        let staged = self.stage_all(repositories, &ledger).await;

        let now = Utc::now();
        for repo in staged.iter().filter(|r| r.succeeded()) {
            ledger.record(repo.descriptor.key(), now);
        }

        ledger
            .save(&self.staging.ledger_path())
            .await
            .context("Failed to save staging ledger")?;

        let summary = DownloadSummary {
            repositories: staged,
            ledger,
            duration: start_time.elapsed(),
        };

        info!(
            "Download phase finished in {:.2}s: {} fetched, {} current, {} failed",
            summary.duration.as_secs_f64(),
            summary.fetched(),
            summary.current(),
            summary.failed()
        );

        Ok(summary)
    }

    /// Run one gated unit of work per repository and collect every outcome
    async fn stage_all(
        &self,
        repositories: Vec<RepositoryDescriptor>,
        previous: &BackupLedger,
    ) -> Vec<StagedRepository> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut futures = FuturesUnordered::new();

        for repo in repositories {
            let semaphore = semaphore.clone();

            futures.push(async move {
                let status = match semaphore.acquire().await {
                    Ok(_permit) => match self.stage(&repo, previous).await {
                        Ok(status) => status,
                        Err(e) => {
                            error!(repo = %repo.full_name, error = %format!("{:#}", e), "Failed to download repository");
                            StageStatus::Failed(format!("{:#}", e))
                        }
                    },
                    Err(e) => StageStatus::Failed(format!("download gate closed: {}", e)),
                };
                StagedRepository {
                    descriptor: repo,
                    status,
                }
            });
        }

        let mut staged = Vec::new();
        while let Some(result) = futures.next().await {
            debug!(repo = %result.descriptor.full_name, status = ?result.status, "Download unit finished");
            staged.push(result);
        }
        staged
    }

    /// Bring one repository up to date
    async fn stage(
        &self,
        repo: &RepositoryDescriptor,
        previous: &BackupLedger,
    ) -> Result<StageStatus> {
        let key = repo.key();

        if !self.force_redownload
            && self.staging.has_copy(&key).await
            && !previous.is_stale(repo)
        {
            info!(repo = %repo.full_name, "Repository is up to date");
            return Ok(StageStatus::Current);
        }

        // Also clears a purged directory that only kept its marker
        self.staging.remove_copy(&key).await?;

        info!(repo = %repo.full_name, "Downloading repository");
        let target = self.staging.repo_dir(&key);
        self.fetcher.fetch(&repo.full_name, &target).await?;

        self.staging
            .write_marker(&RepositoryMarker::new(repo, Utc::now()))
            .await?;

        Ok(StageStatus::Fetched)
    }
}
