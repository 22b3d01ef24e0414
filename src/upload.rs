//! Upload Orchestrator - pushes staged changes to every enabled destination
//!
//! Destinations run independently and concurrently. Each one computes its
//! own delta against the ledger it last stored, so a destination that missed
//! a run catches up on the next one.

use anyhow::{anyhow, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::destinations::Destination;
use crate::download::DownloadSummary;
use crate::ledger::BackupLedger;
use crate::repository::{RepositoryDescriptor, SanitizedKey};
use crate::staging::StagingArea;

/// How one destination fared
#[derive(Debug, Clone)]
pub struct DestinationOutcome {
    pub name: String,
    /// Repositories in the destination's delta
    pub pushed: usize,
    pub attempts: u32,
    pub error: Option<String>,
}

impl DestinationOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct UploadSummary {
    pub outcomes: Vec<DestinationOutcome>,
    pub duration: Duration,
}

impl UploadSummary {
    /// Total repositories pushed across all destinations
    pub fn pushed(&self) -> usize {
        self.outcomes.iter().map(|o| o.pushed).sum()
    }
}

/// One printable line per configured destination
pub fn manifest(destinations: &[Box<dyn Destination>]) -> Vec<String> {
    destinations
        .iter()
        .map(|d| {
            format!(
                "{:<14} {:<20} {}",
                d.kind().as_str(),
                d.name(),
                if d.enabled() { "enabled" } else { "disabled" }
            )
        })
        .collect()
}

pub struct UploadOrchestrator {
    staging: StagingArea,
    concurrency: usize,
    retries: u32,
    retry_delay: Duration,
}

impl UploadOrchestrator {
    pub fn new(staging: StagingArea, concurrency: usize) -> Self {
        Self {
            staging,
            concurrency: concurrency.max(1),
            retries: 0,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Retry a failed destination `retries` more times, waiting `delay` in between
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = delay;
        self
    }

    pub async fn run(
        &self,
        mut destinations: Vec<Box<dyn Destination>>,
        download: &DownloadSummary,
    ) -> Result<UploadSummary> {
        let start_time = Instant::now();

        if destinations.is_empty() {
            return Err(anyhow!(
                "No destinations configured. Add at least one entry under 'destinations' in the config file"
            ));
        }

        println!("📦 Destinations:");
        for line in manifest(&destinations) {
            println!("   {}", line);
        }

        // Connect one at a time so interactive prompts never interleave
        for destination in destinations.iter_mut().filter(|d| d.enabled()) {
            info!(destination = %destination.name(), kind = destination.kind().as_str(), "Connecting");
            destination
                .connect()
                .await
                .with_context(|| format!("Failed to connect destination '{}'", destination.name()))?;
        }

        self.staging.reset_zips().await?;

        let eligible: Vec<&RepositoryDescriptor> = download
            .repositories
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| &r.descriptor)
            .collect();
        let not_downloaded: Vec<SanitizedKey> = download
            .repositories
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.descriptor.key())
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut futures = FuturesUnordered::new();

        for mut destination in destinations.into_iter() {
            if !destination.enabled() {
                info!(destination = %destination.name(), "Skipping disabled destination");
                continue;
            }

            let semaphore = Arc::clone(&semaphore);
            let eligible = &eligible;
            let not_downloaded = &not_downloaded;

            futures.push(async move {
                let _permit = semaphore.acquire().await;
                self.sync_with_retries(destination.as_mut(), eligible, not_downloaded, &download.ledger)
                    .await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(outcome) = futures.next().await {
            match &outcome.error {
                None => info!(destination = %outcome.name, pushed = outcome.pushed, "Destination up to date"),
                Some(e) => error!(destination = %outcome.name, error = %e, "Destination failed"),
            }
            outcomes.push(outcome);
        }

        let summary = UploadSummary {
            outcomes,
            duration: start_time.elapsed(),
        };

        let failed: Vec<&str> = summary
            .outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.name.as_str())
            .collect();

        info!(
            "Upload phase finished in {:.2}s: {} destinations, {} failed",
            summary.duration.as_secs_f64(),
            summary.outcomes.len(),
            failed.len()
        );

        if !failed.is_empty() {
            return Err(anyhow!(
                "{} of {} destinations failed: {}",
                failed.len(),
                summary.outcomes.len(),
                failed.join(", ")
            ));
        }

        Ok(summary)
    }

    async fn sync_with_retries(
        &self,
        destination: &mut dyn Destination,
        eligible: &[&RepositoryDescriptor],
        not_downloaded: &[SanitizedKey],
        staged: &BackupLedger,
    ) -> DestinationOutcome {
        let name = destination.name().to_string();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match sync_destination(destination, eligible, not_downloaded, staged).await {
                Ok(pushed) => {
                    return DestinationOutcome {
                        name,
                        pushed,
                        attempts,
                        error: None,
                    }
                }
                Err(e) if attempts <= self.retries => {
                    warn!(destination = %name, attempt = attempts, error = %e, "Push failed, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    return DestinationOutcome {
                        name,
                        pushed: 0,
                        attempts,
                        error: Some(format!("{:#}", e)),
                    }
                }
            }
        }
    }
}

/// Compute one destination's delta and push it with the ledger snapshot
async fn sync_destination(
    destination: &mut dyn Destination,
    eligible: &[&RepositoryDescriptor],
    not_downloaded: &[SanitizedKey],
    staged: &BackupLedger,
) -> Result<usize> {
    let previous = destination
        .previous_backup_times()
        .await
        .context("Failed to read destination ledger")?;

    let delta: Vec<SanitizedKey> = previous
        .delta(eligible.iter().copied())
        .into_iter()
        .map(RepositoryDescriptor::key)
        .collect();

    // Repositories that did not download keep whatever this destination had
    let snapshot = staged.reverted(not_downloaded, &previous);

    info!(
        destination = %destination.name(),
        "{} of {} repositories changed since the last push",
        delta.len(),
        eligible.len()
    );

    destination.push(&delta, &snapshot).await?;
    Ok(delta.len())
}
