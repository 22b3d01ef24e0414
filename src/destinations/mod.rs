//! Destination adapters: where staged repositories end up.
//!
//! Every adapter implements [`Destination`]. The set of adapters is closed:
//! [`build`] maps a configured type to its implementation and the upload
//! orchestrator only ever sees the trait object.

pub mod drive;
pub mod local;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::archive::ArchiveCache;
use crate::config::{DestinationConfig, DestinationType};
use crate::ledger::BackupLedger;
use crate::prompt::Confirm;
use crate::repository::SanitizedKey;
use crate::staging::StagingArea;

pub use drive::GoogleDrive;
pub use local::LocalFolder;

#[async_trait]
pub trait Destination: Send {
    fn kind(&self) -> DestinationType;

    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    /// Validate configuration and establish whatever session the destination needs
    async fn connect(&mut self) -> Result<()>;

    /// Ledger of the last successful push; empty when nothing was pushed yet
    async fn previous_backup_times(&mut self) -> Result<BackupLedger>;

    /// Transfer `changed` from staging and store `ledger` for the next delta.
    ///
    /// Keys that fail to transfer keep their previous timestamp in the stored
    /// ledger.
    async fn push(&mut self, changed: &[SanitizedKey], ledger: &BackupLedger) -> Result<()>;
}

/// Shared collaborators handed to every adapter
#[derive(Clone)]
pub struct DestinationContext {
    pub staging: StagingArea,
    pub archives: ArchiveCache,
    pub confirm: Arc<dyn Confirm>,
    pub http: reqwest::Client,
    pub credentials_dir: PathBuf,
    /// Concurrent repository transfers within one destination
    pub concurrency: usize,
}

/// Instantiate the adapter for one configured destination
pub fn build(config: &DestinationConfig, ctx: &DestinationContext) -> Box<dyn Destination> {
    match config.kind {
        DestinationType::Local => Box::new(LocalFolder::from_config(config, ctx)),
        DestinationType::GoogleDrive => Box::new(GoogleDrive::from_config(config, ctx)),
    }
}

/// Instantiate every configured destination, in configuration order
pub fn build_all(configs: &[DestinationConfig], ctx: &DestinationContext) -> Vec<Box<dyn Destination>> {
    configs.iter().map(|config| build(config, ctx)).collect()
}
