//! repobackup - Incremental GitHub Repository Backup
//!
//! repobackup mirrors every repository an account can see into a local
//! staging area, then pushes whatever changed to one or more backup
//! destinations. Each store keeps a ledger of when it last saw each
//! repository, so only the delta moves on every run.
//!
//! ## Core Features
//!
//! - **Incremental Downloads**: Repositories are re-fetched only when the remote changed
//! - **Independent Destinations**: Local folders and Google Drive, each with its own ledger
//! - **Bounded Concurrency**: Semaphore-gated fetches and uploads
//! - **Device-Flow OAuth**: Headless-friendly Google authentication with token refresh
//! - **Configuration Management**: YAML-based configuration with XDG compliance
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`engine`]: Pipeline orchestration
//! - [`download`]: Download scheduler
//! - [`upload`]: Upload orchestrator
//! - [`destinations`]: Destination adapters
//! - [`auth`]: OAuth device flow

pub mod archive;
pub mod auth;
pub mod cleanup;
pub mod config;
pub mod destinations;
pub mod download;
pub mod engine;
pub mod filter;
pub mod gh;
pub mod ledger;
pub mod prompt;
pub mod repository;
pub mod staging;
pub mod upload;

pub use config::Config;
pub use destinations::Destination;
pub use download::{DownloadScheduler, DownloadSummary};
pub use engine::{BackupEngine, BackupOptions, BackupSummary};
pub use ledger::BackupLedger;
pub use repository::{RepositoryDescriptor, SanitizedKey};
pub use upload::{UploadOrchestrator, UploadSummary};
