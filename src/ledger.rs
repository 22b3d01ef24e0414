//! Backup ledgers: per-repository "last successfully backed up at" records.
//!
//! One ledger describes the freshness of the local staging area, and every
//! destination keeps its own. On disk a ledger is a JSON object mapping
//! sanitized repository keys to RFC 3339 timestamps.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::repository::{RepositoryDescriptor, SanitizedKey};

/// File name used for the staging ledger, per-destination ledgers and
/// per-repository metadata markers
pub const BACKUP_INFO_FILE: &str = "backup_info.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupLedger {
    entries: BTreeMap<SanitizedKey, DateTime<Utc>>,
}

impl BackupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SanitizedKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).copied()
    }

    pub fn record(&mut self, key: SanitizedKey, at: DateTime<Utc>) {
        self.entries.insert(key, at);
    }

    pub fn remove(&mut self, key: &SanitizedKey) -> Option<DateTime<Utc>> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SanitizedKey, &DateTime<Utc>)> {
        self.entries.iter()
    }

    /// Whether the repository changed remotely after this ledger last saw it.
    /// A repository without an entry always counts as changed.
    pub fn is_stale(&self, repo: &RepositoryDescriptor) -> bool {
        match self.get(&repo.key()) {
            Some(recorded) => repo.updated_at > recorded,
            None => true,
        }
    }

    /// Repositories whose remote timestamp is strictly after this ledger's record
    pub fn delta<'a, I>(&self, repos: I) -> Vec<&'a RepositoryDescriptor>
    where
        I: IntoIterator<Item = &'a RepositoryDescriptor>,
    {
        repos.into_iter().filter(|repo| self.is_stale(repo)).collect()
    }

    /// Copy of this ledger in which `keys` carry their value from `previous`
    /// (or no entry at all), so failed transfers are not marked as current.
    pub fn reverted<'a, I>(&self, keys: I, previous: &BackupLedger) -> BackupLedger
    where
        I: IntoIterator<Item = &'a SanitizedKey>,
    {
        let mut ledger = self.clone();
        for key in keys {
            match previous.get(key) {
                Some(at) => ledger.record(key.clone(), at),
                None => {
                    ledger.remove(key);
                }
            }
        }
        ledger
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("Failed to parse backup ledger")
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("Failed to serialize backup ledger")
    }

    /// Load a ledger file; a missing file is an empty ledger
    pub async fn load(path: &Path) -> Result<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Self::from_slice(&bytes)
                .with_context(|| format!("Invalid ledger file: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No ledger at {}, starting empty", path.display());
                Ok(Self::new())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read ledger file: {}", path.display()))
            }
        }
    }

    /// Persist the whole ledger by writing a sibling file and renaming it into place
    pub async fn save(&self, path: &Path) -> Result<()> {
        let bytes = self.to_vec()?;
        let tmp_path = path.with_extension("json.tmp");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create ledger directory: {}", parent.display()))?;
        }

        tokio::fs::write(&tmp_path, bytes)
            .await
            .with_context(|| format!("Failed to write ledger file: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("Failed to move ledger into place: {}", path.display()))?;

        debug!("Saved ledger with {} entries to {}", self.len(), path.display());
        Ok(())
    }
}

impl FromIterator<(SanitizedKey, DateTime<Utc>)> for BackupLedger {
    fn from_iter<T: IntoIterator<Item = (SanitizedKey, DateTime<Utc>)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
