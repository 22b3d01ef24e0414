//! Common test utilities and helpers for repobackup tests
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

use repobackup::archive::Archiver;
use repobackup::config::{DestinationConfig, DestinationType};
use repobackup::gh::{Fetcher, SourceInventory};
use repobackup::{Config, RepositoryDescriptor};

pub fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

pub fn repo(full_name: &str, updated_at: DateTime<Utc>) -> RepositoryDescriptor {
    RepositoryDescriptor {
        full_name: full_name.to_string(),
        name: full_name.split('/').nth(1).unwrap().to_string(),
        is_private: false,
        updated_at,
        archived: false,
        description: format!("{} description", full_name),
    }
}

/// Inventory whose repository list can be changed between runs
pub struct FakeInventory {
    pub user: String,
    pub repositories: Mutex<Vec<RepositoryDescriptor>>,
}

impl FakeInventory {
    pub fn new(user: &str, repositories: Vec<RepositoryDescriptor>) -> Self {
        Self {
            user: user.to_string(),
            repositories: Mutex::new(repositories),
        }
    }

    pub fn touch(&self, full_name: &str, updated_at: DateTime<Utc>) {
        for repo in self.repositories.lock().unwrap().iter_mut() {
            if repo.full_name == full_name {
                repo.updated_at = updated_at;
            }
        }
    }
}

#[async_trait]
impl SourceInventory for FakeInventory {
    async fn authenticated_user(&self) -> Result<String> {
        Ok(self.user.clone())
    }

    async fn list_repositories(&self) -> Result<Vec<RepositoryDescriptor>> {
        Ok(self.repositories.lock().unwrap().clone())
    }
}

/// Fetcher that writes a small working copy and records every call
#[derive(Default)]
pub struct FakeFetcher {
    pub fetched: Mutex<Vec<String>>,
    pub failing: HashSet<String>,
}

impl FakeFetcher {
    pub fn failing(names: &[&str]) -> Self {
        Self {
            fetched: Mutex::new(Vec::new()),
            failing: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    pub fn fetched(&self) -> Vec<String> {
        let mut fetched = self.fetched.lock().unwrap().clone();
        fetched.sort();
        fetched
    }

    pub fn reset(&self) {
        self.fetched.lock().unwrap().clear();
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, full_name: &str, target: &Path) -> Result<()> {
        if self.failing.contains(full_name) {
            return Err(anyhow!("clone of {} refused", full_name));
        }
        self.fetched.lock().unwrap().push(full_name.to_string());
        tokio::fs::create_dir_all(target.join("src")).await?;
        tokio::fs::write(target.join("README.md"), full_name).await?;
        tokio::fs::write(target.join("src/lib.rs"), "pub fn answer() -> u32 { 42 }").await?;
        Ok(())
    }
}

pub struct FakeArchiver;

#[async_trait]
impl Archiver for FakeArchiver {
    async fn archive(&self, _source: &Path, archive: &Path) -> Result<()> {
        tokio::fs::write(archive, b"PK").await?;
        Ok(())
    }
}

/// Temporary staging, credential and destination directories
pub struct TestEnvironment {
    pub temp_dir: TempDir,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.path("stage")
    }

    /// Config staging into this environment with one local destination per name
    pub fn config_with_local(&self, destinations: &[&str]) -> Config {
        let mut config = Config::default();
        config.storage_path = self.staging_dir().display().to_string();
        config.credentials_dir = self.path("credentials").display().to_string();
        config.non_interactive = true;
        config.download.concurrency = 2;
        config.upload.concurrency = 2;
        config.destinations = destinations
            .iter()
            .map(|name| {
                let mut parameters = BTreeMap::new();
                parameters.insert(
                    "path".to_string(),
                    self.path(&format!("dest-{}", name)).display().to_string(),
                );
                DestinationConfig {
                    name: name.to_string(),
                    kind: DestinationType::Local,
                    enabled: true,
                    parameters,
                }
            })
            .collect();
        config
    }

    pub fn write_config(&self, content: &str) -> PathBuf {
        let config_path = self.path("config.yml");
        std::fs::write(&config_path, content).expect("Failed to write test config");
        config_path
    }
}

/// Install a shell script standing in for the `gh` executable.
///
/// It answers `api user` with `me`, prints `repos.json` for `repo list`
/// and, for `repo clone`, creates the target with a README and appends the
/// repository name to `clones.log`.
#[cfg(unix)]
pub fn install_fake_gh(dir: &Path, repos_json: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("repos.json"), repos_json).unwrap();

    let script = r#"#!/bin/sh
here="$(dirname "$0")"
case "$1 $2" in
  "api user") echo "me" ;;
  "repo list") cat "$here/repos.json" ;;
  "repo clone")
    mkdir -p "$4" && echo "$3" > "$4/README" && echo "$3" >> "$here/clones.log" ;;
  *) echo "unexpected gh invocation: $*" >&2; exit 1 ;;
esac
"#;
    let path = dir.join("gh");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Lines appended to `clones.log` by the fake `gh`
pub fn clone_log(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("clones.log"))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
