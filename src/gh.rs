//! GitHub access through the `gh` command line tool
//!
//! The `gh` CLI owns authentication with GitHub; repobackup only asks it for
//! the repository inventory and for fresh clones.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

use crate::repository::RepositoryDescriptor;

/// Fields requested from `gh repo list --json`
pub const INVENTORY_FIELDS: &[&str] = &[
    "name",
    "nameWithOwner",
    "isPrivate",
    "owner",
    "updatedAt",
    "isArchived",
    "description",
];

const LIST_LIMIT: &str = "500";

/// Produces the list of remote repositories for one run
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceInventory: Send + Sync {
    /// Login of the authenticated user
    async fn authenticated_user(&self) -> Result<String>;

    /// Every repository visible to the authenticated user
    async fn list_repositories(&self) -> Result<Vec<RepositoryDescriptor>>;
}

/// Materializes a working copy of a repository
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Clone `full_name` into `target`, which must not exist yet
    async fn fetch(&self, full_name: &str, target: &Path) -> Result<()>;
}

/// Wrapper around the `gh` executable
#[derive(Debug, Clone)]
pub struct GhCli {
    executable: PathBuf,
}

impl GhCli {
    /// Locate `gh`, honouring `GH_PATH` when set
    pub fn new() -> Self {
        let executable = std::env::var_os("GH_PATH")
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("gh"));
        Self { executable }
    }

    pub fn with_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    async fn exec(&self, args: &[&str]) -> Result<String> {
        debug!("Running gh {}", args.join(" "));

        let output = AsyncCommand::new(&self.executable)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.executable.display()))?;

        if !output.status.success() {
            return Err(anyhow!(
                "gh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        String::from_utf8(output.stdout).context("gh output is not valid UTF-8")
    }
}

impl Default for GhCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceInventory for GhCli {
    async fn authenticated_user(&self) -> Result<String> {
        let login = self
            .exec(&["api", "user", "-q", ".login"])
            .await
            .context("Failed to get authenticated GitHub user. Run: gh auth login")?;

        let login = login.trim().to_string();
        if login.is_empty() {
            return Err(anyhow!("gh returned an empty login"));
        }
        Ok(login)
    }

    async fn list_repositories(&self) -> Result<Vec<RepositoryDescriptor>> {
        let fields = INVENTORY_FIELDS.join(",");
        let stdout = self
            .exec(&["repo", "list", "--limit", LIST_LIMIT, "--json", &fields])
            .await
            .context("Failed to list repositories")?;

        let repos = parse_inventory(&stdout)?;
        info!("Found {} repositories", repos.len());
        Ok(repos)
    }
}

#[async_trait]
impl Fetcher for GhCli {
    async fn fetch(&self, full_name: &str, target: &Path) -> Result<()> {
        let target = target
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 target path: {}", target.display()))?;
        self.exec(&["repo", "clone", full_name, target]).await?;
        Ok(())
    }
}

/// Parse the JSON array printed by `gh repo list --json`
pub fn parse_inventory(json: &str) -> Result<Vec<RepositoryDescriptor>> {
    serde_json::from_str(json).context("Failed to parse repository list")
}
