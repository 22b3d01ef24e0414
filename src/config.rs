use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for repobackup
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Local staging directory that mirrors every repository
    #[serde(default = "default_storage_path")]
    pub storage_path: String,

    /// Directory holding per-destination credential files
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: String,

    /// Never prompt; treat every confirmation as declined
    #[serde(default)]
    pub non_interactive: bool,

    /// Repository selection policy
    #[serde(default)]
    pub filters: FilterConfig,

    /// Download phase settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Upload phase settings
    #[serde(default)]
    pub upload: UploadConfig,

    /// Post-upload cleanup
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Backup destinations
    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

/// Repository filtering configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FilterConfig {
    /// Back up private repositories
    #[serde(default = "default_true")]
    pub include_private: bool,

    /// Back up repositories owned by someone other than the authenticated user
    #[serde(default)]
    pub include_other_owners: bool,

    /// Repositories to skip, as `owner/name` (`*` globs allowed)
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Download phase configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DownloadConfig {
    /// Maximum concurrent fetches
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Re-fetch every repository even when the ledger says it is current
    #[serde(default)]
    pub force_redownload: bool,
}

/// Upload phase configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UploadConfig {
    /// Maximum concurrent destinations, and concurrent transfers within one
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Extra attempts for a failed destination push
    #[serde(default)]
    pub retries: u32,

    /// Delay between push attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Cleanup configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CleanupConfig {
    /// Remove staged payload after a successful upload, keeping metadata markers
    #[serde(default)]
    pub delete_data_after_upload: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "full"
}

/// Destination adapter selector
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum DestinationType {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "gdrive", alias = "google-drive")]
    GoogleDrive,
}

impl DestinationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestinationType::Local => "local",
            DestinationType::GoogleDrive => "google-drive",
        }
    }
}

/// One configured backup destination
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DestinationConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: DestinationType,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Type-specific settings (e.g. `path`, `clientID`, `clientSecret`)
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl DestinationConfig {
    /// Look up a non-empty parameter
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_concurrency() -> usize {
    5
}
fn default_retry_delay() -> u64 {
    5
}
fn default_storage_path() -> String {
    "/tmp/repobackup".to_string()
}
fn default_credentials_dir() -> String {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        format!("{}/repobackup/credentials", config_home)
    } else {
        "${HOME}/.config/repobackup/credentials".to_string()
    }
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include_private: default_true(),
            include_other_owners: false,
            exclude: Vec::new(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            force_redownload: false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retries: 0,
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repobackup").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.storage_path = shellexpand::full(&self.storage_path)
            .context("Failed to expand storage_path")?
            .into_owned();

        self.credentials_dir = shellexpand::full(&self.credentials_dir)
            .context("Failed to expand credentials_dir")?
            .into_owned();

        for destination in &mut self.destinations {
            if let Some(path) = destination.parameters.get_mut("path") {
                *path = shellexpand::full(path.as_str())
                    .with_context(|| {
                        format!("Failed to expand path of destination '{}'", destination.name)
                    })?
                    .into_owned();
            }
        }

        Ok(())
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(&self.storage_path)
    }

    pub fn credentials_root(&self) -> PathBuf {
        PathBuf::from(&self.credentials_dir)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.upload.retry_delay_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            credentials_dir: default_credentials_dir(),
            non_interactive: false,
            filters: FilterConfig::default(),
            download: DownloadConfig::default(),
            upload: UploadConfig::default(),
            cleanup: CleanupConfig::default(),
            logging: LoggingConfig::default(),
            destinations: Vec::new(),
        }
    }
}
