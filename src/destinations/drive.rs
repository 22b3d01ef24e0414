//! Google Drive destination
//!
//! Layout inside the account:
//!
//! ```text
//! repobackup/                              root container
//! repobackup/GLOBAL_backup_info.json       destination ledger
//! repobackup/repobackup-<timestamp>/       one container per push
//! repobackup/repobackup-<timestamp>/<key>.zip
//! ```

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info};

use super::{Destination, DestinationContext};
use crate::archive::ArchiveCache;
use crate::auth::{CredentialStore, DeviceFlowAuthenticator, OAuthClient};
use crate::config::{DestinationConfig, DestinationType};
use crate::ledger::BackupLedger;
use crate::prompt::Confirm;
use crate::repository::SanitizedKey;

pub const ROOT_FOLDER: &str = "repobackup";
pub const LEDGER_FILE: &str = "GLOBAL_backup_info.json";
pub const DRIVE_SCOPE: &str = "email https://www.googleapis.com/auth/drive.file";
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

const DEFAULT_API_BASE: &str = "https://www.googleapis.com";
const DEFAULT_OAUTH_BASE: &str = "https://oauth2.googleapis.com";
const MULTIPART_BOUNDARY: &str = "repobackup-part-boundary";

/// File or folder metadata as returned by the Drive API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FileMetadata<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parents: Vec<&'a str>,
}

/// Minimal Drive v3 REST client bound to one access token
#[derive(Debug, Clone)]
pub struct DriveClient {
    http: reqwest::Client,
    api_base: String,
    access_token: String,
}

impl DriveClient {
    pub fn new(http: reqwest::Client, api_base: &str, access_token: &str) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        }
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }

    pub async fn list(&self, query: &str) -> Result<Vec<DriveFile>> {
        debug!("Drive query: {}", query);
        let response = self
            .http
            .get(self.files_url())
            .bearer_auth(&self.access_token)
            .query(&[
                ("q", query),
                ("fields", "files(id,name,mimeType)"),
                ("spaces", "drive"),
            ])
            .send()
            .await
            .context("Failed to reach Drive API")?;

        let list: FileList = checked(response, "list")
            .await?
            .json()
            .await
            .context("Invalid file list from Drive API")?;
        Ok(list.files)
    }

    pub async fn find_folder(&self, name: &str, parent: Option<&str>) -> Result<Option<DriveFile>> {
        Ok(self.list(&folder_query(name, parent)).await?.into_iter().next())
    }

    pub async fn find_file(&self, name: &str, parent: &str) -> Result<Option<DriveFile>> {
        Ok(self.list(&file_query(name, parent)).await?.into_iter().next())
    }

    pub async fn create_folder(&self, name: &str, parent: Option<&str>) -> Result<DriveFile> {
        let metadata = FileMetadata {
            name,
            mime_type: Some(FOLDER_MIME),
            parents: parent.into_iter().collect(),
        };
        let response = self
            .http
            .post(self.files_url())
            .bearer_auth(&self.access_token)
            .json(&metadata)
            .send()
            .await
            .context("Failed to reach Drive API")?;

        checked(response, "create folder")
            .await?
            .json()
            .await
            .context("Invalid folder metadata from Drive API")
    }

    /// Upload `content` as a new file in `parent` in a single
    /// multipart/related request. Meant for small files such as the ledger.
    pub async fn upload(
        &self,
        name: &str,
        parent: &str,
        mime_type: &str,
        content: Vec<u8>,
    ) -> Result<DriveFile> {
        let metadata = serde_json::to_vec(&FileMetadata {
            name,
            mime_type: None,
            parents: vec![parent],
        })?;
        let body = multipart_body(&metadata, mime_type, &content);

        let response = self
            .http
            .post(format!("{}/upload/drive/v3/files", self.api_base))
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "multipart")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", name))?;

        checked(response, "upload")
            .await?
            .json()
            .await
            .context("Invalid upload response from Drive API")
    }

    /// Upload the file at `source` as a new file in `parent` through a
    /// resumable session, streaming the body from disk
    pub async fn upload_file(
        &self,
        name: &str,
        parent: &str,
        mime_type: &str,
        source: &Path,
    ) -> Result<DriveFile> {
        let file = tokio::fs::File::open(source)
            .await
            .with_context(|| format!("Failed to open {}", source.display()))?;
        let length = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", source.display()))?
            .len();

        let session = self.start_resumable(name, parent, mime_type, length).await?;
        debug!("Resumable session for {} ({} bytes)", name, length);

        let response = self
            .http
            .put(&session)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .with_context(|| format!("Failed to upload {}", name))?;

        checked(response, "upload")
            .await?
            .json()
            .await
            .context("Invalid upload response from Drive API")
    }

    /// Open a resumable upload session and return its URI
    async fn start_resumable(
        &self,
        name: &str,
        parent: &str,
        mime_type: &str,
        length: u64,
    ) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/upload/drive/v3/files", self.api_base))
            .bearer_auth(&self.access_token)
            .query(&[("uploadType", "resumable")])
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", length)
            .json(&FileMetadata {
                name,
                mime_type: None,
                parents: vec![parent],
            })
            .send()
            .await
            .with_context(|| format!("Failed to start upload of {}", name))?;

        checked(response, "start upload")
            .await?
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|location| location.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Drive returned no upload session for {}", name))
    }

    pub async fn download(&self, id: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(format!("{}/{}", self.files_url(), id))
            .bearer_auth(&self.access_token)
            .query(&[("alt", "media")])
            .send()
            .await
            .context("Failed to reach Drive API")?;

        Ok(checked(response, "download").await?.bytes().await?.to_vec())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .delete(format!("{}/{}", self.files_url(), id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("Failed to reach Drive API")?;

        checked(response, "delete").await?;
        Ok(())
    }
}

async fn checked(response: reqwest::Response, operation: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(anyhow!("Drive {} failed ({}): {}", operation, status, body.trim()))
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Folder lookup under `parent`, or directly under the drive root
fn folder_query(name: &str, parent: Option<&str>) -> String {
    format!(
        "name = '{}' and mimeType = '{}' and '{}' in parents and trashed = false",
        quote(name),
        FOLDER_MIME,
        quote(parent.unwrap_or("root"))
    )
}

fn file_query(name: &str, parent: &str) -> String {
    format!(
        "name = '{}' and '{}' in parents and trashed = false",
        quote(name),
        quote(parent)
    )
}

fn multipart_body(metadata: &[u8], mime_type: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + content.len() + 256);
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n",
            b = MULTIPART_BOUNDARY
        )
        .as_bytes(),
    );
    body.extend_from_slice(metadata);
    body.extend_from_slice(
        format!("\r\n--{}\r\nContent-Type: {}\r\n\r\n", MULTIPART_BOUNDARY, mime_type).as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
    body
}

struct DriveSession {
    client: DriveClient,
    root_id: String,
    ledger_file_id: Option<String>,
    previous: BackupLedger,
}

pub struct GoogleDrive {
    name: String,
    enabled: bool,
    client_id: Option<String>,
    client_secret: Option<String>,
    api_base: String,
    oauth_base: String,
    credentials: PathBuf,
    http: reqwest::Client,
    confirm: Arc<dyn Confirm>,
    archives: ArchiveCache,
    concurrency: usize,
    session: Option<DriveSession>,
}

impl GoogleDrive {
    pub fn from_config(config: &DestinationConfig, ctx: &DestinationContext) -> Self {
        let credentials = ctx.credentials_dir.join(format!(
            "credentials_{}.json",
            SanitizedKey::new(&config.name)
        ));

        Self {
            name: config.name.clone(),
            enabled: config.enabled,
            client_id: config.parameter("clientID").map(str::to_string),
            client_secret: config.parameter("clientSecret").map(str::to_string),
            api_base: config
                .parameter("apiBase")
                .unwrap_or(DEFAULT_API_BASE)
                .to_string(),
            oauth_base: config
                .parameter("oauthBase")
                .unwrap_or(DEFAULT_OAUTH_BASE)
                .to_string(),
            credentials,
            http: ctx.http.clone(),
            confirm: Arc::clone(&ctx.confirm),
            archives: ctx.archives.clone(),
            concurrency: ctx.concurrency.max(1),
            session: None,
        }
    }

    fn session(&mut self) -> Result<&mut DriveSession> {
        let name = &self.name;
        self.session
            .as_mut()
            .ok_or_else(|| anyhow!("Destination '{}' is not connected", name))
    }

    fn authenticator(&self) -> Result<DeviceFlowAuthenticator> {
        let client_id = self
            .client_id
            .as_deref()
            .ok_or_else(|| anyhow!("Destination '{}' is missing the clientID parameter", self.name))?;
        let client_secret = self.client_secret.as_deref().ok_or_else(|| {
            anyhow!("Destination '{}' is missing the clientSecret parameter", self.name)
        })?;

        Ok(DeviceFlowAuthenticator::new(
            self.name.clone(),
            self.http.clone(),
            OAuthClient::google(client_id, client_secret, DRIVE_SCOPE, &self.oauth_base),
            CredentialStore::new(&self.credentials),
        ))
    }
}

#[async_trait]
impl Destination for GoogleDrive {
    fn kind(&self) -> DestinationType {
        DestinationType::GoogleDrive
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn connect(&mut self) -> Result<()> {
        let token = self
            .authenticator()?
            .ensure_token(self.confirm.as_ref())
            .await
            .with_context(|| format!("Authentication failed for destination '{}'", self.name))?;

        let client = DriveClient::new(self.http.clone(), &self.api_base, &token.access_token);
        let root = match client.find_folder(ROOT_FOLDER, None).await? {
            Some(folder) => folder,
            None => {
                info!(destination = %self.name, "Creating root folder '{}'", ROOT_FOLDER);
                client.create_folder(ROOT_FOLDER, None).await?
            }
        };

        info!(destination = %self.name, root = %root.id, "Connected to Google Drive");
        self.session = Some(DriveSession {
            client,
            root_id: root.id,
            ledger_file_id: None,
            previous: BackupLedger::new(),
        });
        Ok(())
    }

    async fn previous_backup_times(&mut self) -> Result<BackupLedger> {
        let session = self.session()?;

        let ledger = match session.client.find_file(LEDGER_FILE, &session.root_id).await? {
            Some(file) => {
                let bytes = session.client.download(&file.id).await?;
                session.ledger_file_id = Some(file.id);
                BackupLedger::from_slice(&bytes)?
            }
            None => {
                session.ledger_file_id = None;
                BackupLedger::new()
            }
        };

        session.previous = ledger.clone();
        Ok(ledger)
    }

    async fn push(&mut self, changed: &[SanitizedKey], ledger: &BackupLedger) -> Result<()> {
        if changed.is_empty() {
            info!(destination = %self.name, "Nothing to upload");
            return Ok(());
        }

        let name = self.name.clone();
        let archives = self.archives.clone();
        let concurrency = self.concurrency;
        let session = self.session()?;

        let run_folder_name = format!(
            "{}-{}",
            ROOT_FOLDER,
            Utc::now().format("%Y-%m-%d-%H-%M-%S")
        );
        let run_folder = session
            .client
            .create_folder(&run_folder_name, Some(&session.root_id))
            .await
            .with_context(|| format!("Failed to create folder {}", run_folder_name))?;
        info!(destination = %name, folder = %run_folder_name, "Uploading {} repositories", changed.len());

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut futures = FuturesUnordered::new();
        for key in changed {
            let semaphore = Arc::clone(&semaphore);
            let client = &session.client;
            let archives = &archives;
            let parent = run_folder.id.as_str();

            futures.push(async move {
                let result = async {
                    let _permit = semaphore.acquire().await?;
                    let zip = archives.archive_for(key).await?;
                    client
                        .upload_file(&format!("{}.zip", key), parent, "application/zip", &zip)
                        .await
                }
                .await;
                (key, result)
            });
        }

        let mut failed = Vec::new();
        while let Some((key, result)) = futures.next().await {
            match result {
                Ok(file) => debug!(destination = %name, repo = %key, id = %file.id, "Uploaded"),
                Err(e) => {
                    error!(destination = %name, repo = %key, error = %e, "Failed to upload repository");
                    failed.push(key);
                }
            }
        }

        // Ledger replacement must succeed, or the next delta would be wrong
        let snapshot = ledger.reverted(failed.iter().copied(), &session.previous);
        if let Some(old) = session.ledger_file_id.take() {
            session
                .client
                .delete(&old)
                .await
                .context("Failed to delete previous ledger")?;
        }
        let uploaded = session
            .client
            .upload(LEDGER_FILE, &session.root_id, "application/json", snapshot.to_vec()?)
            .await
            .context("Failed to upload ledger")?;

        session.ledger_file_id = Some(uploaded.id);
        session.previous = snapshot;

        info!(
            destination = %name,
            "Uploaded {} of {} repositories",
            changed.len() - failed.len(),
            changed.len()
        );
        Ok(())
    }
}
