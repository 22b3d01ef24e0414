//! OAuth 2.0 device-flow authentication
//!
//! ```text
//! NoCredential -> AwaitingUserAuthorization -> Polling -> Authenticated
//! Authenticated -> Expired -> Refreshing -> Authenticated | NoCredential
//! ```
//!
//! The operator authorizes on another device while we poll the token
//! endpoint every `interval` seconds for at most
//! `max(expires_in, 600) / interval` attempts. Token records are persisted
//! to one credential file per destination, outside the backup data tree.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::prompt::Confirm;

/// Floor for the authorization window, whatever the provider declares
pub const MIN_AUTHORIZATION_WINDOW_SECS: u64 = 600;

pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Seconds added to the polling interval each time the server answers `slow_down`
pub const SLOW_DOWN_INCREMENT_SECS: u32 = 5;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("HTTP error talking to the authorization server: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Authorization server rejected the request ({status}): {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("Device was not authorized after {attempts} polling attempts")]
    AuthorizationTimedOut { attempts: u64 },

    #[error("Token refresh failed ({status}): {body}")]
    RefreshFailed { status: StatusCode, body: String },

    #[error("Unexpected response from authorization server: {0}")]
    InvalidResponse(String),

    #[error("Invalid credential file {path}: {reason}")]
    InvalidCredentials { path: PathBuf, reason: String },

    #[error("Credential file I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which states of the device flow a credential can be in when a connection starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    NoCredential,
    AwaitingUserAuthorization,
    Polling,
    Authenticated,
    Expired,
    Refreshing,
}

/// Provider endpoints and client identity
#[derive(Debug, Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub device_code_url: String,
    pub token_url: String,
}

impl OAuthClient {
    /// Google's device-flow endpoints, rooted at `base` (normally `https://oauth2.googleapis.com`)
    pub fn google(client_id: &str, client_secret: &str, scope: &str, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scope: scope.to_string(),
            device_code_url: format!("{}/device/code", base),
            token_url: format!("{}/token", base),
        }
    }
}

/// Persisted access/refresh token pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    /// Declared lifetime in seconds
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub id_token: String,
    /// When the record was obtained or last refreshed
    pub obtained_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.obtained_at + ChronoDuration::seconds(self.expires_in)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() < now
    }

    pub fn state(&self, now: DateTime<Utc>) -> AuthState {
        if self.is_expired(now) {
            AuthState::Expired
        } else {
            AuthState::Authenticated
        }
    }

    /// `email` claim of the identity token, if it carries one
    pub fn email(&self) -> Option<String> {
        #[derive(Deserialize)]
        struct Claims {
            email: Option<String>,
        }

        let mut parts = self.id_token.split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) => payload,
            _ => return None,
        };
        let decoded = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
        let claims: Claims = serde_json::from_slice(&decoded).ok()?;
        claims.email.filter(|e| !e.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

impl TokenResponse {
    fn into_record(self, obtained_at: DateTime<Utc>) -> TokenRecord {
        TokenRecord {
            access_token: self.access_token,
            token_type: self.token_type,
            expires_in: self.expires_in,
            refresh_token: self.refresh_token.unwrap_or_default(),
            id_token: self.id_token.unwrap_or_default(),
            obtained_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Device code grant handed to the operator
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    #[serde(alias = "verification_uri")]
    pub verification_url: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

impl DeviceAuthorization {
    pub fn max_attempts(&self) -> u64 {
        max_poll_attempts(self.expires_in, self.interval)
    }
}

/// Number of polls that fit in `max(expires_in, 600)` seconds
pub fn max_poll_attempts(expires_in: u64, interval: u64) -> u64 {
    expires_in.max(MIN_AUTHORIZATION_WINDOW_SECS) / interval.max(1)
}

/// Credential file for one destination
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<TokenRecord>, AuthError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: TokenRecord =
            serde_json::from_slice(&bytes).map_err(|e| AuthError::InvalidCredentials {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if record.access_token.is_empty() {
            return Err(AuthError::InvalidCredentials {
                path: self.path.clone(),
                reason: "access token missing".to_string(),
            });
        }
        Ok(Some(record))
    }

    pub async fn save(&self, record: &TokenRecord) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        // Owner-only from the moment it exists, then moved over the old file
        let partial = self.path.with_extension("json.partial");
        match tokio::fs::remove_file(&partial).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&partial).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&partial, &self.path).await?;
        Ok(())
    }
}

/// Runs the device flow and token refreshes for one destination
pub struct DeviceFlowAuthenticator {
    name: String,
    http: reqwest::Client,
    client: OAuthClient,
    store: CredentialStore,
    tick: Duration,
}

impl DeviceFlowAuthenticator {
    pub fn new(
        name: impl Into<String>,
        http: reqwest::Client,
        client: OAuthClient,
        store: CredentialStore,
    ) -> Self {
        Self {
            name: name.into(),
            http,
            client,
            store,
            tick: Duration::from_secs(1),
        }
    }

    /// Wall-clock length of one unit of the provider's polling interval
    pub fn with_poll_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Produce a usable token, authenticating or refreshing as needed.
    ///
    /// If a refresh fails, `confirm` decides whether to restart the full
    /// device flow or give up with the refresh error.
    pub async fn ensure_token(&self, confirm: &dyn Confirm) -> Result<TokenRecord, AuthError> {
        let record = match self.store.load().await? {
            Some(record) => {
                info!(destination = %self.name, "Credentials found at {}", self.store.path().display());
                record
            }
            None => {
                debug!(destination = %self.name, state = ?AuthState::NoCredential, "No stored credentials");
                self.authenticate().await?
            }
        };

        if record.state(Utc::now()) == AuthState::Authenticated {
            return Ok(record);
        }

        info!(destination = %self.name, "Token expired, refreshing");
        match self.refresh(&record).await {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(destination = %self.name, error = %e, "Failed to refresh token");
                let question = format!(
                    "Failed to refresh the token for '{}'. Re-authenticate?",
                    self.name
                );
                if confirm.confirm(&question).await {
                    self.authenticate().await
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Full device flow: request a code, show it, poll, persist
    pub async fn authenticate(&self) -> Result<TokenRecord, AuthError> {
        info!(destination = %self.name, "Starting device authorization");
        let authorization = self.request_device_code().await?;

        debug!(destination = %self.name, state = ?AuthState::AwaitingUserAuthorization, "Waiting for the operator");
        println!(
            "🔑 {}: visit {} and enter the code: {}",
            self.name, authorization.verification_url, authorization.user_code
        );

        let record = self.poll_for_token(&authorization).await?;
        self.store.save(&record).await?;

        match record.email() {
            Some(email) => info!(destination = %self.name, "Authenticated as {}", email),
            None => warn!(destination = %self.name, "Authenticated, but the identity token carries no e-mail"),
        }
        Ok(record)
    }

    pub async fn request_device_code(&self) -> Result<DeviceAuthorization, AuthError> {
        let response = self
            .http
            .post(&self.client.device_code_url)
            .form(&[
                ("client_id", self.client.client_id.as_str()),
                ("scope", self.client.scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::Rejected { status, body });
        }

        serde_json::from_str(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }

    /// Poll the token endpoint until the operator approves, the provider
    /// refuses, or the attempt budget runs out
    pub async fn poll_for_token(
        &self,
        authorization: &DeviceAuthorization,
    ) -> Result<TokenRecord, AuthError> {
        let max_attempts = authorization.max_attempts();
        let mut wait = self.tick * authorization.interval.max(1) as u32;

        debug!(destination = %self.name, state = ?AuthState::Polling, max_attempts, "Polling for token");

        for attempt in 1..=max_attempts {
            tokio::time::sleep(wait).await;

            let response = self
                .http
                .post(&self.client.token_url)
                .form(&[
                    ("client_id", self.client.client_id.as_str()),
                    ("client_secret", self.client.client_secret.as_str()),
                    ("device_code", authorization.device_code.as_str()),
                    ("grant_type", DEVICE_GRANT_TYPE),
                ])
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::PRECONDITION_REQUIRED {
                debug!(destination = %self.name, attempt, "Authorization pending");
                continue;
            }

            let body = response.text().await?;
            if status.is_success() {
                let token: TokenResponse = serde_json::from_str(&body)
                    .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
                debug!(destination = %self.name, state = ?AuthState::Authenticated, attempt, "Device authorized");
                return Ok(token.into_record(Utc::now()));
            }

            match poll_error(&body) {
                Some(PollError::Pending) => {
                    debug!(destination = %self.name, attempt, "Authorization pending");
                }
                Some(PollError::SlowDown) => {
                    wait += self.tick * SLOW_DOWN_INCREMENT_SECS;
                    debug!(destination = %self.name, attempt, ?wait, "Asked to slow down");
                }
                None => return Err(AuthError::Rejected { status, body }),
            }
        }

        Err(AuthError::AuthorizationTimedOut {
            attempts: max_attempts,
        })
    }

    /// Exchange the refresh token for a new access token and persist it
    pub async fn refresh(&self, record: &TokenRecord) -> Result<TokenRecord, AuthError> {
        debug!(destination = %self.name, state = ?AuthState::Refreshing, "Refreshing access token");

        let response = self
            .http
            .post(&self.client.token_url)
            .form(&[
                ("client_id", self.client.client_id.as_str()),
                ("client_secret", self.client.client_secret.as_str()),
                ("refresh_token", record.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::RefreshFailed { status, body });
        }

        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        let mut refreshed = token.into_record(Utc::now());
        if refreshed.refresh_token.is_empty() {
            refreshed.refresh_token = record.refresh_token.clone();
        }

        self.store.save(&refreshed).await?;
        info!(destination = %self.name, "Access token refreshed");
        Ok(refreshed)
    }
}

/// Token endpoint errors that mean "keep polling"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollError {
    Pending,
    SlowDown,
}

fn poll_error(body: &str) -> Option<PollError> {
    let response = serde_json::from_str::<ErrorResponse>(body).ok()?;
    match response.error.as_str() {
        "authorization_pending" => Some(PollError::Pending),
        "slow_down" => Some(PollError::SlowDown),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{MockConfirm, NonInteractive};
    use assert_matches::assert_matches;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn authenticator(server: &MockServer, dir: &TempDir) -> DeviceFlowAuthenticator {
        let client = OAuthClient::google("client-1", "secret-1", "email drive.file", &server.uri());
        DeviceFlowAuthenticator::new(
            "drive",
            reqwest::Client::new(),
            client,
            CredentialStore::new(dir.path().join("credentials_drive.json")),
        )
        .with_poll_tick(Duration::from_millis(1))
    }

    fn id_token(email: &str) -> String {
        let payload = URL_SAFE_NO_PAD.encode(json!({ "email": email }).to_string());
        format!("header.{}.signature", payload)
    }

    fn record(obtained_at: DateTime<Utc>) -> TokenRecord {
        TokenRecord {
            access_token: "old-access".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            refresh_token: "old-refresh".to_string(),
            id_token: String::new(),
            obtained_at,
        }
    }

    async fn mount_device_code(server: &MockServer, expires_in: u64, interval: u64) {
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .and(body_string_contains("client_id=client-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "device_code": "DEV-1",
                "user_code": "ABCD-EFGH",
                "verification_url": "https://www.google.com/device",
                "expires_in": expires_in,
                "interval": interval,
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[test]
    fn test_poll_attempt_budget() {
        assert_eq!(max_poll_attempts(1800, 5), 360);
        assert_eq!(max_poll_attempts(0, 5), 120);
        assert_eq!(max_poll_attempts(300, 100), 6);
        assert_eq!(max_poll_attempts(600, 0), 600);
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        assert!(!record(now - ChronoDuration::seconds(3599)).is_expired(now));
        assert!(record(now - ChronoDuration::seconds(3601)).is_expired(now));
        assert_eq!(record(now - ChronoDuration::hours(2)).state(now), AuthState::Expired);
    }

    #[test]
    fn test_email_from_id_token() {
        let mut token = record(Utc::now());
        token.id_token = id_token("me@example.com");
        assert_eq!(token.email(), Some("me@example.com".to_string()));

        token.id_token = "not-a-jwt".to_string();
        assert_eq!(token.email(), None);
    }

    #[tokio::test]
    async fn test_device_flow_polls_until_authorized() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_device_code(&server, 1800, 5).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("device_code=DEV-1"))
            .respond_with(ResponseTemplate::new(428))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("device_code=DEV-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "token_type": "Bearer",
                "expires_in": 3599,
                "refresh_token": "refresh-1",
                "id_token": id_token("me@example.com"),
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = authenticator(&server, &dir);
        let before = Utc::now();
        let token = auth.authenticate().await.unwrap();

        assert_eq!(token.access_token, "access-1");
        assert_eq!(token.refresh_token, "refresh-1");
        assert!(token.obtained_at >= before);

        let stored = auth.store().load().await.unwrap().unwrap();
        assert_eq!(stored, token);
    }

    #[tokio::test]
    async fn test_rfc_pending_error_keeps_polling() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_device_code(&server, 1800, 5).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "authorization_pending" })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-2",
                "expires_in": 3599,
            })))
            .mount(&server)
            .await;

        let token = authenticator(&server, &dir).authenticate().await.unwrap();
        assert_eq!(token.access_token, "access-2");
    }

    #[tokio::test]
    async fn test_polling_gives_up_after_budget() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_device_code(&server, 0, 100).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(428))
            .expect(6)
            .mount(&server)
            .await;

        let auth = authenticator(&server, &dir);
        let err = auth.authenticate().await.unwrap_err();

        assert_matches!(err, AuthError::AuthorizationTimedOut { attempts: 6 });
        assert!(auth.store().load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_denied_authorization_is_terminal() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_device_code(&server, 1800, 5).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(403).set_body_json(json!({ "error": "access_denied" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = authenticator(&server, &dir).authenticate().await.unwrap_err();
        assert_matches!(err, AuthError::Rejected { status, .. } if status == StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_reissued() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=old-refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "token_type": "Bearer",
                "expires_in": 3599,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = authenticator(&server, &dir);
        let stale = record(Utc::now() - ChronoDuration::hours(3));
        let refreshed = auth.refresh(&stale).await.unwrap();

        assert_eq!(refreshed.access_token, "new-access");
        assert_eq!(refreshed.refresh_token, "old-refresh");
        assert!(!refreshed.is_expired(Utc::now()));
        assert_eq!(auth.store().load().await.unwrap(), Some(refreshed));
    }

    #[tokio::test]
    async fn test_refresh_uses_reissued_refresh_token() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "new-access",
                "expires_in": 3599,
                "refresh_token": "rotated",
            })))
            .mount(&server)
            .await;

        let refreshed = authenticator(&server, &dir)
            .refresh(&record(Utc::now() - ChronoDuration::hours(3)))
            .await
            .unwrap();
        assert_eq!(refreshed.refresh_token, "rotated");
    }

    #[tokio::test]
    async fn test_valid_stored_token_makes_no_requests() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let auth = authenticator(&server, &dir);
        let current = record(Utc::now());
        auth.store().save(&current).await.unwrap();

        let token = auth.ensure_token(&NonInteractive).await.unwrap();
        assert_eq!(token, current);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_refresh_non_interactive_aborts() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let auth = authenticator(&server, &dir);
        auth.store()
            .save(&record(Utc::now() - ChronoDuration::hours(3)))
            .await
            .unwrap();

        let err = auth.ensure_token(&NonInteractive).await.unwrap_err();
        assert_matches!(err, AuthError::RefreshFailed { .. });
    }

    #[tokio::test]
    async fn test_failed_refresh_confirmed_reauthenticates() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        mount_device_code(&server, 1800, 5).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("device_code=DEV-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "expires_in": 3599,
                "refresh_token": "fresh-refresh",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = authenticator(&server, &dir);
        auth.store()
            .save(&record(Utc::now() - ChronoDuration::hours(3)))
            .await
            .unwrap();

        let mut confirm = MockConfirm::new();
        confirm.expect_confirm().times(1).returning(|_| true);

        let token = auth.ensure_token(&confirm).await.unwrap();
        assert_eq!(token.access_token, "fresh");
        assert_eq!(auth.store().load().await.unwrap(), Some(token));
    }

    #[tokio::test]
    async fn test_missing_credentials_run_device_flow() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_device_code(&server, 1800, 5).await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "first",
                "expires_in": 3599,
                "refresh_token": "r",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = authenticator(&server, &dir);
        let token = auth.ensure_token(&NonInteractive).await.unwrap();
        assert_eq!(token.access_token, "first");
        assert!(auth.store().path().exists());
    }

    #[test]
    fn test_poll_error_classification() {
        assert_eq!(
            poll_error(r#"{"error":"authorization_pending"}"#),
            Some(PollError::Pending)
        );
        assert_eq!(poll_error(r#"{"error":"slow_down"}"#), Some(PollError::SlowDown));
        assert_eq!(poll_error(r#"{"error":"expired_token"}"#), None);
        assert_eq!(poll_error("<html>"), None);
    }

    #[tokio::test]
    async fn test_slow_down_lengthens_interval() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        mount_device_code(&server, 1800, 1).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "slow_down" })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "patient",
                "expires_in": 3599,
            })))
            .mount(&server)
            .await;

        let auth = authenticator(&server, &dir).with_poll_tick(Duration::from_millis(10));
        let started = std::time::Instant::now();
        let token = auth.authenticate().await.unwrap();

        // One tick before the first poll, then 1 + 5 ticks before the second
        assert_eq!(token.access_token, "patient");
        assert!(started.elapsed() >= Duration::from_millis(70));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_saved_credentials_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("nested/credentials_drive.json"));
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::write(store.path(), "{}").unwrap();
        std::fs::set_permissions(store.path(), std::fs::Permissions::from_mode(0o644)).unwrap();

        let saved = record(Utc::now());
        store.save(&saved).await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(store.load().await.unwrap(), Some(saved));
        assert!(!dir.path().join("nested/credentials_drive.json.partial").exists());
    }

    #[tokio::test]
    async fn test_credentials_without_access_token_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("c.json"));
        std::fs::write(
            store.path(),
            r#"{"access_token":"","obtained_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_matches!(store.load().await, Err(AuthError::InvalidCredentials { .. }));
    }
}
