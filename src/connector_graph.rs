//! Microsoft Graph drive connector.
//!
//! Lists and downloads files from a folder in a OneDrive/SharePoint drive
//! using the OAuth2 client-credentials flow.
//!
//! # Configuration
//!
//! ```toml
//! [remote]
//! tenant_id = "00000000-0000-0000-0000-000000000000"
//! client_id = "11111111-1111-1111-1111-111111111111"
//! client_secret_env = "GRAPH_CLIENT_SECRET"
//! drive_id = "b!XYZ"              # shared or SharePoint drive
//! # user_id = "docs@example.com"  # or a user's personal drive
//! ```
//!
//! One [`GraphClient`] (and so one token cache) is shared by every class;
//! each class gets a [`GraphSource`] bound to its folder and include globs.
//!
//! # Authentication
//!
//! Tokens come from `POST {authority}/{tenant}/oauth2/v2.0/token` and are
//! cached until shortly before `expires_in`. A 401 from Graph drops the
//! cached token and retries the request once with a fresh one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use docsync_core::models::{RemoteDocument, RemoteDocumentMeta};
use docsync_core::PipelineError;

use crate::config::RemoteConfig;
use crate::retry::{is_retryable_error, should_retry, Backoff};
use crate::traits::{DocumentSource, Listing};

/// Refresh this long before the token actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

// ═══════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    name: String,
    last_modified_date_time: DateTime<Utc>,
    size: Option<u64>,
    web_url: Option<String>,
    /// Present only on files; folders carry a `folder` facet instead.
    file: Option<serde_json::Value>,
}

/// Authenticated HTTP access to one Graph drive.
pub struct GraphClient {
    http: reqwest::Client,
    /// `drives/{id}` or `users/{id}/drive`.
    drive: String,
    config: RemoteConfig,
    client_secret: String,
    backoff: Backoff,
    token: Mutex<Option<CachedToken>>,
}

impl GraphClient {
    pub fn new(config: RemoteConfig, client_secret: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let backoff = Backoff::new(config.max_attempts, config.retry_base_ms);
        let drive = match (&config.drive_id, &config.user_id) {
            (Some(drive_id), _) => format!("drives/{}", drive_id),
            (None, Some(user_id)) => format!("users/{}/drive", user_id),
            (None, None) => anyhow::bail!("remote: set drive_id or user_id"),
        };
        Ok(Self {
            http,
            drive,
            config,
            client_secret,
            backoff,
            token: Mutex::new(None),
        })
    }

    fn drive_url(&self) -> String {
        format!("{}/{}", self.config.graph_url.trim_end_matches('/'), self.drive)
    }

    /// Cached bearer token, refreshed when missing or about to expire.
    async fn access_token(&self) -> Result<String, PipelineError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                return Ok(token.access_token.clone());
            }
        }
        let fresh = self.request_token().await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn request_token(&self) -> Result<CachedToken, PipelineError> {
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.config.authority_url.trim_end_matches('/'),
            self.config.tenant_id
        );
        let scope = format!("{}/.default", graph_resource(&self.config.graph_url));
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope.as_str()),
            ("grant_type", "client_credentials"),
        ];

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.http.post(&url).form(&form).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body: TokenResponse = resp.json().await.map_err(|e| {
                        PipelineError::Auth(format!("invalid token response: {}", e))
                    })?;
                    debug!(expires_in = body.expires_in, "acquired graph token");
                    return Ok(CachedToken {
                        access_token: body.access_token,
                        expires_at: Instant::now() + Duration::from_secs(body.expires_in),
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    if should_retry(status) && self.backoff.can_retry(attempt) {
                        warn!(attempt, %status, "token request failed, retrying");
                        self.backoff.wait(attempt).await;
                        continue;
                    }
                    return Err(PipelineError::Auth(format!(
                        "token endpoint returned {}: {}",
                        status, body
                    )));
                }
                Err(e) => {
                    if is_retryable_error(&e) && self.backoff.can_retry(attempt) {
                        warn!(attempt, error = %e, "token request failed, retrying");
                        self.backoff.wait(attempt).await;
                        continue;
                    }
                    return Err(PipelineError::Auth(format!("token request failed: {}", e)));
                }
            }
        }
    }

    /// Authenticated GET with retry on 429/5xx/network errors and one
    /// token refresh on 401. Non-retryable statuses are returned as-is.
    async fn get(&self, url: &str) -> Result<reqwest::Response, PipelineError> {
        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            attempt += 1;
            let token = self.access_token().await?;
            match self.http.get(url).bearer_auth(&token).send().await {
                Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED => {
                    if refreshed {
                        return Err(PipelineError::Auth(
                            "graph rejected a freshly issued token".into(),
                        ));
                    }
                    debug!("graph returned 401, refreshing token");
                    self.invalidate_token().await;
                    refreshed = true;
                    attempt -= 1;
                }
                Ok(resp) if should_retry(resp.status()) => {
                    let status = resp.status();
                    if !self.backoff.can_retry(attempt) {
                        return Err(PipelineError::TransientIo(format!(
                            "GET {} returned {} after {} attempts",
                            url, status, attempt
                        )));
                    }
                    let delay = retry_after(&resp).unwrap_or_else(|| self.backoff.delay(attempt));
                    warn!(attempt, %status, "graph request throttled or failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if !(is_retryable_error(&e) && self.backoff.can_retry(attempt)) {
                        return Err(PipelineError::TransientIo(format!("GET {}: {}", url, e)));
                    }
                    warn!(attempt, error = %e, "graph request failed, retrying");
                    self.backoff.wait(attempt).await;
                }
            }
        }
    }

    async fn list_page(&self, url: &str) -> Result<ChildrenPage, PipelineError> {
        let resp = self.get(url).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Listing(format!(
                "listing returned {}: {}",
                status, body
            )));
        }
        resp.json()
            .await
            .map_err(|e| PipelineError::Listing(format!("invalid listing page: {}", e)))
    }

    async fn download(&self, item_id: &str) -> Result<Vec<u8>, PipelineError> {
        let url = format!("{}/items/{}/content", self.drive_url(), item_id);
        let resp = self.get(&url).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(PipelineError::InvalidDocument(format!(
                "item {} no longer exists",
                item_id
            )));
        }
        if !status.is_success() {
            return Err(PipelineError::TransientIo(format!(
                "download of {} returned {}",
                item_id, status
            )));
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| PipelineError::TransientIo(format!("download of {}: {}", item_id, e)))
    }
}

/// `https://graph.microsoft.com/v1.0` → `https://graph.microsoft.com`
fn graph_resource(graph_url: &str) -> &str {
    let trimmed = graph_url.trim_end_matches('/');
    match trimmed.find("://") {
        Some(scheme_end) => match trimmed[scheme_end + 3..].find('/') {
            Some(path_start) => &trimmed[..scheme_end + 3 + path_start],
            None => trimmed,
        },
        None => trimmed,
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs.min(60)))
}

/// Percent-encode a drive path, keeping `/` separators.
fn encode_drive_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for segment in path.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
        if !out.is_empty() {
            out.push('/');
        }
        for byte in segment.bytes() {
            match byte {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                    out.push(byte as char)
                }
                _ => out.push_str(&format!("%{:02X}", byte)),
            }
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════
// Source
// ═══════════════════════════════════════════════════════════════════════

/// A [`DocumentSource`] over one folder of a Graph drive.
pub struct GraphSource {
    client: Arc<GraphClient>,
    folder: String,
    globs: GlobSet,
    label: String,
}

impl GraphSource {
    pub fn new(
        client: Arc<GraphClient>,
        folder: &str,
        include_globs: &[String],
    ) -> anyhow::Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in include_globs {
            builder.add(Glob::new(&pattern.to_lowercase())?);
        }
        Ok(Self {
            client,
            folder: folder.trim_matches('/').to_string(),
            globs: builder.build()?,
            label: format!("graph:{}", folder.trim_matches('/')),
        })
    }

    fn children_url(&self) -> String {
        let base = self.client.drive_url();
        let select = "id,name,lastModifiedDateTime,size,webUrl,file";
        let page_size = self.client.config.page_size;
        if self.folder.is_empty() {
            format!("{}/root/children?$top={}&$select={}", base, page_size, select)
        } else {
            format!(
                "{}/root:/{}:/children?$top={}&$select={}",
                base,
                encode_drive_path(&self.folder),
                page_size,
                select
            )
        }
    }

    fn accepts(&self, item: &DriveItem, since: DateTime<Utc>) -> bool {
        item.file.is_some()
            && item.last_modified_date_time >= since
            && self.globs.is_match(item.name.to_lowercase())
    }
}

#[async_trait]
impl DocumentSource for GraphSource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn list_candidates(&self, since: DateTime<Utc>) -> Result<Listing, PipelineError> {
        let mut listing = Listing::default();
        let mut next = Some(self.children_url());
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            let page = match self.client.list_page(&url).await {
                Ok(page) => page,
                Err(e @ PipelineError::Auth(_)) => return Err(e),
                Err(e) if pages == 0 => {
                    return Err(PipelineError::Listing(format!("{}: {}", self.label, e)))
                }
                Err(e) => {
                    warn!(source = %self.label, page = pages + 1, error = %e, "listing page failed");
                    listing
                        .errors
                        .push(format!("page {} of {}: {}", pages + 1, self.label, e));
                    break;
                }
            };
            pages += 1;
            for item in page.value {
                if self.accepts(&item, since) {
                    listing.candidates.push(RemoteDocumentMeta {
                        external_id: item.id,
                        name: item.name,
                        last_modified: item.last_modified_date_time,
                        size: item.size,
                        web_url: item.web_url,
                    });
                }
            }
            next = page.next_link;
        }

        debug!(
            source = %self.label,
            pages,
            candidates = listing.candidates.len(),
            "listing complete"
        );
        Ok(listing)
    }

    async fn fetch(&self, meta: &RemoteDocumentMeta) -> Result<RemoteDocument, PipelineError> {
        let content = self.client.download(&meta.external_id).await?;
        Ok(RemoteDocument::new(meta.clone(), content))
    }
}
