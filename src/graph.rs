//! Microsoft Graph REST client.
//!
//! Covers the handful of mailbox and OneDrive endpoints the connectors and the
//! archive step need. Every call goes through [`GraphClient::execute`], which
//! attaches a bearer token and retries 429 / 5xx / transport failures with
//! exponential backoff.
//!
//! Drive paths are addressed with Graph's `root:/{path}:` syntax and are
//! normalized first (`\` becomes `/`, surrounding slashes are trimmed).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::auth::{GraphCredentials, TokenProvider};
use crate::config::GraphConfig;
use crate::error::{backoff_delay, check_status, RemoteError};
use crate::models::{DriveItem, MailAttachment, MailMessage};

const SERVICE: &str = "graph";

/// Fields requested from the mail delta endpoint.
const MESSAGE_SELECT: &str = "id,subject,body,bodyPreview,from,toRecipients,ccRecipients,\
receivedDateTime,lastModifiedDateTime,hasAttachments,internetMessageId,webLink,categories,importance";

/// One full pass over a delta query.
#[derive(Debug)]
pub struct DeltaPage<T> {
    pub items: Vec<T>,
    /// Ids of entries reported with an `@removed` marker.
    pub removed_ids: Vec<String>,
    /// Link to resume from on the next sync.
    pub delta_link: Option<String>,
    /// The stored link had expired and the query started over.
    pub restarted: bool,
}

/// Entries returned by a delta query.
pub trait DeltaEntry {
    fn entry_id(&self) -> &str;
    fn is_removed(&self) -> bool;
}

impl DeltaEntry for DriveItem {
    fn entry_id(&self) -> &str {
        &self.id
    }
    fn is_removed(&self) -> bool {
        self.removed.is_some()
    }
}

impl DeltaEntry for MailMessage {
    fn entry_id(&self) -> &str {
        &self.id
    }
    fn is_removed(&self) -> bool {
        self.removed.is_some()
    }
}

/// A file written to OneDrive by [`GraphClient::upload`].
#[derive(Debug, Clone)]
pub struct UploadedItem {
    pub id: String,
    pub web_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(default, rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(default, rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

pub struct GraphClient {
    http: reqwest::Client,
    base_url: Url,
    user: String,
    page_size: u32,
    max_retries: u32,
    tokens: TokenProvider,
}

impl GraphClient {
    pub fn new(config: &GraphConfig, user: String, credentials: GraphCredentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .with_context(|| format!("Invalid graph.base_url: {}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Invalid graph.base_url: {}", config.base_url);
        }
        let tokens = TokenProvider::new(http.clone(), &config.authority_url, credentials);
        Ok(Self {
            http,
            base_url,
            user,
            page_size: config.page_size,
            max_retries: config.max_retries,
            tokens,
        })
    }

    /// Build a client from `[graph]` plus the `AZURE_*` and `USER_EMAIL`
    /// environment variables.
    pub fn from_config(config: &GraphConfig) -> Result<Self> {
        let credentials = GraphCredentials::from_env()?;
        let user = config
            .user()
            .context("No mailbox configured: set USER_EMAIL or [graph].user")?;
        Self::new(config, user, credentials)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    // ============ Drive ============

    /// Direct children of a drive folder, following `@odata.nextLink`.
    pub async fn list_children(&self, folder: &str) -> Result<Vec<DriveItem>, RemoteError> {
        let url = self.drive_path_url(folder, Some("children"));
        let mut items = Vec::new();
        let mut next = Some(url.to_string());
        while let Some(link) = next {
            let page: Page<DriveItem> = self.get_json(&link, &[]).await?;
            items.extend(page.value);
            next = page.next_link;
        }
        Ok(items)
    }

    /// Drive delta from the root, or from a stored delta link.
    pub async fn drive_delta(
        &self,
        cursor: Option<&str>,
    ) -> Result<DeltaPage<DriveItem>, RemoteError> {
        let initial = self.user_url(&["drive", "root", "delta"]).to_string();
        self.resume_delta(initial, cursor, &[]).await
    }

    pub async fn download_item(&self, item_id: &str) -> Result<Vec<u8>, RemoteError> {
        let url = self.user_url(&["drive", "items", item_id, "content"]);
        self.get_bytes(url).await
    }

    /// Create or replace `{folder}/{filename}`.
    pub async fn upload(
        &self,
        folder: &str,
        filename: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<UploadedItem, RemoteError> {
        let folder = normalize_path(folder);
        let target = if folder.is_empty() {
            filename.to_string()
        } else {
            format!("{}/{}", folder, filename)
        };
        let url = self.drive_path_url(&target, Some("content"));
        let resp = self
            .execute(|http| {
                http.put(url.clone())
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(bytes.clone())
            })
            .await?;
        let item: DriveItem = decode(resp).await?;
        tracing::debug!(path = %target, id = %item.id, "uploaded to onedrive");
        Ok(UploadedItem {
            id: item.id,
            web_url: item.web_url,
            created_at: item.created_date_time,
        })
    }

    pub async fn file_exists(&self, path: &str) -> Result<bool, RemoteError> {
        let url = self.drive_path_url(path, None);
        match self.execute(|http| http.get(url.clone())).await {
            Ok(_) => Ok(true),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Permanently delete a drive item. A missing item counts as deleted.
    pub async fn delete_item(&self, item_id: &str) -> Result<(), RemoteError> {
        let url = self.user_url(&["drive", "items", item_id]);
        match self.execute(|http| http.delete(url.clone())).await {
            Ok(_) => Ok(()),
            Err(e) if e.status() == Some(StatusCode::NOT_FOUND) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ============ Mail ============

    /// Message delta for a mail folder (well-known name such as `inbox`, or
    /// a folder id), or continuation from a stored delta link.
    pub async fn messages_delta(
        &self,
        folder: &str,
        cursor: Option<&str>,
    ) -> Result<DeltaPage<MailMessage>, RemoteError> {
        let prefer = format!("odata.maxpagesize={}", self.page_size);
        let headers = [("Prefer", prefer.as_str())];
        let mut initial = self.user_url(&["mailFolders", folder, "messages", "delta"]);
        initial.query_pairs_mut().append_pair("$select", MESSAGE_SELECT);
        self.resume_delta(initial.to_string(), cursor, &headers).await
    }

    /// Most recent `top` messages across the mailbox.
    pub async fn list_messages(&self, top: u32) -> Result<Vec<MailMessage>, RemoteError> {
        let mut url = self.user_url(&["messages"]);
        url.query_pairs_mut()
            .append_pair("$top", &top.to_string())
            .append_pair("$select", MESSAGE_SELECT);
        let page: Page<MailMessage> = self.get_json(url.as_str(), &[]).await?;
        Ok(page.value)
    }

    /// Attachments of a message. File attachments carry base64 `contentBytes`.
    pub async fn list_attachments(
        &self,
        message_id: &str,
    ) -> Result<Vec<MailAttachment>, RemoteError> {
        let url = self.user_url(&["messages", message_id, "attachments"]);
        let mut out = Vec::new();
        let mut next = Some(url.to_string());
        while let Some(link) = next {
            let page: Page<MailAttachment> = self.get_json(&link, &[]).await?;
            out.extend(page.value);
            next = page.next_link;
        }
        Ok(out)
    }

    // ============ Plumbing ============

    /// Continue from `cursor`, or start at `initial` without one. Graph
    /// answers 410 Gone once a delta link has expired; the query then starts
    /// over from `initial`.
    async fn resume_delta<T>(
        &self,
        initial: String,
        cursor: Option<&str>,
        headers: &[(&str, &str)],
    ) -> Result<DeltaPage<T>, RemoteError>
    where
        T: DeserializeOwned + DeltaEntry,
    {
        let Some(link) = cursor else {
            return self.collect_delta(initial, headers).await;
        };
        match self.collect_delta(link.to_string(), headers).await {
            Err(e) if e.status() == Some(StatusCode::GONE) => {
                tracing::warn!(error = %e, "delta link expired, restarting delta query");
                let mut page = self.collect_delta(initial, headers).await?;
                page.restarted = true;
                Ok(page)
            }
            other => other,
        }
    }

    async fn collect_delta<T>(
        &self,
        start: String,
        headers: &[(&str, &str)],
    ) -> Result<DeltaPage<T>, RemoteError>
    where
        T: DeserializeOwned + DeltaEntry,
    {
        let mut items = Vec::new();
        let mut removed_ids = Vec::new();
        let mut next = Some(start);
        let mut delta_link = None;
        let mut pages = 0usize;

        while let Some(link) = next.take() {
            let page: Page<T> = self.get_json(&link, headers).await?;
            pages += 1;
            for entry in page.value {
                if entry.is_removed() {
                    removed_ids.push(entry.entry_id().to_string());
                } else {
                    items.push(entry);
                }
            }
            if page.delta_link.is_some() {
                delta_link = page.delta_link;
            }
            next = page.next_link;
        }

        tracing::debug!(pages, items = items.len(), removed = removed_ids.len(), "delta collected");
        Ok(DeltaPage {
            items,
            removed_ids,
            delta_link,
            restarted: false,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<T, RemoteError> {
        let resp = self
            .execute(|http| {
                headers
                    .iter()
                    .fold(http.get(url), |req, (name, value)| req.header(*name, *value))
            })
            .await?;
        decode(resp).await
    }

    async fn get_bytes(&self, url: Url) -> Result<Vec<u8>, RemoteError> {
        let resp = self.execute(|http| http.get(url.clone())).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RemoteError::transport(SERVICE, e))?;
        Ok(bytes.to_vec())
    }

    /// Send a request with a bearer token, retrying retryable failures. A 401
    /// drops the cached token and is retried once.
    async fn execute<F>(&self, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut last_err = None;
        let mut refreshed = false;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let token = self.tokens.token().await?;
            let err = match build(&self.http).bearer_auth(&token).send().await {
                Ok(resp) => match check_status(SERVICE, resp).await {
                    Ok(resp) => return Ok(resp),
                    Err(e) => e,
                },
                Err(e) => RemoteError::transport(SERVICE, e),
            };

            if err.status() == Some(StatusCode::UNAUTHORIZED) && !refreshed {
                refreshed = true;
                self.tokens.invalidate().await;
            } else if !err.is_retryable() {
                return Err(err);
            }
            tracing::warn!(attempt, error = %err, "graph request failed");
            last_err = Some(err);
        }

        Err(last_err.unwrap_or_else(|| RemoteError::decode(SERVICE, "no attempt was made")))
    }

    fn user_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push("users").push(&self.user).extend(segments);
        }
        url
    }

    /// `.../drive/root:/{path}:[/{suffix}]`, or `.../drive/root[/{suffix}]`
    /// for the drive root.
    fn drive_path_url(&self, item_path: &str, suffix: Option<&str>) -> Url {
        let normalized = normalize_path(item_path);
        let mut segments: Vec<String> = vec!["drive".to_string()];
        if normalized.is_empty() {
            segments.push("root".to_string());
        } else {
            segments.push("root:".to_string());
            let parts: Vec<&str> = normalized.split('/').collect();
            let last = parts.len() - 1;
            for (i, part) in parts.iter().enumerate() {
                if i == last {
                    segments.push(format!("{}:", part));
                } else {
                    segments.push(part.to_string());
                }
            }
        }
        if let Some(s) = suffix {
            segments.push(s.to_string());
        }
        let refs: Vec<&str> = segments.iter().map(String::as_str).collect();
        self.user_url(&refs)
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, RemoteError> {
    resp.json::<T>()
        .await
        .map_err(|e| RemoteError::decode(SERVICE, e.to_string()))
}

/// `\` → `/`, surrounding slashes and empty segments removed.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
