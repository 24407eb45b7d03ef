//! Azure AD client-credentials flow for Microsoft Graph.
//!
//! Reads `AZURE_TENANT_ID`, `AZURE_CLIENT_ID`, and `AZURE_CLIENT_SECRET` from
//! the environment and caches the access token until five minutes before it
//! expires.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{check_status, RemoteError};

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const EXPIRY_BUFFER: Duration = Duration::from_secs(300);

/// App registration used for the client-credentials grant.
#[derive(Clone)]
pub struct GraphCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for GraphCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

impl GraphCredentials {
    pub fn from_env() -> Result<Self, RemoteError> {
        Ok(Self {
            tenant_id: required_env("AZURE_TENANT_ID")?,
            client_id: required_env("AZURE_CLIENT_ID")?,
            client_secret: required_env("AZURE_CLIENT_SECRET")?,
        })
    }

    /// True when all three variables are set.
    pub fn present() -> bool {
        Self::from_env().is_ok()
    }
}

fn required_env(name: &'static str) -> Result<String, RemoteError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(RemoteError::MissingCredential(name))
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Fetches and caches Graph access tokens.
pub struct TokenProvider {
    http: reqwest::Client,
    token_url: String,
    credentials: GraphCredentials,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(http: reqwest::Client, authority_url: &str, credentials: GraphCredentials) -> Self {
        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            authority_url.trim_end_matches('/'),
            credentials.tenant_id
        );
        Self {
            http,
            token_url,
            credentials,
            cached: Mutex::new(None),
        }
    }

    /// A valid bearer token, fetching a new one when the cached token is
    /// missing or inside the expiry buffer.
    pub async fn token(&self) -> Result<String, RemoteError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    /// Drop the cached token so the next call fetches a new one.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn fetch(&self) -> Result<CachedToken, RemoteError> {
        tracing::debug!(url = %self.token_url, "requesting graph access token");
        let form = [
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("scope", GRAPH_SCOPE),
            ("grant_type", "client_credentials"),
        ];
        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RemoteError::transport("azure-ad", e))?;

        let status = resp.status();
        if status.is_client_error() {
            // Azure AD reports the reason in error_description. Proxies and
            // gateways may answer with something that is not JSON at all.
            let raw = resp.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<TokenResponse>(&raw)
                .ok()
                .and_then(|body| body.error_description.or(body.error))
                .unwrap_or_else(|| {
                    let snippet: String = raw.trim().chars().take(500).collect();
                    if snippet.is_empty() {
                        "token request rejected".to_string()
                    } else {
                        snippet
                    }
                });
            return Err(RemoteError::Status {
                service: "azure-ad",
                status,
                body: reason,
            });
        }
        let resp = check_status("azure-ad", resp).await?;
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::decode("azure-ad", e.to_string()))?;

        let value = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RemoteError::decode("azure-ad", "response has no access_token"))?;
        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(3600));
        Ok(CachedToken {
            value,
            expires_at: Instant::now() + lifetime.saturating_sub(EXPIRY_BUFFER),
        })
    }
}
