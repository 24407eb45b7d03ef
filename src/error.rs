//! Typed errors for calls to remote services (Azure AD, Graph, OpenAI).
//!
//! Everything above the HTTP clients works with `anyhow`; this type exists so
//! the retry loops can ask whether a failure is worth another attempt.

use reqwest::{Response, StatusCode};

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Non-success HTTP status. `body` holds at most 500 characters.
    #[error("{service} request failed (HTTP {status}): {body}")]
    Status {
        service: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned an unexpected payload: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },

    #[error("{0} environment variable not set")]
    MissingCredential(&'static str),
}

impl RemoteError {
    /// 429, 5xx, and transport failures are retried; other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            RemoteError::Transport { .. } => true,
            RemoteError::Decode { .. } | RemoteError::MissingCredential(_) => false,
        }
    }

    /// HTTP status of the failed call, if one was received.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RemoteError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn transport(service: &'static str, source: reqwest::Error) -> Self {
        RemoteError::Transport { service, source }
    }

    pub fn decode(service: &'static str, message: impl Into<String>) -> Self {
        RemoteError::Decode {
            service,
            message: message.into(),
        }
    }
}

/// Pass successful responses through; turn anything else into
/// [`RemoteError::Status`] with a truncated body.
pub async fn check_status(service: &'static str, resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        service,
        status,
        body: body.chars().take(500).collect(),
    })
}

/// Backoff before retry `attempt` (1-based): 1s, 2s, 4s, ... capped at 32s.
pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}
