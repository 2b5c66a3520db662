//! HTTP plumbing shared by the provider adapters.

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{ProviderResult, ProviderUnavailable};

/// Tokens are refreshed this long before the provider expires them.
pub(crate) const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Status and decoded body of a provider response.
#[derive(Debug)]
pub(crate) struct HttpReply {
    pub status: StatusCode,
    pub body: Value,
}

impl HttpReply {
    /// Reads the body as JSON. Non-JSON text is kept as a string value so it
    /// can still be surfaced in errors and metadata.
    pub async fn read(response: Response) -> ProviderResult<Self> {
        let status = response.status();
        let text = response.text().await?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(Self { status, body })
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
    }

    /// Statuses that say nothing definitive about the transaction.
    pub fn is_transient(&self) -> bool {
        self.status.is_server_error()
            || self.status == StatusCode::TOO_MANY_REQUESTS
            || self.status == StatusCode::REQUEST_TIMEOUT
    }

    pub fn unavailable(&self) -> ProviderUnavailable {
        ProviderUnavailable::HttpStatus {
            status: self.status.as_u16(),
            body: truncate(&self.body.to_string()),
        }
    }

    /// String field at a JSON pointer such as `/data/transaction/status`.
    pub fn str_at(&self, pointer: &str) -> Option<&str> {
        self.body.pointer(pointer).and_then(Value::as_str)
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Access token grant returned by a provider token endpoint.
#[derive(Debug, Clone)]
pub(crate) struct TokenGrant {
    pub access_token: String,
    pub expires_in: Duration,
}

impl TokenGrant {
    /// Parses the OAuth-style `{access_token, expires_in}` body.
    pub fn from_reply(reply: &HttpReply) -> ProviderResult<Self> {
        let access_token = reply
            .str_at("/access_token")
            .ok_or_else(|| {
                ProviderUnavailable::MalformedResponse("token response without access_token".into())
            })?
            .to_string();

        // Some sandboxes send expires_in as a string.
        let expires_in = match reply.body.get("expires_in") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
        .unwrap_or(3600);

        Ok(Self {
            access_token,
            expires_in: Duration::from_secs(expires_in),
        })
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Single-slot access token cache.
///
/// The lock is held across a refresh so concurrent callers wait for one
/// token request instead of each issuing their own.
#[derive(Debug, Default)]
pub(crate) struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> ProviderResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = ProviderResult<TokenGrant>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(token) = slot.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let grant = fetch().await?;
        let lifetime = grant.expires_in.saturating_sub(TOKEN_REFRESH_MARGIN);
        let value = grant.access_token.clone();
        *slot = Some(CachedToken {
            value: grant.access_token,
            refresh_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}
