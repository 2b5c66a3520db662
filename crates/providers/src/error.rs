use thiserror::Error;

/// A provider call that could not produce a definitive answer.
///
/// Never mapped to a canonical status. The caller leaves the record as it is
/// and asks again on a later pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderUnavailable {
    #[error("provider call timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("provider authentication failed: {0}")]
    Auth(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl ProviderUnavailable {
    /// Short label used in metrics and log fields.
    pub fn reason(&self) -> &'static str {
        match self {
            ProviderUnavailable::Timeout => "timeout",
            ProviderUnavailable::Network(_) => "network",
            ProviderUnavailable::HttpStatus { .. } => "http_status",
            ProviderUnavailable::Auth(_) => "auth",
            ProviderUnavailable::MalformedResponse(_) => "malformed_response",
        }
    }
}

impl From<reqwest::Error> for ProviderUnavailable {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderUnavailable::Timeout
        } else if err.is_decode() {
            ProviderUnavailable::MalformedResponse(err.to_string())
        } else {
            ProviderUnavailable::Network(err.to_string())
        }
    }
}

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderUnavailable>;
