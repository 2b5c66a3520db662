//! Application configuration loaded from environment variables.

use std::collections::HashMap;
use std::time::Duration;

use domain::RetryPolicy;
use providers::{AirtelMoneyConfig, MtnMomoConfig, MtnProductCredentials};
use reconciliation::ReconcileConfig;

const DEFAULT_MTN_BASE_URL: &str = "https://sandbox.momodeveloper.mtn.com";
const DEFAULT_AIRTEL_BASE_URL: &str = "https://openapiuat.airtel.africa";

/// Log line format selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `json` for JSON log lines, anything else for text
/// - `DATABASE_URL`: PostgreSQL store; the in-memory store is used when unset
/// - `STALE_AFTER_SECS`, `SWEEP_BATCH_LIMIT`, `SWEEP_CONCURRENCY`,
///   `PROVIDER_TIMEOUT_MS`, `MAX_PAYOUT_RETRIES`, `MIN_RETRY_DELAY_SECS`:
///   reconciliation engine settings
/// - `RECONCILE_TRIGGER_TOKEN`: bearer token required by the sweep trigger
/// - `API_TOKENS`: comma-separated `token:user_id` pairs for user endpoints
/// - `MTN_*` / `AIRTEL_*`: provider credentials
///
/// Unparseable numbers fall back to their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub reconcile: ReconcileConfig,
    pub trigger_token: Option<String>,
    /// Bearer token to user id.
    pub api_tokens: HashMap<String, String>,
    pub mtn: Option<MtnMomoConfig>,
    pub airtel: Option<AirtelMoneyConfig>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = ReconcileConfig::default();
        let default_policy = RetryPolicy::default();

        let provider_timeout = var("PROVIDER_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.provider_timeout);

        let reconcile = ReconcileConfig {
            stale_after: var("STALE_AFTER_SECS")
                .and_then(|v| v.parse().ok())
                .map(chrono::Duration::seconds)
                .unwrap_or(defaults.stale_after),
            batch_limit: var("SWEEP_BATCH_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_limit),
            concurrency: var("SWEEP_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.concurrency),
            provider_timeout,
            retry_policy: RetryPolicy::new(
                var("MAX_PAYOUT_RETRIES")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default_policy.max_retries),
                var("MIN_RETRY_DELAY_SECS")
                    .and_then(|v| v.parse().ok())
                    .map(chrono::Duration::seconds)
                    .unwrap_or(default_policy.min_delay),
            ),
        };

        Self {
            host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: var("PORT").and_then(|p| p.parse().ok()).unwrap_or(3000),
            log_level: var("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            log_format: match var("LOG_FORMAT") {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: var("DATABASE_URL"),
            reconcile,
            trigger_token: var("RECONCILE_TRIGGER_TOKEN"),
            api_tokens: var("API_TOKENS")
                .map(|v| parse_api_tokens(&v))
                .unwrap_or_default(),
            mtn: mtn_config(&var, provider_timeout),
            airtel: airtel_config(&var, provider_timeout),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Parses `token:user_id` pairs; malformed entries are skipped.
fn parse_api_tokens(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (token, user) = pair.split_once(':')?;
            let (token, user) = (token.trim(), user.trim());
            (!token.is_empty() && !user.is_empty()).then(|| (token.to_string(), user.to_string()))
        })
        .collect()
}

fn mtn_product(var: &impl Fn(&str) -> Option<String>, product: &str) -> Option<MtnProductCredentials> {
    Some(MtnProductCredentials {
        subscription_key: var(format!("MTN_{product}_SUBSCRIPTION_KEY").as_str())?,
        api_user: var(format!("MTN_{product}_API_USER").as_str())?,
        api_key: var(format!("MTN_{product}_API_KEY").as_str())?,
    })
}

/// MTN is configured only when both products have credentials.
fn mtn_config(var: &impl Fn(&str) -> Option<String>, timeout: Duration) -> Option<MtnMomoConfig> {
    Some(MtnMomoConfig {
        collection: mtn_product(var, "COLLECTION")?,
        disbursement: mtn_product(var, "DISBURSEMENT")?,
        base_url: var("MTN_BASE_URL").unwrap_or_else(|| DEFAULT_MTN_BASE_URL.to_string()),
        target_environment: var("MTN_TARGET_ENVIRONMENT").unwrap_or_else(|| "sandbox".to_string()),
        timeout,
    })
}

fn airtel_config(var: &impl Fn(&str) -> Option<String>, timeout: Duration) -> Option<AirtelMoneyConfig> {
    Some(AirtelMoneyConfig {
        client_id: var("AIRTEL_CLIENT_ID")?,
        client_secret: var("AIRTEL_CLIENT_SECRET")?,
        base_url: var("AIRTEL_BASE_URL").unwrap_or_else(|| DEFAULT_AIRTEL_BASE_URL.to_string()),
        country: var("AIRTEL_COUNTRY").unwrap_or_else(|| "UG".to_string()),
        currency: var("AIRTEL_CURRENCY").unwrap_or_else(|| "UGX".to_string()),
        disbursement_pin: var("AIRTEL_DISBURSEMENT_PIN").unwrap_or_default(),
        timeout,
    })
}
