//! Airtel Money adapter (merchant collections and standard disbursements).

use std::time::Duration;

use async_trait::async_trait;
use common::{ProviderId, RecordKind};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::adapter::{
    InitiateOutcome, InitiateRequest, NATIVE_NOT_FOUND, PaymentCheck, PayoutCheck,
    ProviderAdapter,
};
use crate::transport::{HttpReply, TokenCache, TokenGrant};
use crate::{ProviderResult, ProviderUnavailable};

#[derive(Debug, Clone)]
pub struct AirtelMoneyConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// ISO country code sent as `X-Country`.
    pub country: String,
    /// Wallet currency sent as `X-Currency`.
    pub currency: String,
    /// Encrypted disbursement PIN.
    pub disbursement_pin: String,
    pub timeout: Duration,
}

pub struct AirtelMoneyAdapter {
    config: AirtelMoneyConfig,
    client: Client,
    token: TokenCache,
}

impl AirtelMoneyAdapter {
    pub fn new(config: AirtelMoneyConfig) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderUnavailable::Network(e.to_string()))?;

        Ok(Self {
            config,
            client,
            token: TokenCache::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn fetch_token(&self) -> ProviderResult<TokenGrant> {
        let response = self
            .client
            .post(self.url("auth/oauth2/token"))
            .json(&json!({
                "client_id": self.config.client_id,
                "client_secret": self.config.client_secret,
                "grant_type": "client_credentials",
            }))
            .send()
            .await?;
        let reply = HttpReply::read(response).await?;

        if reply.is_auth_failure() {
            return Err(ProviderUnavailable::Auth(format!(
                "token request rejected with HTTP {}",
                reply.status.as_u16()
            )));
        }
        if !reply.status.is_success() {
            return Err(reply.unavailable());
        }
        TokenGrant::from_reply(&reply)
    }

    async fn access_token(&self) -> ProviderResult<String> {
        self.token.get_or_refresh(|| self.fetch_token()).await
    }

    /// Sends an authenticated request, refreshing the token once on 401/403.
    async fn send<F>(&self, build: F) -> ProviderResult<HttpReply>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.access_token().await?;
        let reply = HttpReply::read(self.decorate(build(&token)).send().await?).await?;
        if !reply.is_auth_failure() {
            return Ok(reply);
        }

        tracing::debug!("Airtel token rejected, refreshing");
        self.token.invalidate().await;
        let token = self.access_token().await?;
        let reply = HttpReply::read(self.decorate(build(&token)).send().await?).await?;
        if reply.is_auth_failure() {
            return Err(ProviderUnavailable::Auth(
                "request rejected after token refresh".into(),
            ));
        }
        Ok(reply)
    }

    fn decorate(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("X-Country", &self.config.country)
            .header("X-Currency", &self.config.currency)
    }

    async fn check(&self, path: &str, reference: &str) -> ProviderResult<HttpReply> {
        let url = self.url(&format!("{path}/{reference}"));
        let reply = self
            .send(|token| self.client.get(&url).bearer_auth(token))
            .await?;

        if reply.status != StatusCode::NOT_FOUND && !reply.status.is_success() {
            return Err(reply.unavailable());
        }
        Ok(reply)
    }

    fn native_status(reply: &HttpReply) -> ProviderResult<String> {
        if reply.status == StatusCode::NOT_FOUND {
            return Ok(NATIVE_NOT_FOUND.to_string());
        }
        reply
            .str_at("/data/transaction/status")
            .map(String::from)
            .ok_or_else(|| {
                ProviderUnavailable::MalformedResponse("transaction status missing".into())
            })
    }
}

#[async_trait]
impl ProviderAdapter for AirtelMoneyAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::AirtelMoney
    }

    // Airtel transactions are keyed by a merchant-minted id.
    fn new_reference(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    #[tracing::instrument(skip(self, request), fields(record_id = %request.record_id, kind = %request.kind))]
    async fn initiate(&self, request: &InitiateRequest) -> ProviderResult<InitiateOutcome> {
        let reference = request.reference.clone();

        let (path, body) = match request.kind {
            RecordKind::Payment => (
                "merchant/v1/payments/",
                json!({
                    "reference": request.note.clone().unwrap_or_else(|| request.record_id.to_string()),
                    "subscriber": {
                        "country": self.config.country,
                        "currency": request.currency,
                        "msisdn": request.phone,
                    },
                    "transaction": {
                        "amount": request.amount,
                        "country": self.config.country,
                        "currency": request.currency,
                        "id": reference,
                    },
                }),
            ),
            RecordKind::Payout => (
                "standard/v1/disbursements/",
                json!({
                    "payee": { "msisdn": request.phone, "wallet_type": "NORMAL" },
                    "reference": request.note.clone().unwrap_or_else(|| request.record_id.to_string()),
                    "pin": self.config.disbursement_pin,
                    "transaction": {
                        "amount": request.amount,
                        "id": reference,
                        "type": "B2C",
                    },
                }),
            ),
        };

        let url = self.url(path);
        let reply = self
            .send(|token| self.client.post(&url).bearer_auth(token).json(&body))
            .await?;

        if reply.is_transient() {
            return Err(reply.unavailable());
        }

        let accepted = reply.status.is_success()
            && reply.body.pointer("/status/success").and_then(Value::as_bool) == Some(true);
        if accepted {
            return Ok(InitiateOutcome::Accepted {
                reference,
                raw: reply.body,
            });
        }

        let reason_code = reply
            .str_at("/status/response_code")
            .or_else(|| reply.str_at("/status/code"))
            .map(String::from)
            .unwrap_or_else(|| format!("HTTP_{}", reply.status.as_u16()));
        Ok(InitiateOutcome::Rejected {
            reason_code,
            raw: reply.body,
        })
    }

    async fn check_payment_status(&self, reference: &str) -> ProviderResult<PaymentCheck> {
        let reply = self.check("standard/v1/payments", reference).await?;
        Ok(PaymentCheck {
            native_status: Self::native_status(&reply)?,
            raw: reply.body,
        })
    }

    async fn check_payout_status(&self, reference: &str) -> ProviderResult<PayoutCheck> {
        let reply = self.check("standard/v1/disbursements", reference).await?;
        Ok(PayoutCheck {
            native_status: Self::native_status(&reply)?,
            reason_code: reply.str_at("/status/response_code").map(String::from),
            raw: reply.body,
        })
    }
}
