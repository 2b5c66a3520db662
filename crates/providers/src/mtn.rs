//! MTN Mobile Money adapter (collection and disbursement products).

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

/// API user credentials for one MTN product.
#[derive(Debug, Clone)]
pub struct MtnProductCredentials {
    pub subscription_key: String,
    pub api_user: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct MtnMomoConfig {
    pub base_url: String,
    /// `sandbox` or the production market name, sent as `X-Target-Environment`.
    pub target_environment: String,
    pub collection: MtnProductCredentials,
    pub disbursement: MtnProductCredentials,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Product {
    Collection,
    Disbursement,
}

impl Product {
    fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Payment => Product::Collection,
            RecordKind::Payout => Product::Disbursement,
        }
    }

    fn path(self) -> &'static str {
        match self {
            Product::Collection => "collection",
            Product::Disbursement => "disbursement",
        }
    }

    /// Resource holding the transactions of this product.
    fn resource(self) -> &'static str {
        match self {
            Product::Collection => "requesttopay",
            Product::Disbursement => "transfer",
        }
    }
}

pub struct MtnMomoAdapter {
    config: MtnMomoConfig,
    client: Client,
    collection_token: TokenCache,
    disbursement_token: TokenCache,
}

impl MtnMomoAdapter {
    pub fn new(config: MtnMomoConfig) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderUnavailable::Network(e.to_string()))?;

        Ok(Self {
            config,
            client,
            collection_token: TokenCache::new(),
            disbursement_token: TokenCache::new(),
        })
    }

    fn credentials(&self, product: Product) -> &MtnProductCredentials {
        match product {
            Product::Collection => &self.config.collection,
            Product::Disbursement => &self.config.disbursement,
        }
    }

    fn tokens(&self, product: Product) -> &TokenCache {
        match product {
            Product::Collection => &self.collection_token,
            Product::Disbursement => &self.disbursement_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn fetch_token(&self, product: Product) -> ProviderResult<TokenGrant> {
        let credentials = self.credentials(product);
        let response = self
            .client
            .post(self.url(&format!("{}/token/", product.path())))
            .basic_auth(&credentials.api_user, Some(&credentials.api_key))
            .header("Ocp-Apim-Subscription-Key", &credentials.subscription_key)
            .send()
            .await?;
        let reply = HttpReply::read(response).await?;

        if reply.is_auth_failure() {
            return Err(ProviderUnavailable::Auth(format!(
                "{} token request rejected with HTTP {}",
                product.path(),
                reply.status.as_u16()
            )));
        }
        if !reply.status.is_success() {
            return Err(reply.unavailable());
        }
        TokenGrant::from_reply(&reply)
    }

    async fn token(&self, product: Product) -> ProviderResult<String> {
        self.tokens(product)
            .get_or_refresh(|| self.fetch_token(product))
            .await
    }

    /// Sends an authenticated request, refreshing the token once on 401/403.
    async fn send<F>(&self, product: Product, build: F) -> ProviderResult<HttpReply>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.token(product).await?;
        let reply = HttpReply::read(self.decorate(product, build(&token)).send().await?).await?;
        if !reply.is_auth_failure() {
            return Ok(reply);
        }

        tracing::debug!(product = product.path(), "MTN token rejected, refreshing");
        self.tokens(product).invalidate().await;
        let token = self.token(product).await?;
        let reply = HttpReply::read(self.decorate(product, build(&token)).send().await?).await?;
        if reply.is_auth_failure() {
            return Err(ProviderUnavailable::Auth(format!(
                "{} request rejected after token refresh",
                product.path()
            )));
        }
        Ok(reply)
    }

    fn decorate(&self, product: Product, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("X-Target-Environment", &self.config.target_environment)
            .header(
                "Ocp-Apim-Subscription-Key",
                &self.credentials(product).subscription_key,
            )
    }

    async fn check(&self, product: Product, reference: &str) -> ProviderResult<(String, Value)> {
        let url = self.url(&format!(
            "{}/v1_0/{}/{}",
            product.path(),
            product.resource(),
            reference
        ));
        let reply = self
            .send(product, |token| self.client.get(&url).bearer_auth(token))
            .await?;

        if reply.status == StatusCode::NOT_FOUND {
            return Ok((NATIVE_NOT_FOUND.to_string(), reply.body));
        }
        if !reply.status.is_success() {
            return Err(reply.unavailable());
        }

        let native = reply
            .str_at("/status")
            .ok_or_else(|| ProviderUnavailable::MalformedResponse("status field missing".into()))?
            .to_string();
        Ok((native, reply.body))
    }
}

/// MTN reports `reason` either as a bare code or as `{code, message}`.
fn reason_code(body: &Value) -> Option<String> {
    match body.get("reason")? {
        Value::String(code) => Some(code.clone()),
        Value::Object(reason) => reason.get("code").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

#[async_trait]
impl ProviderAdapter for MtnMomoAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::MtnMomo
    }

    /// MTN requires a UUID v4 `X-Reference-Id`.
    fn new_reference(&self) -> String {
        Uuid::new_v4().to_string()
    }

    #[tracing::instrument(skip(self, request), fields(record_id = %request.record_id, kind = %request.kind))]
    async fn initiate(&self, request: &InitiateRequest) -> ProviderResult<InitiateOutcome> {
        let product = Product::for_kind(request.kind);
        let reference = request.reference.clone();
        let party = json!({ "partyIdType": "MSISDN", "partyId": request.phone });
        let note = request.note.clone().unwrap_or_default();

        let mut body = json!({
            "amount": request.amount.to_string(),
            "currency": request.currency,
            "externalId": request.record_id.to_string(),
            "payerMessage": note,
            "payeeNote": note,
        });
        let party_field = match product {
            Product::Collection => "payer",
            Product::Disbursement => "payee",
        };
        body[party_field] = party;

        let url = self.url(&format!("{}/v1_0/{}", product.path(), product.resource()));
        let reply = self
            .send(product, |token| {
                self.client
                    .post(&url)
                    .bearer_auth(token)
                    .header("X-Reference-Id", &reference)
                    .json(&body)
            })
            .await?;

        // 409 means a transfer already exists under this X-Reference-Id.
        if reply.status.is_success() || reply.status == StatusCode::CONFLICT {
            return Ok(InitiateOutcome::Accepted {
                reference,
                raw: json!({ "httpStatus": reply.status.as_u16(), "body": reply.body }),
            });
        }
        if reply.is_transient() {
            return Err(reply.unavailable());
        }

        let reason_code = reply
            .str_at("/code")
            .map(String::from)
            .unwrap_or_else(|| format!("HTTP_{}", reply.status.as_u16()));
        Ok(InitiateOutcome::Rejected {
            reason_code,
            raw: reply.body,
        })
    }

    async fn check_payment_status(&self, reference: &str) -> ProviderResult<PaymentCheck> {
        let (native_status, raw) = self.check(Product::Collection, reference).await?;
        Ok(PaymentCheck { native_status, raw })
    }

    async fn check_payout_status(&self, reference: &str) -> ProviderResult<PayoutCheck> {
        let (native_status, raw) = self.check(Product::Disbursement, reference).await?;
        Ok(PayoutCheck {
            native_status,
            reason_code: reason_code(&raw),
            raw,
        })
    }
}
