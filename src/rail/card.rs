//! Card rail: hosted-checkout processor integration.
//!
//! The processor is the source of truth for card settlements and reports
//! them through signed webhooks. The local ledger is populated by the
//! webhook handler, and every "did this session pay?" question is answered
//! from the ledger - never by calling the processor on the read path.
//!
//! Webhook signatures follow the `t=<unix>,v1=<hex>` scheme: HMAC-SHA256
//! over `<t>.<raw body>` with the endpoint secret, compared in constant
//! time, with a bounded timestamp tolerance against replay.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use url::Url;

use crate::catalog::{Catalog, Rail, ResourceId};
use crate::coupon::CouponCode;
use crate::error::{GatewayError, NotFoundKind};
use crate::ledger::{
    CouponStore, Ledger, PayerRef, PaymentRecord, PaymentStore, SettlementSignature,
};
use crate::money::{AssetRef, Money};
use crate::rail::{PaymentProof, ProofVerifier, Settlement, VerifyExpectation};
use crate::subscription::SubscriptionService;
use crate::timestamp::UnixTimestamp;

type HmacSha256 = Hmac<Sha256>;

/// Default replay window for webhook timestamps.
pub const SIGNATURE_TOLERANCE_SECONDS: u64 = 300;

/// Parses a `t=...,v1=...,v1=...` signature header.
fn parse_signature_header(header: &str) -> Result<(u64, Vec<Vec<u8>>), GatewayError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<u64>().ok(),
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }
    match (timestamp, signatures.is_empty()) {
        (Some(timestamp), false) => Ok((timestamp, signatures)),
        _ => Err(GatewayError::WebhookSignature),
    }
}

/// Verifies a webhook payload against the endpoint secret.
pub fn verify_webhook_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: UnixTimestamp,
    tolerance_seconds: u64,
) -> Result<(), GatewayError> {
    let (timestamp, signatures) = parse_signature_header(header)?;
    let age = now.seconds_since_epoch().abs_diff(timestamp);
    if age > tolerance_seconds {
        return Err(GatewayError::WebhookSignature);
    }
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::WebhookSignature)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = mac.finalize().into_bytes();
    let mut matched = false;
    for candidate in &signatures {
        matched |= candidate.len() == expected.len()
            && bool::from(candidate.as_slice().ct_eq(expected.as_slice()));
    }
    if matched {
        Ok(())
    } else {
        Err(GatewayError::WebhookSignature)
    }
}

/// A parsed processor event.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, GatewayError> {
        serde_json::from_slice(payload)
            .map_err(|e| GatewayError::invalid_field("event", e.to_string()))
    }
}

fn str_field<'a>(object: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    object.get(key).and_then(|v| v.as_str())
}

/// Card rail verifier and webhook processor.
pub struct CardRail {
    ledger: Arc<dyn Ledger>,
    subscriptions: Arc<SubscriptionService>,
    catalog: Arc<Catalog>,
    /// Sessions created by this gateway that have not settled yet.
    open_sessions: DashMap<String, UnixTimestamp>,
}

impl CardRail {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        subscriptions: Arc<SubscriptionService>,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            catalog,
            open_sessions: DashMap::new(),
        }
    }

    /// Remembers a checkout session created by this gateway, so a
    /// not-yet-settled session answers `SessionPending` instead of
    /// `SessionNotFound`.
    pub fn register_session(&self, session_id: &str, now: UnixTimestamp) {
        self.open_sessions.insert(session_id.to_string(), now);
    }

    /// Answers "did this session pay?" from the local ledger.
    pub async fn verify_session(&self, session_id: &str) -> Result<PaymentRecord, GatewayError> {
        let signature = SettlementSignature::for_card_session(session_id);
        if let Some(record) = self
            .ledger
            .get_payment(&signature)
            .await
            .map_err(GatewayError::from)?
        {
            return Ok(record);
        }
        if self.open_sessions.contains_key(session_id) {
            return Err(GatewayError::SessionPending);
        }
        Err(GatewayError::not_found(NotFoundKind::Session, session_id))
    }

    /// Applies one verified webhook event to local state.
    ///
    /// Delivery is at-least-once; every branch tolerates replays.
    #[tracing::instrument(skip_all, fields(event = %event.event_type))]
    pub async fn handle_event(
        &self,
        event: &WebhookEvent,
        now: UnixTimestamp,
    ) -> Result<(), GatewayError> {
        let object = &event.data.object;
        match event.event_type.as_str() {
            "checkout.session.completed" => self.on_session_completed(object, now).await,
            "invoice.paid" => {
                if let Some(subscription_id) = str_field(object, "subscription") {
                    match self.subscriptions.renew_card(subscription_id, now).await {
                        Ok(_) => {}
                        Err(GatewayError::NotFound { .. }) => {
                            tracing::debug!(subscription_id, "renewal for unknown subscription");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            "invoice.payment_failed" => {
                if let Some(subscription_id) = str_field(object, "subscription") {
                    match self.subscriptions.card_payment_failed(subscription_id).await {
                        Ok(_) | Err(GatewayError::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            "customer.subscription.deleted" => {
                if let Some(subscription_id) = str_field(object, "id") {
                    match self.subscriptions.card_canceled(subscription_id, now).await {
                        Ok(_) | Err(GatewayError::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            }
            other => {
                tracing::debug!(event = other, "ignoring webhook event");
                Ok(())
            }
        }
    }

    async fn on_session_completed(
        &self,
        object: &serde_json::Value,
        now: UnixTimestamp,
    ) -> Result<(), GatewayError> {
        let session_id = str_field(object, "id")
            .ok_or_else(|| GatewayError::invalid_field("id", "missing session id"))?;
        let metadata = object.get("metadata").cloned().unwrap_or_default();
        let resource_id = metadata
            .get("resource_id")
            .or_else(|| metadata.get("cart_id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                GatewayError::invalid_field("metadata", "session carries no resource id")
            })?
            .to_string();
        let customer = str_field(object, "customer").unwrap_or("anonymous").to_string();
        let amount_total = object
            .get("amount_total")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let currency = str_field(object, "currency").unwrap_or("usd").to_uppercase();

        let record = PaymentRecord {
            signature: SettlementSignature::for_card_session(session_id),
            resource_id: ResourceId(resource_id.clone()),
            rail: Rail::Card,
            payer: PayerRef::CustomerRef(customer.clone()),
            amount: Money::new(AssetRef::new(currency, 2), amount_total),
            created_at: Utc::now(),
            metadata: metadata.clone(),
        };
        match self.ledger.insert_payment(record).await {
            Ok(()) => {}
            Err(crate::ledger::LedgerError::SignatureReused(_)) => {
                // Redelivered webhook; everything below already happened.
                tracing::debug!(session_id, "duplicate session webhook");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        self.open_sessions.remove(session_id);

        if let Some(code) = metadata.get("coupon_code").and_then(|v| v.as_str()) {
            if let Err(e) = self
                .ledger
                .increment_coupon_usage(&CouponCode::from(code))
                .await
            {
                tracing::warn!(code, error = %e, "coupon usage increment failed");
            }
        }

        let is_subscription = str_field(object, "mode") == Some("subscription");
        if is_subscription
            && let Some(resource) = self.catalog.get(&ResourceId(resource_id))
            && resource.is_subscription()
        {
            let processor_subscription_id = str_field(object, "subscription")
                .unwrap_or(session_id)
                .to_string();
            let trial_end = object
                .get("trial_end")
                .and_then(|v| v.as_u64())
                .map(UnixTimestamp);
            if let Err(e) = self
                .subscriptions
                .create_card(&customer, &resource, &processor_subscription_id, trial_end, now)
                .await
            {
                tracing::warn!(error = %e, "card subscription creation failed");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProofVerifier for CardRail {
    async fn verify(
        &self,
        proof: &PaymentProof,
        expectation: &VerifyExpectation,
    ) -> Result<Settlement, GatewayError> {
        let session_id = proof.payload.metadata.session_id.as_deref().ok_or_else(|| {
            GatewayError::InvalidPaymentProof("card proof carries no session id".to_string())
        })?;
        let record = self.verify_session(session_id).await?;
        if record.resource_id != expectation.subject {
            return Err(GatewayError::InvalidPaymentProof(
                "session paid for a different resource".to_string(),
            ));
        }
        Ok(Settlement {
            signature: record.signature,
            payer: record.payer,
            amount_atomic: record.amount.atomic,
        })
    }
}

// ---------------------------------------------------------------------------
// Processor REST client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub base_url: Url,
    pub secret_key: String,
    pub webhook_secret: String,
    pub success_url: String,
    pub cancel_url: String,
}

/// One checkout line: either a configured processor price or an ad-hoc
/// amount (cart items priced by the gateway).
#[derive(Debug, Clone, Serialize)]
pub struct SessionLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_amount: Option<i64>,
    pub quantity: u32,
}

#[derive(Debug, Serialize)]
struct CreateSessionBody<'a> {
    mode: &'a str,
    line_items: &'a [SessionLine],
    metadata: &'a serde_json::Value,
    success_url: &'a str,
    cancel_url: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorSession {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub customer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortalSession {
    pub url: String,
}

/// Minimal JSON client for the processor API.
pub struct CardProcessorClient {
    http: reqwest::Client,
    config: ProcessorConfig,
}

impl CardProcessorClient {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn webhook_secret(&self) -> &str {
        &self.config.webhook_secret
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| GatewayError::Internal(format!("bad processor url: {e}")))
    }

    async fn check<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::CardProcessor(format!("{status}: {body}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::CardProcessor(e.to_string()))
    }

    /// Creates a hosted checkout session. The caller's idempotency key is
    /// forwarded so processor-side retries collapse too.
    pub async fn create_checkout_session(
        &self,
        mode: &str,
        lines: &[SessionLine],
        metadata: &serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> Result<ProcessorSession, GatewayError> {
        let body = CreateSessionBody {
            mode,
            line_items: lines,
            metadata,
            success_url: &self.config.success_url,
            cancel_url: &self.config.cancel_url,
        };
        let mut request = self
            .http
            .post(self.endpoint("v1/checkout/sessions")?)
            .bearer_auth(&self.config.secret_key)
            .json(&body);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::CardProcessor(e.to_string()))?;
        Self::check(response).await
    }

    pub async fn create_portal_session(
        &self,
        customer_ref: &str,
    ) -> Result<PortalSession, GatewayError> {
        let response = self
            .http
            .post(self.endpoint("v1/billing_portal/sessions")?)
            .bearer_auth(&self.config.secret_key)
            .json(&serde_json::json!({ "customer": customer_ref }))
            .send()
            .await
            .map_err(|e| GatewayError::CardProcessor(e.to_string()))?;
        Self::check(response).await
    }

    /// Moves a processor-side subscription to a new price. Must complete
    /// before the local product change is recorded.
    pub async fn update_subscription_price(
        &self,
        processor_subscription_id: &str,
        price_id: &str,
    ) -> Result<(), GatewayError> {
        let response = self
            .http
            .post(self.endpoint(&format!(
                "v1/subscriptions/{processor_subscription_id}"
            ))?)
            .bearer_auth(&self.config.secret_key)
            .json(&serde_json::json!({ "price": price_id }))
            .send()
            .await
            .map_err(|e| GatewayError::CardProcessor(e.to_string()))?;
        let _: serde_json::Value = Self::check(response).await?;
        Ok(())
    }
}
