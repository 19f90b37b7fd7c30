//! Durable state: payment records, refund requests, subscriptions, coupon
//! counters.
//!
//! Store implementations come in two flavors with identical semantics: an
//! in-memory backend for tests and single-node deployments
//! ([`memory::MemoryLedger`]) and a Postgres backend ([`sql::SqlLedger`]).
//! Concurrency control is embedded in the contracts themselves - the unique
//! settlement signature on payments, the compare-and-swap status transition
//! on refunds, the capped increment on coupon usage - so the authorization
//! pipeline behaves identically over either backend.

pub mod memory;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use uuid::Uuid;

use crate::catalog::{BillingPeriod, Rail, RefundId, ResourceId};
use crate::coupon::{Coupon, CouponCode};
use crate::error::{GatewayError, NotFoundKind};
use crate::money::Money;
use crate::timestamp::UnixTimestamp;

/// Globally unique settlement signature.
///
/// Chain settlements use the on-chain transaction signature verbatim; card
/// settlements use `card:<session_id>`. The shared namespace is what makes
/// the ledger's uniqueness constraint double as replay protection for both
/// rails.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettlementSignature(pub String);

impl SettlementSignature {
    pub fn for_card_session(session_id: &str) -> Self {
        Self(format!("card:{session_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SettlementSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SettlementSignature {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who paid: a chain wallet or a card-processor customer reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PayerRef {
    Wallet(String),
    CustomerRef(String),
}

impl PayerRef {
    pub fn as_str(&self) -> &str {
        match self {
            PayerRef::Wallet(w) => w,
            PayerRef::CustomerRef(c) => c,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PayerRef::Wallet(_) => "wallet",
            PayerRef::CustomerRef(_) => "customer_ref",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub signature: SettlementSignature,
    pub resource_id: ResourceId,
    pub rail: Rail,
    pub payer: PayerRef,
    pub amount: Money,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Approved,
    Denied,
    Settled,
}

impl Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Approved => "approved",
            RefundStatus::Denied => "denied",
            RefundStatus::Settled => "settled",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub id: RefundId,
    pub original_signature: SettlementSignature,
    /// Wallet the refund pays out to.
    pub recipient: String,
    pub amount: Money,
    /// Mint of the token the refund settles in.
    pub token: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub settled_signature: Option<SettlementSignature>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(format!("sub_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Expired,
}

impl Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub product_id: ResourceId,
    pub holder: PayerRef,
    pub rail: Rail,
    pub billing_period: BillingPeriod,
    pub interval: u32,
    pub status: SubscriptionStatus,
    pub current_period_start: UnixTimestamp,
    pub current_period_end: UnixTimestamp,
    #[serde(default)]
    pub trial_end: Option<UnixTimestamp>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<UnixTimestamp>,
    /// Subscription id on the card processor, card rail only.
    #[serde(default)]
    pub processor_subscription_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Errors shared by all ledger backends.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Unique signature constraint hit: the payment was already settled.
    #[error("settlement signature already recorded: {0}")]
    SignatureReused(SettlementSignature),
    /// A non-denied refund already exists for the original signature.
    #[error("refund already open for signature {0}")]
    DuplicateRefund(SettlementSignature),
    #[error("refund transition rejected: {id} is {actual}, expected {expected}")]
    RefundTransition {
        id: RefundId,
        expected: RefundStatus,
        actual: RefundStatus,
    },
    #[error("coupon usage limit reached: {0}")]
    CouponExhausted(CouponCode),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<LedgerError> for GatewayError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::SignatureReused(_) => GatewayError::SignatureReused,
            LedgerError::DuplicateRefund(_) | LedgerError::RefundTransition { .. } => {
                GatewayError::RefundAlreadyProcessed
            }
            LedgerError::CouponExhausted(_) => GatewayError::CouponExhausted,
            LedgerError::NotFound(id) => GatewayError::not_found(NotFoundKind::Refund, id),
            LedgerError::Storage(message) => GatewayError::Internal(message),
        }
    }
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Inserts a payment record. Exactly one insert per signature succeeds;
    /// the loser of a race observes [`LedgerError::SignatureReused`].
    async fn insert_payment(&self, record: PaymentRecord) -> Result<(), LedgerError>;

    async fn get_payment(
        &self,
        signature: &SettlementSignature,
    ) -> Result<Option<PaymentRecord>, LedgerError>;
}

#[async_trait]
pub trait RefundStore: Send + Sync {
    /// Creates a refund request. Fails when a non-denied request already
    /// exists for the same original signature.
    async fn insert_refund(&self, refund: RefundRequest) -> Result<(), LedgerError>;

    async fn get_refund(&self, id: &RefundId) -> Result<Option<RefundRequest>, LedgerError>;

    /// Compare-and-swap status transition. Only the caller that observes
    /// `expected` wins; everyone else gets [`LedgerError::RefundTransition`].
    async fn transition_refund(
        &self,
        id: &RefundId,
        expected: RefundStatus,
        next: RefundStatus,
        settled_signature: Option<SettlementSignature>,
    ) -> Result<RefundRequest, LedgerError>;

    async fn list_pending_refunds(&self) -> Result<Vec<RefundRequest>, LedgerError>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn insert_subscription(&self, subscription: Subscription) -> Result<(), LedgerError>;

    async fn update_subscription(&self, subscription: Subscription) -> Result<(), LedgerError>;

    async fn get_subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, LedgerError>;

    /// Chain-rail identity: one subscription per `(wallet, product)`.
    async fn find_by_holder_product(
        &self,
        holder: &PayerRef,
        product_id: &ResourceId,
    ) -> Result<Option<Subscription>, LedgerError>;

    /// Card-rail identity: the processor's subscription id.
    async fn find_by_processor_id(
        &self,
        processor_subscription_id: &str,
    ) -> Result<Option<Subscription>, LedgerError>;

    async fn list_for_holder(&self, holder: &PayerRef) -> Result<Vec<Subscription>, LedgerError>;
}

#[async_trait]
pub trait CouponStore: Send + Sync {
    async fn list_coupons(&self) -> Result<Vec<Coupon>, LedgerError>;

    async fn get_coupon(&self, code: &CouponCode) -> Result<Option<Coupon>, LedgerError>;

    /// Increments the usage counter, refusing once `usage_limit` is reached.
    /// The check and the increment are atomic.
    async fn increment_coupon_usage(&self, code: &CouponCode) -> Result<(), LedgerError>;
}

/// The full ledger surface the pipeline depends on.
pub trait Ledger: PaymentStore + RefundStore + SubscriptionStore + CouponStore {}

impl<T: PaymentStore + RefundStore + SubscriptionStore + CouponStore> Ledger for T {}

pub(crate) fn payer_columns(payer: &PayerRef) -> (&'static str, &str) {
    (payer.kind(), payer.as_str())
}

pub(crate) fn payer_from_columns(kind: &str, value: String) -> PayerRef {
    match kind {
        "wallet" => PayerRef::Wallet(value),
        _ => PayerRef::CustomerRef(value),
    }
}
