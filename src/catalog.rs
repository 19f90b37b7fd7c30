//! Product catalog: resources, carts, and the identifiers that route them.
//!
//! Resources are immutable within a serving epoch - the catalog is loaded
//! from configuration at startup and only read afterwards. Cart and refund
//! ids carry their routing prefix (`cart_`, `refund_`) so the authorization
//! pipeline can dispatch on the id alone.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use uuid::Uuid;

use crate::money::Money;

pub const CART_ID_PREFIX: &str = "cart_";
pub const REFUND_ID_PREFIX: &str = "refund_";

/// Settlement rail an operation runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rail {
    Card,
    Chain,
}

impl Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rail::Card => write!(f, "card"),
            Rail::Chain => write!(f, "chain"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_cart(&self) -> bool {
        self.0.starts_with(CART_ID_PREFIX)
    }

    pub fn is_refund(&self) -> bool {
        self.0.starts_with(REFUND_ID_PREFIX)
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        ResourceId(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CartId(pub String);

impl CartId {
    pub fn generate() -> Self {
        CartId(format!("{CART_ID_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefundId(pub String);

impl RefundId {
    pub fn generate() -> Self {
        RefundId(format!("{REFUND_ID_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RefundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Billing period unit for subscription-class resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Day,
    Week,
    Month,
    Year,
}

impl BillingPeriod {
    /// Seconds in one period unit. Months use 30 days, years 365: period
    /// math on the chain rail is duration-based, not calendar-based.
    pub fn seconds(&self) -> u64 {
        match self {
            BillingPeriod::Day => 86_400,
            BillingPeriod::Week => 7 * 86_400,
            BillingPeriod::Month => 30 * 86_400,
            BillingPeriod::Year => 365 * 86_400,
        }
    }
}

/// Subscription parameters attached to a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSpec {
    pub billing_period: BillingPeriod,
    #[serde(default = "default_interval")]
    pub interval: u32,
    #[serde(default)]
    pub trial_days: Option<u32>,
    /// Price id on the card processor, when the resource is sold there.
    #[serde(default)]
    pub processor_price_id: Option<String>,
}

fn default_interval() -> u32 {
    1
}

impl SubSpec {
    pub fn period_seconds(&self) -> u64 {
        self.billing_period.seconds() * self.interval as u64
    }
}

/// A sellable resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub description: String,
    #[serde(default)]
    pub fiat_price: Option<Money>,
    #[serde(default)]
    pub crypto_price: Option<Money>,
    /// Price id on the card processor for one-off checkout.
    #[serde(default)]
    pub fiat_processor_price_id: Option<String>,
    /// Token account that receives chain-rail payments. When absent the
    /// recipient is derived as the merchant's associated token account.
    #[serde(default)]
    pub recipient_token_account: Option<String>,
    #[serde(default = "default_memo_template")]
    pub memo_template: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub subscription: Option<SubSpec>,
}

fn default_memo_template() -> String {
    "pay:{resource}".to_string()
}

impl Resource {
    /// Renders the on-chain memo bound to this resource.
    pub fn memo(&self) -> String {
        interpolate_memo(&self.memo_template, &self.id)
    }

    pub fn is_subscription(&self) -> bool {
        self.subscription.is_some()
    }
}

/// Replaces the `{resource}` placeholder with the resource id.
pub fn interpolate_memo(template: &str, resource_id: &ResourceId) -> String {
    template.replace("{resource}", resource_id.as_str())
}

/// One cart line: a resource and how many of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub resource_id: ResourceId,
    pub quantity: u32,
}

/// An ordered sequence of cart lines. The derived quote lives in the quote
/// store, keyed by the cart id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    pub items: Vec<CartItem>,
}

/// Read-only resource registry, populated once from configuration.
#[derive(Debug, Default)]
pub struct Catalog {
    resources: DashMap<ResourceId, Resource>,
}

impl Catalog {
    pub fn new(resources: Vec<Resource>) -> Self {
        let map = DashMap::with_capacity(resources.len());
        for resource in resources {
            map.insert(resource.id.clone(), resource);
        }
        Self { resources: map }
    }

    pub fn get(&self, id: &ResourceId) -> Option<Resource> {
        self.resources.get(id).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<Resource> {
        let mut all: Vec<Resource> = self
            .resources
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        all
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
