//! Quote generation: resource → price → effective price → quote envelope.
//!
//! A quote is a time-bounded, amount-bounded payment requirement. Catalog
//! stage coupons discount each line item; checkout-stage coupons discount
//! the cart total, deduplicated by code across the cart. Every amount is
//! ceiled to display cents before it leaves this module.
//!
//! Cart quotes are stored here until they expire. The stored quote - not the
//! live catalog - is authoritative at verification time: re-pricing a cart
//! during verification would let a catalog edit change what a buyer already
//! agreed to pay.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::catalog::{Cart, CartId, CartItem, Catalog, Rail, Resource, ResourceId};
use crate::coupon::{self, Coupon, CouponCode, Stage};
use crate::error::{GatewayError, NotFoundKind};
use crate::ledger::CouponStore;
use crate::money::Money;
use crate::timestamp::UnixTimestamp;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuoteId(pub String);

impl QuoteId {
    fn generate() -> Self {
        Self(format!("quote_{}", Uuid::new_v4().simple()))
    }
}

/// An issued quote. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: QuoteId,
    pub subject: ResourceId,
    pub rail: Rail,
    pub amount: Money,
    pub pay_to: String,
    pub memo: String,
    pub expires_at: UnixTimestamp,
    pub coupons_applied: Vec<CouponCode>,
}

/// The 402 payment-requirement envelope for the chain rail.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub pay_to: String,
    pub asset: String,
    /// Atomic units, stringified.
    pub max_amount_required: String,
    /// The memo the transfer must carry.
    pub resource: String,
    pub description: String,
    pub max_timeout_seconds: u64,
}

/// Chain-rail pricing parameters fixed at startup.
#[derive(Debug, Clone)]
pub struct ChainPricing {
    /// Network name advertised in quotes (e.g. `solana`, `solana-devnet`).
    pub network: String,
    /// SPL mint all chain prices settle in.
    pub mint: String,
    /// Recipient token account used when a resource does not name its own.
    pub default_pay_to: String,
    /// Quote lifetime.
    pub quote_ttl_seconds: u64,
}

/// A cart with its authoritative quote.
#[derive(Debug, Clone)]
pub struct StoredCart {
    pub cart: Cart,
    pub quote: Quote,
    pub paid: bool,
}

pub struct QuoteGenerator {
    catalog: Arc<Catalog>,
    coupons: Arc<dyn CouponStore>,
    pricing: ChainPricing,
    carts: DashMap<CartId, StoredCart>,
}

impl QuoteGenerator {
    pub fn new(catalog: Arc<Catalog>, coupons: Arc<dyn CouponStore>, pricing: ChainPricing) -> Self {
        Self {
            catalog,
            coupons,
            pricing,
            carts: DashMap::new(),
        }
    }

    fn resource(&self, id: &ResourceId) -> Result<Resource, GatewayError> {
        self.catalog
            .get(id)
            .ok_or_else(|| GatewayError::not_found(NotFoundKind::Resource, id.as_str()))
    }

    fn base_price(&self, resource: &Resource, rail: Rail) -> Result<Money, GatewayError> {
        let price = match rail {
            Rail::Chain => resource.crypto_price.as_ref(),
            Rail::Card => resource.fiat_price.as_ref(),
        };
        price.cloned().ok_or_else(|| {
            GatewayError::invalid_field(
                "resource",
                format!("{} has no {rail} price", resource.id),
            )
        })
    }

    fn pay_to(&self, resource: &Resource) -> String {
        resource
            .recipient_token_account
            .clone()
            .unwrap_or_else(|| self.pricing.default_pay_to.clone())
    }

    async fn manual_coupon(
        &self,
        code: Option<&CouponCode>,
    ) -> Result<Option<Coupon>, GatewayError> {
        let Some(code) = code else {
            return Ok(None);
        };
        let coupon = self
            .coupons
            .get_coupon(code)
            .await
            .map_err(GatewayError::from)?
            .ok_or_else(|| GatewayError::not_found(NotFoundKind::Coupon, code.as_str()))?;
        Ok(Some(coupon))
    }

    /// Effective per-item price after catalog-stage coupons.
    pub async fn effective_item_price(
        &self,
        resource: &Resource,
        rail: Rail,
        manual: Option<&Coupon>,
        now: UnixTimestamp,
    ) -> Result<(Money, Vec<CouponCode>), GatewayError> {
        let base = self.base_price(resource, rail)?;
        let all = self.coupons.list_coupons().await.map_err(GatewayError::from)?;
        let selected = coupon::select_for_payment(
            &all,
            Some(&resource.id),
            rail,
            manual,
            Stage::Catalog,
            now,
        )
        .map_err(GatewayError::from)?;
        let amount = coupon::stack(&base, &selected)?;
        let applied = selected.iter().map(|c| c.code.clone()).collect();
        Ok((amount, applied))
    }

    /// Generates a quote for a single resource.
    #[tracing::instrument(skip(self), fields(resource = %resource_id))]
    pub async fn quote_resource(
        &self,
        resource_id: &ResourceId,
        rail: Rail,
        manual_code: Option<&CouponCode>,
        now: UnixTimestamp,
    ) -> Result<Quote, GatewayError> {
        let resource = self.resource(resource_id)?;
        let manual = self.manual_coupon(manual_code).await?;
        let (amount, coupons_applied) = self
            .effective_item_price(&resource, rail, manual.as_ref(), now)
            .await?;
        Ok(Quote {
            id: QuoteId::generate(),
            subject: resource.id.clone(),
            rail,
            amount,
            pay_to: self.pay_to(&resource),
            memo: resource.memo(),
            expires_at: now + self.pricing.quote_ttl_seconds,
            coupons_applied,
        })
    }

    /// Generates and stores a cart quote.
    ///
    /// Line items get catalog-stage pricing; the summed total then passes
    /// through checkout-stage coupons once, deduplicated by code.
    #[tracing::instrument(skip(self, items))]
    pub async fn quote_cart(
        &self,
        items: Vec<CartItem>,
        rail: Rail,
        manual_code: Option<&CouponCode>,
        now: UnixTimestamp,
    ) -> Result<(Cart, Quote), GatewayError> {
        if items.is_empty() {
            return Err(GatewayError::EmptyCart);
        }
        let manual = self.manual_coupon(manual_code).await?;
        let mut total: Option<Money> = None;
        for item in &items {
            if item.quantity == 0 {
                return Err(GatewayError::invalid_field("quantity", "must be positive"));
            }
            let resource = self.resource(&item.resource_id)?;
            let (unit, _) = self
                .effective_item_price(&resource, rail, None, now)
                .await?;
            let line = unit.mul_rational(item.quantity as i64, 1)?;
            total = Some(match total {
                None => line,
                Some(total) => total.add(&line)?,
            });
        }
        let total = total.expect("cart verified non-empty");

        let all = self.coupons.list_coupons().await.map_err(GatewayError::from)?;
        let checkout = coupon::select_for_payment(
            &all,
            None,
            rail,
            manual.as_ref(),
            Stage::Checkout,
            now,
        )
        .map_err(GatewayError::from)?;
        let amount = coupon::stack(&total, &checkout)?;
        let coupons_applied: Vec<CouponCode> =
            checkout.iter().map(|c| c.code.clone()).collect();

        let cart = Cart {
            id: CartId::generate(),
            items,
        };
        let cart_subject = ResourceId(cart.id.as_str().to_string());
        let quote = Quote {
            id: QuoteId::generate(),
            subject: cart_subject.clone(),
            rail,
            amount,
            pay_to: self.pricing.default_pay_to.clone(),
            memo: crate::catalog::interpolate_memo("pay:{resource}", &cart_subject),
            expires_at: now + self.pricing.quote_ttl_seconds,
            coupons_applied,
        };
        self.carts.insert(
            cart.id.clone(),
            StoredCart {
                cart: cart.clone(),
                quote: quote.clone(),
                paid: false,
            },
        );
        Ok((cart, quote))
    }

    /// Fetches a stored cart, enforcing expiry and paid-state.
    ///
    /// Expiry is inclusive: a cart is rejected the second its quote expires.
    pub fn stored_cart(&self, cart_id: &CartId, now: UnixTimestamp) -> Result<StoredCart, GatewayError> {
        let stored = self
            .carts
            .get(cart_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::not_found(NotFoundKind::Cart, cart_id.as_str()))?;
        if stored.paid {
            return Err(GatewayError::CartAlreadyPaid);
        }
        if stored.quote.expires_at.is_expired_at(now) {
            return Err(GatewayError::QuoteExpired);
        }
        Ok(stored)
    }

    /// Marks a cart as settled so a second proof cannot pay it again.
    pub fn mark_cart_paid(&self, cart_id: &CartId) {
        if let Some(mut stored) = self.carts.get_mut(cart_id) {
            stored.paid = true;
        }
    }

    /// Renders the 402 envelope for a chain-rail quote.
    pub fn payment_requirements(&self, quote: &Quote, description: &str) -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".to_string(),
            network: self.pricing.network.clone(),
            pay_to: quote.pay_to.clone(),
            asset: self.pricing.mint.clone(),
            max_amount_required: quote.amount.atomic.to_string(),
            resource: quote.memo.clone(),
            description: description.to_string(),
            max_timeout_seconds: self.pricing.quote_ttl_seconds,
        }
    }

    pub fn pricing(&self) -> &ChainPricing {
        &self.pricing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::coupon::{CouponScope, Discount, MethodScope, Percentage};
    use crate::ledger::memory::MemoryLedger;
    use crate::money::AssetRef;

    fn usdc(atomic: i64) -> Money {
        Money::new(AssetRef::new("USDC", 6), atomic)
    }

    fn resource(id: &str, atomic: i64) -> Resource {
        Resource {
            id: ResourceId::from(id),
            description: format!("resource {id}"),
            fiat_price: Some(usdc(atomic)),
            crypto_price: Some(usdc(atomic)),
            fiat_processor_price_id: None,
            recipient_token_account: None,
            memo_template: "pay:{resource}".to_string(),
            metadata: serde_json::Value::Null,
            subscription: None,
        }
    }

    fn coupon(code: &str, discount: Discount, stage: Stage) -> Coupon {
        Coupon {
            code: CouponCode::from(code),
            discount,
            scope: CouponScope::All,
            product_ids: vec![],
            payment_method: MethodScope::Any,
            applies_at: stage,
            auto_apply: true,
            expires_at: None,
            usage_limit: None,
            usage_count: 0,
            metadata: serde_json::Value::Null,
        }
    }

    fn generator(resources: Vec<Resource>, coupons: Vec<Coupon>) -> QuoteGenerator {
        QuoteGenerator::new(
            Arc::new(Catalog::new(resources)),
            Arc::new(MemoryLedger::with_coupons(coupons)),
            ChainPricing {
                network: "solana".to_string(),
                mint: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string(),
                default_pay_to: "MerchantTokenAccount111".to_string(),
                quote_ttl_seconds: 300,
            },
        )
    }

    #[tokio::test]
    async fn resource_quote_stacks_catalog_coupons() {
        // $1.00 resource, 20% catalog coupon then $0.10 fixed -> $0.70
        let twenty = coupon(
            "TWENTY",
            Discount::Percentage(Percentage::from_bps(2_000).unwrap()),
            Stage::Catalog,
        );
        let dime = coupon("DIME", Discount::Fixed(usdc(100_000)), Stage::Catalog);
        let generator = generator(vec![resource("x", 1_000_000)], vec![dime, twenty]);
        let quote = generator
            .quote_resource(&ResourceId::from("x"), Rail::Chain, None, UnixTimestamp(0))
            .await
            .unwrap();
        assert_eq!(quote.amount.atomic, 700_000);
        assert_eq!(quote.memo, "pay:x");
        assert_eq!(quote.expires_at, UnixTimestamp(300));
        assert_eq!(quote.coupons_applied.len(), 2);
    }

    #[tokio::test]
    async fn requirements_envelope_carries_atomic_string() {
        let generator = generator(vec![resource("x", 1_000_000)], vec![]);
        let quote = generator
            .quote_resource(&ResourceId::from("x"), Rail::Chain, None, UnixTimestamp(0))
            .await
            .unwrap();
        let requirements = generator.payment_requirements(&quote, "resource x");
        assert_eq!(requirements.max_amount_required, "1000000");
        assert_eq!(requirements.scheme, "exact");
        assert_eq!(requirements.resource, "pay:x");
        let json = serde_json::to_value(&requirements).unwrap();
        assert!(json.get("maxAmountRequired").is_some());
    }

    #[tokio::test]
    async fn cart_quote_applies_checkout_coupon_once() {
        // a: $1.00, b: 2 x $0.50, 10% checkout -> $1.80
        let ten = coupon(
            "TEN",
            Discount::Percentage(Percentage::from_bps(1_000).unwrap()),
            Stage::Checkout,
        );
        let generator = generator(
            vec![resource("a", 1_000_000), resource("b", 500_000)],
            vec![ten],
        );
        let items = vec![
            CartItem {
                resource_id: ResourceId::from("a"),
                quantity: 1,
            },
            CartItem {
                resource_id: ResourceId::from("b"),
                quantity: 2,
            },
        ];
        let (cart, quote) = generator
            .quote_cart(items, Rail::Chain, None, UnixTimestamp(0))
            .await
            .unwrap();
        assert!(cart.id.as_str().starts_with("cart_"));
        assert_eq!(quote.amount.atomic, 1_800_000);
        assert_eq!(quote.memo, format!("pay:{}", cart.id));
    }

    #[tokio::test]
    async fn empty_cart_rejected() {
        let generator = generator(vec![], vec![]);
        let err = generator
            .quote_cart(vec![], Rail::Chain, None, UnixTimestamp(0))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::EmptyCart));
    }

    #[tokio::test]
    async fn stored_cart_expiry_is_inclusive() {
        let generator = generator(vec![resource("a", 1_000_000)], vec![]);
        let (cart, quote) = generator
            .quote_cart(
                vec![CartItem {
                    resource_id: ResourceId::from("a"),
                    quantity: 1,
                }],
                Rail::Chain,
                None,
                UnixTimestamp(0),
            )
            .await
            .unwrap();
        assert!(generator.stored_cart(&cart.id, quote.expires_at - 1).is_ok());
        let err = generator.stored_cart(&cart.id, quote.expires_at).unwrap_err();
        assert!(matches!(err, GatewayError::QuoteExpired));
    }

    #[tokio::test]
    async fn paid_cart_cannot_be_fetched_for_payment() {
        let generator = generator(vec![resource("a", 1_000_000)], vec![]);
        let (cart, _) = generator
            .quote_cart(
                vec![CartItem {
                    resource_id: ResourceId::from("a"),
                    quantity: 1,
                }],
                Rail::Chain,
                None,
                UnixTimestamp(0),
            )
            .await
            .unwrap();
        generator.mark_cart_paid(&cart.id);
        let err = generator.stored_cart(&cart.id, UnixTimestamp(1)).unwrap_err();
        assert!(matches!(err, GatewayError::CartAlreadyPaid));
    }

    #[tokio::test]
    async fn stored_quote_survives_catalog_coupon_changes() {
        // The quote is authoritative: coupons added after quoting must not
        // change the amount the verifier expects.
        let ledger = Arc::new(MemoryLedger::new());
        let generator = QuoteGenerator::new(
            Arc::new(Catalog::new(vec![resource("a", 1_000_000)])),
            Arc::clone(&ledger) as Arc<dyn crate::ledger::CouponStore>,
            ChainPricing {
                network: "solana".to_string(),
                mint: "Mint111".to_string(),
                default_pay_to: "PayTo111".to_string(),
                quote_ttl_seconds: 300,
            },
        );
        let (cart, quote) = generator
            .quote_cart(
                vec![CartItem {
                    resource_id: ResourceId::from("a"),
                    quantity: 1,
                }],
                Rail::Chain,
                None,
                UnixTimestamp(0),
            )
            .await
            .unwrap();
        assert_eq!(quote.amount.atomic, 1_000_000);
        // A 50% checkout coupon appears after the quote was issued.
        ledger.seed_coupon(coupon(
            "HALF",
            Discount::Percentage(Percentage::from_bps(5_000).unwrap()),
            Stage::Checkout,
        ));
        let stored = generator.stored_cart(&cart.id, UnixTimestamp(10)).unwrap();
        assert_eq!(stored.quote.amount.atomic, 1_000_000);
    }

    #[tokio::test]
    async fn unknown_manual_coupon_is_not_found() {
        let generator = generator(vec![resource("a", 1_000_000)], vec![]);
        let err = generator
            .quote_resource(
                &ResourceId::from("a"),
                Rail::Chain,
                Some(&CouponCode::from("NOPE")),
                UnixTimestamp(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { .. }));
    }
}
