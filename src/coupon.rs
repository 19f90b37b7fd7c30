//! Coupon validation, selection, and ordered discount stacking.
//!
//! Stacking order is fixed by policy: percentage coupons first, in the order
//! given, then fixed-amount coupons, with every intermediate amount rounded
//! up to display cents before the next step. A `free` coupon short-circuits
//! the chain to zero. All arithmetic goes through [`Money`], so a discount
//! can never produce a fractional atomic unit or a negative amount.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::fmt::Display;

use crate::catalog::{Rail, ResourceId};
use crate::error::GatewayError;
use crate::money::{Money, MoneyError};
use crate::timestamp::UnixTimestamp;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CouponCode(pub String);

impl CouponCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CouponCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CouponCode {
    fn from(s: &str) -> Self {
        CouponCode(s.to_string())
    }
}

/// A percentage expressed in basis points, bounded to [0, 100%].
///
/// Deserializes from a decimal percent (`20` or `12.5`); policy arithmetic
/// only ever sees the integer basis points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Percentage(u32);

impl Percentage {
    pub fn from_bps(bps: u32) -> Option<Self> {
        (bps <= 10_000).then_some(Self(bps))
    }

    pub fn bps(&self) -> u32 {
        self.0
    }
}

impl Serialize for Percentage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Emit whole percents when exact, else fractional.
        if self.0 % 100 == 0 {
            serializer.serialize_u32(self.0 / 100)
        } else {
            serializer.serialize_f64(self.0 as f64 / 100.0)
        }
    }
}

impl<'de> Deserialize<'de> for Percentage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use rust_decimal::Decimal;
        use rust_decimal::prelude::ToPrimitive;
        use std::str::FromStr;

        let number = serde_json::Number::deserialize(deserializer)?;
        let decimal = Decimal::from_str(&number.to_string())
            .map_err(|_| serde::de::Error::custom("invalid percentage"))?;
        let bps = (decimal * Decimal::from(100))
            .to_u32()
            .ok_or_else(|| serde::de::Error::custom("percentage out of range"))?;
        Percentage::from_bps(bps)
            .ok_or_else(|| serde::de::Error::custom("percentage must be within [0, 100]"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Discount {
    Percentage(Percentage),
    Fixed(Money),
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CouponScope {
    All,
    Specific,
}

/// Which rail a coupon may be redeemed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodScope {
    Any,
    Card,
    Chain,
}

impl MethodScope {
    pub fn admits(&self, rail: Rail) -> bool {
        match self {
            MethodScope::Any => true,
            MethodScope::Card => rail == Rail::Card,
            MethodScope::Chain => rail == Rail::Chain,
        }
    }
}

/// Stage at which a coupon applies: per-item display pricing or cart-wide
/// checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Catalog,
    Checkout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: CouponCode,
    pub discount: Discount,
    pub scope: CouponScope,
    #[serde(default)]
    pub product_ids: Vec<ResourceId>,
    pub payment_method: MethodScope,
    pub applies_at: Stage,
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default)]
    pub expires_at: Option<UnixTimestamp>,
    #[serde(default)]
    pub usage_limit: Option<u32>,
    #[serde(default)]
    pub usage_count: u32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Why a coupon failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidReason {
    #[error("coupon expired")]
    Expired,
    #[error("coupon usage limit reached")]
    UsageExhausted,
    #[error("coupon does not apply to this product")]
    NotApplicableProduct,
    #[error("coupon does not apply to this payment method")]
    WrongPaymentMethod,
}

impl From<InvalidReason> for GatewayError {
    fn from(value: InvalidReason) -> Self {
        match value {
            InvalidReason::Expired => GatewayError::CouponExpired,
            InvalidReason::UsageExhausted => GatewayError::CouponExhausted,
            InvalidReason::NotApplicableProduct => GatewayError::CouponNotApplicable,
            InvalidReason::WrongPaymentMethod => GatewayError::CouponWrongMethod,
        }
    }
}

/// Checks a coupon against the clock, its usage cap, and the optional
/// product/rail context.
pub fn validate(
    coupon: &Coupon,
    now: UnixTimestamp,
    product_id: Option<&ResourceId>,
    payment_method: Option<Rail>,
) -> Result<(), InvalidReason> {
    if let Some(expires_at) = coupon.expires_at
        && expires_at.is_expired_at(now)
    {
        return Err(InvalidReason::Expired);
    }
    if let Some(limit) = coupon.usage_limit
        && coupon.usage_count >= limit
    {
        return Err(InvalidReason::UsageExhausted);
    }
    if coupon.scope == CouponScope::Specific
        && let Some(product_id) = product_id
        && !coupon.product_ids.contains(product_id)
    {
        return Err(InvalidReason::NotApplicableProduct);
    }
    if let Some(rail) = payment_method
        && !coupon.payment_method.admits(rail)
    {
        return Err(InvalidReason::WrongPaymentMethod);
    }
    Ok(())
}

/// Applies a single coupon to `amount`, rounding up to cents.
fn apply_one(amount: &Money, coupon: &Coupon) -> Result<Money, MoneyError> {
    let discounted = match &coupon.discount {
        Discount::Free => Money::zero(amount.asset.clone()),
        Discount::Percentage(pct) => {
            let keep_bps = 10_000 - pct.bps();
            amount.apply_percentage(keep_bps)?
        }
        Discount::Fixed(fixed) => amount.sub_clamped(fixed)?,
    };
    discounted.round_up_to_cents()
}

/// Applies coupons in stacking order: percentage first (in the order given),
/// then fixed; a free coupon anywhere collapses the amount to zero.
pub fn stack(amount: &Money, coupons: &[&Coupon]) -> Result<Money, MoneyError> {
    if coupons
        .iter()
        .any(|c| matches!(c.discount, Discount::Free))
    {
        return Ok(Money::zero(amount.asset.clone()));
    }
    let mut current = amount.round_up_to_cents()?;
    for coupon in coupons
        .iter()
        .filter(|c| matches!(c.discount, Discount::Percentage(_)))
    {
        current = apply_one(&current, coupon)?;
    }
    for coupon in coupons
        .iter()
        .filter(|c| matches!(c.discount, Discount::Fixed(_)))
    {
        current = apply_one(&current, coupon)?;
    }
    Ok(current)
}

/// Picks the coupon producing the largest discount on `base`.
/// Ties go to the first candidate encountered.
pub fn select_best<'a>(candidates: &[&'a Coupon], base: &Money) -> Option<&'a Coupon> {
    let mut best: Option<(&Coupon, i64)> = None;
    for candidate in candidates {
        let after = match apply_one(base, candidate) {
            Ok(after) => after,
            Err(_) => continue,
        };
        let saved = base.atomic - after.atomic;
        match best {
            Some((_, best_saved)) if saved <= best_saved => {}
            _ => best = Some((candidate, saved)),
        }
    }
    best.map(|(coupon, _)| coupon)
}

/// Selects the applicable auto-apply coupons for one payment at `stage`,
/// appending the manually supplied coupon when it validates.
///
/// Checkout-stage selection deduplicates by code: a cart of three items must
/// not apply the same cart-wide coupon three times.
pub fn select_for_payment<'a>(
    all: &'a [Coupon],
    product_id: Option<&ResourceId>,
    rail: Rail,
    manual: Option<&'a Coupon>,
    stage: Stage,
    now: UnixTimestamp,
) -> Result<Vec<&'a Coupon>, InvalidReason> {
    let mut selected: Vec<&Coupon> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for coupon in all {
        if !coupon.auto_apply || coupon.applies_at != stage {
            continue;
        }
        if validate(coupon, now, product_id, Some(rail)).is_err() {
            continue;
        }
        if seen.insert(coupon.code.as_str()) {
            selected.push(coupon);
        }
    }
    if let Some(manual) = manual {
        validate(manual, now, product_id, Some(rail))?;
        if seen.insert(manual.code.as_str()) {
            selected.push(manual);
        }
    }
    Ok(selected)
}
