//! Monetary values in atomic token units.
//!
//! Every price policy decision in the gateway happens on integers. A
//! [`Money`] is an atomic amount tagged with the [`AssetRef`] it denominates,
//! and arithmetic between differing assets is a hard error rather than a
//! silent conversion. Floating point never participates: human-readable
//! amounts (`"1.50"`) are parsed with `rust_decimal` at the configuration
//! boundary and immediately scaled to atomic units.
//!
//! Rounding is always toward +∞ at the chosen granularity, so a discounted
//! price can only ever round in the merchant's favor by less than one cent.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// A reference to the asset a [`Money`] value is denominated in.
///
/// `code` is a human-oriented ticker (`"USDC"`), `decimals` the number of
/// fractional digits one whole unit carries on its rail.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetRef {
    pub code: String,
    pub decimals: u8,
}

impl AssetRef {
    pub fn new(code: impl Into<String>, decimals: u8) -> Self {
        Self {
            code: code.into(),
            decimals,
        }
    }

    /// Atomic units per display cent (hundredth of a whole unit).
    ///
    /// Assets with fewer than two decimals round at whole atomic units.
    pub fn cent_granularity(&self) -> i64 {
        if self.decimals < 2 {
            1
        } else {
            10i64.pow(self.decimals as u32 - 2)
        }
    }
}

impl Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)
    }
}

/// Errors produced by [`Money`] arithmetic.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("asset mismatch: {left} vs {right}")]
    AssetMismatch { left: String, right: String },
    #[error("subtraction would go negative")]
    Underflow,
    #[error("amount exceeds representable range")]
    Overflow,
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

/// An exact monetary amount: `atomic` units of `asset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Money {
    pub asset: AssetRef,
    pub atomic: i64,
}

impl Money {
    pub fn new(asset: AssetRef, atomic: i64) -> Self {
        Self { asset, atomic }
    }

    pub fn zero(asset: AssetRef) -> Self {
        Self { asset, atomic: 0 }
    }

    pub fn is_zero(&self) -> bool {
        self.atomic == 0
    }

    /// Parses a human-readable decimal amount (`"1.50"`) into atomic units.
    ///
    /// Used only at the configuration boundary. Fails when the input carries
    /// more precision than the asset can represent.
    pub fn parse(asset: AssetRef, input: &str) -> Result<Self, MoneyError> {
        let decimal =
            Decimal::from_str(input).map_err(|e| MoneyError::InvalidAmount(e.to_string()))?;
        if decimal.is_sign_negative() {
            return Err(MoneyError::InvalidAmount("negative amount".to_string()));
        }
        let scale = decimal.scale();
        let token_scale = asset.decimals as u32;
        if scale > token_scale {
            return Err(MoneyError::InvalidAmount(format!(
                "precision {scale} exceeds asset decimals {token_scale}"
            )));
        }
        let mantissa = decimal.mantissa().unsigned_abs();
        let multiplier = 10u128.pow(token_scale - scale);
        let atomic = mantissa
            .checked_mul(multiplier)
            .and_then(|v| i64::try_from(v).ok())
            .ok_or(MoneyError::Overflow)?;
        Ok(Self { asset, atomic })
    }

    fn assert_same_asset(&self, other: &Money) -> Result<(), MoneyError> {
        if self.asset != other.asset {
            return Err(MoneyError::AssetMismatch {
                left: self.asset.code.clone(),
                right: other.asset.code.clone(),
            });
        }
        Ok(())
    }

    pub fn add(&self, other: &Money) -> Result<Money, MoneyError> {
        self.assert_same_asset(other)?;
        let atomic = self
            .atomic
            .checked_add(other.atomic)
            .ok_or(MoneyError::Overflow)?;
        Ok(Money::new(self.asset.clone(), atomic))
    }

    /// Subtracts `other`, failing instead of going negative.
    pub fn sub(&self, other: &Money) -> Result<Money, MoneyError> {
        self.assert_same_asset(other)?;
        if other.atomic > self.atomic {
            return Err(MoneyError::Underflow);
        }
        Ok(Money::new(self.asset.clone(), self.atomic - other.atomic))
    }

    /// Subtracts `other`, clamping at zero. Used by discount stacking where a
    /// fixed coupon larger than the remaining amount means "free".
    pub fn sub_clamped(&self, other: &Money) -> Result<Money, MoneyError> {
        self.assert_same_asset(other)?;
        Ok(Money::new(
            self.asset.clone(),
            self.atomic.saturating_sub(other.atomic).max(0),
        ))
    }

    /// Multiplies by `num/den` with the ceiling taken on the final division.
    ///
    /// Intermediates are carried in `i128`, so `atomic * num` cannot wrap for
    /// any representable amount.
    pub fn mul_rational(&self, num: i64, den: i64) -> Result<Money, MoneyError> {
        if den <= 0 || num < 0 {
            return Err(MoneyError::InvalidAmount(format!(
                "invalid rational {num}/{den}"
            )));
        }
        let wide = self.atomic as i128 * num as i128;
        let den = den as i128;
        let ceiled = (wide + den - 1) / den;
        let atomic = i64::try_from(ceiled).map_err(|_| MoneyError::Overflow)?;
        Ok(Money::new(self.asset.clone(), atomic))
    }

    /// Applies a percentage expressed in basis points (10000 = 100%).
    pub fn apply_percentage(&self, bps: u32) -> Result<Money, MoneyError> {
        self.mul_rational(bps as i64, 10_000)
    }

    /// Rounds up to the next multiple of `granularity_atomic`.
    pub fn round_up_to(&self, granularity_atomic: i64) -> Result<Money, MoneyError> {
        if granularity_atomic <= 0 {
            return Err(MoneyError::InvalidAmount(format!(
                "invalid granularity {granularity_atomic}"
            )));
        }
        let g = granularity_atomic as i128;
        let wide = self.atomic as i128;
        let ceiled = (wide + g - 1) / g * g;
        let atomic = i64::try_from(ceiled).map_err(|_| MoneyError::Overflow)?;
        Ok(Money::new(self.asset.clone(), atomic))
    }

    /// Rounds up to the asset's display cent.
    pub fn round_up_to_cents(&self) -> Result<Money, MoneyError> {
        self.round_up_to(self.asset.cent_granularity())
    }
}

impl Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.atomic, self.asset.code)
    }
}

/// Wire representation: the atomic amount travels as a string to survive
/// JSON number precision limits.
#[derive(Serialize, Deserialize)]
struct MoneyWire {
    asset: AssetRef,
    atomic: String,
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        MoneyWire {
            asset: self.asset.clone(),
            atomic: self.atomic.to_string(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = MoneyWire::deserialize(deserializer)?;
        let atomic = wire
            .atomic
            .parse::<i64>()
            .map_err(|_| serde::de::Error::custom("atomic amount must be a base-10 integer"))?;
        Ok(Money::new(wire.asset, atomic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usdc() -> AssetRef {
        AssetRef::new("USDC", 6)
    }

    fn usdc_amount(atomic: i64) -> Money {
        Money::new(usdc(), atomic)
    }

    #[test]
    fn add_same_asset() {
        let sum = usdc_amount(1_000_000).add(&usdc_amount(500_000)).unwrap();
        assert_eq!(sum.atomic, 1_500_000);
    }

    #[test]
    fn add_mismatched_asset_fails() {
        let sol = Money::new(AssetRef::new("SOL", 9), 1);
        let err = usdc_amount(1).add(&sol).unwrap_err();
        assert!(matches!(err, MoneyError::AssetMismatch { .. }));
    }

    #[test]
    fn add_overflow() {
        let err = usdc_amount(i64::MAX).add(&usdc_amount(1)).unwrap_err();
        assert_eq!(err, MoneyError::Overflow);
    }

    #[test]
    fn sub_underflow() {
        let err = usdc_amount(100).sub(&usdc_amount(101)).unwrap_err();
        assert_eq!(err, MoneyError::Underflow);
    }

    #[test]
    fn sub_clamped_floors_at_zero() {
        let out = usdc_amount(100).sub_clamped(&usdc_amount(250)).unwrap();
        assert_eq!(out.atomic, 0);
    }

    #[test]
    fn mul_rational_ceils() {
        // 100 * 1/3 = 33.33.. -> 34
        let out = usdc_amount(100).mul_rational(1, 3).unwrap();
        assert_eq!(out.atomic, 34);
        // exact division stays exact
        let out = usdc_amount(100).mul_rational(1, 4).unwrap();
        assert_eq!(out.atomic, 25);
    }

    #[test]
    fn mul_rational_rejects_bad_rationals() {
        assert!(usdc_amount(100).mul_rational(1, 0).is_err());
        assert!(usdc_amount(100).mul_rational(-1, 2).is_err());
    }

    #[test]
    fn apply_percentage_is_bps() {
        // 80% of $1.00
        let out = usdc_amount(1_000_000).apply_percentage(8_000).unwrap();
        assert_eq!(out.atomic, 800_000);
    }

    #[test]
    fn round_up_to_cents_usdc() {
        // one cent of USDC is 10_000 atomic units
        let out = usdc_amount(1_620_001).round_up_to_cents().unwrap();
        assert_eq!(out.atomic, 1_630_000);
        let exact = usdc_amount(1_620_000).round_up_to_cents().unwrap();
        assert_eq!(exact.atomic, 1_620_000);
    }

    #[test]
    fn round_up_low_decimal_asset() {
        let jpy = AssetRef::new("JPY", 0);
        assert_eq!(jpy.cent_granularity(), 1);
        let out = Money::new(jpy, 7).round_up_to_cents().unwrap();
        assert_eq!(out.atomic, 7);
    }

    #[test]
    fn parse_human_amount() {
        let out = Money::parse(usdc(), "1.50").unwrap();
        assert_eq!(out.atomic, 1_500_000);
        let whole = Money::parse(usdc(), "100").unwrap();
        assert_eq!(whole.atomic, 100_000_000);
    }

    #[test]
    fn parse_rejects_excess_precision() {
        let err = Money::parse(AssetRef::new("X", 2), "1.234").unwrap_err();
        assert!(matches!(err, MoneyError::InvalidAmount(_)));
    }

    #[test]
    fn parse_rejects_negative() {
        assert!(Money::parse(usdc(), "-1").is_err());
    }

    #[test]
    fn serde_round_trip_keeps_atomic_as_string() {
        let money = usdc_amount(700_000);
        let json = serde_json::to_value(&money).unwrap();
        assert_eq!(json["atomic"], "700000");
        let back: Money = serde_json::from_value(json).unwrap();
        assert_eq!(back, money);
    }
}
