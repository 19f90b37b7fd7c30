//! In-memory ledger backend.
//!
//! Semantics mirror the SQL backend exactly: unique settlement signatures,
//! single open refund per original signature, CAS refund transitions, and
//! capped coupon increments. Tests run against this implementation; a
//! single-node deployment can too.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Mutex;

use crate::catalog::{RefundId, ResourceId};
use crate::coupon::{Coupon, CouponCode};

use super::{
    CouponStore, LedgerError, PayerRef, PaymentRecord, PaymentStore, RefundRequest, RefundStatus,
    RefundStore, SettlementSignature, Subscription, SubscriptionId, SubscriptionStore,
};

#[derive(Debug, Default)]
pub struct MemoryLedger {
    payments: DashMap<SettlementSignature, PaymentRecord>,
    /// Refund state is guarded by one lock: the duplicate check over
    /// `original_signature` spans multiple entries, which per-entry locking
    /// cannot make atomic.
    refunds: Mutex<Vec<RefundRequest>>,
    subscriptions: DashMap<SubscriptionId, Subscription>,
    coupons: DashMap<CouponCode, Coupon>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_coupons(coupons: Vec<Coupon>) -> Self {
        let ledger = Self::new();
        for coupon in coupons {
            ledger.coupons.insert(coupon.code.clone(), coupon);
        }
        ledger
    }

    pub fn seed_coupon(&self, coupon: Coupon) {
        self.coupons.insert(coupon.code.clone(), coupon);
    }
}

#[async_trait]
impl PaymentStore for MemoryLedger {
    async fn insert_payment(&self, record: PaymentRecord) -> Result<(), LedgerError> {
        match self.payments.entry(record.signature.clone()) {
            Entry::Occupied(_) => Err(LedgerError::SignatureReused(record.signature)),
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(())
            }
        }
    }

    async fn get_payment(
        &self,
        signature: &SettlementSignature,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        Ok(self.payments.get(signature).map(|r| r.value().clone()))
    }
}

#[async_trait]
impl RefundStore for MemoryLedger {
    async fn insert_refund(&self, refund: RefundRequest) -> Result<(), LedgerError> {
        let mut refunds = self.refunds.lock().expect("refund lock poisoned");
        let open_exists = refunds.iter().any(|existing| {
            existing.original_signature == refund.original_signature
                && existing.status != RefundStatus::Denied
        });
        if open_exists {
            return Err(LedgerError::DuplicateRefund(refund.original_signature));
        }
        refunds.push(refund);
        Ok(())
    }

    async fn get_refund(&self, id: &RefundId) -> Result<Option<RefundRequest>, LedgerError> {
        let refunds = self.refunds.lock().expect("refund lock poisoned");
        Ok(refunds.iter().find(|r| &r.id == id).cloned())
    }

    async fn transition_refund(
        &self,
        id: &RefundId,
        expected: RefundStatus,
        next: RefundStatus,
        settled_signature: Option<SettlementSignature>,
    ) -> Result<RefundRequest, LedgerError> {
        let mut refunds = self.refunds.lock().expect("refund lock poisoned");
        let refund = refunds
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        if refund.status != expected {
            return Err(LedgerError::RefundTransition {
                id: id.clone(),
                expected,
                actual: refund.status,
            });
        }
        refund.status = next;
        if settled_signature.is_some() {
            refund.settled_signature = settled_signature;
        }
        Ok(refund.clone())
    }

    async fn list_pending_refunds(&self) -> Result<Vec<RefundRequest>, LedgerError> {
        let refunds = self.refunds.lock().expect("refund lock poisoned");
        Ok(refunds
            .iter()
            .filter(|r| r.status == RefundStatus::Pending)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryLedger {
    async fn insert_subscription(&self, subscription: Subscription) -> Result<(), LedgerError> {
        self.subscriptions
            .insert(subscription.id.clone(), subscription);
        Ok(())
    }

    async fn update_subscription(&self, subscription: Subscription) -> Result<(), LedgerError> {
        match self.subscriptions.entry(subscription.id.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(subscription);
                Ok(())
            }
            Entry::Vacant(_) => Err(LedgerError::NotFound(subscription.id.to_string())),
        }
    }

    async fn get_subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, LedgerError> {
        Ok(self.subscriptions.get(id).map(|s| s.value().clone()))
    }

    async fn find_by_holder_product(
        &self,
        holder: &PayerRef,
        product_id: &ResourceId,
    ) -> Result<Option<Subscription>, LedgerError> {
        Ok(self
            .subscriptions
            .iter()
            .find(|entry| {
                entry.value().holder == *holder && entry.value().product_id == *product_id
            })
            .map(|entry| entry.value().clone()))
    }

    async fn find_by_processor_id(
        &self,
        processor_subscription_id: &str,
    ) -> Result<Option<Subscription>, LedgerError> {
        Ok(self
            .subscriptions
            .iter()
            .find(|entry| {
                entry.value().processor_subscription_id.as_deref()
                    == Some(processor_subscription_id)
            })
            .map(|entry| entry.value().clone()))
    }

    async fn list_for_holder(&self, holder: &PayerRef) -> Result<Vec<Subscription>, LedgerError> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().holder == *holder)
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[async_trait]
impl CouponStore for MemoryLedger {
    async fn list_coupons(&self) -> Result<Vec<Coupon>, LedgerError> {
        let mut all: Vec<Coupon> = self
            .coupons
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.code.0.cmp(&b.code.0));
        Ok(all)
    }

    async fn get_coupon(&self, code: &CouponCode) -> Result<Option<Coupon>, LedgerError> {
        Ok(self.coupons.get(code).map(|c| c.value().clone()))
    }

    async fn increment_coupon_usage(&self, code: &CouponCode) -> Result<(), LedgerError> {
        match self.coupons.entry(code.clone()) {
            Entry::Vacant(_) => Err(LedgerError::NotFound(code.to_string())),
            Entry::Occupied(mut occupied) => {
                let coupon = occupied.get_mut();
                if let Some(limit) = coupon.usage_limit
                    && coupon.usage_count >= limit
                {
                    return Err(LedgerError::CouponExhausted(code.clone()));
                }
                coupon.usage_count += 1;
                Ok(())
            }
        }
    }
}
