//! Subscription lifecycle across both rails.
//!
//! The card processor drives card-rail subscriptions through webhooks
//! (renewal, payment failure, cancellation); chain-rail subscriptions are
//! driven locally by verified payments, with period math in plain seconds.
//! The two rails never share an identity: chain subscriptions key on
//! `(wallet, product)`, card subscriptions on the processor's subscription
//! id.

use std::sync::Arc;

use crate::catalog::{Rail, Resource, ResourceId};
use crate::error::{GatewayError, NotFoundKind};
use crate::ledger::{
    PayerRef, Subscription, SubscriptionId, SubscriptionStatus, SubscriptionStore,
};
use crate::timestamp::UnixTimestamp;

pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    grace_seconds: u64,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>, grace_seconds: u64) -> Self {
        Self {
            store,
            grace_seconds,
        }
    }

    fn sub_spec(resource: &Resource) -> Result<&crate::catalog::SubSpec, GatewayError> {
        resource.subscription.as_ref().ok_or_else(|| {
            GatewayError::SubscriptionState(format!(
                "{} is not a subscription product",
                resource.id
            ))
        })
    }

    /// Creates or renews a chain-rail subscription for `(wallet, product)`.
    ///
    /// A renewal extends `current_period_end` from the later of now and the
    /// existing end, so early renewals stack and late renewals restart from
    /// now.
    #[tracing::instrument(skip(self, resource), fields(product = %resource.id))]
    pub async fn create_or_renew_chain(
        &self,
        wallet: &str,
        resource: &Resource,
        now: UnixTimestamp,
    ) -> Result<Subscription, GatewayError> {
        let spec = Self::sub_spec(resource)?;
        let period = spec.period_seconds();
        let holder = PayerRef::Wallet(wallet.to_string());

        let existing = self
            .store
            .find_by_holder_product(&holder, &resource.id)
            .await
            .map_err(GatewayError::from)?;
        if let Some(mut subscription) = existing {
            let base = subscription.current_period_end.max(now);
            subscription.current_period_end = base + period;
            subscription.status = SubscriptionStatus::Active;
            subscription.cancel_at_period_end = false;
            subscription.canceled_at = None;
            self.store
                .update_subscription(subscription.clone())
                .await
                .map_err(GatewayError::from)?;
            return Ok(subscription);
        }

        let trial_end = spec
            .trial_days
            .map(|days| now + days as u64 * 86_400);
        let status = match trial_end {
            Some(end) if now < end => SubscriptionStatus::Trialing,
            _ => SubscriptionStatus::Active,
        };
        let subscription = Subscription {
            id: SubscriptionId::generate(),
            product_id: resource.id.clone(),
            holder,
            rail: Rail::Chain,
            billing_period: spec.billing_period,
            interval: spec.interval,
            status,
            current_period_start: now,
            current_period_end: now + period,
            trial_end,
            cancel_at_period_end: false,
            canceled_at: None,
            processor_subscription_id: None,
            metadata: serde_json::Value::Null,
        };
        self.store
            .insert_subscription(subscription.clone())
            .await
            .map_err(GatewayError::from)?;
        Ok(subscription)
    }

    /// Registers a card-rail subscription reported by the processor.
    #[tracing::instrument(skip(self, resource), fields(product = %resource.id))]
    pub async fn create_card(
        &self,
        customer_ref: &str,
        resource: &Resource,
        processor_subscription_id: &str,
        trial_end: Option<UnixTimestamp>,
        now: UnixTimestamp,
    ) -> Result<Subscription, GatewayError> {
        let spec = Self::sub_spec(resource)?;
        if let Some(existing) = self
            .store
            .find_by_processor_id(processor_subscription_id)
            .await
            .map_err(GatewayError::from)?
        {
            // Webhooks are at-least-once; the second delivery is a no-op.
            return Ok(existing);
        }
        let status = match trial_end {
            Some(end) if now < end => SubscriptionStatus::Trialing,
            _ => SubscriptionStatus::Active,
        };
        let subscription = Subscription {
            id: SubscriptionId::generate(),
            product_id: resource.id.clone(),
            holder: PayerRef::CustomerRef(customer_ref.to_string()),
            rail: Rail::Card,
            billing_period: spec.billing_period,
            interval: spec.interval,
            status,
            current_period_start: now,
            current_period_end: now + spec.period_seconds(),
            trial_end,
            cancel_at_period_end: false,
            canceled_at: None,
            processor_subscription_id: Some(processor_subscription_id.to_string()),
            metadata: serde_json::Value::Null,
        };
        self.store
            .insert_subscription(subscription.clone())
            .await
            .map_err(GatewayError::from)?;
        Ok(subscription)
    }

    async fn by_processor_id(
        &self,
        processor_subscription_id: &str,
    ) -> Result<Subscription, GatewayError> {
        self.store
            .find_by_processor_id(processor_subscription_id)
            .await
            .map_err(GatewayError::from)?
            .ok_or_else(|| {
                GatewayError::not_found(NotFoundKind::Subscription, processor_subscription_id)
            })
    }

    /// Renewal webhook: a paid invoice extends the period.
    pub async fn renew_card(
        &self,
        processor_subscription_id: &str,
        now: UnixTimestamp,
    ) -> Result<Subscription, GatewayError> {
        let mut subscription = self.by_processor_id(processor_subscription_id).await?;
        let period = subscription.billing_period.seconds() * subscription.interval as u64;
        subscription.current_period_start = now;
        subscription.current_period_end = subscription.current_period_end.max(now) + period;
        subscription.status = SubscriptionStatus::Active;
        self.store
            .update_subscription(subscription.clone())
            .await
            .map_err(GatewayError::from)?;
        Ok(subscription)
    }

    /// Payment-failed webhook.
    pub async fn card_payment_failed(
        &self,
        processor_subscription_id: &str,
    ) -> Result<Subscription, GatewayError> {
        let mut subscription = self.by_processor_id(processor_subscription_id).await?;
        subscription.status = SubscriptionStatus::PastDue;
        self.store
            .update_subscription(subscription.clone())
            .await
            .map_err(GatewayError::from)?;
        Ok(subscription)
    }

    /// Cancellation webhook or user-initiated immediate cancel.
    pub async fn card_canceled(
        &self,
        processor_subscription_id: &str,
        now: UnixTimestamp,
    ) -> Result<Subscription, GatewayError> {
        let subscription = self.by_processor_id(processor_subscription_id).await?;
        self.cancel(&subscription.id, true, now).await
    }

    async fn get(&self, id: &SubscriptionId) -> Result<Subscription, GatewayError> {
        self.store
            .get_subscription(id)
            .await
            .map_err(GatewayError::from)?
            .ok_or_else(|| GatewayError::not_found(NotFoundKind::Subscription, id.as_str()))
    }

    /// Cancels now, or flags cancellation at the period boundary.
    pub async fn cancel(
        &self,
        id: &SubscriptionId,
        immediate: bool,
        now: UnixTimestamp,
    ) -> Result<Subscription, GatewayError> {
        let mut subscription = self.get(id).await?;
        if subscription.status == SubscriptionStatus::Canceled {
            return Err(GatewayError::SubscriptionState(
                "already canceled".to_string(),
            ));
        }
        if immediate {
            subscription.status = SubscriptionStatus::Canceled;
            subscription.canceled_at = Some(now);
        } else {
            subscription.cancel_at_period_end = true;
        }
        self.store
            .update_subscription(subscription.clone())
            .await
            .map_err(GatewayError::from)?;
        Ok(subscription)
    }

    /// Undoes a pending cancel-at-period-end, only while the period is
    /// still running.
    pub async fn reactivate(
        &self,
        id: &SubscriptionId,
        now: UnixTimestamp,
    ) -> Result<Subscription, GatewayError> {
        let mut subscription = self.get(id).await?;
        if !subscription.cancel_at_period_end {
            return Err(GatewayError::SubscriptionState(
                "no pending cancellation to undo".to_string(),
            ));
        }
        if now >= subscription.current_period_end {
            return Err(GatewayError::SubscriptionState(
                "period already ended".to_string(),
            ));
        }
        subscription.cancel_at_period_end = false;
        self.store
            .update_subscription(subscription.clone())
            .await
            .map_err(GatewayError::from)?;
        Ok(subscription)
    }

    /// Moves the subscription to a new product, recording the previous one
    /// in metadata. Card rail requires the processor-side update to have
    /// happened first (the caller owns that ordering).
    pub async fn change(
        &self,
        id: &SubscriptionId,
        new_product: &Resource,
        now: UnixTimestamp,
    ) -> Result<Subscription, GatewayError> {
        Self::sub_spec(new_product)?;
        let mut subscription = self.get(id).await?;
        let previous = subscription.product_id.clone();
        let mut metadata = match subscription.metadata.take() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        metadata.insert(
            "previous_product_id".to_string(),
            serde_json::Value::String(previous.0),
        );
        metadata.insert(
            "product_changed_at".to_string(),
            serde_json::Value::String(now.to_string()),
        );
        subscription.metadata = serde_json::Value::Object(metadata);
        subscription.product_id = new_product.id.clone();
        self.store
            .update_subscription(subscription.clone())
            .await
            .map_err(GatewayError::from)?;
        Ok(subscription)
    }

    /// Access check: active-ish status and inside the period plus grace.
    pub async fn has_access(
        &self,
        holder: &PayerRef,
        product_id: &ResourceId,
        now: UnixTimestamp,
    ) -> Result<bool, GatewayError> {
        let Some(subscription) = self
            .store
            .find_by_holder_product(holder, product_id)
            .await
            .map_err(GatewayError::from)?
        else {
            return Ok(false);
        };
        Ok(Self::grants_access(&subscription, now, self.grace_seconds))
    }

    pub fn grace_seconds(&self) -> u64 {
        self.grace_seconds
    }

    pub fn grants_access(subscription: &Subscription, now: UnixTimestamp, grace: u64) -> bool {
        let status_ok = matches!(
            subscription.status,
            SubscriptionStatus::Active
                | SubscriptionStatus::Trialing
                | SubscriptionStatus::PastDue
        );
        status_ok && now < subscription.current_period_end + grace
    }

    pub async fn list_for_holder(
        &self,
        holder: &PayerRef,
    ) -> Result<Vec<Subscription>, GatewayError> {
        self.store
            .list_for_holder(holder)
            .await
            .map_err(GatewayError::from)
    }

    pub async fn status(&self, id: &SubscriptionId) -> Result<Subscription, GatewayError> {
        self.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BillingPeriod, SubSpec};
    use crate::ledger::memory::MemoryLedger;
    use crate::money::{AssetRef, Money};

    fn sub_resource(id: &str, period: BillingPeriod, interval: u32) -> Resource {
        Resource {
            id: ResourceId::from(id),
            description: "subscription".to_string(),
            fiat_price: Some(Money::new(AssetRef::new("USD", 2), 999)),
            crypto_price: Some(Money::new(AssetRef::new("USDC", 6), 9_990_000)),
            fiat_processor_price_id: Some("price_123".to_string()),
            recipient_token_account: None,
            memo_template: "pay:{resource}".to_string(),
            metadata: serde_json::Value::Null,
            subscription: Some(SubSpec {
                billing_period: period,
                interval,
                trial_days: None,
                processor_price_id: Some("price_123".to_string()),
            }),
        }
    }

    fn service() -> SubscriptionService {
        SubscriptionService::new(Arc::new(MemoryLedger::new()), 3_600)
    }

    #[tokio::test]
    async fn chain_create_then_renew_extends_from_later_of_now_and_end() {
        let service = service();
        let resource = sub_resource("pro", BillingPeriod::Month, 1);
        let month = 30 * 86_400;

        let created = service
            .create_or_renew_chain("wallet1", &resource, UnixTimestamp(1_000))
            .await
            .unwrap();
        assert_eq!(created.status, SubscriptionStatus::Active);
        assert_eq!(created.current_period_end, UnixTimestamp(1_000 + month));

        // Early renewal stacks onto the existing end.
        let renewed = service
            .create_or_renew_chain("wallet1", &resource, UnixTimestamp(2_000))
            .await
            .unwrap();
        assert_eq!(renewed.current_period_end, UnixTimestamp(1_000 + 2 * month));
        assert_eq!(renewed.id, created.id);

        // Late renewal restarts from now.
        let late_now = UnixTimestamp(1_000 + 3 * month);
        let renewed = service
            .create_or_renew_chain("wallet1", &resource, late_now)
            .await
            .unwrap();
        assert_eq!(renewed.current_period_end, late_now + month);
    }

    #[tokio::test]
    async fn non_subscription_product_is_rejected() {
        let service = service();
        let mut resource = sub_resource("oneoff", BillingPeriod::Month, 1);
        resource.subscription = None;
        let err = service
            .create_or_renew_chain("wallet1", &resource, UnixTimestamp(0))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SubscriptionState(_)));
    }

    #[tokio::test]
    async fn card_lifecycle_webhook_transitions() {
        let service = service();
        let resource = sub_resource("pro", BillingPeriod::Month, 1);
        let created = service
            .create_card("cus_1", &resource, "sub_proc_1", None, UnixTimestamp(0))
            .await
            .unwrap();
        assert_eq!(created.status, SubscriptionStatus::Active);
        assert_eq!(created.rail, Rail::Card);

        // Duplicate creation webhook is idempotent.
        let duplicate = service
            .create_card("cus_1", &resource, "sub_proc_1", None, UnixTimestamp(5))
            .await
            .unwrap();
        assert_eq!(duplicate.id, created.id);

        let failed = service.card_payment_failed("sub_proc_1").await.unwrap();
        assert_eq!(failed.status, SubscriptionStatus::PastDue);

        let renewed = service
            .renew_card("sub_proc_1", UnixTimestamp(100))
            .await
            .unwrap();
        assert_eq!(renewed.status, SubscriptionStatus::Active);

        let canceled = service
            .card_canceled("sub_proc_1", UnixTimestamp(200))
            .await
            .unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert_eq!(canceled.canceled_at, Some(UnixTimestamp(200)));
    }

    #[tokio::test]
    async fn trialing_when_trial_end_in_future() {
        let service = service();
        let resource = sub_resource("pro", BillingPeriod::Month, 1);
        let sub = service
            .create_card(
                "cus_1",
                &resource,
                "sub_proc_1",
                Some(UnixTimestamp(1_000)),
                UnixTimestamp(0),
            )
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
    }

    #[tokio::test]
    async fn cancel_at_period_end_and_reactivate() {
        let service = service();
        let resource = sub_resource("pro", BillingPeriod::Month, 1);
        let created = service
            .create_or_renew_chain("wallet1", &resource, UnixTimestamp(0))
            .await
            .unwrap();

        let flagged = service
            .cancel(&created.id, false, UnixTimestamp(10))
            .await
            .unwrap();
        assert!(flagged.cancel_at_period_end);
        assert_eq!(flagged.status, SubscriptionStatus::Active);

        let reactivated = service
            .reactivate(&created.id, UnixTimestamp(20))
            .await
            .unwrap();
        assert!(!reactivated.cancel_at_period_end);

        // Reactivation without a pending cancel fails.
        let err = service
            .reactivate(&created.id, UnixTimestamp(30))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SubscriptionState(_)));

        // Reactivation after the period end fails.
        service
            .cancel(&created.id, false, UnixTimestamp(40))
            .await
            .unwrap();
        let err = service
            .reactivate(&created.id, created.current_period_end)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SubscriptionState(_)));
    }

    #[tokio::test]
    async fn change_records_previous_product() {
        let service = service();
        let old = sub_resource("basic", BillingPeriod::Month, 1);
        let new = sub_resource("pro", BillingPeriod::Month, 1);
        let created = service
            .create_or_renew_chain("wallet1", &old, UnixTimestamp(0))
            .await
            .unwrap();
        let changed = service
            .change(&created.id, &new, UnixTimestamp(50))
            .await
            .unwrap();
        assert_eq!(changed.product_id, ResourceId::from("pro"));
        assert_eq!(changed.metadata["previous_product_id"], "basic");
        assert_eq!(changed.metadata["product_changed_at"], "50");
    }

    #[tokio::test]
    async fn has_access_respects_status_and_grace() {
        let service = service();
        let resource = sub_resource("pro", BillingPeriod::Day, 1);
        let holder = PayerRef::Wallet("wallet1".to_string());
        let created = service
            .create_or_renew_chain("wallet1", &resource, UnixTimestamp(0))
            .await
            .unwrap();
        let end = created.current_period_end;

        // Inside the period.
        assert!(service.has_access(&holder, &resource.id, UnixTimestamp(10)).await.unwrap());
        // Inside grace (3600s configured).
        assert!(service.has_access(&holder, &resource.id, end + 3_599).await.unwrap());
        // At the grace boundary access ends.
        assert!(!service.has_access(&holder, &resource.id, end + 3_600).await.unwrap());

        // Canceled kills access regardless of period.
        service.cancel(&created.id, true, UnixTimestamp(20)).await.unwrap();
        assert!(!service.has_access(&holder, &resource.id, UnixTimestamp(30)).await.unwrap());
    }

    #[tokio::test]
    async fn past_due_still_grants_access() {
        let service = service();
        let resource = sub_resource("pro", BillingPeriod::Month, 1);
        service
            .create_card("cus_1", &resource, "sub_proc_1", None, UnixTimestamp(0))
            .await
            .unwrap();
        service.card_payment_failed("sub_proc_1").await.unwrap();
        let holder = PayerRef::CustomerRef("cus_1".to_string());
        assert!(service.has_access(&holder, &resource.id, UnixTimestamp(100)).await.unwrap());
    }
}
