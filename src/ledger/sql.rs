//! Postgres ledger backend.
//!
//! All operations take the pool held by [`SqlLedger`] and operate on four
//! tables: `payments`, `refunds`, `subscriptions`, `coupons`. Concurrency
//! control lives in the statements: the unique index on
//! `payments.signature`, the partial unique index on open refunds, the
//! status predicate in the refund UPDATE, and the usage predicate in the
//! coupon UPDATE. Rows affected decide who won a race.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::catalog::{BillingPeriod, Rail, RefundId, ResourceId};
use crate::coupon::{Coupon, CouponCode};
use crate::money::{AssetRef, Money};
use crate::timestamp::UnixTimestamp;

use super::{
    CouponStore, LedgerError, PayerRef, PaymentRecord, PaymentStore, RefundRequest, RefundStatus,
    RefundStore, SettlementSignature, Subscription, SubscriptionId, SubscriptionStatus,
    SubscriptionStore, payer_columns, payer_from_columns,
};

/// Schema applied idempotently at startup.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS payments (
    signature       TEXT PRIMARY KEY,
    resource_id     TEXT NOT NULL,
    rail            TEXT NOT NULL,
    payer_kind      TEXT NOT NULL,
    payer_ref       TEXT NOT NULL,
    asset_code      TEXT NOT NULL,
    asset_decimals  SMALLINT NOT NULL,
    amount_atomic   BIGINT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    metadata        JSONB NOT NULL DEFAULT 'null'
);

CREATE TABLE IF NOT EXISTS refunds (
    id                  TEXT PRIMARY KEY,
    original_signature  TEXT NOT NULL,
    recipient           TEXT NOT NULL,
    asset_code          TEXT NOT NULL,
    asset_decimals      SMALLINT NOT NULL,
    amount_atomic       BIGINT NOT NULL,
    token               TEXT NOT NULL,
    reason              TEXT,
    status              TEXT NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    settled_signature   TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS refunds_open_per_signature
    ON refunds (original_signature)
    WHERE status <> 'denied';

CREATE TABLE IF NOT EXISTS subscriptions (
    id                          TEXT PRIMARY KEY,
    product_id                  TEXT NOT NULL,
    holder_kind                 TEXT NOT NULL,
    holder_ref                  TEXT NOT NULL,
    rail                        TEXT NOT NULL,
    billing_period              TEXT NOT NULL,
    billing_interval            INTEGER NOT NULL,
    status                      TEXT NOT NULL,
    current_period_start        BIGINT NOT NULL,
    current_period_end          BIGINT NOT NULL,
    trial_end                   BIGINT,
    cancel_at_period_end        BOOLEAN NOT NULL DEFAULT FALSE,
    canceled_at                 BIGINT,
    processor_subscription_id   TEXT,
    metadata                    JSONB NOT NULL DEFAULT 'null'
);

CREATE INDEX IF NOT EXISTS subscriptions_holder
    ON subscriptions (holder_kind, holder_ref, product_id);

CREATE TABLE IF NOT EXISTS coupons (
    code        TEXT PRIMARY KEY,
    definition  JSONB NOT NULL,
    usage_limit INTEGER,
    usage_count INTEGER NOT NULL DEFAULT 0
);
"#;

pub struct SqlLedger {
    pool: PgPool,
}

impl SqlLedger {
    /// Connects to Postgres and applies the schema.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(storage)?;
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(storage)?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Seeds the coupon table from configuration, preserving existing usage
    /// counters.
    pub async fn seed_coupons(&self, coupons: &[Coupon]) -> Result<(), LedgerError> {
        for coupon in coupons {
            let definition = serde_json::to_value(coupon).map_err(|e| {
                LedgerError::Storage(format!("coupon serialization failed: {e}"))
            })?;
            sqlx::query(
                "INSERT INTO coupons (code, definition, usage_limit, usage_count)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (code) DO UPDATE SET
                    definition = EXCLUDED.definition,
                    usage_limit = EXCLUDED.usage_limit",
            )
            .bind(coupon.code.as_str())
            .bind(&definition)
            .bind(coupon.usage_limit.map(|l| l as i32))
            .bind(coupon.usage_count as i32)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        }
        Ok(())
    }
}

fn storage(error: sqlx::Error) -> LedgerError {
    LedgerError::Storage(error.to_string())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[async_trait]
impl PaymentStore for SqlLedger {
    async fn insert_payment(&self, record: PaymentRecord) -> Result<(), LedgerError> {
        let (payer_kind, payer_ref) = payer_columns(&record.payer);
        let result = sqlx::query(
            "INSERT INTO payments (signature, resource_id, rail, payer_kind, payer_ref,
             asset_code, asset_decimals, amount_atomic, created_at, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.signature.as_str())
        .bind(record.resource_id.as_str())
        .bind(record.rail.to_string())
        .bind(payer_kind)
        .bind(payer_ref)
        .bind(&record.amount.asset.code)
        .bind(record.amount.asset.decimals as i16)
        .bind(record.amount.atomic)
        .bind(record.created_at)
        .bind(&record.metadata)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(LedgerError::SignatureReused(record.signature))
            }
            Err(e) => Err(storage(e)),
        }
    }

    async fn get_payment(
        &self,
        signature: &SettlementSignature,
    ) -> Result<Option<PaymentRecord>, LedgerError> {
        let row = sqlx::query_as::<_, PaymentRow>(
            "SELECT signature, resource_id, rail, payer_kind, payer_ref,
             asset_code, asset_decimals, amount_atomic, created_at, metadata
             FROM payments WHERE signature = $1",
        )
        .bind(signature.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(PaymentRow::into_record))
    }
}

#[async_trait]
impl RefundStore for SqlLedger {
    async fn insert_refund(&self, refund: RefundRequest) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "INSERT INTO refunds (id, original_signature, recipient, asset_code,
             asset_decimals, amount_atomic, token, reason, status, created_at, settled_signature)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(refund.id.as_str())
        .bind(refund.original_signature.as_str())
        .bind(&refund.recipient)
        .bind(&refund.amount.asset.code)
        .bind(refund.amount.asset.decimals as i16)
        .bind(refund.amount.atomic)
        .bind(&refund.token)
        .bind(&refund.reason)
        .bind(refund.status.to_string())
        .bind(refund.created_at)
        .bind(refund.settled_signature.as_ref().map(|s| s.as_str().to_string()))
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(LedgerError::DuplicateRefund(refund.original_signature))
            }
            Err(e) => Err(storage(e)),
        }
    }

    async fn get_refund(&self, id: &RefundId) -> Result<Option<RefundRequest>, LedgerError> {
        let row = sqlx::query_as::<_, RefundRow>(
            "SELECT id, original_signature, recipient, asset_code, asset_decimals,
             amount_atomic, token, reason, status, created_at, settled_signature
             FROM refunds WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(RefundRow::into_record))
    }

    async fn transition_refund(
        &self,
        id: &RefundId,
        expected: RefundStatus,
        next: RefundStatus,
        settled_signature: Option<SettlementSignature>,
    ) -> Result<RefundRequest, LedgerError> {
        let row = sqlx::query_as::<_, RefundRow>(
            "UPDATE refunds
             SET status = $3,
                 settled_signature = COALESCE($4, settled_signature)
             WHERE id = $1 AND status = $2
             RETURNING id, original_signature, recipient, asset_code, asset_decimals,
                       amount_atomic, token, reason, status, created_at, settled_signature",
        )
        .bind(id.as_str())
        .bind(expected.to_string())
        .bind(next.to_string())
        .bind(settled_signature.as_ref().map(|s| s.as_str().to_string()))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        match row {
            Some(row) => Ok(row.into_record()),
            None => {
                // Distinguish a lost race from a missing row.
                let current = self.get_refund(id).await?;
                match current {
                    Some(refund) => Err(LedgerError::RefundTransition {
                        id: id.clone(),
                        expected,
                        actual: refund.status,
                    }),
                    None => Err(LedgerError::NotFound(id.to_string())),
                }
            }
        }
    }

    async fn list_pending_refunds(&self) -> Result<Vec<RefundRequest>, LedgerError> {
        let rows = sqlx::query_as::<_, RefundRow>(
            "SELECT id, original_signature, recipient, asset_code, asset_decimals,
             amount_atomic, token, reason, status, created_at, settled_signature
             FROM refunds WHERE status = 'pending' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(RefundRow::into_record).collect())
    }
}

#[async_trait]
impl SubscriptionStore for SqlLedger {
    async fn insert_subscription(&self, subscription: Subscription) -> Result<(), LedgerError> {
        insert_subscription(&self.pool, &subscription).await
    }

    async fn update_subscription(&self, subscription: Subscription) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET
                product_id = $2,
                status = $3,
                current_period_start = $4,
                current_period_end = $5,
                trial_end = $6,
                cancel_at_period_end = $7,
                canceled_at = $8,
                processor_subscription_id = $9,
                metadata = $10
             WHERE id = $1",
        )
        .bind(subscription.id.as_str())
        .bind(subscription.product_id.as_str())
        .bind(subscription.status.to_string())
        .bind(subscription.current_period_start.seconds_since_epoch() as i64)
        .bind(subscription.current_period_end.seconds_since_epoch() as i64)
        .bind(subscription.trial_end.map(|t| t.seconds_since_epoch() as i64))
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.canceled_at.map(|t| t.seconds_since_epoch() as i64))
        .bind(&subscription.processor_subscription_id)
        .bind(&subscription.metadata)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(subscription.id.to_string()));
        }
        Ok(())
    }

    async fn get_subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, LedgerError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "{SUBSCRIPTION_SELECT} WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(SubscriptionRow::into_record))
    }

    async fn find_by_holder_product(
        &self,
        holder: &PayerRef,
        product_id: &ResourceId,
    ) -> Result<Option<Subscription>, LedgerError> {
        let (holder_kind, holder_ref) = payer_columns(holder);
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "{SUBSCRIPTION_SELECT} WHERE holder_kind = $1 AND holder_ref = $2 AND product_id = $3"
        ))
        .bind(holder_kind)
        .bind(holder_ref)
        .bind(product_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(SubscriptionRow::into_record))
    }

    async fn find_by_processor_id(
        &self,
        processor_subscription_id: &str,
    ) -> Result<Option<Subscription>, LedgerError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "{SUBSCRIPTION_SELECT} WHERE processor_subscription_id = $1"
        ))
        .bind(processor_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        Ok(row.map(SubscriptionRow::into_record))
    }

    async fn list_for_holder(&self, holder: &PayerRef) -> Result<Vec<Subscription>, LedgerError> {
        let (holder_kind, holder_ref) = payer_columns(holder);
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "{SUBSCRIPTION_SELECT} WHERE holder_kind = $1 AND holder_ref = $2"
        ))
        .bind(holder_kind)
        .bind(holder_ref)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(SubscriptionRow::into_record).collect())
    }
}

#[async_trait]
impl CouponStore for SqlLedger {
    async fn list_coupons(&self) -> Result<Vec<Coupon>, LedgerError> {
        let rows = sqlx::query_as::<_, CouponRow>(
            "SELECT code, definition, usage_limit, usage_count FROM coupons ORDER BY code",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.into_iter().map(CouponRow::into_coupon).collect()
    }

    async fn get_coupon(&self, code: &CouponCode) -> Result<Option<Coupon>, LedgerError> {
        let row = sqlx::query_as::<_, CouponRow>(
            "SELECT code, definition, usage_limit, usage_count FROM coupons WHERE code = $1",
        )
        .bind(code.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.map(CouponRow::into_coupon).transpose()
    }

    async fn increment_coupon_usage(&self, code: &CouponCode) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE coupons
             SET usage_count = usage_count + 1
             WHERE code = $1 AND (usage_limit IS NULL OR usage_count < usage_limit)",
        )
        .bind(code.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_coupon(code).await? {
            Some(_) => Err(LedgerError::CouponExhausted(code.clone())),
            None => Err(LedgerError::NotFound(code.to_string())),
        }
    }
}

const SUBSCRIPTION_SELECT: &str = "SELECT id, product_id, holder_kind, holder_ref, rail,
    billing_period, billing_interval, status, current_period_start, current_period_end,
    trial_end, cancel_at_period_end, canceled_at, processor_subscription_id, metadata
    FROM subscriptions";

async fn insert_subscription(
    pool: &PgPool,
    subscription: &Subscription,
) -> Result<(), LedgerError> {
    let (holder_kind, holder_ref) = payer_columns(&subscription.holder);
    let billing_period = serde_json::to_value(subscription.billing_period)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "month".to_string());
    sqlx::query(
        "INSERT INTO subscriptions (id, product_id, holder_kind, holder_ref, rail,
         billing_period, billing_interval, status, current_period_start, current_period_end,
         trial_end, cancel_at_period_end, canceled_at, processor_subscription_id, metadata)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
    )
    .bind(subscription.id.as_str())
    .bind(subscription.product_id.as_str())
    .bind(holder_kind)
    .bind(holder_ref)
    .bind(subscription.rail.to_string())
    .bind(billing_period)
    .bind(subscription.interval as i32)
    .bind(subscription.status.to_string())
    .bind(subscription.current_period_start.seconds_since_epoch() as i64)
    .bind(subscription.current_period_end.seconds_since_epoch() as i64)
    .bind(subscription.trial_end.map(|t| t.seconds_since_epoch() as i64))
    .bind(subscription.cancel_at_period_end)
    .bind(subscription.canceled_at.map(|t| t.seconds_since_epoch() as i64))
    .bind(&subscription.processor_subscription_id)
    .bind(&subscription.metadata)
    .execute(pool)
    .await
    .map_err(storage)?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct PaymentRow {
    signature: String,
    resource_id: String,
    rail: String,
    payer_kind: String,
    payer_ref: String,
    asset_code: String,
    asset_decimals: i16,
    amount_atomic: i64,
    created_at: DateTime<Utc>,
    metadata: serde_json::Value,
}

impl PaymentRow {
    fn into_record(self) -> PaymentRecord {
        PaymentRecord {
            signature: SettlementSignature(self.signature),
            resource_id: ResourceId(self.resource_id),
            rail: parse_rail(&self.rail),
            payer: payer_from_columns(&self.payer_kind, self.payer_ref),
            amount: Money::new(
                AssetRef::new(self.asset_code, self.asset_decimals as u8),
                self.amount_atomic,
            ),
            created_at: self.created_at,
            metadata: self.metadata,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: String,
    original_signature: String,
    recipient: String,
    asset_code: String,
    asset_decimals: i16,
    amount_atomic: i64,
    token: String,
    reason: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    settled_signature: Option<String>,
}

impl RefundRow {
    fn into_record(self) -> RefundRequest {
        RefundRequest {
            id: RefundId(self.id),
            original_signature: SettlementSignature(self.original_signature),
            recipient: self.recipient,
            amount: Money::new(
                AssetRef::new(self.asset_code, self.asset_decimals as u8),
                self.amount_atomic,
            ),
            token: self.token,
            reason: self.reason,
            status: parse_refund_status(&self.status),
            created_at: self.created_at,
            settled_signature: self.settled_signature.map(SettlementSignature),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    product_id: String,
    holder_kind: String,
    holder_ref: String,
    rail: String,
    billing_period: String,
    billing_interval: i32,
    status: String,
    current_period_start: i64,
    current_period_end: i64,
    trial_end: Option<i64>,
    cancel_at_period_end: bool,
    canceled_at: Option<i64>,
    processor_subscription_id: Option<String>,
    metadata: serde_json::Value,
}

impl SubscriptionRow {
    fn into_record(self) -> Subscription {
        Subscription {
            id: SubscriptionId(self.id),
            product_id: ResourceId(self.product_id),
            holder: payer_from_columns(&self.holder_kind, self.holder_ref),
            rail: parse_rail(&self.rail),
            billing_period: parse_billing_period(&self.billing_period),
            interval: self.billing_interval.max(1) as u32,
            status: parse_subscription_status(&self.status),
            current_period_start: UnixTimestamp(self.current_period_start.max(0) as u64),
            current_period_end: UnixTimestamp(self.current_period_end.max(0) as u64),
            trial_end: self.trial_end.map(|t| UnixTimestamp(t.max(0) as u64)),
            cancel_at_period_end: self.cancel_at_period_end,
            canceled_at: self.canceled_at.map(|t| UnixTimestamp(t.max(0) as u64)),
            processor_subscription_id: self.processor_subscription_id,
            metadata: self.metadata,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CouponRow {
    code: String,
    definition: serde_json::Value,
    usage_limit: Option<i32>,
    usage_count: i32,
}

impl CouponRow {
    fn into_coupon(self) -> Result<Coupon, LedgerError> {
        let mut coupon: Coupon = serde_json::from_value(self.definition).map_err(|e| {
            LedgerError::Storage(format!("coupon {} failed to decode: {e}", self.code))
        })?;
        // Counters live in their own columns so increments never rewrite
        // the definition blob.
        coupon.usage_limit = self.usage_limit.map(|l| l.max(0) as u32);
        coupon.usage_count = self.usage_count.max(0) as u32;
        Ok(coupon)
    }
}

fn parse_rail(value: &str) -> Rail {
    match value {
        "card" => Rail::Card,
        _ => Rail::Chain,
    }
}

fn parse_refund_status(value: &str) -> RefundStatus {
    match value {
        "pending" => RefundStatus::Pending,
        "approved" => RefundStatus::Approved,
        "denied" => RefundStatus::Denied,
        _ => RefundStatus::Settled,
    }
}

fn parse_subscription_status(value: &str) -> SubscriptionStatus {
    match value {
        "trialing" => SubscriptionStatus::Trialing,
        "active" => SubscriptionStatus::Active,
        "past_due" => SubscriptionStatus::PastDue,
        "canceled" => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::Expired,
    }
}

fn parse_billing_period(value: &str) -> BillingPeriod {
    match value {
        "day" => BillingPeriod::Day,
        "week" => BillingPeriod::Week,
        "year" => BillingPeriod::Year,
        _ => BillingPeriod::Month,
    }
}
