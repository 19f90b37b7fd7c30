//! The payment authorization pipeline.
//!
//! Single write path to the payment ledger. Each request walks
//! `Received → Parsed → Routed → Verified → Settled → SideEffectsApplied →
//! Responded`; every arrow has a failure mode and the ordering guarantees
//! are load-bearing:
//!
//! - the cryptographic/on-chain verification happens before any state
//!   mutation,
//! - the payment record lands before coupon counters and subscription
//!   extensions move, so a side-effect failure can never lose a payment,
//! - replay protection is the ledger's unique signature constraint - the
//!   loser of a concurrent insert race is told `SignatureReused`, same as a
//!   deliberate replay.
//!
//! Card settlements are written by the webhook handler, not here; for the
//! card rail this pipeline verifies presence rather than inserting.

use chrono::Utc;
use std::sync::Arc;

use crate::catalog::{CartId, Catalog, Rail, RefundId, ResourceId};
use crate::coupon::CouponCode;
use crate::error::GatewayError;
use crate::ledger::{
    CouponStore, Ledger, PaymentRecord, PaymentStore, RefundRequest, RefundStatus,
};
use crate::money::Money;
use crate::quote::QuoteGenerator;
use crate::rail::{
    PaymentProof, RailRegistry, ResourceType, Settlement, SettlementReceipt, VerifyExpectation,
};
use crate::refund::RefundService;
use crate::subscription::SubscriptionService;
use crate::timestamp::UnixTimestamp;

enum Route {
    Regular {
        expectation: VerifyExpectation,
        coupons: Vec<CouponCode>,
        is_subscription: bool,
    },
    Cart {
        cart_id: CartId,
        expectation: VerifyExpectation,
        coupons: Vec<CouponCode>,
    },
    Refund {
        refund: RefundRequest,
        expectation: VerifyExpectation,
    },
}

pub struct AuthorizationPipeline {
    rails: RailRegistry,
    ledger: Arc<dyn Ledger>,
    quotes: Arc<QuoteGenerator>,
    refunds: Arc<RefundService>,
    subscriptions: Arc<SubscriptionService>,
    catalog: Arc<Catalog>,
}

impl AuthorizationPipeline {
    pub fn new(
        rails: RailRegistry,
        ledger: Arc<dyn Ledger>,
        quotes: Arc<QuoteGenerator>,
        refunds: Arc<RefundService>,
        subscriptions: Arc<SubscriptionService>,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            rails,
            ledger,
            quotes,
            refunds,
            subscriptions,
            catalog,
        }
    }

    /// Routes a parsed proof: consistency between the id prefix and the
    /// declared resource type, then the expectation the settlement must meet.
    async fn route(
        &self,
        proof: &PaymentProof,
        rail: Rail,
        now: UnixTimestamp,
    ) -> Result<Route, GatewayError> {
        let subject = proof.resource_id();
        match proof.payload.resource_type {
            ResourceType::Regular => {
                if subject.is_cart() || subject.is_refund() {
                    return Err(GatewayError::invalid_field(
                        "resource_type",
                        "prefixed id declared as regular",
                    ));
                }
                let manual = proof
                    .payload
                    .metadata
                    .coupon_code
                    .as_deref()
                    .map(CouponCode::from);
                let quote = self
                    .quotes
                    .quote_resource(&subject, rail, manual.as_ref(), now)
                    .await?;
                let resource = self.catalog.get(&subject);
                Ok(Route::Regular {
                    expectation: VerifyExpectation {
                        subject,
                        amount: quote.amount,
                        pay_to: quote.pay_to,
                        memo: quote.memo,
                        exact_amount: false,
                    },
                    coupons: quote.coupons_applied,
                    is_subscription: resource.is_some_and(|r| r.is_subscription()),
                })
            }
            ResourceType::Cart => {
                if !subject.is_cart() {
                    return Err(GatewayError::invalid_field(
                        "resource_type",
                        "cart type requires a cart_ id",
                    ));
                }
                let cart_id = CartId(subject.0.clone());
                // The stored quote is authoritative; coupons are never
                // re-applied here.
                let stored = self.quotes.stored_cart(&cart_id, now)?;
                Ok(Route::Cart {
                    cart_id,
                    coupons: stored.quote.coupons_applied.clone(),
                    expectation: VerifyExpectation {
                        subject,
                        amount: stored.quote.amount,
                        pay_to: stored.quote.pay_to,
                        memo: stored.quote.memo,
                        exact_amount: false,
                    },
                })
            }
            ResourceType::Refund => {
                if !subject.is_refund() {
                    return Err(GatewayError::invalid_field(
                        "resource_type",
                        "refund type requires a refund_ id",
                    ));
                }
                if rail != Rail::Chain {
                    return Err(GatewayError::Unsupported(
                        "refunds settle on the chain rail".to_string(),
                    ));
                }
                let refund = self.refunds.load(&RefundId(subject.0.clone())).await?;
                match refund.status {
                    RefundStatus::Approved => {}
                    RefundStatus::Settled | RefundStatus::Denied => {
                        return Err(GatewayError::RefundAlreadyProcessed);
                    }
                    RefundStatus::Pending => {
                        return Err(GatewayError::invalid_field(
                            "refund",
                            "refund is not approved",
                        ));
                    }
                }
                let expectation = self.refunds.expectation_for(&refund)?;
                Ok(Route::Refund {
                    refund,
                    expectation,
                })
            }
        }
    }

    /// Settles a verified payment into the ledger (chain rail only - card
    /// records were written by the webhook).
    async fn settle_payment(
        &self,
        rail: Rail,
        subject: &ResourceId,
        expectation: &VerifyExpectation,
        settlement: &Settlement,
        coupons: &[CouponCode],
    ) -> Result<(), GatewayError> {
        if rail == Rail::Card {
            return Ok(());
        }
        if self
            .ledger
            .get_payment(&settlement.signature)
            .await
            .map_err(GatewayError::from)?
            .is_some()
        {
            return Err(GatewayError::SignatureReused);
        }
        let record = PaymentRecord {
            signature: settlement.signature.clone(),
            resource_id: subject.clone(),
            rail,
            payer: settlement.payer.clone(),
            amount: Money::new(expectation.amount.asset.clone(), settlement.amount_atomic),
            created_at: Utc::now(),
            metadata: serde_json::json!({
                "coupons": coupons.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
            }),
        };
        // The unique constraint is the replay gate: a concurrent duplicate
        // fails here, after verification but before any side effect.
        self.ledger
            .insert_payment(record)
            .await
            .map_err(GatewayError::from)
    }

    /// Post-settlement effects. Failures are logged and swallowed: the
    /// payment is recorded, downstream state is at-least-once.
    async fn apply_side_effects(
        &self,
        rail: Rail,
        route: &Route,
        settlement: &Settlement,
        now: UnixTimestamp,
    ) {
        // Card-rail coupon usage is counted by the webhook handler when the
        // session settles; counting here would double it.
        if rail == Rail::Chain {
            let coupons: &[CouponCode] = match route {
                Route::Regular { coupons, .. } | Route::Cart { coupons, .. } => coupons,
                Route::Refund { .. } => &[],
            };
            for code in coupons {
                if let Err(error) = self.ledger.increment_coupon_usage(code).await {
                    tracing::warn!(code = %code, %error, "coupon usage increment failed");
                }
            }
        }
        match route {
            Route::Cart { cart_id, .. } => self.quotes.mark_cart_paid(cart_id),
            Route::Regular {
                expectation,
                is_subscription: true,
                ..
            } if rail == Rail::Chain => {
                if let crate::ledger::PayerRef::Wallet(wallet) = &settlement.payer
                    && let Some(resource) = self.catalog.get(&expectation.subject)
                {
                    if let Err(error) = self
                        .subscriptions
                        .create_or_renew_chain(wallet, &resource, now)
                        .await
                    {
                        tracing::warn!(%error, "subscription extension failed");
                    }
                }
            }
            _ => {}
        }
    }

    /// Runs the full state machine for one `X-PAYMENT` header.
    #[tracing::instrument(skip_all)]
    pub async fn verify(
        &self,
        payment_header: &str,
        now: UnixTimestamp,
    ) -> Result<SettlementReceipt, GatewayError> {
        // Received → Parsed
        let proof = PaymentProof::decode(payment_header)?;
        let rail = proof.rail();
        let subject = proof.resource_id();

        // Parsed → Routed
        let route = self.route(&proof, rail, now).await?;

        // Routed → Verified
        let expectation = match &route {
            Route::Regular { expectation, .. }
            | Route::Cart { expectation, .. }
            | Route::Refund { expectation, .. } => expectation,
        };
        let verifier = self.rails.verifier(rail)?;
        let settlement = verifier.verify(&proof, expectation).await?;

        // Verified → Settled
        match &route {
            Route::Refund { refund, .. } => {
                self.refunds
                    .settle(&refund.id, settlement.signature.clone())
                    .await?;
            }
            Route::Regular { coupons, .. } | Route::Cart { coupons, .. } => {
                self.settle_payment(rail, &subject, expectation, &settlement, coupons)
                    .await?;
            }
        }

        // Settled → SideEffectsApplied (never fatal)
        self.apply_side_effects(rail, &route, &settlement, now).await;

        // → Responded
        Ok(SettlementReceipt {
            success: true,
            rail,
            resource: subject.0,
            transaction: match rail {
                Rail::Chain => Some(settlement.signature.0),
                Rail::Card => None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CartItem, Resource};
    use crate::coupon::{Coupon, CouponScope, Discount, MethodScope, Percentage, Stage};
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::{CouponStore, PayerRef, PaymentStore, SettlementSignature};
    use crate::money::AssetRef;
    use crate::nonce::NonceStore;
    use crate::quote::ChainPricing;
    use crate::rail::chain::rpc::ChainRpc;
    use crate::rail::chain::test_support::{MockRpc, transfer_transaction};
    use crate::rail::chain::ChainVerifier;
    use crate::rail::{ProofMetadata, ProofPayload, RailCapabilities};
    use crate::util::Base64Bytes;
    use solana_pubkey::Pubkey;
    use std::str::FromStr;

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

    fn coupon(code: &str, bps: u32, stage: Stage, limit: Option<u32>) -> Coupon {
        Coupon {
            code: CouponCode::from(code),
            discount: Discount::Percentage(Percentage::from_bps(bps).unwrap()),
            scope: CouponScope::All,
            product_ids: vec![],
            payment_method: MethodScope::Any,
            applies_at: stage,
            auto_apply: true,
            expires_at: None,
            usage_limit: limit,
            usage_count: 0,
            metadata: serde_json::Value::Null,
        }
    }

    struct Fixture {
        pipeline: AuthorizationPipeline,
        ledger: Arc<MemoryLedger>,
        rpc: Arc<MockRpc>,
        quotes: Arc<QuoteGenerator>,
        refunds: Arc<RefundService>,
        mint: Pubkey,
        pay_to: Pubkey,
        payer: Pubkey,
    }

    fn fixture(resources: Vec<Resource>, coupons: Vec<Coupon>) -> Fixture {
        let ledger = Arc::new(MemoryLedger::with_coupons(coupons));
        let rpc = Arc::new(MockRpc::new());
        let mint = Pubkey::new_unique();
        let pay_to = Pubkey::new_unique();
        let catalog = Arc::new(Catalog::new(resources));
        let quotes = Arc::new(QuoteGenerator::new(
            Arc::clone(&catalog),
            Arc::clone(&ledger) as Arc<dyn CouponStore>,
            ChainPricing {
                network: "solana".to_string(),
                mint: mint.to_string(),
                default_pay_to: pay_to.to_string(),
                quote_ttl_seconds: 300,
            },
        ));
        let nonces = Arc::new(NonceStore::new(300));
        let refunds = Arc::new(RefundService::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            nonces,
            "admin".to_string(),
            mint.to_string(),
        ));
        let subscriptions = Arc::new(SubscriptionService::new(
            Arc::clone(&ledger) as Arc<dyn crate::ledger::SubscriptionStore>,
            3_600,
        ));
        let verifier = Arc::new(ChainVerifier::new(
            Arc::clone(&rpc) as Arc<dyn ChainRpc>,
            mint,
        ));
        let rails = RailRegistry::new().register(
            Rail::Chain,
            RailCapabilities {
                verifier,
                gasless: None,
                health: None,
            },
        );
        let pipeline = AuthorizationPipeline::new(
            rails,
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            Arc::clone(&quotes),
            Arc::clone(&refunds),
            subscriptions,
            catalog,
        );
        Fixture {
            pipeline,
            ledger,
            rpc,
            quotes,
            refunds,
            mint,
            pay_to,
            payer: Pubkey::new_unique(),
        }
    }

    fn proof_header(resource: &str, resource_type: ResourceType, signature: &str) -> String {
        let proof = PaymentProof {
            payload: ProofPayload {
                resource: resource.to_string(),
                resource_type,
                signature: Some(signature.to_string()),
                transaction: None,
                metadata: ProofMetadata::default(),
            },
        };
        Base64Bytes::encode(serde_json::to_vec(&proof).unwrap()).to_string()
    }

    #[tokio::test]
    async fn regular_payment_settles_and_counts_coupons() {
        // $1.00 resource with a 20% catalog coupon capped at 2 uses.
        let f = fixture(
            vec![resource("x", 1_000_000)],
            vec![coupon("TWENTY", 2_000, Stage::Catalog, Some(2))],
        );
        let tx = transfer_transaction(f.mint, f.pay_to, f.payer, 800_000, "pay:x");
        let signature = f.rpc.seed_transaction(tx, true);
        let header = proof_header("x", ResourceType::Regular, &signature.to_string());

        let receipt = f.pipeline.verify(&header, UnixTimestamp(0)).await.unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.transaction.as_deref(), Some(signature.to_string().as_str()));

        let record = f
            .ledger
            .get_payment(&SettlementSignature(signature.to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.resource_id, ResourceId::from("x"));
        assert_eq!(record.amount.atomic, 800_000);
        assert_eq!(record.payer, PayerRef::Wallet(f.payer.to_string()));

        let coupon = f
            .ledger
            .get_coupon(&CouponCode::from("TWENTY"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coupon.usage_count, 1);
    }

    #[tokio::test]
    async fn replayed_proof_reports_signature_reused() {
        let f = fixture(vec![resource("x", 1_000_000)], vec![]);
        let tx = transfer_transaction(f.mint, f.pay_to, f.payer, 1_000_000, "pay:x");
        let signature = f.rpc.seed_transaction(tx, true);
        let header = proof_header("x", ResourceType::Regular, &signature.to_string());

        f.pipeline.verify(&header, UnixTimestamp(0)).await.unwrap();
        let err = f.pipeline.verify(&header, UnixTimestamp(1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::SignatureReused));
    }

    #[tokio::test]
    async fn cart_payment_uses_stored_quote_and_marks_paid() {
        let f = fixture(
            vec![resource("a", 1_000_000), resource("b", 500_000)],
            vec![coupon("TEN", 1_000, Stage::Checkout, None)],
        );
        let (cart, quote) = f
            .quotes
            .quote_cart(
                vec![
                    CartItem {
                        resource_id: ResourceId::from("a"),
                        quantity: 1,
                    },
                    CartItem {
                        resource_id: ResourceId::from("b"),
                        quantity: 2,
                    },
                ],
                Rail::Chain,
                None,
                UnixTimestamp(0),
            )
            .await
            .unwrap();
        assert_eq!(quote.amount.atomic, 1_800_000);

        let tx = transfer_transaction(
            f.mint,
            f.pay_to,
            f.payer,
            1_800_000,
            &format!("pay:{}", cart.id),
        );
        let signature = f.rpc.seed_transaction(tx, true);
        let header = proof_header(cart.id.as_str(), ResourceType::Cart, &signature.to_string());
        let receipt = f.pipeline.verify(&header, UnixTimestamp(10)).await.unwrap();
        assert!(receipt.success);

        // The cart cannot be paid twice.
        let tx2 = transfer_transaction(
            f.mint,
            f.pay_to,
            f.payer,
            1_800_000,
            &format!("pay:{}", cart.id),
        );
        let signature2 = f.rpc.seed_transaction(tx2, true);
        let header2 =
            proof_header(cart.id.as_str(), ResourceType::Cart, &signature2.to_string());
        let err = f.pipeline.verify(&header2, UnixTimestamp(11)).await.unwrap_err();
        assert!(matches!(err, GatewayError::CartAlreadyPaid));
    }

    #[tokio::test]
    async fn expired_cart_quote_rejected_at_verify() {
        let f = fixture(vec![resource("a", 1_000_000)], vec![]);
        let (cart, quote) = f
            .quotes
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
        let tx = transfer_transaction(
            f.mint,
            f.pay_to,
            f.payer,
            1_000_000,
            &format!("pay:{}", cart.id),
        );
        let signature = f.rpc.seed_transaction(tx, true);
        let header = proof_header(cart.id.as_str(), ResourceType::Cart, &signature.to_string());
        let err = f
            .pipeline
            .verify(&header, quote.expires_at)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::QuoteExpired));
    }

    #[tokio::test]
    async fn prefix_type_mismatch_is_invalid_field() {
        let f = fixture(vec![], vec![]);
        let header = proof_header("cart_abc", ResourceType::Regular, "sig");
        let err = f.pipeline.verify(&header, UnixTimestamp(0)).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidField { .. }));
    }

    #[tokio::test]
    async fn refund_settles_with_exact_amount() {
        use chrono::Utc;
        use crate::ledger::{RefundStore, RefundRequest, RefundStatus};

        let f = fixture(vec![], vec![]);
        // An approved refund of 700_000 for a wallet with a known pubkey.
        let recipient_wallet = Pubkey::new_unique();
        let refund = RefundRequest {
            id: RefundId::generate(),
            original_signature: SettlementSignature::from("orig"),
            recipient: recipient_wallet.to_string(),
            amount: usdc(700_000),
            token: f.mint.to_string(),
            reason: None,
            status: RefundStatus::Approved,
            created_at: Utc::now(),
            settled_signature: None,
        };
        f.ledger.insert_refund(refund.clone()).await.unwrap();

        let expectation = f.refunds.expectation_for(&refund).unwrap();
        let destination = Pubkey::from_str(&expectation.pay_to).unwrap();
        let tx = transfer_transaction(
            f.mint,
            destination,
            f.payer,
            700_000,
            &format!("pay:{}", refund.id),
        );
        let signature = f.rpc.seed_transaction(tx, true);
        let header = proof_header(
            refund.id.as_str(),
            ResourceType::Refund,
            &signature.to_string(),
        );
        let receipt = f.pipeline.verify(&header, UnixTimestamp(0)).await.unwrap();
        assert!(receipt.success);

        let settled = f.refunds.load(&refund.id).await.unwrap();
        assert_eq!(settled.status, RefundStatus::Settled);
        assert_eq!(
            settled.settled_signature,
            Some(SettlementSignature(signature.to_string()))
        );

        // Replaying the refund proof conflicts.
        let err = f.pipeline.verify(&header, UnixTimestamp(1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::RefundAlreadyProcessed));
    }

    #[tokio::test]
    async fn pending_refund_cannot_be_settled() {
        use chrono::Utc;
        use crate::ledger::{RefundStore, RefundRequest, RefundStatus};

        let f = fixture(vec![], vec![]);
        let refund = RefundRequest {
            id: RefundId::generate(),
            original_signature: SettlementSignature::from("orig"),
            recipient: Pubkey::new_unique().to_string(),
            amount: usdc(700_000),
            token: f.mint.to_string(),
            reason: None,
            status: RefundStatus::Pending,
            created_at: Utc::now(),
            settled_signature: None,
        };
        f.ledger.insert_refund(refund.clone()).await.unwrap();
        let header = proof_header(refund.id.as_str(), ResourceType::Refund, "sig");
        let err = f.pipeline.verify(&header, UnixTimestamp(0)).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidField { .. }));
    }

    #[tokio::test]
    async fn coupon_usage_boundary_at_limit() {
        // usage_count == usage_limit - 1: the payment succeeds and consumes
        // the last use; the coupon then stops applying to quotes.
        let mut last_use = coupon("CAP", 2_000, Stage::Catalog, Some(2));
        last_use.usage_count = 1;
        let f = fixture(vec![resource("x", 1_000_000)], vec![last_use]);

        let tx = transfer_transaction(f.mint, f.pay_to, f.payer, 800_000, "pay:x");
        let signature = f.rpc.seed_transaction(tx, true);
        let header = proof_header("x", ResourceType::Regular, &signature.to_string());
        f.pipeline.verify(&header, UnixTimestamp(0)).await.unwrap();

        let stored = f
            .ledger
            .get_coupon(&CouponCode::from("CAP"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.usage_count, 2);

        // The next quote prices at full: the coupon is exhausted.
        let quote = f
            .quotes
            .quote_resource(&ResourceId::from("x"), Rail::Chain, None, UnixTimestamp(1))
            .await
            .unwrap();
        assert_eq!(quote.amount.atomic, 1_000_000);
    }

    #[tokio::test]
    async fn chain_subscription_extended_after_payment() {
        use crate::catalog::{BillingPeriod, SubSpec};
        let mut sub_resource = resource("pro", 1_000_000);
        sub_resource.subscription = Some(SubSpec {
            billing_period: BillingPeriod::Month,
            interval: 1,
            trial_days: None,
            processor_price_id: None,
        });
        let f = fixture(vec![sub_resource], vec![]);

        let tx = transfer_transaction(f.mint, f.pay_to, f.payer, 1_000_000, "pay:pro");
        let signature = f.rpc.seed_transaction(tx, true);
        let header = proof_header("pro", ResourceType::Regular, &signature.to_string());
        f.pipeline.verify(&header, UnixTimestamp(1_000)).await.unwrap();

        let holder = PayerRef::Wallet(f.payer.to_string());
        let subscription = crate::ledger::SubscriptionStore::find_by_holder_product(
            f.ledger.as_ref(),
            &holder,
            &ResourceId::from("pro"),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            subscription.current_period_end,
            UnixTimestamp(1_000 + 30 * 86_400)
        );
    }
}
