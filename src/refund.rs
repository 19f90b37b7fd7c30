//! Refund requests: user-signed creation, admin-signed review, on-chain
//! settlement.
//!
//! A refund is requested by the wallet that made the original chain payment,
//! proven by an Ed25519 signature over `refund-request:<original_signature>`.
//! Admin decisions are signed over `approve-refund:<id>` / `deny-refund:<id>`
//! and the pending listing binds a single-use nonce. State moves through a
//! CAS transition on the ledger, so concurrent admins cannot double-process
//! a request, and settlement demands an exact-amount transfer.

use chrono::Utc;
use std::sync::Arc;

use crate::catalog::{Rail, RefundId, ResourceId};
use crate::error::{GatewayError, NotFoundKind};
use crate::gasless::associated_token_account;
use crate::ledger::{
    Ledger, PayerRef, PaymentStore, RefundRequest, RefundStatus, RefundStore,
    SettlementSignature,
};
use crate::nonce::{NonceId, NonceStore};
use crate::rail::VerifyExpectation;
use crate::signature::{SignedRequest, admin_message, verify_admin, verify_user};
use crate::timestamp::UnixTimestamp;
use solana_pubkey::Pubkey;
use std::str::FromStr;

pub const ACTION_APPROVE: &str = "approve-refund";
pub const ACTION_DENY: &str = "deny-refund";
pub const ACTION_LIST_PENDING: &str = "list-pending-refunds";
pub const ACTION_REQUEST: &str = "refund-request";

pub struct RefundService {
    ledger: Arc<dyn Ledger>,
    nonces: Arc<NonceStore>,
    /// Base58 pubkey of the admin wallet allowed to review refunds.
    admin_wallet: String,
    /// Mint refunds settle in.
    token_mint: String,
}

impl RefundService {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        nonces: Arc<NonceStore>,
        admin_wallet: String,
        token_mint: String,
    ) -> Self {
        Self {
            ledger,
            nonces,
            admin_wallet,
            token_mint,
        }
    }

    async fn get(&self, id: &RefundId) -> Result<RefundRequest, GatewayError> {
        self.ledger
            .get_refund(id)
            .await
            .map_err(GatewayError::from)?
            .ok_or_else(|| GatewayError::not_found(NotFoundKind::Refund, id.as_str()))
    }

    /// Opens a refund request for an original chain payment.
    ///
    /// The signer must be the wallet that paid. The amount and token are
    /// copied from the original payment record; the requester cannot choose
    /// them.
    #[tracing::instrument(skip_all)]
    pub async fn request(
        &self,
        signed: &SignedRequest,
        original_signature: &SettlementSignature,
        reason: Option<String>,
    ) -> Result<RefundRequest, GatewayError> {
        let expected_message = admin_message(ACTION_REQUEST, original_signature.as_str());
        let signer = verify_user(signed, &[], &expected_message)?;

        let payment = self
            .ledger
            .get_payment(original_signature)
            .await
            .map_err(GatewayError::from)?
            .ok_or_else(|| {
                GatewayError::not_found(NotFoundKind::Payment, original_signature.as_str())
            })?;
        if payment.rail != Rail::Chain {
            return Err(GatewayError::Unsupported(
                "card payments are refunded by the processor".to_string(),
            ));
        }
        match &payment.payer {
            PayerRef::Wallet(wallet) if *wallet == signer => {}
            _ => {
                return Err(GatewayError::Unauthorized(
                    "refunds can only be requested by the paying wallet".to_string(),
                ));
            }
        }

        let refund = RefundRequest {
            id: RefundId::generate(),
            original_signature: original_signature.clone(),
            recipient: signer,
            amount: payment.amount.clone(),
            token: self.token_mint.clone(),
            reason,
            status: RefundStatus::Pending,
            created_at: Utc::now(),
            settled_signature: None,
        };
        self.ledger
            .insert_refund(refund.clone())
            .await
            .map_err(GatewayError::from)?;
        Ok(refund)
    }

    /// Admin approval: pending → approved, returning the settlement
    /// expectation the refund transfer must meet.
    #[tracing::instrument(skip_all, fields(refund = %refund_id))]
    pub async fn approve(
        &self,
        signed: &SignedRequest,
        refund_id: &RefundId,
    ) -> Result<(RefundRequest, VerifyExpectation), GatewayError> {
        let expected = admin_message(ACTION_APPROVE, refund_id.as_str());
        verify_admin(signed, &self.admin_wallet, &expected)?;
        let refund = self
            .ledger
            .transition_refund(refund_id, RefundStatus::Pending, RefundStatus::Approved, None)
            .await
            .map_err(GatewayError::from)?;
        let expectation = self.expectation_for(&refund)?;
        Ok((refund, expectation))
    }

    /// Admin denial: pending → denied.
    #[tracing::instrument(skip_all, fields(refund = %refund_id))]
    pub async fn deny(
        &self,
        signed: &SignedRequest,
        refund_id: &RefundId,
    ) -> Result<RefundRequest, GatewayError> {
        let expected = admin_message(ACTION_DENY, refund_id.as_str());
        verify_admin(signed, &self.admin_wallet, &expected)?;
        self.ledger
            .transition_refund(refund_id, RefundStatus::Pending, RefundStatus::Denied, None)
            .await
            .map_err(GatewayError::from)
    }

    /// Admin listing of pending refunds, gated by a single-use nonce bound
    /// into the signed message.
    #[tracing::instrument(skip_all)]
    pub async fn list_pending(
        &self,
        signed: &SignedRequest,
        nonce_id: &NonceId,
        now: UnixTimestamp,
    ) -> Result<Vec<RefundRequest>, GatewayError> {
        let expected = admin_message(ACTION_LIST_PENDING, nonce_id.as_str());
        verify_admin(signed, &self.admin_wallet, &expected)?;
        // The signature proves the admin minted this request; consume the
        // nonce only after that proof.
        self.nonces.consume(nonce_id, now).map_err(GatewayError::from)?;
        self.ledger
            .list_pending_refunds()
            .await
            .map_err(GatewayError::from)
    }

    /// What the settling transfer must look like: exact amount, the
    /// recipient's token account, the refund memo.
    pub fn expectation_for(
        &self,
        refund: &RefundRequest,
    ) -> Result<VerifyExpectation, GatewayError> {
        let recipient_wallet = Pubkey::from_str(&refund.recipient).map_err(|_| {
            GatewayError::Internal(format!("refund recipient {} invalid", refund.recipient))
        })?;
        let mint = Pubkey::from_str(&self.token_mint)
            .map_err(|_| GatewayError::Internal("configured mint invalid".to_string()))?;
        let pay_to = associated_token_account(&recipient_wallet, &mint);
        Ok(VerifyExpectation {
            subject: ResourceId(refund.id.as_str().to_string()),
            amount: refund.amount.clone(),
            pay_to: pay_to.to_string(),
            memo: format!("pay:{}", refund.id),
            exact_amount: true,
        })
    }

    /// Settlement: approved → settled, recording the on-chain signature.
    pub async fn settle(
        &self,
        refund_id: &RefundId,
        settled_signature: SettlementSignature,
    ) -> Result<RefundRequest, GatewayError> {
        self.ledger
            .transition_refund(
                refund_id,
                RefundStatus::Approved,
                RefundStatus::Settled,
                Some(settled_signature),
            )
            .await
            .map_err(GatewayError::from)
    }

    pub async fn load(&self, id: &RefundId) -> Result<RefundRequest, GatewayError> {
        self.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ResourceId;
    use crate::ledger::memory::MemoryLedger;
    use crate::ledger::{PaymentRecord, PaymentStore};
    use crate::money::{AssetRef, Money};
    use ed25519_dalek::{Signer as _, SigningKey};

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn wallet_of(key: &SigningKey) -> String {
        bs58::encode(key.verifying_key().to_bytes()).into_string()
    }

    fn sign(key: &SigningKey, message: String) -> SignedRequest {
        let signature = key.sign(message.as_bytes());
        SignedRequest {
            signature: bs58::encode(signature.to_bytes()).into_string(),
            message,
            signer: wallet_of(key),
        }
    }

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        nonces: Arc<NonceStore>,
        service: RefundService,
        user: SigningKey,
        admin: SigningKey,
        mint: Pubkey,
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let nonces = Arc::new(NonceStore::new(300));
        let user = key(1);
        let admin = key(2);
        let mint = Pubkey::new_unique();
        let service = RefundService::new(
            Arc::clone(&ledger) as Arc<dyn Ledger>,
            Arc::clone(&nonces),
            wallet_of(&admin),
            mint.to_string(),
        );
        ledger
            .insert_payment(PaymentRecord {
                signature: SettlementSignature::from("orig_sig"),
                resource_id: ResourceId::from("x"),
                rail: Rail::Chain,
                payer: PayerRef::Wallet(wallet_of(&user)),
                amount: Money::new(AssetRef::new("USDC", 6), 700_000),
                created_at: Utc::now(),
                metadata: serde_json::Value::Null,
            })
            .await
            .unwrap();
        Fixture {
            ledger,
            nonces,
            service,
            user,
            admin,
            mint,
        }
    }

    #[tokio::test]
    async fn request_approve_settle_flow() {
        let f = fixture().await;
        let signed = sign(&f.user, "refund-request:orig_sig".to_string());
        let refund = f
            .service
            .request(&signed, &SettlementSignature::from("orig_sig"), Some("broken".into()))
            .await
            .unwrap();
        assert_eq!(refund.status, RefundStatus::Pending);
        assert_eq!(refund.amount.atomic, 700_000);
        assert_eq!(refund.recipient, wallet_of(&f.user));

        let approve = sign(&f.admin, format!("approve-refund:{}", refund.id));
        let (approved, expectation) = f.service.approve(&approve, &refund.id).await.unwrap();
        assert_eq!(approved.status, RefundStatus::Approved);
        assert!(expectation.exact_amount);
        assert_eq!(expectation.memo, format!("pay:{}", refund.id));
        let expected_ata = associated_token_account(
            &Pubkey::from_str(&wallet_of(&f.user)).unwrap(),
            &f.mint,
        );
        assert_eq!(expectation.pay_to, expected_ata.to_string());

        let settled = f
            .service
            .settle(&refund.id, SettlementSignature::from("refund_sig"))
            .await
            .unwrap();
        assert_eq!(settled.status, RefundStatus::Settled);
        assert_eq!(
            settled.settled_signature,
            Some(SettlementSignature::from("refund_sig"))
        );
    }

    #[tokio::test]
    async fn deny_then_second_action_conflicts() {
        let f = fixture().await;
        let signed = sign(&f.user, "refund-request:orig_sig".to_string());
        let refund = f
            .service
            .request(&signed, &SettlementSignature::from("orig_sig"), None)
            .await
            .unwrap();
        let deny = sign(&f.admin, format!("deny-refund:{}", refund.id));
        let denied = f.service.deny(&deny, &refund.id).await.unwrap();
        assert_eq!(denied.status, RefundStatus::Denied);

        let err = f.service.deny(&deny, &refund.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::RefundAlreadyProcessed));
        let approve = sign(&f.admin, format!("approve-refund:{}", refund.id));
        let err = f.service.approve(&approve, &refund.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::RefundAlreadyProcessed));
    }

    #[tokio::test]
    async fn only_paying_wallet_may_request() {
        let f = fixture().await;
        let intruder = key(9);
        let signed = sign(&intruder, "refund-request:orig_sig".to_string());
        let err = f
            .service
            .request(&signed, &SettlementSignature::from("orig_sig"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn second_open_request_rejected() {
        let f = fixture().await;
        let signed = sign(&f.user, "refund-request:orig_sig".to_string());
        f.service
            .request(&signed, &SettlementSignature::from("orig_sig"), None)
            .await
            .unwrap();
        let err = f
            .service
            .request(&signed, &SettlementSignature::from("orig_sig"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RefundAlreadyProcessed));
    }

    #[tokio::test]
    async fn pending_list_requires_fresh_nonce() {
        let f = fixture().await;
        let signed = sign(&f.user, "refund-request:orig_sig".to_string());
        f.service
            .request(&signed, &SettlementSignature::from("orig_sig"), None)
            .await
            .unwrap();

        let nonce = f.nonces.mint("list-pending-refunds", UnixTimestamp(0));
        let list_signed = sign(&f.admin, format!("list-pending-refunds:{}", nonce.id));
        let pending = f
            .service
            .list_pending(&list_signed, &nonce.id, UnixTimestamp(1))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        // Nonce replay.
        let err = f
            .service
            .list_pending(&list_signed, &nonce.id, UnixTimestamp(2))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NonceAlreadyUsed));
    }

    #[tokio::test]
    async fn admin_actions_reject_non_admin_signers() {
        let f = fixture().await;
        let signed = sign(&f.user, "refund-request:orig_sig".to_string());
        let refund = f
            .service
            .request(&signed, &SettlementSignature::from("orig_sig"), None)
            .await
            .unwrap();
        let forged = sign(&f.user, format!("approve-refund:{}", refund.id));
        let err = f.service.approve(&forged, &refund.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidSignature));
    }
}
