//! Gasless transactions: the server sponsors native fees so a user can pay
//! in the token without holding SOL.
//!
//! Build: resolve the amount through the quote generator (done by the
//! caller), pick a hot fee payer, fetch the cached blockhash, and assemble
//! `[SetComputeUnitLimit, SetComputeUnitPrice, TransferChecked, Memo]` with
//! the fee payer as the transaction payer. The client signs the transfer
//! authority slot and sends the transaction back.
//!
//! Submit: co-sign as fee payer, refuse undersigned or fee-payer-draining
//! transactions, broadcast, and confirm. The regular chain verifier then
//! observes the signature like any other payment.

use async_trait::async_trait;
use solana_compute_budget_interface::ComputeBudgetInstruction;
use solana_keypair::Keypair;
use solana_message::v0::Message as MessageV0;
use solana_message::VersionedMessage;
use solana_pubkey::{Pubkey, pubkey};
use solana_signature::Signature;
use solana_signer::Signer;
use solana_transaction::Instruction;
use solana_transaction::versioned::VersionedTransaction;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::rail::chain::blockhash::BlockhashCache;
use crate::rail::chain::decode_transfer;
use crate::rail::chain::rpc::ChainRpc;
use crate::rail::{GaslessBuildRequest, GaslessBuilder, GaslessTransaction};
use crate::util::Base64Bytes;
use crate::wallet::FeePayerPool;

pub const ATA_PROGRAM_PUBKEY: Pubkey = pubkey!("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Derives the associated token account for `owner` and `mint`.
pub fn associated_token_account(owner: &Pubkey, mint: &Pubkey) -> Pubkey {
    let (ata, _) = Pubkey::find_program_address(
        &[owner.as_ref(), spl_token::ID.as_ref(), mint.as_ref()],
        &ATA_PROGRAM_PUBKEY,
    );
    ata
}

/// Signs `transaction` with `keypair`, placing the signature in the slot the
/// message reserves for that key.
pub fn place_signature(
    mut transaction: VersionedTransaction,
    keypair: &Keypair,
) -> Result<VersionedTransaction, GatewayError> {
    let message_bytes = transaction.message.serialize();
    let signature = keypair
        .try_sign_message(&message_bytes)
        .map_err(|e| GatewayError::Internal(format!("signing failed: {e}")))?;
    let num_required = transaction.message.header().num_required_signatures as usize;
    let static_keys = transaction.message.static_account_keys();
    let position = static_keys[..num_required]
        .iter()
        .position(|key| *key == keypair.pubkey())
        .ok_or_else(|| {
            GatewayError::InvalidPaymentProof("signer not among required signers".to_string())
        })?;
    if transaction.signatures.len() < num_required {
        transaction
            .signatures
            .resize(num_required, Signature::default());
    }
    transaction.signatures[position] = signature;
    Ok(transaction)
}

fn is_fully_signed(transaction: &VersionedTransaction) -> bool {
    let num_required = transaction.message.header().num_required_signatures as usize;
    transaction.signatures.len() >= num_required
        && transaction
            .signatures
            .iter()
            .all(|s| *s != Signature::default())
}

pub struct GaslessService {
    rpc: Arc<dyn ChainRpc>,
    pool: Arc<FeePayerPool>,
    blockhash: Arc<BlockhashCache>,
    mint: Pubkey,
    mint_decimals: u8,
    compute_unit_limit: u32,
    compute_unit_price: u64,
}

impl GaslessService {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        pool: Arc<FeePayerPool>,
        blockhash: Arc<BlockhashCache>,
        mint: Pubkey,
        mint_decimals: u8,
        compute_unit_limit: u32,
        compute_unit_price: u64,
    ) -> Self {
        Self {
            rpc,
            pool,
            blockhash,
            mint,
            mint_decimals,
            compute_unit_limit,
            compute_unit_price,
        }
    }
}

#[async_trait]
impl GaslessBuilder for GaslessService {
    #[tracing::instrument(skip_all, fields(wallet = %request.user_wallet))]
    async fn build(
        &self,
        request: &GaslessBuildRequest,
    ) -> Result<GaslessTransaction, GatewayError> {
        let user = Pubkey::from_str(&request.user_wallet)
            .map_err(|_| GatewayError::invalid_field("user_wallet", "not a valid pubkey"))?;
        let destination = Pubkey::from_str(&request.pay_to).map_err(|_| {
            GatewayError::Internal(format!("recipient {} is not a valid pubkey", request.pay_to))
        })?;
        let amount = u64::try_from(request.amount.atomic)
            .map_err(|_| GatewayError::InvalidAmount("negative amount".to_string()))?;

        let fee_payer = self.pool.select(request.fee_payer_hint.as_deref())?;
        let source = associated_token_account(&user, &self.mint);
        let blockhash = self
            .blockhash
            .get(self.rpc.as_ref())
            .await
            .map_err(GatewayError::from)?;

        let transfer = spl_token::instruction::transfer_checked(
            &spl_token::ID,
            &source,
            &self.mint,
            &destination,
            &user,
            &[],
            amount,
            self.mint_decimals,
        )
        .map_err(|e| GatewayError::Internal(format!("transfer instruction: {e}")))?;
        let instructions: Vec<Instruction> = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(self.compute_unit_limit),
            ComputeBudgetInstruction::set_compute_unit_price(self.compute_unit_price),
            transfer,
            spl_memo::build_memo(request.memo.as_bytes(), &[]),
        ];

        let message =
            MessageV0::try_compile(&fee_payer.pubkey(), &instructions, &[], blockhash)
                .map_err(|e| GatewayError::Internal(format!("message compile: {e}")))?;
        let transaction = VersionedTransaction {
            signatures: vec![],
            message: VersionedMessage::V0(message),
        };
        let bytes = bincode::serialize(&transaction)
            .map_err(|e| GatewayError::Internal(format!("transaction encode: {e}")))?;
        Ok(GaslessTransaction {
            transaction: Base64Bytes::encode(bytes).to_string(),
            fee_payer: fee_payer.pubkey().to_string(),
        })
    }

    #[tracing::instrument(skip_all)]
    async fn submit(&self, transaction_b64: &str) -> Result<String, GatewayError> {
        let bytes = Base64Bytes::from(transaction_b64)
            .decode()
            .map_err(|e| GatewayError::InvalidPaymentProof(e.to_string()))?;
        let transaction: VersionedTransaction = bincode::deserialize(&bytes)
            .map_err(|e| GatewayError::InvalidPaymentProof(e.to_string()))?;

        let static_keys = transaction.message.static_account_keys();
        let fee_payer_pubkey = static_keys
            .first()
            .copied()
            .ok_or_else(|| GatewayError::InvalidPaymentProof("empty account keys".to_string()))?;
        let keypair = self.pool.keypair_for(&fee_payer_pubkey).ok_or_else(|| {
            GatewayError::invalid_field("fee_payer", "not a pool wallet")
        })?;

        // The fee payer sponsors fees, never moves tokens.
        let transfer = decode_transfer(&transaction)?;
        if transfer.authority == fee_payer_pubkey {
            return Err(GatewayError::InvalidPaymentProof(
                "fee payer cannot be the transfer authority".to_string(),
            ));
        }

        let transaction = place_signature(transaction, &keypair)?;
        if !is_fully_signed(&transaction) {
            return Err(GatewayError::InvalidPaymentProof(
                "transaction is missing the user signature".to_string(),
            ));
        }
        let signature = self
            .rpc
            .send_transaction(&transaction)
            .await
            .map_err(GatewayError::from)?;
        if !self
            .rpc
            .confirm_signature(&signature)
            .await
            .map_err(GatewayError::from)?
        {
            return Err(GatewayError::TransactionNotConfirmed);
        }
        tracing::info!(signature = %signature, "gasless transaction settled");
        Ok(signature.to_string())
    }
}
