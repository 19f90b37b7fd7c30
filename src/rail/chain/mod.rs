//! Chain rail: verification of SPL token transfers against issued quotes.
//!
//! A chain proof names an on-chain transaction, either by signature (already
//! broadcast) or as a signed blob (broadcast here). Verification walks the
//! checks in a fixed order, each with its own error taxon, so a client can
//! tell a wrong memo from a wrong mint from an unconfirmed transaction:
//!
//! 1. proof decodes and the signature parses,
//! 2. the transaction exists and is confirmed,
//! 3. it contains exactly one SPL `TransferChecked` to the expected
//!    recipient token account for the configured mint,
//! 4. the amount covers the quote (equality for refunds),
//! 5. the memo instruction matches the resource memo.
//!
//! Replay protection (checks 6 and 7) is the ledger's unique settlement
//! signature, enforced by the pipeline at insert time.

pub mod blockhash;
pub mod rpc;

#[cfg(test)]
pub mod test_support;

use async_trait::async_trait;
use solana_message::compiled_instruction::CompiledInstruction;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_transaction::versioned::VersionedTransaction;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::ledger::{PayerRef, SettlementSignature};
use crate::rail::{PaymentProof, ProofVerifier, Settlement, VerifyExpectation};
use crate::util::Base64Bytes;

use self::rpc::ChainRpc;

/// The token transfer extracted from a candidate transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDetails {
    pub amount: u64,
    pub source: Pubkey,
    pub mint: Pubkey,
    pub destination: Pubkey,
    pub authority: Pubkey,
}

fn account_at(
    instruction: &CompiledInstruction,
    keys: &[Pubkey],
    position: u8,
) -> Result<Pubkey, GatewayError> {
    let index = instruction
        .accounts
        .get(position as usize)
        .copied()
        .ok_or(GatewayError::NotSplTransfer)?;
    keys.get(index as usize)
        .copied()
        .ok_or(GatewayError::NotSplTransfer)
}

/// Finds the single SPL `TransferChecked` in the transaction.
///
/// Zero transfers, more than one transfer, or a token instruction of any
/// other kind all fail the same way: this is not the shape of transaction a
/// quote asks for.
pub fn decode_transfer(
    transaction: &VersionedTransaction,
) -> Result<TransferDetails, GatewayError> {
    let keys = transaction.message.static_account_keys();
    let mut found: Option<TransferDetails> = None;
    for instruction in transaction.message.instructions() {
        let program_id = instruction.program_id(keys);
        if spl_token::ID.ne(program_id) {
            continue;
        }
        let token_instruction =
            spl_token::instruction::TokenInstruction::unpack(instruction.data.as_slice())
                .map_err(|_| GatewayError::NotSplTransfer)?;
        let amount = match token_instruction {
            spl_token::instruction::TokenInstruction::TransferChecked { amount, decimals: _ } => {
                amount
            }
            _ => return Err(GatewayError::NotSplTransfer),
        };
        if found.is_some() {
            return Err(GatewayError::NotSplTransfer);
        }
        found = Some(TransferDetails {
            amount,
            source: account_at(instruction, keys, 0)?,
            mint: account_at(instruction, keys, 1)?,
            destination: account_at(instruction, keys, 2)?,
            authority: account_at(instruction, keys, 3)?,
        });
    }
    found.ok_or(GatewayError::NotSplTransfer)
}

/// Extracts the memo instruction's payload, when present.
pub fn decode_memo(transaction: &VersionedTransaction) -> Option<String> {
    let keys = transaction.message.static_account_keys();
    for instruction in transaction.message.instructions() {
        let program_id = instruction.program_id(keys);
        if spl_memo::ID.eq(program_id) {
            return String::from_utf8(instruction.data.clone()).ok();
        }
    }
    None
}

/// Verifier for the chain rail.
pub struct ChainVerifier {
    rpc: Arc<dyn ChainRpc>,
    mint: Pubkey,
}

impl ChainVerifier {
    pub fn new(rpc: Arc<dyn ChainRpc>, mint: Pubkey) -> Self {
        Self { rpc, mint }
    }

    /// Resolves the proof to an on-chain signature: either the named one or,
    /// for a signed blob, the signature observed after broadcasting it.
    async fn resolve_signature(&self, proof: &PaymentProof) -> Result<Signature, GatewayError> {
        if let Some(signature) = &proof.payload.signature {
            return Signature::from_str(signature)
                .map_err(|_| GatewayError::InvalidPaymentProof("bad signature encoding".into()));
        }
        let Some(blob) = &proof.payload.transaction else {
            return Err(GatewayError::InvalidPaymentProof(
                "proof carries neither signature nor transaction".into(),
            ));
        };
        let bytes = Base64Bytes::from(blob.as_str())
            .decode()
            .map_err(|e| GatewayError::InvalidPaymentProof(e.to_string()))?;
        let transaction: VersionedTransaction = bincode::deserialize(&bytes)
            .map_err(|e| GatewayError::InvalidPaymentProof(e.to_string()))?;
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
        Ok(signature)
    }

    #[tracing::instrument(skip_all, fields(subject = %expectation.subject))]
    async fn verify_inner(
        &self,
        proof: &PaymentProof,
        expectation: &VerifyExpectation,
    ) -> Result<Settlement, GatewayError> {
        let signature = self.resolve_signature(proof).await?;

        let observed = self
            .rpc
            .observe_transaction(&signature)
            .await
            .map_err(GatewayError::from)?
            .ok_or(GatewayError::TransactionNotFound)?;
        if !observed.confirmed {
            return Err(GatewayError::TransactionNotConfirmed);
        }

        let transfer = decode_transfer(&observed.transaction)?;
        let expected_destination = Pubkey::from_str(&expectation.pay_to).map_err(|_| {
            GatewayError::Internal(format!(
                "recipient token account {} is not a valid pubkey",
                expectation.pay_to
            ))
        })?;
        if transfer.destination != expected_destination {
            return Err(GatewayError::InvalidRecipient);
        }
        if transfer.mint != self.mint {
            return Err(GatewayError::InvalidTokenMint);
        }

        let required = expectation.amount.atomic;
        let actual = i64::try_from(transfer.amount)
            .map_err(|_| GatewayError::InvalidAmount("transfer amount overflows".into()))?;
        if expectation.exact_amount {
            if actual != required {
                return Err(GatewayError::AmountMismatch { required, actual });
            }
        } else if actual < required {
            return Err(GatewayError::AmountBelowMinimum { required, actual });
        }

        let memo = decode_memo(&observed.transaction).ok_or(GatewayError::MissingMemo)?;
        if memo != expectation.memo {
            return Err(GatewayError::InvalidMemo);
        }

        tracing::info!(
            signature = %signature,
            payer = %transfer.authority,
            amount = transfer.amount,
            "chain transfer verified"
        );
        Ok(Settlement {
            signature: SettlementSignature(signature.to_string()),
            payer: PayerRef::Wallet(transfer.authority.to_string()),
            amount_atomic: actual,
        })
    }
}

#[async_trait]
impl ProofVerifier for ChainVerifier {
    async fn verify(
        &self,
        proof: &PaymentProof,
        expectation: &VerifyExpectation,
    ) -> Result<Settlement, GatewayError> {
        self.verify_inner(proof, expectation).await
    }
}
