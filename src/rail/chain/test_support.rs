//! Scripted chain RPC and transaction builders for tests.

use async_trait::async_trait;
use solana_compute_budget_interface::ComputeBudgetInstruction;
use solana_message::v0::Message as MessageV0;
use solana_message::{Hash, VersionedMessage};
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_transaction::Instruction;
use solana_transaction::versioned::VersionedTransaction;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::rpc::{ChainRpc, ChainRpcError, ObservedTransaction};

static SIGNATURE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_signature() -> Signature {
    let n = SIGNATURE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut bytes = [0u8; 64];
    bytes[..8].copy_from_slice(&n.to_le_bytes());
    Signature::from(bytes)
}

/// In-memory [`ChainRpc`] with scripted transactions and balances.
#[derive(Default)]
pub struct MockRpc {
    pub blockhash_calls: AtomicUsize,
    pub transactions: Mutex<HashMap<Signature, ObservedTransaction>>,
    pub balances: Mutex<HashMap<Pubkey, u64>>,
    pub sent: Mutex<Vec<VersionedTransaction>>,
    pub fail_balance: Mutex<bool>,
}

impl MockRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transaction as observable and returns its signature.
    pub fn seed_transaction(
        &self,
        transaction: VersionedTransaction,
        confirmed: bool,
    ) -> Signature {
        let signature = next_signature();
        self.transactions.lock().unwrap().insert(
            signature,
            ObservedTransaction {
                transaction,
                confirmed,
                slot: 1,
            },
        );
        signature
    }

    pub fn set_balance(&self, pubkey: Pubkey, lamports: u64) {
        self.balances.lock().unwrap().insert(pubkey, lamports);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn latest_blockhash(&self) -> Result<Hash, ChainRpcError> {
        self.blockhash_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Hash::default())
    }

    async fn observe_transaction(
        &self,
        signature: &Signature,
    ) -> Result<Option<ObservedTransaction>, ChainRpcError> {
        Ok(self.transactions.lock().unwrap().get(signature).cloned())
    }

    async fn send_transaction(
        &self,
        transaction: &VersionedTransaction,
    ) -> Result<Signature, ChainRpcError> {
        self.sent.lock().unwrap().push(transaction.clone());
        let signature = transaction
            .signatures
            .first()
            .copied()
            .filter(|s| *s != Signature::default())
            .unwrap_or_else(next_signature);
        self.transactions.lock().unwrap().insert(
            signature,
            ObservedTransaction {
                transaction: transaction.clone(),
                confirmed: true,
                slot: 1,
            },
        );
        Ok(signature)
    }

    async fn confirm_signature(&self, signature: &Signature) -> Result<bool, ChainRpcError> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .get(signature)
            .map(|t| t.confirmed)
            .unwrap_or(false))
    }

    async fn get_balance(&self, pubkey: &Pubkey) -> Result<u64, ChainRpcError> {
        if *self.fail_balance.lock().unwrap() {
            return Err(ChainRpcError::Transport("probe failed".to_string()));
        }
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(pubkey)
            .copied()
            .unwrap_or(0))
    }
}

fn compile(payer: Pubkey, instructions: &[Instruction]) -> VersionedTransaction {
    let message = MessageV0::try_compile(&payer, instructions, &[], Hash::default())
        .expect("test message compiles");
    VersionedTransaction {
        signatures: vec![],
        message: VersionedMessage::V0(message),
    }
}

/// A well-formed payment transaction: compute budget, transfer, memo.
pub fn transfer_transaction(
    mint: Pubkey,
    destination: Pubkey,
    authority: Pubkey,
    amount: u64,
    memo: &str,
) -> VersionedTransaction {
    let source = Pubkey::new_unique();
    let transfer = spl_token::instruction::transfer_checked(
        &spl_token::ID,
        &source,
        &mint,
        &destination,
        &authority,
        &[],
        amount,
        6,
    )
    .expect("transfer instruction builds");
    let instructions = vec![
        ComputeBudgetInstruction::set_compute_unit_limit(60_000),
        ComputeBudgetInstruction::set_compute_unit_price(1),
        transfer,
        spl_memo::build_memo(memo.as_bytes(), &[]),
    ];
    compile(authority, &instructions)
}

/// Same shape, minus the memo instruction.
pub fn transfer_transaction_without_memo(
    mint: Pubkey,
    destination: Pubkey,
    authority: Pubkey,
    amount: u64,
) -> VersionedTransaction {
    let source = Pubkey::new_unique();
    let transfer = spl_token::instruction::transfer_checked(
        &spl_token::ID,
        &source,
        &mint,
        &destination,
        &authority,
        &[],
        amount,
        6,
    )
    .expect("transfer instruction builds");
    let instructions = vec![
        ComputeBudgetInstruction::set_compute_unit_limit(60_000),
        ComputeBudgetInstruction::set_compute_unit_price(1),
        transfer,
    ];
    compile(authority, &instructions)
}
