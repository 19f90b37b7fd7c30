//! Chain RPC seam.
//!
//! The verifier, gasless builder, and wallet monitor all talk to the chain
//! through [`ChainRpc`], so tests swap in a scripted implementation and
//! never touch the network. The production implementation wraps the
//! nonblocking Solana RPC client and retries reads with bounded exponential
//! backoff on transient transport failures; writes are never retried.

use async_trait::async_trait;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcSendTransactionConfig, RpcTransactionConfig};
use solana_commitment_config::CommitmentConfig;
use solana_message::Hash;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_transaction::versioned::VersionedTransaction;
use solana_transaction_status_client_types::{TransactionConfirmationStatus, UiTransactionEncoding};
use std::sync::Arc;
use std::time::Duration;

use crate::error::GatewayError;

/// Read retries: attempts and base delay for the exponential backoff.
const READ_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ChainRpcError {
    #[error("rpc transport error: {0}")]
    Transport(String),
    #[error("rpc rejected request: {0}")]
    Rejected(String),
}

impl From<ChainRpcError> for GatewayError {
    fn from(value: ChainRpcError) -> Self {
        GatewayError::ChainRpc(value.to_string())
    }
}

/// A transaction as observed on chain.
#[derive(Debug, Clone)]
pub struct ObservedTransaction {
    pub transaction: VersionedTransaction,
    /// Confirmed at the configured commitment or better.
    pub confirmed: bool,
    pub slot: u64,
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn latest_blockhash(&self) -> Result<Hash, ChainRpcError>;

    /// Looks a transaction up by signature. `Ok(None)` means the chain has
    /// never seen it.
    async fn observe_transaction(
        &self,
        signature: &Signature,
    ) -> Result<Option<ObservedTransaction>, ChainRpcError>;

    async fn send_transaction(
        &self,
        transaction: &VersionedTransaction,
    ) -> Result<Signature, ChainRpcError>;

    async fn confirm_signature(&self, signature: &Signature) -> Result<bool, ChainRpcError>;

    /// Native balance in lamports, for fee-payer health.
    async fn get_balance(&self, pubkey: &Pubkey) -> Result<u64, ChainRpcError>;
}

pub struct SolanaRpc {
    client: Arc<RpcClient>,
    commitment: CommitmentConfig,
}

impl SolanaRpc {
    pub fn new(rpc_url: String, commitment: CommitmentConfig) -> Self {
        Self {
            client: Arc::new(RpcClient::new_with_commitment(rpc_url, commitment)),
            commitment,
        }
    }

    pub fn url(&self) -> String {
        self.client.url()
    }

    fn is_transient(error: &ClientError) -> bool {
        match &*error.kind {
            ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) => true,
            // Rate limits surface as middleware/custom errors depending on
            // the transport; match on the message.
            other => other.to_string().contains("429"),
        }
    }

    /// Runs a read-only request with bounded exponential backoff.
    async fn with_retry<T, F, Fut>(&self, mut call: F) -> Result<T, ChainRpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if Self::is_transient(&error) && attempt + 1 < READ_ATTEMPTS => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt);
                    tracing::debug!(attempt, ?delay, error = %error, "retrying chain rpc read");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(ChainRpcError::Transport(error.to_string())),
            }
        }
    }

    fn confirmation_reached(&self, status: &Option<TransactionConfirmationStatus>) -> bool {
        let reached = match status {
            Some(TransactionConfirmationStatus::Finalized) => 2,
            Some(TransactionConfirmationStatus::Confirmed) => 1,
            _ => 0,
        };
        let wanted = if self.commitment.is_finalized() { 2 } else { 1 };
        reached >= wanted
    }
}

#[async_trait]
impl ChainRpc for SolanaRpc {
    async fn latest_blockhash(&self) -> Result<Hash, ChainRpcError> {
        self.with_retry(|| self.client.get_latest_blockhash()).await
    }

    async fn observe_transaction(
        &self,
        signature: &Signature,
    ) -> Result<Option<ObservedTransaction>, ChainRpcError> {
        let signatures = [*signature];
        let statuses = self
            .with_retry(|| self.client.get_signature_statuses(&signatures))
            .await?;
        let Some(status) = statuses.value.into_iter().next().flatten() else {
            return Ok(None);
        };
        let confirmed = self.confirmation_reached(&status.confirmation_status);

        let encoded = self
            .with_retry(|| {
                let config = RpcTransactionConfig {
                    encoding: Some(UiTransactionEncoding::Base64),
                    commitment: Some(self.commitment),
                    max_supported_transaction_version: Some(0),
                };
                self.client.get_transaction_with_config(signature, config)
            })
            .await?;
        let transaction = encoded
            .transaction
            .transaction
            .decode()
            .ok_or_else(|| ChainRpcError::Rejected("undecodable transaction".to_string()))?;
        Ok(Some(ObservedTransaction {
            transaction,
            confirmed,
            slot: encoded.slot,
        }))
    }

    async fn send_transaction(
        &self,
        transaction: &VersionedTransaction,
    ) -> Result<Signature, ChainRpcError> {
        // No retry: a write repeated blindly can double-submit.
        self.client
            .send_transaction_with_config(
                transaction,
                RpcSendTransactionConfig {
                    skip_preflight: true,
                    ..RpcSendTransactionConfig::default()
                },
            )
            .await
            .map_err(|e| ChainRpcError::Rejected(e.to_string()))
    }

    async fn confirm_signature(&self, signature: &Signature) -> Result<bool, ChainRpcError> {
        let confirmed = self
            .with_retry(|| {
                self.client
                    .confirm_transaction_with_commitment(signature, self.commitment)
            })
            .await?;
        Ok(confirmed.value)
    }

    async fn get_balance(&self, pubkey: &Pubkey) -> Result<u64, ChainRpcError> {
        self.with_retry(|| self.client.get_balance(pubkey)).await
    }
}
