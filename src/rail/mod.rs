//! Settlement rails and the capability set the pipeline dispatches over.
//!
//! Each rail registers a verifier plus optional capabilities: gasless
//! transaction building and a health probe. A rail that cannot build gasless
//! transactions simply omits the capability and the endpoint refuses
//! cleanly. The pipeline never knows which concrete rail it is talking to -
//! it routes by [`Rail`] and works the trait surface.

pub mod card;
pub mod chain;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::{Rail, ResourceId};
use crate::error::GatewayError;
use crate::ledger::{PayerRef, SettlementSignature};
use crate::money::Money;
use crate::util::Base64Bytes;

/// What the payload claims to be paying for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Regular,
    Cart,
    Refund,
}

/// Free-form proof metadata. Known keys are lifted out; the rest rides
/// along untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProofMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coupon_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The inner payload of an `X-PAYMENT` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofPayload {
    pub resource: String,
    pub resource_type: ResourceType,
    /// Base58 on-chain transaction signature (chain rail).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Base64 signed transaction blob (chain rail, pre-broadcast).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    #[serde(default)]
    pub metadata: ProofMetadata,
}

/// An opaque payment proof as posted by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentProof {
    pub payload: ProofPayload,
}

impl PaymentProof {
    /// Decodes the base64 JSON `X-PAYMENT` header value.
    pub fn decode(header_value: &str) -> Result<Self, GatewayError> {
        let bytes = Base64Bytes::from(header_value)
            .decode()
            .map_err(|e| GatewayError::InvalidPaymentProof(e.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| GatewayError::InvalidPaymentProof(e.to_string()))
    }

    /// Which rail this proof settles on, inferred from its contents.
    pub fn rail(&self) -> Rail {
        if self.payload.metadata.session_id.is_some() {
            Rail::Card
        } else {
            Rail::Chain
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId(self.payload.resource.clone())
    }
}

/// What a settlement must look like to satisfy a quote or refund.
#[derive(Debug, Clone)]
pub struct VerifyExpectation {
    pub subject: ResourceId,
    pub amount: Money,
    /// Chain rail: the recipient token account. Card rail: unused.
    pub pay_to: String,
    pub memo: String,
    /// Refunds demand equality; payments accept overpayment.
    pub exact_amount: bool,
}

/// A verified settlement, normalized across rails.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub signature: SettlementSignature,
    pub payer: PayerRef,
    pub amount_atomic: i64,
}

/// The settlement record returned to the client in `X-PAYMENT-RESPONSE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub success: bool,
    pub rail: Rail,
    pub resource: String,
    /// Transaction hash when applicable (chain rail).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
}

impl SettlementReceipt {
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("receipt serialization cannot fail");
        Base64Bytes::encode(json).to_string()
    }
}

/// Verification capability, one per rail.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify(
        &self,
        proof: &PaymentProof,
        expectation: &VerifyExpectation,
    ) -> Result<Settlement, GatewayError>;
}

/// Parameters for building a gasless transaction.
#[derive(Debug, Clone)]
pub struct GaslessBuildRequest {
    pub user_wallet: String,
    pub amount: Money,
    pub pay_to: String,
    pub memo: String,
    /// Caller preference for a specific fee payer; best effort.
    pub fee_payer_hint: Option<String>,
}

/// The built transaction handed back for client co-signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GaslessTransaction {
    /// Base64-serialized transaction, partially signed by the fee payer side.
    pub transaction: String,
    pub fee_payer: String,
}

/// Gasless capability. Rails without native-fee sponsorship omit this.
#[async_trait]
pub trait GaslessBuilder: Send + Sync {
    async fn build(&self, request: &GaslessBuildRequest) -> Result<GaslessTransaction, GatewayError>;

    /// Co-signs the client-signed transaction as fee payer and broadcasts.
    /// Returns the on-chain signature.
    async fn submit(&self, transaction_b64: &str) -> Result<String, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct RailHealthReport {
    pub rail: Rail,
    pub state: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Health capability. Optional per rail.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn health(&self) -> RailHealthReport;
}

/// One rail's registered capabilities.
#[derive(Clone)]
pub struct RailCapabilities {
    pub verifier: Arc<dyn ProofVerifier>,
    pub gasless: Option<Arc<dyn GaslessBuilder>>,
    pub health: Option<Arc<dyn HealthProbe>>,
}

/// Registry the pipeline dispatches through.
#[derive(Clone, Default)]
pub struct RailRegistry {
    rails: HashMap<Rail, RailCapabilities>,
}

impl RailRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, rail: Rail, capabilities: RailCapabilities) -> Self {
        self.rails.insert(rail, capabilities);
        self
    }

    pub fn verifier(&self, rail: Rail) -> Result<&Arc<dyn ProofVerifier>, GatewayError> {
        self.rails
            .get(&rail)
            .map(|c| &c.verifier)
            .ok_or_else(|| GatewayError::Unsupported(format!("no verifier for rail {rail}")))
    }

    pub fn gasless(&self, rail: Rail) -> Result<&Arc<dyn GaslessBuilder>, GatewayError> {
        self.rails
            .get(&rail)
            .and_then(|c| c.gasless.as_ref())
            .ok_or_else(|| GatewayError::Unsupported(format!("rail {rail} does not support gasless")))
    }

    pub async fn health_reports(&self) -> Vec<RailHealthReport> {
        let mut reports = Vec::new();
        for capabilities in self.rails.values() {
            if let Some(probe) = &capabilities.health {
                reports.push(probe.health().await);
            }
        }
        reports.sort_by_key(|r| r.rail.to_string());
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_decodes_from_base64_json() {
        let json = serde_json::json!({
            "payload": {
                "resource": "x",
                "resource_type": "regular",
                "signature": "5sig",
                "metadata": { "coupon_code": "TEN" }
            }
        });
        let encoded = Base64Bytes::encode(serde_json::to_vec(&json).unwrap());
        let proof = PaymentProof::decode(&encoded.to_string()).unwrap();
        assert_eq!(proof.payload.resource, "x");
        assert_eq!(proof.payload.resource_type, ResourceType::Regular);
        assert_eq!(proof.payload.metadata.coupon_code.as_deref(), Some("TEN"));
        assert_eq!(proof.rail(), Rail::Chain);
    }

    #[test]
    fn proof_with_session_routes_to_card() {
        let json = serde_json::json!({
            "payload": {
                "resource": "x",
                "resource_type": "regular",
                "metadata": { "session_id": "cs_123" }
            }
        });
        let encoded = Base64Bytes::encode(serde_json::to_vec(&json).unwrap());
        let proof = PaymentProof::decode(&encoded.to_string()).unwrap();
        assert_eq!(proof.rail(), Rail::Card);
    }

    #[test]
    fn garbage_header_is_invalid_proof() {
        let err = PaymentProof::decode("!!!").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPaymentProof(_)));
        let not_json = Base64Bytes::encode(b"hello").to_string();
        let err = PaymentProof::decode(&not_json).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPaymentProof(_)));
    }

    #[test]
    fn receipt_round_trips_through_base64() {
        let receipt = SettlementReceipt {
            success: true,
            rail: Rail::Chain,
            resource: "x".to_string(),
            transaction: Some("5sig".to_string()),
        };
        let encoded = receipt.encode();
        let decoded = Base64Bytes::from(encoded.as_str()).decode().unwrap();
        let back: SettlementReceipt = serde_json::from_slice(&decoded).unwrap();
        assert!(back.success);
        assert_eq!(back.transaction.as_deref(), Some("5sig"));
    }
}
