//! Gateway-wide error taxonomy and its HTTP mapping.
//!
//! Every fallible path in the gateway funnels into [`GatewayError`]. The
//! variant decides three things at once: the HTTP status, the stable
//! snake_case code in the response envelope, and whether the caller may
//! usefully retry. Handlers return the error as-is; the `IntoResponse` impl
//! renders the JSON envelope `{code, message, details?}` and logs the
//! technical cause under the request id.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// What kind of entity a [`GatewayError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Resource,
    Cart,
    Payment,
    Refund,
    Coupon,
    Session,
    Subscription,
    Nonce,
}

impl NotFoundKind {
    fn as_str(&self) -> &'static str {
        match self {
            NotFoundKind::Resource => "resource",
            NotFoundKind::Cart => "cart",
            NotFoundKind::Payment => "payment",
            NotFoundKind::Refund => "refund",
            NotFoundKind::Coupon => "coupon",
            NotFoundKind::Session => "session",
            NotFoundKind::Subscription => "subscription",
            NotFoundKind::Nonce => "nonce",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    // ----- input validation (400) -----
    #[error("invalid field {field}: {message}")]
    InvalidField { field: String, message: String },
    #[error("cart has no items")]
    EmptyCart,
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("invalid payment proof: {0}")]
    InvalidPaymentProof(String),
    #[error("invalid webhook signature")]
    WebhookSignature,

    // ----- payment verification (402) -----
    #[error("transaction is not an SPL token transfer")]
    NotSplTransfer,
    #[error("transfer destination does not match the resource recipient")]
    InvalidRecipient,
    #[error("transfer mint does not match the configured token")]
    InvalidTokenMint,
    #[error("memo instruction missing from transaction")]
    MissingMemo,
    #[error("memo does not match the expected resource memo")]
    InvalidMemo,

    // ----- payment resource state (402) -----
    #[error("transaction not found on chain")]
    TransactionNotFound,
    #[error("transaction not yet confirmed")]
    TransactionNotConfirmed,
    #[error("transfer amount {actual} below required {required}")]
    AmountBelowMinimum { required: i64, actual: i64 },
    #[error("transfer amount {actual} does not equal refund amount {required}")]
    AmountMismatch { required: i64, actual: i64 },
    #[error("settlement signature already used")]
    SignatureReused,
    #[error("quote expired")]
    QuoteExpired,
    #[error("card session observed but not yet settled")]
    SessionPending,

    // ----- authorization (403) -----
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // ----- not found (404) -----
    #[error("{kind:?} not found: {id}")]
    NotFound { kind: NotFoundKind, id: String },

    // ----- business rules (409) -----
    #[error("coupon expired")]
    CouponExpired,
    #[error("coupon usage limit reached")]
    CouponExhausted,
    #[error("coupon does not apply to this product")]
    CouponNotApplicable,
    #[error("coupon does not apply to this payment method")]
    CouponWrongMethod,
    #[error("cart already paid")]
    CartAlreadyPaid,
    #[error("refund already processed")]
    RefundAlreadyProcessed,
    #[error("nonce already used")]
    NonceAlreadyUsed,
    #[error("nonce expired")]
    NonceExpired,
    #[error("subscription state does not allow this operation: {0}")]
    SubscriptionState(String),

    // ----- upstream (502) -----
    #[error("chain rpc error: {0}")]
    ChainRpc(String),
    #[error("card processor error: {0}")]
    CardProcessor(String),

    // ----- internal (500) -----
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn not_found(kind: NotFoundKind, id: impl Into<String>) -> Self {
        GatewayError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code surfaced in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidField { .. } => "invalid_field",
            GatewayError::EmptyCart => "empty_cart",
            GatewayError::InvalidAmount(_) => "invalid_amount",
            GatewayError::InvalidPaymentProof(_) => "invalid_payment_proof",
            GatewayError::WebhookSignature => "invalid_webhook_signature",
            GatewayError::NotSplTransfer => "not_spl_transfer",
            GatewayError::InvalidRecipient => "invalid_recipient",
            GatewayError::InvalidTokenMint => "invalid_token_mint",
            GatewayError::MissingMemo => "missing_memo",
            GatewayError::InvalidMemo => "invalid_memo",
            GatewayError::TransactionNotFound => "transaction_not_found",
            GatewayError::TransactionNotConfirmed => "transaction_not_confirmed",
            GatewayError::AmountBelowMinimum { .. } => "amount_below_minimum",
            GatewayError::AmountMismatch { .. } => "amount_mismatch",
            GatewayError::SignatureReused => "signature_reused",
            GatewayError::QuoteExpired => "quote_expired",
            GatewayError::SessionPending => "session_pending",
            GatewayError::InvalidSignature => "invalid_signature",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::NotFound { kind, .. } => match kind {
                NotFoundKind::Resource => "resource_not_found",
                NotFoundKind::Cart => "cart_not_found",
                NotFoundKind::Payment => "payment_not_found",
                NotFoundKind::Refund => "refund_not_found",
                NotFoundKind::Coupon => "coupon_not_found",
                NotFoundKind::Session => "session_not_found",
                NotFoundKind::Subscription => "subscription_not_found",
                NotFoundKind::Nonce => "nonce_not_found",
            },
            GatewayError::CouponExpired => "coupon_expired",
            GatewayError::CouponExhausted => "coupon_usage_exhausted",
            GatewayError::CouponNotApplicable => "coupon_not_applicable",
            GatewayError::CouponWrongMethod => "coupon_wrong_payment_method",
            GatewayError::CartAlreadyPaid => "cart_already_paid",
            GatewayError::RefundAlreadyProcessed => "refund_already_processed",
            GatewayError::NonceAlreadyUsed => "nonce_already_used",
            GatewayError::NonceExpired => "nonce_expired",
            GatewayError::SubscriptionState(_) => "subscription_state",
            GatewayError::ChainRpc(_) => "chain_rpc_error",
            GatewayError::CardProcessor(_) => "card_processor_error",
            GatewayError::Unsupported(_) => "unsupported",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidField { .. }
            | GatewayError::EmptyCart
            | GatewayError::InvalidAmount(_)
            | GatewayError::InvalidPaymentProof(_)
            | GatewayError::WebhookSignature => StatusCode::BAD_REQUEST,

            GatewayError::NotSplTransfer
            | GatewayError::InvalidRecipient
            | GatewayError::InvalidTokenMint
            | GatewayError::MissingMemo
            | GatewayError::InvalidMemo
            | GatewayError::TransactionNotFound
            | GatewayError::TransactionNotConfirmed
            | GatewayError::AmountBelowMinimum { .. }
            | GatewayError::AmountMismatch { .. }
            | GatewayError::SignatureReused
            | GatewayError::QuoteExpired
            | GatewayError::SessionPending => StatusCode::PAYMENT_REQUIRED,

            GatewayError::InvalidSignature | GatewayError::Unauthorized(_) => {
                StatusCode::FORBIDDEN
            }

            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,

            GatewayError::CouponExpired
            | GatewayError::CouponExhausted
            | GatewayError::CouponNotApplicable
            | GatewayError::CouponWrongMethod
            | GatewayError::CartAlreadyPaid
            | GatewayError::RefundAlreadyProcessed
            | GatewayError::NonceAlreadyUsed
            | GatewayError::NonceExpired
            | GatewayError::SubscriptionState(_) => StatusCode::CONFLICT,

            GatewayError::ChainRpc(_) | GatewayError::CardProcessor(_) => StatusCode::BAD_GATEWAY,

            GatewayError::Unsupported(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Only upstream failures and unconfirmed transactions are worth a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::TransactionNotConfirmed
                | GatewayError::ChainRpc(_)
                | GatewayError::CardProcessor(_)
        )
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            GatewayError::InvalidField { field, .. } => {
                Some(serde_json::json!({ "field": field }))
            }
            GatewayError::AmountBelowMinimum { required, actual }
            | GatewayError::AmountMismatch { required, actual } => Some(serde_json::json!({
                "required": required.to_string(),
                "actual": actual.to_string(),
            })),
            GatewayError::NotFound { kind, id } => Some(serde_json::json!({
                "kind": kind.as_str(),
                "id": id,
            })),
            _ => None,
        }
    }
}

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "request rejected");
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<crate::money::MoneyError> for GatewayError {
    fn from(value: crate::money::MoneyError) -> Self {
        GatewayError::InvalidAmount(value.to_string())
    }
}
