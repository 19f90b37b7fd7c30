//! Ed25519 verification for signed admin and user requests.
//!
//! The order of checks is a security property: the cryptographic
//! verification always runs before any comparison against the expected
//! signer set or message, and those comparisons are constant-time. A caller
//! probing with forged signatures learns nothing about which signer the
//! server expects.
//!
//! Wallet keys and signatures travel base58-encoded, matching the chain
//! rail's address format.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use subtle::ConstantTimeEq;

use crate::error::GatewayError;

/// The three headers carrying a signed request.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// Base58-encoded 64-byte Ed25519 signature (`X-Signature`).
    pub signature: String,
    /// The exact message that was signed (`X-Message`).
    pub message: String,
    /// Base58-encoded 32-byte public key of the signer (`X-Signer`).
    pub signer: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("bad encoding: {0}")]
    BadEncoding(&'static str),
    #[error("bad signature")]
    BadSignature,
}

impl From<SignatureError> for GatewayError {
    fn from(_: SignatureError) -> Self {
        GatewayError::InvalidSignature
    }
}

fn decode_signer(signer: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = bs58::decode(signer)
        .into_vec()
        .map_err(|_| SignatureError::BadEncoding("signer"))?;
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SignatureError::BadEncoding("signer"))?;
    VerifyingKey::from_bytes(&array).map_err(|_| SignatureError::BadEncoding("signer"))
}

fn decode_signature(signature: &str) -> Result<Signature, SignatureError> {
    let bytes = bs58::decode(signature)
        .into_vec()
        .map_err(|_| SignatureError::BadEncoding("signature"))?;
    let array: [u8; 64] = bytes
        .try_into()
        .map_err(|_| SignatureError::BadEncoding("signature"))?;
    Ok(Signature::from_bytes(&array))
}

/// Verifies the request cryptographically: does `signature` sign `message`
/// under `signer`? Makes no judgement about who the signer is.
pub fn verify(request: &SignedRequest) -> Result<(), SignatureError> {
    let key = decode_signer(&request.signer)?;
    let signature = decode_signature(&request.signature)?;
    key.verify(request.message.as_bytes(), &signature)
        .map_err(|_| SignatureError::BadSignature)
}

fn ct_str_eq(a: &str, b: &str) -> bool {
    // Length leaks are acceptable; content must not leak.
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Verifies an admin request: valid signature first, then constant-time
/// comparison of the signer against the configured admin wallet and of the
/// message against the expected action string.
pub fn verify_admin(
    request: &SignedRequest,
    expected_signer: &str,
    expected_message: &str,
) -> Result<(), GatewayError> {
    verify(request)?;
    let signer_ok = ct_str_eq(&request.signer, expected_signer);
    let message_ok = ct_str_eq(&request.message, expected_message);
    if signer_ok && message_ok {
        Ok(())
    } else {
        Err(GatewayError::InvalidSignature)
    }
}

/// Verifies a user request against an allow-list. An empty allow-list
/// admits any signer whose signature verifies; the caller then owns the
/// signer identity (e.g. the refund recipient wallet).
pub fn verify_user(
    request: &SignedRequest,
    allowed_signers: &[String],
    expected_message: &str,
) -> Result<String, GatewayError> {
    verify(request)?;
    if !ct_str_eq(&request.message, expected_message) {
        return Err(GatewayError::InvalidSignature);
    }
    if allowed_signers.is_empty() {
        return Ok(request.signer.clone());
    }
    let mut admitted = false;
    for candidate in allowed_signers {
        // Scan the whole list regardless of matches.
        admitted |= ct_str_eq(&request.signer, candidate);
    }
    if admitted {
        Ok(request.signer.clone())
    } else {
        Err(GatewayError::InvalidSignature)
    }
}

/// Builds the canonical admin message for an action, e.g.
/// `approve-refund:refund_abc`.
pub fn admin_message(action: &str, principal: &str) -> String {
    format!("{action}:{principal}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn keypair(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn signed(key: &SigningKey, message: &str) -> SignedRequest {
        let signature = key.sign(message.as_bytes());
        SignedRequest {
            signature: bs58::encode(signature.to_bytes()).into_string(),
            message: message.to_string(),
            signer: bs58::encode(key.verifying_key().to_bytes()).into_string(),
        }
    }

    #[test]
    fn valid_signature_verifies() {
        let key = keypair(7);
        let request = signed(&key, "approve-refund:refund_abc");
        assert!(verify(&request).is_ok());
    }

    #[test]
    fn tampered_message_fails() {
        let key = keypair(7);
        let mut request = signed(&key, "approve-refund:refund_abc");
        request.message = "approve-refund:refund_zzz".to_string();
        assert_eq!(verify(&request), Err(SignatureError::BadSignature));
    }

    #[test]
    fn garbage_encoding_fails_before_crypto() {
        let request = SignedRequest {
            signature: "!!not-base58!!".to_string(),
            message: "m".to_string(),
            signer: "also-bad".to_string(),
        };
        assert!(matches!(
            verify(&request),
            Err(SignatureError::BadEncoding(_))
        ));
    }

    #[test]
    fn admin_accepts_expected_signer_and_message() {
        let key = keypair(1);
        let admin = bs58::encode(key.verifying_key().to_bytes()).into_string();
        let message = admin_message("deny-refund", "refund_abc");
        let request = signed(&key, &message);
        assert!(verify_admin(&request, &admin, &message).is_ok());
    }

    #[test]
    fn admin_rejects_wrong_signer_with_valid_signature() {
        let intruder = keypair(2);
        let admin_key = keypair(1);
        let admin = bs58::encode(admin_key.verifying_key().to_bytes()).into_string();
        let message = admin_message("deny-refund", "refund_abc");
        // Cryptographically valid under the intruder's own key.
        let request = signed(&intruder, &message);
        assert!(verify_admin(&request, &admin, &message).is_err());
    }

    #[test]
    fn admin_rejects_message_deviation() {
        let key = keypair(1);
        let admin = bs58::encode(key.verifying_key().to_bytes()).into_string();
        let request = signed(&key, "deny-refund:refund_other");
        let expected = admin_message("deny-refund", "refund_abc");
        assert!(verify_admin(&request, &admin, &expected).is_err());
    }

    #[test]
    fn user_allow_list() {
        let key = keypair(3);
        let wallet = bs58::encode(key.verifying_key().to_bytes()).into_string();
        let request = signed(&key, "refund-request:sig123");
        let signer =
            verify_user(&request, &[wallet.clone()], "refund-request:sig123").unwrap();
        assert_eq!(signer, wallet);
        assert!(verify_user(&request, &["other".to_string()], "refund-request:sig123").is_err());
    }

    #[test]
    fn user_empty_allow_list_returns_signer() {
        let key = keypair(4);
        let request = signed(&key, "refund-request:sig123");
        let signer = verify_user(&request, &[], "refund-request:sig123").unwrap();
        assert_eq!(
            signer,
            bs58::encode(key.verifying_key().to_bytes()).into_string()
        );
    }
}
