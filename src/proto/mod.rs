//! Protocol types for x402 payment messages.
//!
//! Defines the wire format exchanged between buyers, resource servers, and
//! the facilitator, for protocol version 2 ([`v2`]) and the legacy version 1
//! ([`v1`]). All types serialize to JSON with camelCase field names; the
//! protocol version is carried in the `x402Version` field.
//!
//! Requests arrive untyped ([`VerifyRequest`] wraps raw JSON) so the
//! facilitator can route them to a scheme engine by `(scheme, network)`
//! before committing to a concrete shape.

use serde::{Deserialize, Serialize};
use serde_with::{VecSkipError, serde_as};
use std::collections::HashMap;
use std::str::FromStr;

use crate::chain::ChainId;
use crate::networks;
use crate::scheme::SchemeHandlerSlug;

pub mod v1;
pub mod v2;

/// Request to verify a payment before settlement.
///
/// Wraps the raw JSON body of `POST /verify`. The inner structure varies by
/// protocol version and scheme; [`VerifyRequest::scheme_handler_slug`] peeks
/// at the envelope to pick the scheme engine that parses the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest(serde_json::Value);

/// Request to settle a verified payment on-chain. Same shape as
/// [`VerifyRequest`].
pub type SettleRequest = VerifyRequest;

impl From<serde_json::Value> for VerifyRequest {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl VerifyRequest {
    /// Consumes the request and returns the inner JSON value.
    pub fn into_json(self) -> serde_json::Value {
        self.0
    }

    /// The declared protocol version, when the envelope carries one.
    pub fn x402_version(&self) -> Option<u8> {
        self.0.get("x402Version")?.as_u64()?.try_into().ok()
    }

    /// Extracts the scheme handler slug from the request envelope.
    ///
    /// V1 payloads carry a network name; V2 payloads carry a CAIP-2 chain id
    /// in `paymentPayload.accepted.network`. Returns `None` for malformed
    /// envelopes or unknown versions.
    pub fn scheme_handler_slug(&self) -> Option<SchemeHandlerSlug> {
        let x402_version: u8 = self.0.get("x402Version")?.as_u64()?.try_into().ok()?;
        match x402_version {
            v1::X402Version1::VALUE => {
                let network = self.0.get("paymentPayload")?.get("network")?.as_str()?;
                let chain_id: ChainId = networks::eip155_reference_from_str(network).into();
                let scheme = self.0.get("paymentPayload")?.get("scheme")?.as_str()?;
                Some(SchemeHandlerSlug::new(chain_id, 1, scheme.into()))
            }
            v2::X402Version2::VALUE => {
                let accepted = self.0.get("paymentPayload")?.get("accepted")?;
                let chain_id = ChainId::from_str(accepted.get("network")?.as_str()?).ok()?;
                let scheme = accepted.get("scheme")?.as_str()?;
                Some(SchemeHandlerSlug::new(chain_id, 2, scheme.into()))
            }
            _ => None,
        }
    }
}

/// Response from a payment verification request, as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse(pub serde_json::Value);

/// Response from a payment settlement request, as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleResponse(pub serde_json::Value);

/// A payment method supported by the facilitator, as listed by `/supported`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    /// The x402 protocol version (1 or 2).
    pub x402_version: u8,
    /// The payment scheme identifier (e.g., "exact").
    pub scheme: String,
    /// The network identifier (CAIP-2 chain id for V2, network name for V1).
    pub network: String,
    /// Optional scheme-specific extra data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Response of the facilitator's `/supported` endpoint.
///
/// Lists supported payment kinds and, per chain, the facilitator signer
/// addresses (clients pre-approve allowances against these for tokens
/// without EIP-3009 support).
#[serde_as]
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    /// List of supported payment kinds.
    #[serde_as(as = "VecSkipError<_>")]
    pub kinds: Vec<SupportedPaymentKind>,
    /// Map of chain ids to facilitator signer addresses.
    #[serde(default)]
    pub signers: HashMap<ChainId, Vec<String>>,
}

/// Machine-readable reason codes for payment failures.
///
/// The protocol treats these strings as part of the wire format; they are
/// emitted verbatim in snake_case and must never be reworded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    InsufficientFunds,
    UnsupportedScheme,
    NetworkMismatch,
    MissingEip712Domain,
    InvalidExactEvmPayloadSignature,
    InvalidExactEvmPayloadUndeployedSmartWallet,
    InvalidExactEvmPayloadRecipientMismatch,
    InvalidExactEvmPayloadAuthorizationValidBefore,
    InvalidExactEvmPayloadAuthorizationValidAfter,
    InvalidExactEvmPayloadAuthorizationValue,
    InvalidScheme,
    InvalidTransactionState,
    InvalidPayload,
    InvalidNetwork,
    InvalidX402Version,
    PaymentExpired,
    NonceUsed,
    UnexpectedVerifyError,
    UnexpectedSettleError,
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Leverage serde to print the snake_case wire spelling.
        let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

/// Errors raised while validating a payment payload against requirements.
#[derive(Debug, thiserror::Error)]
pub enum PaymentVerificationError {
    /// The payload is malformed or missing required fields.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    /// The declared payment scheme is not "exact".
    #[error("Unsupported payment scheme")]
    UnsupportedScheme,
    /// The declared protocol version is not accepted.
    #[error("Unsupported x402 version")]
    UnsupportedX402Version,
    /// The payload network does not match the requirements.
    #[error("Payment network does not match the payment requirements")]
    NetworkMismatch,
    /// The network is not handled by this facilitator.
    #[error("Unsupported network")]
    UnsupportedNetwork,
    /// EIP-3009 transfer requested without an EIP-712 domain to sign under.
    #[error("Missing EIP-712 domain")]
    MissingEip712Domain,
    /// Authorization recipient differs from the required `payTo`.
    #[error("Payment recipient does not match the payment requirements")]
    RecipientMismatch,
    /// `validBefore` is inside the block-time buffer.
    #[error("Payment authorization expires too soon")]
    ValidBeforeTooSoon,
    /// `validAfter` is in the future.
    #[error("Payment authorization is not yet valid")]
    ValidAfterInFuture,
    /// Authorization value does not cover the required amount.
    #[error("Authorization value does not cover the required amount")]
    InsufficientValue,
    /// On-chain balance does not cover the required amount.
    #[error("Onchain balance does not cover the required amount")]
    InsufficientFunds,
    /// The signature failed contract-side validation.
    #[error("{0}")]
    InvalidSignature(String),
    /// Smart-wallet payer without code and without EIP-6492 deployment data.
    #[error("Smart wallet is not deployed and the signature carries no deployment")]
    UndeployedSmartWallet,
    /// The authorization nonce was already consumed on-chain.
    #[error("Authorization nonce is already used")]
    NonceUsed,
    /// Processing exceeded the payment deadline.
    #[error("Payment authorization expired")]
    Expired,
    /// The facilitator signer is not an accepted operator of the contract.
    #[error("Facilitator signer is not an accepted operator")]
    InvalidOperator,
}

impl AsPaymentProblem for PaymentVerificationError {
    fn as_payment_problem(&self) -> PaymentProblem {
        let error_reason = match self {
            PaymentVerificationError::InvalidFormat(_) => ErrorReason::InvalidPayload,
            PaymentVerificationError::UnsupportedScheme => ErrorReason::UnsupportedScheme,
            PaymentVerificationError::UnsupportedX402Version => ErrorReason::InvalidX402Version,
            PaymentVerificationError::NetworkMismatch => ErrorReason::NetworkMismatch,
            PaymentVerificationError::UnsupportedNetwork => ErrorReason::InvalidNetwork,
            PaymentVerificationError::MissingEip712Domain => ErrorReason::MissingEip712Domain,
            PaymentVerificationError::RecipientMismatch => {
                ErrorReason::InvalidExactEvmPayloadRecipientMismatch
            }
            PaymentVerificationError::ValidBeforeTooSoon => {
                ErrorReason::InvalidExactEvmPayloadAuthorizationValidBefore
            }
            PaymentVerificationError::ValidAfterInFuture => {
                ErrorReason::InvalidExactEvmPayloadAuthorizationValidAfter
            }
            PaymentVerificationError::InsufficientValue => {
                ErrorReason::InvalidExactEvmPayloadAuthorizationValue
            }
            PaymentVerificationError::InsufficientFunds => ErrorReason::InsufficientFunds,
            PaymentVerificationError::InvalidSignature(_) => {
                ErrorReason::InvalidExactEvmPayloadSignature
            }
            PaymentVerificationError::UndeployedSmartWallet => {
                ErrorReason::InvalidExactEvmPayloadUndeployedSmartWallet
            }
            PaymentVerificationError::NonceUsed => ErrorReason::NonceUsed,
            PaymentVerificationError::Expired => ErrorReason::PaymentExpired,
            PaymentVerificationError::InvalidOperator => ErrorReason::UnexpectedVerifyError,
        };
        PaymentProblem::new(error_reason, self.to_string())
    }
}

impl From<serde_json::Error> for PaymentVerificationError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidFormat(value.to_string())
    }
}

/// Trait for converting errors into structured payment problems.
pub trait AsPaymentProblem {
    /// Converts this error into a [`PaymentProblem`].
    fn as_payment_problem(&self) -> PaymentProblem;
}

/// A structured payment error: machine-readable reason plus human-readable
/// details, returned to clients on verification or settlement failure.
pub struct PaymentProblem {
    reason: ErrorReason,
    details: String,
}

impl PaymentProblem {
    /// Creates a new payment problem with the given reason and details.
    pub fn new(reason: ErrorReason, details: String) -> Self {
        Self { reason, details }
    }

    /// Returns the error reason code.
    pub fn reason(&self) -> ErrorReason {
        self.reason
    }

    /// Returns the human-readable error details.
    pub fn details(&self) -> &str {
        &self.details
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_reason_wire_spelling() {
        assert_eq!(
            ErrorReason::InvalidExactEvmPayloadAuthorizationValidBefore.to_string(),
            "invalid_exact_evm_payload_authorization_valid_before"
        );
        assert_eq!(
            ErrorReason::InvalidExactEvmPayloadUndeployedSmartWallet.to_string(),
            "invalid_exact_evm_payload_undeployed_smart_wallet"
        );
        assert_eq!(ErrorReason::NonceUsed.to_string(), "nonce_used");
        assert_eq!(
            ErrorReason::UnexpectedSettleError.to_string(),
            "unexpected_settle_error"
        );
    }

    #[test]
    fn v2_slug_extraction() {
        let request: VerifyRequest = json!({
            "x402Version": 2,
            "paymentPayload": {
                "accepted": { "scheme": "exact", "network": "eip155:56" },
                "payload": {}
            },
            "paymentRequirements": {}
        })
        .into();
        let slug = request.scheme_handler_slug().unwrap();
        assert_eq!(slug.chain_id.to_string(), "eip155:56");
        assert_eq!(slug.x402_version, 2);
        assert_eq!(slug.name, "exact");
    }

    #[test]
    fn v1_slug_resolves_network_name() {
        let request: VerifyRequest = json!({
            "x402Version": 1,
            "paymentPayload": {
                "scheme": "exact",
                "network": "bsc",
                "payload": {}
            },
            "paymentRequirements": {}
        })
        .into();
        let slug = request.scheme_handler_slug().unwrap();
        assert_eq!(slug.chain_id.to_string(), "eip155:56");
        assert_eq!(slug.x402_version, 1);
    }

    #[test]
    fn unknown_version_has_no_slug() {
        let request: VerifyRequest = json!({ "x402Version": 3 }).into();
        assert!(request.scheme_handler_slug().is_none());
    }
}
