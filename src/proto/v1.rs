//! Legacy x402 protocol version 1.
//!
//! V1 payloads address networks by short name (`"bsc"`) and carry the scheme
//! at the payload top level. V1 requests use the `X-PAYMENT` header and V1
//! responses the `X-PAYMENT-RESPONSE` header. Still accepted for backwards
//! compatibility; V2 ([`super::v2`]) is current.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;

use crate::chain::eip155::{ChecksummedAddress, TokenAmount};
use crate::proto;
use crate::proto::ErrorReason;

/// Version 1 of the x402 protocol.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version1;

impl X402Version1 {
    pub const VALUE: u8 = 1;
}

impl From<X402Version1> for u8 {
    fn from(_: X402Version1) -> Self {
        X402Version1::VALUE
    }
}

impl Serialize for X402Version1 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version1 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version1)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {}, got {}",
                Self::VALUE,
                num
            )))
        }
    }
}

impl Display for X402Version1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

/// The reason attached to a failed settlement.
///
/// Usually a taxonomy code; transport timeout messages are carried verbatim
/// so the caller can still correlate the transaction hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleErrorReason {
    Reason(ErrorReason),
    Other(String),
}

impl From<ErrorReason> for SettleErrorReason {
    fn from(value: ErrorReason) -> Self {
        Self::Reason(value)
    }
}

impl Display for SettleErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettleErrorReason::Reason(reason) => write!(f, "{reason}"),
            SettleErrorReason::Other(message) => write!(f, "{message}"),
        }
    }
}

impl Serialize for SettleErrorReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SettleErrorReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let as_reason = serde_json::from_value::<ErrorReason>(serde_json::Value::String(s.clone()));
        match as_reason {
            Ok(reason) => Ok(SettleErrorReason::Reason(reason)),
            Err(_) => Ok(SettleErrorReason::Other(s)),
        }
    }
}

/// Result of an on-chain settlement attempt.
#[derive(Debug, Clone)]
pub enum SettleResponse {
    Success {
        payer: String,
        transaction: String,
        network: String,
    },
    Error {
        reason: SettleErrorReason,
        network: String,
        /// Transaction hash, when the transaction reached the chain before failing.
        transaction: Option<String>,
        payer: Option<String>,
    },
}

impl From<SettleResponse> for proto::SettleResponse {
    fn from(val: SettleResponse) -> Self {
        proto::SettleResponse(
            serde_json::to_value(val).expect("SettleResponse serialization failed"),
        )
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponseWire {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<SettleErrorReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    pub network: String,
}

impl Serialize for SettleResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            SettleResponse::Success {
                payer,
                transaction,
                network,
            } => SettleResponseWire {
                success: true,
                error_reason: None,
                payer: Some(payer.clone()),
                transaction: Some(transaction.clone()),
                network: network.clone(),
            },
            SettleResponse::Error {
                reason,
                network,
                transaction,
                payer,
            } => SettleResponseWire {
                success: false,
                error_reason: Some(reason.clone()),
                payer: payer.clone(),
                transaction: transaction.clone(),
                network: network.clone(),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SettleResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = SettleResponseWire::deserialize(deserializer)?;
        if wire.success {
            let payer = wire
                .payer
                .ok_or_else(|| serde::de::Error::missing_field("payer"))?;
            let transaction = wire
                .transaction
                .ok_or_else(|| serde::de::Error::missing_field("transaction"))?;
            Ok(SettleResponse::Success {
                payer,
                transaction,
                network: wire.network,
            })
        } else {
            let reason = wire
                .error_reason
                .ok_or_else(|| serde::de::Error::missing_field("errorReason"))?;
            Ok(SettleResponse::Error {
                reason,
                network: wire.network,
                transaction: wire.transaction,
                payer: wire.payer,
            })
        }
    }
}

/// Result returned by the facilitator after verifying a payment payload
/// against the payment requirements.
#[derive(Debug, Clone)]
pub enum VerifyResponse {
    /// The payload matches the requirements and passes all checks.
    Valid { payer: String },
    /// The payload was well-formed but failed verification.
    Invalid {
        reason: ErrorReason,
        payer: Option<String>,
    },
}

impl From<VerifyResponse> for proto::VerifyResponse {
    fn from(val: VerifyResponse) -> Self {
        proto::VerifyResponse(
            serde_json::to_value(val).expect("VerifyResponse serialization failed"),
        )
    }
}

impl VerifyResponse {
    /// A successful verification identifying the `payer`.
    pub fn valid(payer: String) -> Self {
        VerifyResponse::Valid { payer }
    }

    /// A failed verification with a taxonomy `reason`.
    pub fn invalid(payer: Option<String>, reason: ErrorReason) -> Self {
        VerifyResponse::Invalid { reason, payer }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponseWire {
    is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    payer: Option<String>,
    #[serde(default)]
    invalid_reason: Option<ErrorReason>,
}

impl Serialize for VerifyResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            VerifyResponse::Valid { payer } => VerifyResponseWire {
                is_valid: true,
                payer: Some(payer.clone()),
                invalid_reason: None,
            },
            VerifyResponse::Invalid { reason, payer } => VerifyResponseWire {
                is_valid: false,
                payer: payer.clone(),
                invalid_reason: Some(*reason),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = VerifyResponseWire::deserialize(deserializer)?;
        if wire.is_valid {
            let payer = wire
                .payer
                .ok_or_else(|| serde::de::Error::missing_field("payer"))?;
            Ok(VerifyResponse::Valid { payer })
        } else {
            let reason = wire
                .invalid_reason
                .ok_or_else(|| serde::de::Error::missing_field("invalidReason"))?;
            Ok(VerifyResponse::Invalid {
                reason,
                payer: wire.payer,
            })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest<TPayload, TRequirements> {
    pub x402_version: X402Version1,
    pub payment_payload: TPayload,
    pub payment_requirements: TRequirements,
}

impl<TPayload, TRequirements> VerifyRequest<TPayload, TRequirements>
where
    Self: DeserializeOwned,
{
    pub fn from_proto(
        request: proto::VerifyRequest,
    ) -> Result<Self, proto::PaymentVerificationError> {
        let deserialized: Self = serde_json::from_value(request.into_json())?;
        Ok(deserialized)
    }
}

/// A signed V1 request to transfer a specific amount of funds on-chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload<TPayload> {
    pub x402_version: X402Version1,
    pub scheme: String,
    pub network: String,
    pub payload: TPayload,
}

/// EIP-712 domain parameters attached to a payment requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirementsExtra {
    pub name: String,
    pub version: String,
}

/// V1 requirements for an acceptable payment: amount, recipient, asset,
/// network, and display metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: TokenAmount,
    pub resource: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    pub pay_to: ChecksummedAddress,
    pub max_timeout_seconds: u64,
    pub asset: ChecksummedAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<PaymentRequirementsExtra>,
}

/// Body of a V1 402 Payment Required response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: X402Version1,
    pub error: String,
    pub accepts: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_response_valid_wire_shape() {
        let response = VerifyResponse::valid("0x34B7".to_string());
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["isValid"], true);
        assert_eq!(json["payer"], "0x34B7");
        assert!(json.get("invalidReason").is_none());
    }

    #[test]
    fn verify_response_invalid_carries_reason() {
        let response = VerifyResponse::invalid(None, ErrorReason::InsufficientFunds);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["isValid"], false);
        assert_eq!(json["invalidReason"], "insufficient_funds");
    }

    #[test]
    fn settle_error_reason_roundtrips_taxonomy() {
        let reason = SettleErrorReason::Reason(ErrorReason::InvalidTransactionState);
        let json = serde_json::to_string(&reason).unwrap();
        assert_eq!(json, "\"invalid_transaction_state\"");
        let back: SettleErrorReason = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reason);
    }

    #[test]
    fn settle_error_reason_preserves_foreign_message() {
        let json = "\"Transaction 0xabc timed out\"";
        let parsed: SettleErrorReason = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            SettleErrorReason::Other("Transaction 0xabc timed out".to_string())
        );
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
    }

    #[test]
    fn settle_response_failure_keeps_transaction() {
        let response = SettleResponse::Error {
            reason: ErrorReason::InvalidTransactionState.into(),
            network: "eip155:56".to_string(),
            transaction: Some("0xdead".to_string()),
            payer: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["transaction"], "0xdead");
        assert_eq!(json["errorReason"], "invalid_transaction_state");
    }
}
