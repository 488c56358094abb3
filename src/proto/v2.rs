//! Current x402 protocol version 2.
//!
//! V2 addresses networks by CAIP-2 chain id, nests the accepted requirement
//! inside the payment payload, and uses the `payment-required` /
//! `payment-signature` header pair.

use alloy_primitives::U256;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Display, Formatter};
use url::Url;

use crate::chain::ChainId;
use crate::chain::eip155::{ChecksummedAddress, TokenAmount};
use crate::proto;
use crate::proto::PaymentVerificationError;
use crate::proto::v1;

pub use v1::{PaymentRequirementsExtra, SettleErrorReason};

/// Version 2 of the x402 protocol.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version2;

impl X402Version2 {
    pub const VALUE: u8 = 2;
}

impl From<X402Version2> for u8 {
    fn from(_: X402Version2) -> Self {
        X402Version2::VALUE
    }
}

impl Serialize for X402Version2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version2 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version2)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {}, got {}",
                Self::VALUE,
                num
            )))
        }
    }
}

impl Display for X402Version2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

pub type VerifyResponse = v1::VerifyResponse;
pub type SettleResponse = v1::SettleResponse;

/// Description of the protected resource, carried in 402 bodies and payment
/// payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest<TPayload, TRequirements> {
    pub x402_version: X402Version2,
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

/// A V2 payment payload: the requirement the client accepted plus the signed
/// scheme payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload<TPayload> {
    pub x402_version: X402Version2,
    pub accepted: PaymentRequirements,
    pub payload: TPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,
}

/// What the resource server demands for one acceptable payment.
///
/// The amount can be given directly in atomic units (`amount`) or as a
/// human-readable value plus token decimals (`amountRequired` +
/// `tokenDecimals`); [`PaymentRequirements::required_amount`] derives the
/// atomic value either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: ChainId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<TokenAmount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_required: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_decimals: Option<u8>,
    pub pay_to: ChecksummedAddress,
    pub asset: ChecksummedAddress,
    pub max_timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<PaymentRequirementsExtra>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Url>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl PaymentRequirements {
    /// The required amount in atomic units.
    ///
    /// Prefers the explicit `amount`; otherwise scales `amountRequired` by
    /// `tokenDecimals`. Fails when neither form is present or the
    /// human-readable form carries more precision than the token supports.
    pub fn required_amount(&self) -> Result<U256, PaymentVerificationError> {
        if let Some(amount) = self.amount {
            return Ok(amount.into());
        }
        let (required, decimals) = match (self.amount_required, self.token_decimals) {
            (Some(required), Some(decimals)) => (required, decimals),
            _ => {
                return Err(PaymentVerificationError::InvalidFormat(
                    "either amount or amountRequired with tokenDecimals is required".to_string(),
                ));
            }
        };
        let scale = required.scale();
        if scale > decimals as u32 {
            return Err(PaymentVerificationError::InvalidFormat(format!(
                "amountRequired has {scale} decimal places, token supports {decimals}"
            )));
        }
        let mantissa = required.mantissa().unsigned_abs();
        let multiplier = U256::from(10).pow(U256::from(decimals as u32 - scale));
        Ok(U256::from(mantissa) * multiplier)
    }
}

/// Body of a V2 402 Payment Required response, also carried base64-encoded
/// in the `payment-required` header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: X402Version2,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,
    pub accepts: Vec<serde_json::Value>,
    /// The rejected payer, set when a submitted payment failed verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn requirements(
        amount: Option<u64>,
        amount_required: Option<&str>,
        token_decimals: Option<u8>,
    ) -> PaymentRequirements {
        PaymentRequirements {
            scheme: "exact".to_string(),
            network: ChainId::new("eip155", "8453"),
            network_id: None,
            amount: amount.map(TokenAmount::from),
            amount_required: amount_required.map(|s| Decimal::from_str(s).unwrap()),
            token_decimals,
            pay_to: "0x2EC8A9A0ab8bA5cD3a7C0c570e919d1C23E53628".parse().unwrap(),
            asset: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".parse().unwrap(),
            max_timeout_seconds: 300,
            extra: None,
            resource: None,
            description: String::new(),
            mime_type: None,
        }
    }

    #[test]
    fn atomic_amount_wins() {
        let r = requirements(Some(1000), Some("5"), Some(6));
        assert_eq!(r.required_amount().unwrap(), U256::from(1000u64));
    }

    #[test]
    fn human_amount_is_scaled() {
        let r = requirements(None, Some("1.5"), Some(6));
        assert_eq!(r.required_amount().unwrap(), U256::from(1_500_000u64));
    }

    #[test]
    fn missing_both_forms_is_invalid() {
        let r = requirements(None, None, None);
        assert!(r.required_amount().is_err());
    }

    #[test]
    fn excess_precision_is_invalid() {
        let r = requirements(None, Some("0.1234567"), Some(6));
        assert!(r.required_amount().is_err());
    }

    #[test]
    fn requirement_json_uses_camel_case() {
        let r = requirements(Some(1000), None, None);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["payTo"], "0x2EC8A9A0ab8bA5cD3a7C0c570e919d1C23E53628");
        assert_eq!(json["maxTimeoutSeconds"], 300);
        assert_eq!(json["amount"], "1000");
        assert_eq!(json["network"], "eip155:8453");
    }
}
