//! Wire and contract types for the Exact-EVM scheme.
//!
//! The authorization blob has two structurally similar but semantically
//! distinct EIP-712 types: [`TransferWithAuthorization`] signed under the
//! token's own domain (EIP-3009 path), and [`tokenTransferWithAuthorization`]
//! signed under the facilitator contract's domain (allowance path). The
//! capability probe decides which one a payment uses; the two are never
//! duck-typed into each other.

use alloy_primitives::{Address, B256, Bytes, Signature, address, hex};
use alloy_sol_types::{Eip712Domain, SolCall, SolStruct, SolValue, eip712_domain, sol};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::chain::eip155::{ChecksummedAddress, TokenAmount};
use crate::proto::v1;
use crate::proto::v2;
use crate::timestamp::UnixTimestamp;

/// Marker for the one payment scheme this crate implements.
///
/// Serializes as the literal `"exact"` and rejects anything else on the way
/// in, so a mistyped scheme fails at the parsing boundary instead of deep in
/// verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExactScheme;

impl ExactScheme {
    pub const VALUE: &'static str = "exact";
}

impl AsRef<str> for ExactScheme {
    fn as_ref(&self) -> &str {
        Self::VALUE
    }
}

impl Display for ExactScheme {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(Self::VALUE)
    }
}

impl Serialize for ExactScheme {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for ExactScheme {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == Self::VALUE {
            Ok(ExactScheme)
        } else {
            Err(serde::de::Error::custom(format!(
                "unknown payment scheme '{s}', expected '{}'",
                Self::VALUE
            )))
        }
    }
}

/// Address of the facilitator transfer contract, identical on every
/// supported chain. Overridable per scheme in configuration.
pub const FACILITATOR_ADDRESS: Address = address!("0x555e3311a9893c9B17444C1Ff0d88192a57Ef13e");

sol! {
    #[allow(missing_docs)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IEIP3009 {
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bytes signature
        ) external;
    }
}

sol! {
    #[allow(missing_docs)]
    #[allow(clippy::too_many_arguments)]
    #[derive(Debug)]
    #[sol(rpc)]
    interface IFacilitatorTransfer {
        function tokenTransferWithAuthorization(
            address token,
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bool needApprove,
            bytes signature
        ) external;
    }
}

sol! {
    /// EIP-712 message of an ERC-3009 transfer, signed under the token's own
    /// domain `{name, version, chainId, verifyingContract = token}`.
    #[derive(Serialize, Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

sol! {
    /// EIP-712 message of a facilitator-contract transfer, signed under the
    /// domain `{name: "Facilitator", version: "1", chainId,
    /// verifyingContract = facilitator}`. Used for tokens without EIP-3009
    /// support; the payer pre-approves the facilitator contract instead.
    #[allow(non_camel_case_types)]
    #[derive(Serialize, Deserialize)]
    struct tokenTransferWithAuthorization {
        address token;
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
        bool needApprove;
    }
}

sol! {
    /// Prefix of an EIP-6492 signature: the tuple
    /// `(address factory, bytes factoryCalldata, bytes innerSig)`.
    #[derive(Debug)]
    struct Sig6492 {
        address factory;
        bytes   factoryCalldata;
        bytes   innerSig;
    }
}

/// EIP-712 domain of the facilitator transfer contract on `chain_id`.
pub fn facilitator_domain(chain_id: u64, facilitator: Address) -> Eip712Domain {
    eip712_domain! {
        name: "Facilitator",
        version: "1",
        chain_id: chain_id,
        verifying_contract: facilitator,
    }
}

/// The signed transfer intent of a payment payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmAuthorization {
    /// Authorized sender, an EOA or a smart wallet.
    pub from: ChecksummedAddress,
    /// Authorized recipient.
    pub to: ChecksummedAddress,
    /// Transfer amount in atomic units.
    pub value: TokenAmount,
    /// Not valid before this timestamp (inclusive).
    pub valid_after: UnixTimestamp,
    /// Not valid at/after this timestamp (exclusive).
    pub valid_before: UnixTimestamp,
    /// Unique 32-byte nonce (prevents replay).
    pub nonce: B256,
}

impl ExactEvmAuthorization {
    /// A fresh 32-byte authorization nonce for client-side payload
    /// construction. Uniqueness is what prevents replay; the value itself
    /// carries no meaning.
    pub fn random_nonce() -> B256 {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        B256::from(bytes)
    }
}

/// Authorization plus its signature: 65 bytes for an EOA, longer for
/// EIP-1271 / EIP-6492 blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactEvmPayload {
    pub authorization: ExactEvmAuthorization,
    pub signature: Bytes,
}

pub type PaymentRequirements = v2::PaymentRequirements;
pub type PaymentPayload = v2::PaymentPayload<ExactEvmPayload>;
pub type VerifyRequest = v2::VerifyRequest<PaymentPayload, PaymentRequirements>;
pub type SettleRequest = VerifyRequest;

pub type V1PaymentRequirements = v1::PaymentRequirements;
pub type V1PaymentPayload = v1::PaymentPayload<ExactEvmPayload>;
pub type V1VerifyRequest = v1::VerifyRequest<V1PaymentPayload, V1PaymentRequirements>;
pub type V1SettleRequest = V1VerifyRequest;

/// A transfer authorization normalized from either protocol version,
/// joined with the fields of the requirement it was matched against.
#[derive(Debug, Clone)]
pub struct ExactPayment {
    /// Token contract.
    pub asset: Address,
    /// Authorized sender.
    pub from: Address,
    /// Authorized recipient.
    pub to: Address,
    /// Transfer amount.
    pub value: alloy_primitives::U256,
    /// Start of the validity window (inclusive).
    pub valid_after: UnixTimestamp,
    /// End of the validity window (exclusive).
    pub valid_before: UnixTimestamp,
    /// 32-byte authorization nonce.
    pub nonce: B256,
    /// Raw signature bytes.
    pub signature: Bytes,
    /// Required recipient from the requirement.
    pub pay_to: Address,
    /// Required amount in atomic units.
    pub required_amount: alloy_primitives::U256,
    /// Deadline for verify/settle processing, from the requirement.
    pub max_timeout_seconds: u64,
    /// EIP-712 domain parameters from the requirement, when given.
    pub eip712: Option<v1::PaymentRequirementsExtra>,
    /// The network string as spelled in the payload, echoed in responses.
    pub network: String,
    /// Resource URL for the scan record, when known.
    pub resource: Option<String>,
}

impl ExactPayment {
    /// Calldata of `tokenTransferWithAuthorization` on the facilitator
    /// contract for this payment, with the given `signature` bytes.
    pub fn facilitator_calldata(&self, need_approve: bool, signature: Bytes) -> Bytes {
        let call = IFacilitatorTransfer::tokenTransferWithAuthorizationCall {
            token: self.asset,
            from: self.from,
            to: self.to,
            value: self.value,
            validAfter: self.valid_after.into(),
            validBefore: self.valid_before.into(),
            nonce: self.nonce,
            needApprove: need_approve,
            signature,
        };
        call.abi_encode().into()
    }

    /// EIP-712 signing hash of the EIP-3009 `TransferWithAuthorization`
    /// message under the token's `domain`.
    pub fn transfer_signing_hash(&self, domain: &Eip712Domain) -> B256 {
        let message = TransferWithAuthorization {
            from: self.from,
            to: self.to,
            value: self.value,
            validAfter: self.valid_after.into(),
            validBefore: self.valid_before.into(),
            nonce: self.nonce,
        };
        message.eip712_signing_hash(domain)
    }
}

/// The fixed 32-byte magic suffix defined by
/// [EIP-6492](https://eips.ethereum.org/EIPS/eip-6492).
///
/// Any signature ending with this constant is treated as a 6492-wrapped
/// signature; the preceding bytes ABI-decode as
/// `(address factory, bytes factoryCalldata, bytes innerSig)`.
pub const EIP6492_MAGIC_SUFFIX: [u8; 32] =
    hex!("6492649264926492649264926492649264926492649264926492649264926492");

/// A structured representation of an Ethereum signature.
///
/// Normalizes the three supported cases:
///
/// - **EIP-6492 wrapped**: counterfactual contract wallets; carries the
///   deployment metadata (factory + calldata) plus the inner signature.
/// - **EOA**: a plain 65-byte (or ERC-2098 64-byte) secp256k1 signature
///   that recovers to the expected signer.
/// - **EIP-1271**: any other blob, validated by the wallet contract.
#[derive(Debug, Clone)]
pub enum StructuredSignature {
    /// An EIP-6492 wrapped signature.
    Eip6492 {
        /// Factory contract that deploys the wallet deterministically.
        factory: Address,
        /// Calldata to invoke on the factory (usually a CREATE2 deployment).
        factory_calldata: Bytes,
        /// Inner signature for the wallet itself, probably EIP-1271.
        inner: Bytes,
    },
    /// A recovered EOA signature.
    Eoa(Signature),
    /// A plain EIP-1271 contract signature.
    Eip1271(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum StructuredSignatureFormatError {
    #[error("Invalid EIP-6492 signature encoding: {0}")]
    InvalidEip6492Format(alloy_sol_types::Error),
}

impl StructuredSignature {
    /// Parses raw signature bytes.
    ///
    /// The EIP-6492 magic suffix takes precedence; then a 64/65-byte blob is
    /// tried as an EOA signature against `prehash` and `expected_signer`;
    /// anything else is EIP-1271.
    pub fn try_from_bytes(
        bytes: Bytes,
        expected_signer: Address,
        prehash: &B256,
    ) -> Result<Self, StructuredSignatureFormatError> {
        if let Some(parsed) = Self::try_eip6492(&bytes)? {
            return Ok(parsed);
        }
        let eoa_signature = if bytes.len() == 65 {
            Signature::from_raw(&bytes).ok().map(|s| s.normalized_s())
        } else if bytes.len() == 64 {
            Some(Signature::from_erc2098(&bytes).normalized_s())
        } else {
            None
        };
        match eoa_signature {
            None => Ok(StructuredSignature::Eip1271(bytes)),
            Some(s) => {
                let is_expected_signer = s
                    .recover_address_from_prehash(prehash)
                    .ok()
                    .map(|r| r == expected_signer)
                    .unwrap_or(false);
                if is_expected_signer {
                    Ok(StructuredSignature::Eoa(s))
                } else {
                    Ok(StructuredSignature::Eip1271(bytes))
                }
            }
        }
    }

    /// Parses the bytes as an EIP-6492 wrapper, or `Ok(None)` when the magic
    /// suffix is absent.
    pub fn try_eip6492(bytes: &Bytes) -> Result<Option<Self>, StructuredSignatureFormatError> {
        let is_eip6492 = bytes.len() >= 32 && bytes[bytes.len() - 32..] == EIP6492_MAGIC_SUFFIX;
        if !is_eip6492 {
            return Ok(None);
        }
        let body = &bytes[..bytes.len() - 32];
        let sig6492 = Sig6492::abi_decode_params(body)
            .map_err(StructuredSignatureFormatError::InvalidEip6492Format)?;
        Ok(Some(StructuredSignature::Eip6492 {
            factory: sig6492.factory,
            factory_calldata: sig6492.factoryCalldata,
            inner: sig6492.innerSig,
        }))
    }
}

/// Custom error selectors raised by the facilitator transfer contract.
///
/// Gas estimation surfaces these in the RPC error payload; they classify
/// deterministically into the payment taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacilitatorRevert {
    /// `0x13be252b`: allowance does not cover the transfer.
    InsufficientAllowance,
    /// `0xccea9e6f`: the caller is not an accepted operator.
    InvalidOperator,
    /// `0xdf8e4372`: authorization is not yet valid.
    AuthorizationNotYetValid,
    /// `0x0f05f5bf`: authorization expired.
    AuthorizationExpired,
    /// `0x1f6d5aef`: authorization nonce already used.
    NonceUsed,
    /// `0x8baa579f`: signature did not validate.
    InvalidSignature,
}

impl FacilitatorRevert {
    const TABLE: &'static [(FacilitatorRevert, &'static str)] = &[
        (FacilitatorRevert::InsufficientAllowance, "13be252b"),
        (FacilitatorRevert::InvalidOperator, "ccea9e6f"),
        (FacilitatorRevert::AuthorizationNotYetValid, "df8e4372"),
        (FacilitatorRevert::AuthorizationExpired, "0f05f5bf"),
        (FacilitatorRevert::NonceUsed, "1f6d5aef"),
        (FacilitatorRevert::InvalidSignature, "8baa579f"),
    ];

    /// Classifies a 4-byte selector.
    pub fn from_selector(selector: &[u8]) -> Option<Self> {
        if selector.len() < 4 {
            return None;
        }
        let hex_selector = hex::encode(&selector[..4]);
        Self::TABLE
            .iter()
            .find(|(_, s)| *s == hex_selector)
            .map(|(revert, _)| *revert)
    }

    /// Scans an RPC error rendering for a known selector.
    ///
    /// Revert data travels in different places depending on the RPC provider
    /// (the `data` field, or embedded in the message); scanning the rendered
    /// error catches all of them.
    pub fn from_error_text(text: &str) -> Option<Self> {
        let lowered = text.to_lowercase();
        Self::TABLE
            .iter()
            .find(|(_, s)| lowered.contains(s))
            .map(|(revert, _)| *revert)
    }

    /// The taxonomy error this revert maps to.
    pub fn as_verification_error(self) -> crate::proto::PaymentVerificationError {
        use crate::proto::PaymentVerificationError as E;
        match self {
            FacilitatorRevert::InsufficientAllowance => E::InsufficientFunds,
            FacilitatorRevert::InvalidOperator => E::InvalidOperator,
            FacilitatorRevert::AuthorizationNotYetValid => E::ValidAfterInFuture,
            FacilitatorRevert::AuthorizationExpired => E::ValidBeforeTooSoon,
            FacilitatorRevert::NonceUsed => E::NonceUsed,
            FacilitatorRevert::InvalidSignature => E::InvalidSignature(
                "contract reported the signature to be invalid".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{U256, b256};

    fn payment() -> ExactPayment {
        ExactPayment {
            asset: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            from: address!("0x34b72535f371dc25ffa8654a1b2a18beab91f510"),
            to: address!("0x2ec8a9a0ab8ba5cd3a7c0c570e919d1c23e53628"),
            value: U256::from(1000u64),
            valid_after: UnixTimestamp(100),
            valid_before: UnixTimestamp(700),
            nonce: b256!("0x1111111111111111111111111111111111111111111111111111111111111111"),
            signature: Bytes::new(),
            pay_to: address!("0x2ec8a9a0ab8ba5cd3a7c0c570e919d1c23e53628"),
            required_amount: U256::from(1000u64),
            max_timeout_seconds: 300,
            eip712: None,
            network: "eip155:8453".to_string(),
            resource: None,
        }
    }

    #[test]
    fn facilitator_calldata_decodes_back() {
        let payment = payment();
        let calldata = payment.facilitator_calldata(true, Bytes::from(vec![1u8; 65]));
        let decoded =
            IFacilitatorTransfer::tokenTransferWithAuthorizationCall::abi_decode(&calldata)
                .unwrap();
        assert_eq!(decoded.token, payment.asset);
        assert_eq!(decoded.from, payment.from);
        assert!(decoded.needApprove);
        assert_eq!(decoded.value, U256::from(1000u64));
    }

    #[test]
    fn signing_hash_depends_on_domain() {
        let payment = payment();
        let domain_a = eip712_domain! {
            name: "USD Coin",
            version: "2",
            chain_id: 8453,
            verifying_contract: payment.asset,
        };
        let domain_b = facilitator_domain(8453, FACILITATOR_ADDRESS);
        assert_ne!(
            payment.transfer_signing_hash(&domain_a),
            payment.transfer_signing_hash(&domain_b)
        );
    }

    #[test]
    fn exact_scheme_serde_is_the_literal() {
        assert_eq!(serde_json::to_string(&ExactScheme).unwrap(), "\"exact\"");
        assert!(serde_json::from_str::<ExactScheme>("\"exact\"").is_ok());
        assert!(serde_json::from_str::<ExactScheme>("\"upto\"").is_err());
    }

    #[test]
    fn selector_classification() {
        assert_eq!(
            FacilitatorRevert::from_selector(&hex!("1f6d5aef")),
            Some(FacilitatorRevert::NonceUsed)
        );
        assert_eq!(
            FacilitatorRevert::from_selector(&hex!("8baa579f00aa")),
            Some(FacilitatorRevert::InvalidSignature)
        );
        assert_eq!(FacilitatorRevert::from_selector(&hex!("deadbeef")), None);
        assert_eq!(FacilitatorRevert::from_selector(&[0x13]), None);
    }

    #[test]
    fn selector_found_in_error_text() {
        let text = "server returned an error response: error code 3: execution reverted, data: \"0x0f05f5bf\"";
        assert_eq!(
            FacilitatorRevert::from_error_text(text),
            Some(FacilitatorRevert::AuthorizationExpired)
        );
        assert_eq!(FacilitatorRevert::from_error_text("gas required exceeds allowance"), None);
    }

    #[test]
    fn eip6492_wrapper_roundtrip() {
        let factory = address!("0x00000000000000000000000000000000000000aa");
        let factory_calldata = Bytes::from(vec![0xde, 0xad]);
        let inner = Bytes::from(vec![0x01; 65]);
        let encoded = Sig6492 {
            factory,
            factoryCalldata: factory_calldata.clone(),
            innerSig: inner.clone(),
        };
        let mut bytes = encoded.abi_encode_params();
        bytes.extend_from_slice(&EIP6492_MAGIC_SUFFIX);
        let parsed = StructuredSignature::try_eip6492(&Bytes::from(bytes))
            .unwrap()
            .unwrap();
        match parsed {
            StructuredSignature::Eip6492 {
                factory: f,
                factory_calldata: c,
                inner: i,
            } => {
                assert_eq!(f, factory);
                assert_eq!(c, factory_calldata);
                assert_eq!(i, inner);
            }
            other => panic!("expected EIP-6492 signature, got {other:?}"),
        }
    }

    #[test]
    fn plain_bytes_are_not_eip6492() {
        let bytes = Bytes::from(vec![0x01; 65]);
        assert!(StructuredSignature::try_eip6492(&bytes).unwrap().is_none());
    }

    #[test]
    fn payment_payload_base64_json_round_trip() {
        use crate::chain::ChainId;
        use crate::util::Base64Bytes;

        let payload = PaymentPayload {
            x402_version: v2::X402Version2,
            accepted: v2::PaymentRequirements {
                scheme: "exact".to_string(),
                network: ChainId::new("eip155", "8453"),
                network_id: None,
                amount: Some(TokenAmount::from(1000u64)),
                amount_required: None,
                token_decimals: Some(6),
                pay_to: "0x2EC8A9A0ab8bA5cD3a7C0c570e919d1C23E53628".parse().unwrap(),
                asset: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".parse().unwrap(),
                max_timeout_seconds: 300,
                extra: Some(v1::PaymentRequirementsExtra {
                    name: "USD Coin".to_string(),
                    version: "2".to_string(),
                }),
                resource: Some("https://api.example.com/premium".parse().unwrap()),
                description: "Premium content".to_string(),
                mime_type: None,
            },
            payload: ExactEvmPayload {
                authorization: ExactEvmAuthorization {
                    from: "0x34B72535f371dC25fFA8654A1b2A18bEaB91F510".parse().unwrap(),
                    to: "0x2EC8A9A0ab8bA5cD3a7C0c570e919d1C23E53628".parse().unwrap(),
                    value: TokenAmount::from(1000u64),
                    valid_after: UnixTimestamp(1_700_000_000),
                    valid_before: UnixTimestamp(1_700_000_600),
                    nonce: b256!(
                        "0x1111111111111111111111111111111111111111111111111111111111111111"
                    ),
                },
                signature: Bytes::from(vec![0x01; 65]),
            },
            resource: None,
        };
        let first = serde_json::to_value(&payload).unwrap();
        // Amounts and timestamps travel as decimal strings, so the encoding
        // is bigint-safe by construction.
        assert_eq!(first["payload"]["authorization"]["value"], "1000");
        assert_eq!(first["payload"]["authorization"]["validBefore"], "1700000600");

        let encoded = Base64Bytes::encode(first.to_string());
        let decoded = encoded.decode().unwrap();
        let reparsed: PaymentPayload = serde_json::from_slice(&decoded).unwrap();
        let second = serde_json::to_value(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn short_unknown_blob_is_eip1271() {
        let prehash = b256!("0x2222222222222222222222222222222222222222222222222222222222222222");
        let parsed = StructuredSignature::try_from_bytes(
            Bytes::from(vec![0xab; 100]),
            Address::ZERO,
            &prehash,
        )
        .unwrap();
        assert!(matches!(parsed, StructuredSignature::Eip1271(_)));
    }
}
