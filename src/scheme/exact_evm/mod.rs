//! The Exact-EVM payment scheme: a fixed-amount, offline-signed transfer
//! authorization verified against on-chain state and settled through either
//! the token's own EIP-3009 `transferWithAuthorization` or the facilitator
//! transfer contract.
//!
//! Verification is contract-enforced: the decisive check is a gas estimate
//! of the facilitator call from one of our signer addresses, whose revert
//! selectors classify deterministically into the payment taxonomy. Field
//! checks (recipient, validity window, balance, value) run after it.
//!
//! Settlement prefers the sponsored zero-gas-price path on BNB Chain and
//! falls back to a facilitator-paid submission; see [`settle`](self) and the
//! state machine in the crate docs.

pub mod paymaster;
pub mod probe;
pub mod scan;
mod settle;
pub mod types;

use alloy_primitives::Address;
use alloy_provider::Provider;
use alloy_transport::TransportError;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::chain::eip155::Eip155ChainProvider;
use crate::networks;
use crate::proto;
use crate::proto::{PaymentVerificationError, v1};
use crate::scheme::{
    X402SchemeFacilitator, X402SchemeFacilitatorBuilder, X402SchemeFacilitatorError, X402SchemeId,
};
use crate::timestamp::UnixTimestamp;
use paymaster::{PaymasterClient, PaymasterConfig};
use probe::Eip3009Probe;
use scan::ScanSink;
use settle::SettleContext;

pub use types::*;

/// The Exact-EVM scheme under protocol version 1 (legacy).
pub struct V1ExactEvm;

impl X402SchemeId for V1ExactEvm {
    fn x402_version(&self) -> u8 {
        1
    }
    fn namespace(&self) -> &str {
        "eip155"
    }
    fn scheme(&self) -> &str {
        ExactScheme.as_ref()
    }
}

impl X402SchemeFacilitatorBuilder for V1ExactEvm {
    fn build(
        &self,
        provider: Arc<Eip155ChainProvider>,
        config: Option<serde_json::Value>,
    ) -> Result<Box<dyn X402SchemeFacilitator>, Box<dyn std::error::Error>> {
        Ok(Box::new(ExactEvmFacilitator::from_config(provider, config, 1)?))
    }
}

/// The Exact-EVM scheme under protocol version 2 (current).
pub struct V2ExactEvm;

impl X402SchemeId for V2ExactEvm {
    fn namespace(&self) -> &str {
        "eip155"
    }
    fn scheme(&self) -> &str {
        ExactScheme.as_ref()
    }
}

impl X402SchemeFacilitatorBuilder for V2ExactEvm {
    fn build(
        &self,
        provider: Arc<Eip155ChainProvider>,
        config: Option<serde_json::Value>,
    ) -> Result<Box<dyn X402SchemeFacilitator>, Box<dyn std::error::Error>> {
        Ok(Box::new(ExactEvmFacilitator::from_config(provider, config, 2)?))
    }
}

/// Scheme-level settings, read from the `config` block of the scheme entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExactEvmSettings {
    /// Facilitator transfer contract address.
    pub facilitator_address: Address,
    /// Enables counterfactual smart-wallet deployment during settlement.
    pub deploy_erc4337_with_eip6492: bool,
    /// Paymaster connection for the sponsored path.
    pub paymaster: Option<PaymasterConfig>,
    /// Scan sink endpoint; `null` disables the sink entirely.
    pub scan_url: Option<Url>,
}

impl Default for ExactEvmSettings {
    fn default() -> Self {
        Self {
            facilitator_address: FACILITATOR_ADDRESS,
            deploy_erc4337_with_eip6492: false,
            paymaster: None,
            scan_url: Some(
                Url::parse(scan::DEFAULT_SCAN_URL).expect("default scan url is valid"),
            ),
        }
    }
}

/// Errors raised inside the Exact-EVM engine.
#[derive(Debug, thiserror::Error)]
pub enum ExactEvmError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    PaymentVerification(#[from] PaymentVerificationError),
}

impl From<ExactEvmError> for X402SchemeFacilitatorError {
    fn from(value: ExactEvmError) -> Self {
        match value {
            ExactEvmError::Transport(e) => Self::OnchainFailure(e.to_string()),
            ExactEvmError::PaymentVerification(e) => Self::PaymentVerification(e),
        }
    }
}

/// Exact-EVM engine bound to one chain and one protocol version.
///
/// Owns the chain provider handle, the EIP-3009 probe cache, and the
/// paymaster/scan clients for the lifetime of the process. Payloads are
/// immutable after parsing.
pub struct ExactEvmFacilitator {
    provider: Arc<Eip155ChainProvider>,
    version: u8,
    settings: ExactEvmSettings,
    probe: Eip3009Probe,
    paymaster: Option<PaymasterClient>,
    scan: Option<ScanSink>,
}

impl ExactEvmFacilitator {
    /// Builds the engine from the scheme `config` block.
    ///
    /// Spawns the scan forwarder; must run within a Tokio runtime.
    pub fn from_config(
        provider: Arc<Eip155ChainProvider>,
        config: Option<serde_json::Value>,
        version: u8,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let settings: ExactEvmSettings = match config {
            Some(value) => serde_json::from_value(value)?,
            None => ExactEvmSettings::default(),
        };
        let paymaster = settings.paymaster.clone().map(PaymasterClient::new);
        let scan = settings.scan_url.clone().map(ScanSink::spawn);
        Ok(Self {
            provider,
            version,
            settings,
            probe: Eip3009Probe::new(),
            paymaster,
            scan,
        })
    }

    fn parse(&self, request: &proto::VerifyRequest) -> Result<ExactPayment, PaymentVerificationError> {
        match self.version {
            1 => self.parse_v1(request),
            _ => self.parse_v2(request),
        }
    }

    /// Parses and guards a V2 request: scheme and network of the accepted
    /// requirement must agree with the route's requirement and this engine's
    /// chain.
    fn parse_v2(
        &self,
        request: &proto::VerifyRequest,
    ) -> Result<ExactPayment, PaymentVerificationError> {
        let request = types::VerifyRequest::from_proto(request.clone())?;
        let payload = request.payment_payload;
        let requirements = request.payment_requirements;
        let accepted = payload.accepted;

        if accepted.scheme != ExactScheme::VALUE || requirements.scheme != ExactScheme::VALUE {
            return Err(PaymentVerificationError::UnsupportedScheme);
        }
        let chain_id = self.provider.chain_id();
        if accepted.network != requirements.network || accepted.network != chain_id {
            return Err(PaymentVerificationError::NetworkMismatch);
        }
        if let Some(network_id) = &requirements.network_id {
            if *network_id != self.provider.chain().inner().to_string() {
                return Err(PaymentVerificationError::NetworkMismatch);
            }
        }

        let authorization = payload.payload.authorization;
        let resource = payload
            .resource
            .as_ref()
            .map(|r| r.url.clone())
            .or_else(|| requirements.resource.as_ref().map(|u| u.to_string()));
        Ok(ExactPayment {
            asset: requirements.asset.into(),
            from: authorization.from.into(),
            to: authorization.to.into(),
            value: authorization.value.into(),
            valid_after: authorization.valid_after,
            valid_before: authorization.valid_before,
            nonce: authorization.nonce,
            signature: payload.payload.signature,
            pay_to: requirements.pay_to.into(),
            required_amount: requirements.required_amount()?,
            max_timeout_seconds: requirements.max_timeout_seconds,
            eip712: requirements.extra.clone(),
            network: accepted.network.to_string(),
            resource,
        })
    }

    /// Parses and guards a legacy V1 request. Networks are spelled by name;
    /// they resolve leniently (`"bsc"`, `"56"`, `"eip155:56"`).
    fn parse_v1(
        &self,
        request: &proto::VerifyRequest,
    ) -> Result<ExactPayment, PaymentVerificationError> {
        let request = types::V1VerifyRequest::from_proto(request.clone())?;
        let payload = request.payment_payload;
        let requirements = request.payment_requirements;

        if payload.scheme != ExactScheme::VALUE || requirements.scheme != ExactScheme::VALUE {
            return Err(PaymentVerificationError::UnsupportedScheme);
        }
        let chain = self.provider.chain();
        let payload_chain = networks::eip155_reference_from_str(&payload.network);
        let requirements_chain = networks::eip155_reference_from_str(&requirements.network);
        if payload_chain != *chain || requirements_chain != *chain {
            return Err(PaymentVerificationError::NetworkMismatch);
        }

        let authorization = payload.payload.authorization;
        Ok(ExactPayment {
            asset: requirements.asset.into(),
            from: authorization.from.into(),
            to: authorization.to.into(),
            value: authorization.value.into(),
            valid_after: authorization.valid_after,
            valid_before: authorization.valid_before,
            nonce: authorization.nonce,
            signature: payload.payload.signature,
            pay_to: requirements.pay_to.into(),
            required_amount: requirements.max_amount_required.into(),
            max_timeout_seconds: requirements.max_timeout_seconds,
            eip712: requirements.extra.clone(),
            network: payload.network.clone(),
            resource: Some(requirements.resource.clone()),
        })
    }

    /// Runs the ordered verification checks against a parsed payment.
    ///
    /// The scheme, version, and network guards already ran during parsing;
    /// this picks up at the capability probe. The first failure returns.
    #[instrument(skip_all, fields(from = %payment.from, asset = %payment.asset), err)]
    async fn verify_payment(&self, payment: &ExactPayment) -> Result<Address, ExactEvmError> {
        let provider = self.provider.inner();
        let chain_id = self.provider.chain().inner();

        // Capability probe, cached per (chain, asset).
        let supports_eip3009 = self
            .probe
            .supports_eip3009(provider, chain_id, payment.asset)
            .await;
        if supports_eip3009 && payment.eip712.is_none() {
            return Err(PaymentVerificationError::MissingEip712Domain.into());
        }

        // Authorization gas simulation: the facilitator contract enforces
        // signature, window, and nonce; its revert selector is decisive.
        let need_approve = !supports_eip3009;
        let calldata = payment.facilitator_calldata(need_approve, payment.signature.clone());
        let signer = self.provider.next_signer_address();
        let estimate = self
            .provider
            .estimate_call_gas(signer, self.settings.facilitator_address, calldata)
            .await;
        if let Err(error) = estimate {
            let text = error.to_string();
            if let Some(revert) = FacilitatorRevert::from_error_text(&text) {
                return Err(revert.as_verification_error().into());
            }
            if payment.signature.len() > 65 {
                // Smart-wallet analysis: an undeployed wallet cannot validate
                // EIP-1271 on-chain, so the estimate fails without a known
                // selector. Accept only a 6492 blob that can deploy it later.
                let code = provider.get_code_at(payment.from).await?;
                if code.is_empty() {
                    assert_counterfactual_deployable(&payment.signature)?;
                    tracing::debug!(wallet = %payment.from, "counterfactual wallet, deployment deferred to settlement");
                } else {
                    return Err(PaymentVerificationError::InvalidSignature(text).into());
                }
            } else {
                // Plain signature with an unclassified estimate failure:
                // tolerated, the field checks below still gate the payment.
                tracing::warn!(error = %text, "gas estimation failed without a known revert");
            }
        }

        // Field-level checks.
        if payment.to != payment.pay_to {
            return Err(PaymentVerificationError::RecipientMismatch.into());
        }
        assert_time(payment.valid_after, payment.valid_before, UnixTimestamp::now())?;
        let balance = IERC20::new(payment.asset, provider)
            .balanceOf(payment.from)
            .call()
            .await;
        match balance {
            Ok(balance) if balance < payment.required_amount => {
                return Err(PaymentVerificationError::InsufficientFunds.into());
            }
            Ok(_) => {}
            // A balance read failure is tolerated; the transfer itself is
            // still gated by the contract at settlement.
            Err(error) => {
                tracing::warn!(error = %error, "balance read failed, continuing");
            }
        }
        assert_enough_value(&payment.value, &payment.required_amount)?;

        Ok(payment.from)
    }
}

/// Validates the authorization window against `now`.
///
/// `validBefore` gets a 6-second buffer so the authorization cannot expire
/// between verification and block inclusion.
fn assert_time(
    valid_after: UnixTimestamp,
    valid_before: UnixTimestamp,
    now: UnixTimestamp,
) -> Result<(), PaymentVerificationError> {
    if valid_before < now + 6 {
        return Err(PaymentVerificationError::ValidBeforeTooSoon);
    }
    if valid_after > now {
        return Err(PaymentVerificationError::ValidAfterInFuture);
    }
    Ok(())
}

/// The authorization value must cover the required amount exactly or more.
fn assert_enough_value(
    sent: &alloy_primitives::U256,
    required: &alloy_primitives::U256,
) -> Result<(), PaymentVerificationError> {
    if sent < required {
        Err(PaymentVerificationError::InsufficientValue)
    } else {
        Ok(())
    }
}

/// An undeployed smart wallet is acceptable only when its signature carries
/// usable EIP-6492 deployment data: a nonzero factory and nonempty calldata.
fn assert_counterfactual_deployable(
    signature: &alloy_primitives::Bytes,
) -> Result<(), PaymentVerificationError> {
    match StructuredSignature::try_eip6492(signature) {
        Ok(Some(StructuredSignature::Eip6492 {
            factory,
            factory_calldata,
            ..
        })) if factory != Address::ZERO && !factory_calldata.is_empty() => Ok(()),
        _ => Err(PaymentVerificationError::UndeployedSmartWallet),
    }
}

#[async_trait::async_trait]
impl X402SchemeFacilitator for ExactEvmFacilitator {
    async fn verify(
        &self,
        request: &proto::VerifyRequest,
    ) -> Result<proto::VerifyResponse, X402SchemeFacilitatorError> {
        let payment = self.parse(request).map_err(ExactEvmError::from)?;
        let deadline = Duration::from_secs(payment.max_timeout_seconds.max(1));
        let verified = tokio::time::timeout(deadline, self.verify_payment(&payment)).await;
        let payer = match verified {
            Ok(result) => result?,
            Err(_) => return Err(ExactEvmError::from(PaymentVerificationError::Expired).into()),
        };
        Ok(v1::VerifyResponse::valid(payer.to_checksum(None)).into())
    }

    async fn settle(
        &self,
        request: &proto::SettleRequest,
    ) -> Result<proto::SettleResponse, X402SchemeFacilitatorError> {
        let payment = self.parse(request).map_err(ExactEvmError::from)?;
        let supports_eip3009 = self
            .probe
            .supports_eip3009(
                self.provider.inner(),
                self.provider.chain().inner(),
                payment.asset,
            )
            .await;
        let ctx = SettleContext {
            provider: &self.provider,
            facilitator_address: self.settings.facilitator_address,
            deploy_erc4337_with_eip6492: self.settings.deploy_erc4337_with_eip6492,
            paymaster: self.paymaster.as_ref(),
            scan: self.scan.as_ref(),
        };
        match settle::settle_payment(&ctx, &payment, supports_eip3009).await {
            Ok(tx_hash) => Ok(v1::SettleResponse::Success {
                payer: payment.from.to_checksum(None),
                transaction: tx_hash.to_string(),
                network: payment.network.clone(),
            }
            .into()),
            Err(error) => Err(X402SchemeFacilitatorError::Settlement {
                reason: error.settle_reason(),
                network: payment.network.clone(),
                transaction: error.tx_hash().map(|h| h.to_string()),
                payer: Some(payment.from.to_checksum(None)),
            }),
        }
    }

    async fn supported(&self) -> Result<proto::SupportedResponse, X402SchemeFacilitatorError> {
        let chain_id = self.provider.chain_id();
        let network = match self.version {
            1 => networks::network_name_by_chain_id(&chain_id).map(str::to_string),
            _ => Some(chain_id.to_string()),
        };
        let kinds = network
            .map(|network| {
                vec![proto::SupportedPaymentKind {
                    x402_version: self.version,
                    scheme: ExactScheme.to_string(),
                    network,
                    extra: None,
                }]
            })
            .unwrap_or_default();
        let signers = {
            let mut signers = std::collections::HashMap::with_capacity(1);
            signers.insert(chain_id, self.provider.signer_addresses());
            signers
        };
        Ok(proto::SupportedResponse { kinds, signers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address as Addr, Bytes, U256};
    use alloy_sol_types::SolValue;

    #[test]
    fn valid_before_boundary_is_six_seconds() {
        let now = UnixTimestamp(1_700_000_000);
        // now + 5: inside the block-time buffer, rejected.
        let result = assert_time(UnixTimestamp(0), now + 5, now);
        assert!(matches!(
            result,
            Err(PaymentVerificationError::ValidBeforeTooSoon)
        ));
        // now + 6: exactly at the buffer, accepted.
        assert!(assert_time(UnixTimestamp(0), now + 6, now).is_ok());
    }

    #[test]
    fn valid_after_must_not_be_in_the_future() {
        let now = UnixTimestamp(1_700_000_000);
        let result = assert_time(now + 1, now + 600, now);
        assert!(matches!(
            result,
            Err(PaymentVerificationError::ValidAfterInFuture)
        ));
        assert!(assert_time(now, now + 600, now).is_ok());
    }

    #[test]
    fn value_boundary_is_exact() {
        let required = U256::from(1000u64);
        assert!(assert_enough_value(&U256::from(1000u64), &required).is_ok());
        assert!(matches!(
            assert_enough_value(&U256::from(999u64), &required),
            Err(PaymentVerificationError::InsufficientValue)
        ));
    }

    fn wrapped_6492(factory: Addr, factory_calldata: &[u8]) -> Bytes {
        let mut bytes = Sig6492 {
            factory,
            factoryCalldata: Bytes::copy_from_slice(factory_calldata),
            innerSig: Bytes::from(vec![0x01; 65]),
        }
        .abi_encode_params();
        bytes.extend_from_slice(&EIP6492_MAGIC_SUFFIX);
        Bytes::from(bytes)
    }

    #[test]
    fn zero_factory_is_not_deployable() {
        let signature = wrapped_6492(Addr::ZERO, &[0xde, 0xad]);
        assert!(matches!(
            assert_counterfactual_deployable(&signature),
            Err(PaymentVerificationError::UndeployedSmartWallet)
        ));
    }

    #[test]
    fn empty_factory_calldata_is_not_deployable() {
        let factory = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let signature = wrapped_6492(factory, &[]);
        assert!(matches!(
            assert_counterfactual_deployable(&signature),
            Err(PaymentVerificationError::UndeployedSmartWallet)
        ));
    }

    #[test]
    fn factory_with_calldata_is_deployable() {
        let factory = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let signature = wrapped_6492(factory, &[0xde, 0xad]);
        assert!(assert_counterfactual_deployable(&signature).is_ok());
    }

    #[test]
    fn plain_signature_is_not_deployable() {
        let signature = Bytes::from(vec![0x01; 65]);
        assert!(matches!(
            assert_counterfactual_deployable(&signature),
            Err(PaymentVerificationError::UndeployedSmartWallet)
        ));
    }
}
