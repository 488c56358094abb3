//! EVM chain gateway for x402 payments.
//!
//! This module owns every interaction with an EVM chain: contract reads, gas
//! estimation, transaction submission (both facilitator-paid and sponsored
//! zero-gas-price), receipt polling, and nonce discipline. The scheme engine
//! drives it but never talks JSON-RPC directly.

pub mod pending_nonce_manager;
pub mod types;

use alloy_network::{Ethereum as AlloyEthereum, EthereumWallet, NetworkWallet, TransactionBuilder};
use alloy_primitives::{Address, B256, Bytes, TxHash, U256};
use alloy_provider::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
};
use alloy_provider::{
    Identity, PendingTransactionBuilder, PendingTransactionError, Provider, ProviderBuilder,
    RootProvider, WalletProvider,
};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{TransactionReceipt, TransactionRequest};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_transport::TransportError;
use alloy_transport::layers::{FallbackLayer, ThrottleLayer};
use alloy_transport_http::Http;
use std::fmt::{Display, Formatter};
use std::num::NonZeroUsize;
use std::ops::Mul;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower::ServiceBuilder;
use tracing::Instrument;

use crate::chain::ChainId;
use crate::config::Eip155ChainConfig;
use crate::util::money_amount::{MoneyAmount, MoneyAmountParseError};
pub use pending_nonce_manager::*;
pub use types::*;

/// Combined filler type for gas, blob gas, nonce, and chain ID.
pub type InnerFiller = JoinFill<
    GasFiller,
    JoinFill<BlobGasFiller, JoinFill<NonceFiller<PendingNonceManager>, ChainIdFiller>>,
>;

/// The fully composed Ethereum provider type used in this project.
///
/// Combines filler layers for gas, nonce, chain ID, blob gas, and wallet
/// signing around a [`RootProvider`] for JSON-RPC communication.
pub type InnerProvider = FillProvider<
    JoinFill<JoinFill<Identity, InnerFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

/// The CAIP-2 namespace for EVM-compatible chains.
pub const EIP155_NAMESPACE: &str = "eip155";

/// Gas limit used for a sponsored submission when estimation is unavailable.
const DEFAULT_SPONSORED_GAS_LIMIT: u64 = 300_000;

/// A numeric chain ID for EVM-compatible networks, e.g. `56` for BNB Chain.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Eip155ChainReference(u64);

impl Eip155ChainReference {
    /// Creates a new chain reference from a numeric chain ID.
    pub fn new(chain_id: u64) -> Self {
        Self(chain_id)
    }

    /// Returns the numeric chain ID.
    pub fn inner(&self) -> u64 {
        self.0
    }

    /// Converts this chain reference to a CAIP-2 [`ChainId`].
    pub fn as_chain_id(&self) -> ChainId {
        ChainId::new(EIP155_NAMESPACE, self.0.to_string())
    }
}

impl From<Eip155ChainReference> for ChainId {
    fn from(value: Eip155ChainReference) -> Self {
        value.as_chain_id()
    }
}

impl From<&Eip155ChainReference> for ChainId {
    fn from(value: &Eip155ChainReference) -> Self {
        value.as_chain_id()
    }
}

impl TryFrom<&ChainId> for Eip155ChainReference {
    type Error = Eip155ChainReferenceFormatError;

    fn try_from(value: &ChainId) -> Result<Self, Self::Error> {
        if value.namespace != EIP155_NAMESPACE {
            return Err(Eip155ChainReferenceFormatError::InvalidNamespace(
                value.namespace.clone(),
            ));
        }
        let chain_id: u64 = value.reference.parse().map_err(|_| {
            Eip155ChainReferenceFormatError::InvalidReference(value.reference.clone())
        })?;
        Ok(Eip155ChainReference(chain_id))
    }
}

impl TryFrom<ChainId> for Eip155ChainReference {
    type Error = Eip155ChainReferenceFormatError;

    fn try_from(value: ChainId) -> Result<Self, Self::Error> {
        (&value).try_into()
    }
}

/// Error returned when converting a [`ChainId`] to an [`Eip155ChainReference`].
#[derive(Debug, thiserror::Error)]
pub enum Eip155ChainReferenceFormatError {
    /// The chain ID namespace is not `eip155`.
    #[error("Invalid namespace {0}, expected eip155")]
    InvalidNamespace(String),
    /// The chain reference is not a valid numeric value.
    #[error("Invalid eip155 chain reference {0}")]
    InvalidReference(String),
}

impl Display for Eip155ChainReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// EIP-712 domain parameters for a token deployment.
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TokenDeploymentEip712 {
    /// The token name as specified in the EIP-712 domain.
    pub name: String,
    /// The token version as specified in the EIP-712 domain.
    pub version: String,
}

/// A token deployment on an EVM chain: address, decimals, and optional
/// EIP-712 domain parameters for EIP-3009 signature construction.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Eip155TokenDeployment {
    /// The chain this token is deployed on.
    pub chain_reference: Eip155ChainReference,
    /// The token contract address.
    pub address: Address,
    /// Number of decimal places (e.g. 6 for USDC, 18 for most ERC-20s).
    pub decimals: u8,
    /// Optional EIP-712 domain parameters.
    pub eip712: Option<TokenDeploymentEip712>,
}

/// An amount of a specific deployed token, in atomic units.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeployedTokenAmount {
    pub amount: U256,
    pub token: Eip155TokenDeployment,
}

impl Eip155TokenDeployment {
    /// Creates a token amount from a raw value already in atomic units.
    pub fn amount<V: Into<TokenAmount>>(&self, v: V) -> DeployedTokenAmount {
        DeployedTokenAmount {
            amount: v.into().0,
            token: self.clone(),
        }
    }

    /// Parses a human-readable amount string into atomic token units.
    ///
    /// Accepts formats like `"10.50"`, `"$10.50"`, `"1,000"`. The amount is
    /// scaled by the token's decimal places.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a number, carries more decimal
    /// places than the token supports, or is out of range.
    pub fn parse<V>(&self, v: V) -> Result<DeployedTokenAmount, MoneyAmountParseError>
    where
        V: TryInto<MoneyAmount>,
        MoneyAmountParseError: From<<V as TryInto<MoneyAmount>>::Error>,
    {
        let money_amount = v.try_into()?;
        let scale = money_amount.scale();
        let token_scale = self.decimals as u32;
        if scale > token_scale {
            return Err(MoneyAmountParseError::WrongPrecision {
                money: scale,
                token: token_scale,
            });
        }
        let scale_diff = token_scale - scale;
        let multiplier = U256::from(10).pow(U256::from(scale_diff));
        let digits = money_amount.mantissa();
        let value = U256::from(digits).mul(multiplier);
        Ok(DeployedTokenAmount {
            amount: value,
            token: self.clone(),
        })
    }
}

/// Gateway to one EVM chain.
///
/// Owns the signing wallet, nonce discipline, gas pricing, and receipt
/// polling for every transaction the facilitator sends on this chain.
///
/// Multiple signers are supported; they are selected round-robin to spread
/// transaction load and reduce nonce contention under concurrent settles.
#[derive(Debug)]
pub struct Eip155ChainProvider {
    chain: Eip155ChainReference,
    eip1559: bool,
    receipt_timeout_secs: u64,
    inner: InnerProvider,
    /// Available signer addresses for round-robin selection.
    signer_addresses: Arc<Vec<Address>>,
    /// Current position in round-robin signer rotation.
    signer_cursor: Arc<AtomicUsize>,
    /// Nonce manager, reset on transaction failures.
    nonce_manager: PendingNonceManager,
}

/// Transaction parameters for a facilitator-paid submission: target address,
/// calldata, confirmations, and an optional per-request deadline.
pub struct MetaTransaction {
    /// Target contract address.
    pub to: Address,
    /// Transaction calldata (encoded function call).
    pub calldata: Bytes,
    /// Number of block confirmations to wait for.
    pub confirmations: u64,
    /// Per-request deadline in seconds; clamps the configured receipt timeout.
    pub deadline_secs: Option<u64>,
}

/// Transaction parameters for a sponsored (zero gas price) submission.
///
/// The nonce is always supplied by the caller, freshly fetched from the
/// chain; the gasless retry loop refetches it on every attempt.
pub struct SponsoredTransaction {
    /// Sending facilitator signer.
    pub from: Address,
    /// Target contract address.
    pub to: Address,
    /// Transaction calldata (encoded function call).
    pub calldata: Bytes,
    /// Explicit transaction nonce.
    pub nonce: u64,
    /// Gas limit; falls back to a fixed default when absent.
    pub gas_limit: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum MetaTransactionSendError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Receipt wait failed after submission; the hash stays observable.
    #[error("Pending transaction {tx_hash} failed: {source}")]
    PendingTransaction {
        tx_hash: TxHash,
        #[source]
        source: PendingTransactionError,
    },
}

impl MetaTransactionSendError {
    /// The transaction hash, when the transaction made it past submission.
    pub fn tx_hash(&self) -> Option<TxHash> {
        match self {
            MetaTransactionSendError::Transport(_) => None,
            MetaTransactionSendError::PendingTransaction { tx_hash, .. } => Some(*tx_hash),
        }
    }
}

impl Eip155ChainProvider {
    /// Creates a new provider from configuration.
    ///
    /// Initializes signers, RPC transports with throttling and fallback, and
    /// the nonce manager.
    ///
    /// # Errors
    ///
    /// Returns an error if no signers are configured, a private key is
    /// invalid, or transport initialization fails.
    pub async fn from_config(config: &Eip155ChainConfig) -> Result<Self, Box<dyn std::error::Error>> {
        // 1. Signers
        let signers = config
            .signers()
            .iter()
            .map(|s| B256::from_slice(s.inner().as_bytes()))
            .map(|b| {
                PrivateKeySigner::from_bytes(&b)
                    .map(|s| s.with_chain_id(Some(config.chain_reference().inner())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if signers.is_empty() {
            return Err("at least one signer should be provided".into());
        }
        let wallet = {
            let mut iter = signers.into_iter();
            let first_signer = iter
                .next()
                .expect("iterator contains at least one element by construction");
            let mut wallet = EthereumWallet::from(first_signer);
            for signer in iter {
                wallet.register_signer(signer);
            }
            wallet
        };
        let signer_addresses =
            NetworkWallet::<AlloyEthereum>::signer_addresses(&wallet).collect::<Vec<_>>();
        let signer_addresses = Arc::new(signer_addresses);
        let signer_cursor = Arc::new(AtomicUsize::new(0));

        // 2. Transports
        let transports = config
            .rpc()
            .iter()
            .filter_map(|provider_config| {
                let scheme = provider_config.http.scheme();
                let is_http = scheme == "http" || scheme == "https";
                if !is_http {
                    return None;
                }
                let rpc_url = provider_config.http.clone();
                tracing::info!(chain=%config.chain_id(), rpc_url=%rpc_url, rate_limit=?provider_config.rate_limit, "Using HTTP transport");
                let rate_limit = provider_config.rate_limit.unwrap_or(u32::MAX);
                let service = ServiceBuilder::new()
                    .layer(ThrottleLayer::new(rate_limit))
                    .service(Http::new(rpc_url));
                Some(service)
            })
            .collect::<Vec<_>>();
        let transport_count = NonZeroUsize::new(transports.len())
            .ok_or("at least one HTTP RPC endpoint should be provided")?;
        let fallback = ServiceBuilder::new()
            .layer(FallbackLayer::default().with_active_transport_count(transport_count))
            .service(transports);
        let client = RpcClient::new(fallback, false);

        // 3. Provider
        // The nonce manager is created explicitly so it can be reset on failures.
        let nonce_manager = PendingNonceManager::default();
        let filler = JoinFill::new(
            GasFiller,
            JoinFill::new(
                BlobGasFiller::default(),
                JoinFill::new(
                    NonceFiller::new(nonce_manager.clone()),
                    ChainIdFiller::default(),
                ),
            ),
        );
        let inner: InnerProvider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_client(client);

        tracing::info!(chain=%config.chain_id(), signers=?signer_addresses, "Initialized EVM provider");

        Ok(Self {
            chain: config.chain_reference(),
            eip1559: config.eip1559(),
            receipt_timeout_secs: config.receipt_timeout_secs(),
            inner,
            signer_addresses,
            signer_cursor,
            nonce_manager,
        })
    }

    /// Reference to the underlying alloy provider.
    pub fn inner(&self) -> &InnerProvider {
        &self.inner
    }

    /// The chain this provider talks to.
    pub fn chain(&self) -> &Eip155ChainReference {
        &self.chain
    }

    /// The CAIP-2 identifier of this chain.
    pub fn chain_id(&self) -> ChainId {
        self.chain.into()
    }

    /// All configured signer addresses, checksummed.
    pub fn signer_addresses(&self) -> Vec<String> {
        self.inner
            .signer_addresses()
            .map(|a| a.to_checksum(None))
            .collect()
    }

    /// Round-robin selection of the next signer from the wallet.
    pub fn next_signer_address(&self) -> Address {
        debug_assert!(!self.signer_addresses.is_empty());
        if self.signer_addresses.len() == 1 {
            self.signer_addresses[0]
        } else {
            let next =
                self.signer_cursor.fetch_add(1, Ordering::Relaxed) % self.signer_addresses.len();
            self.signer_addresses[next]
        }
    }

    /// Estimates gas for a call from `from` to `to` with the given calldata.
    ///
    /// The raw transport error is returned untouched so callers can classify
    /// revert selectors carried in the error payload.
    pub async fn estimate_call_gas(
        &self,
        from: Address,
        to: Address,
        calldata: Bytes,
    ) -> Result<u64, TransportError> {
        let txr = TransactionRequest::default()
            .with_from(from)
            .with_to(to)
            .with_input(calldata);
        self.inner
            .estimate_gas(txr)
            .into_future()
            .instrument(tracing::info_span!("estimate_gas", from = %from, to = %to, otel.kind = "client"))
            .await
    }

    /// Transaction count of `address` including pending mempool transactions.
    pub async fn pending_nonce(&self, address: Address) -> Result<u64, TransportError> {
        self.inner
            .get_transaction_count(address)
            .pending()
            .into_future()
            .instrument(tracing::info_span!("get_transaction_count", %address, block = "pending", otel.kind = "client"))
            .await
    }

    /// Transaction count of `address` at the latest block, excluding mempool.
    pub async fn latest_nonce(&self, address: Address) -> Result<u64, TransportError> {
        self.inner
            .get_transaction_count(address)
            .latest()
            .into_future()
            .instrument(tracing::info_span!("get_transaction_count", %address, block = "latest", otel.kind = "client"))
            .await
    }

    /// Effective receipt timeout: the configured value clamped by a
    /// per-request deadline when one is present.
    fn receipt_timeout(&self, deadline_secs: Option<u64>) -> Duration {
        let secs = match deadline_secs {
            Some(deadline) => self.receipt_timeout_secs.min(deadline),
            None => self.receipt_timeout_secs,
        };
        Duration::from_secs(secs)
    }

    /// Submits a sponsored transaction: explicit nonce, zero gas price.
    ///
    /// The wallet filler signs locally and the transaction goes out as
    /// `eth_sendRawTransaction`. Submission errors are returned raw so the
    /// caller's nonce-conflict retry loop can classify them; the nonce cache
    /// is reset either way since an explicit nonce bypassed it.
    pub async fn submit_sponsored(
        &self,
        tx: SponsoredTransaction,
    ) -> Result<PendingTransactionBuilder<AlloyEthereum>, TransportError> {
        let txr = TransactionRequest::default()
            .with_from(tx.from)
            .with_to(tx.to)
            .with_input(tx.calldata)
            .with_nonce(tx.nonce)
            .with_gas_limit(tx.gas_limit.unwrap_or(DEFAULT_SPONSORED_GAS_LIMIT))
            .with_gas_price(0);
        let result = self
            .inner
            .send_transaction(txr)
            .into_future()
            .instrument(tracing::info_span!("send_sponsored_transaction",
                from = %tx.from,
                to = %tx.to,
                nonce = tx.nonce,
                otel.kind = "client",
            ))
            .await;
        self.nonce_manager.reset_nonce(tx.from).await;
        result
    }

    /// Waits for the receipt of a previously submitted transaction.
    ///
    /// The timeout honors the per-request deadline; on expiry the error keeps
    /// the transaction hash observable.
    pub async fn wait_receipt(
        &self,
        pending: PendingTransactionBuilder<AlloyEthereum>,
        deadline_secs: Option<u64>,
    ) -> Result<TransactionReceipt, MetaTransactionSendError> {
        let tx_hash = *pending.tx_hash();
        let watcher = pending
            .with_required_confirmations(1)
            .with_timeout(Some(self.receipt_timeout(deadline_secs)));
        watcher
            .get_receipt()
            .into_future()
            .instrument(tracing::info_span!("get_receipt", transaction = %tx_hash, otel.kind = "client"))
            .await
            .map_err(|source| MetaTransactionSendError::PendingTransaction { tx_hash, source })
    }

    /// Sends a facilitator-paid transaction and waits for its receipt.
    ///
    /// The signer is selected round-robin; gas pricing adapts to the chain
    /// (EIP-1559 fillers, or an explicit legacy gas price). On any failure
    /// the signer's nonce cache is reset to force a fresh query, since the
    /// transaction may or may not have reached the mempool.
    pub async fn send_transaction(
        &self,
        tx: MetaTransaction,
    ) -> Result<TransactionReceipt, MetaTransactionSendError> {
        let from_address = self.next_signer_address();
        let mut txr = TransactionRequest::default()
            .with_to(tx.to)
            .with_from(from_address)
            .with_input(tx.calldata);

        if !self.eip1559 {
            let gas: u128 = self
                .inner
                .get_gas_price()
                .instrument(tracing::info_span!("get_gas_price"))
                .await?;
            txr.set_gas_price(gas);
        }

        let pending_tx = match self.inner.send_transaction(txr).await {
            Ok(pending) => pending,
            Err(e) => {
                self.nonce_manager.reset_nonce(from_address).await;
                return Err(MetaTransactionSendError::Transport(e));
            }
        };

        let tx_hash = *pending_tx.tx_hash();
        let watcher = pending_tx
            .with_required_confirmations(tx.confirmations)
            .with_timeout(Some(self.receipt_timeout(tx.deadline_secs)));

        match watcher.get_receipt().await {
            Ok(receipt) => Ok(receipt),
            Err(source) => {
                self.nonce_manager.reset_nonce(from_address).await;
                Err(MetaTransactionSendError::PendingTransaction { tx_hash, source })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_deployment(decimals: u8) -> Eip155TokenDeployment {
        Eip155TokenDeployment {
            chain_reference: Eip155ChainReference::new(56),
            address: Address::ZERO,
            decimals,
            eip712: None,
        }
    }

    #[test]
    fn chain_reference_roundtrips_through_chain_id() {
        let bsc = Eip155ChainReference::new(56);
        let chain_id: ChainId = bsc.into();
        assert_eq!(chain_id.to_string(), "eip155:56");
        let back: Eip155ChainReference = chain_id.try_into().unwrap();
        assert_eq!(back, bsc);
    }

    #[test]
    fn chain_reference_rejects_foreign_namespace() {
        let chain_id = ChainId::new("solana", "mainnet");
        let result: Result<Eip155ChainReference, _> = chain_id.try_into();
        assert!(result.is_err());
    }

    #[test]
    fn parse_whole_number() {
        let deployment = test_deployment(6);
        let result = deployment.parse("100").unwrap();
        assert_eq!(result.amount, U256::from(100_000_000u64));
    }

    #[test]
    fn parse_with_decimals() {
        let deployment = test_deployment(6);
        let result = deployment.parse("1.50").unwrap();
        assert_eq!(result.amount, U256::from(1_500_000u64));
    }

    #[test]
    fn parse_precision_too_high() {
        let deployment = test_deployment(2);
        let err = deployment.parse("1.234").unwrap_err();
        assert!(matches!(err, MoneyAmountParseError::WrongPrecision { .. }));
    }

    #[test]
    fn parse_with_currency_symbol() {
        let deployment = test_deployment(6);
        let result = deployment.parse("$10.50").unwrap();
        assert_eq!(result.amount, U256::from(10_500_000u64));
    }

    #[test]
    fn parse_eighteen_decimals() {
        let deployment = test_deployment(18);
        let result = deployment.parse("2").unwrap();
        let expected = U256::from(2u64) * U256::from(10).pow(U256::from(18));
        assert_eq!(result.amount, expected);
    }
}
