//! Payment scheme engines.
//!
//! A scheme defines how payments are authorized, verified, and settled. The
//! registry maps `(chain, protocol version, scheme name)` to an engine
//! instance; the facilitator routes incoming requests through it.
//!
//! Only the Exact-EVM scheme ([`exact_evm`]) is built in: a fixed-amount
//! transfer authorization settled through EIP-3009 or the facilitator
//! contract. New schemes plug in by implementing [`X402SchemeId`],
//! [`X402SchemeFacilitatorBuilder`], and [`X402SchemeFacilitator`], then
//! registering with [`SchemeBlueprints::register`].

pub mod exact_evm;

use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::sync::Arc;

use crate::chain::eip155::Eip155ChainProvider;
use crate::chain::{ChainId, ChainRegistry};
use crate::config::SchemeConfig;
use crate::proto;
use crate::proto::v1::SettleErrorReason;
use crate::proto::{AsPaymentProblem, ErrorReason, PaymentProblem, PaymentVerificationError};
use crate::scheme::exact_evm::{V1ExactEvm, V2ExactEvm};

/// A scheme engine that processes payment verification and settlement.
#[async_trait::async_trait]
pub trait X402SchemeFacilitator: Send + Sync {
    /// Verifies a payment authorization without settling it.
    async fn verify(
        &self,
        request: &proto::VerifyRequest,
    ) -> Result<proto::VerifyResponse, X402SchemeFacilitatorError>;

    /// Settles a verified payment on-chain.
    async fn settle(
        &self,
        request: &proto::SettleRequest,
    ) -> Result<proto::SettleResponse, X402SchemeFacilitatorError>;

    /// Returns the payment methods supported by this engine.
    async fn supported(&self) -> Result<proto::SupportedResponse, X402SchemeFacilitatorError>;
}

/// Marker trait for types that are both identifiable and buildable.
pub trait X402SchemeBlueprint: X402SchemeId + X402SchemeFacilitatorBuilder {}
impl<T> X402SchemeBlueprint for T where T: X402SchemeId + X402SchemeFacilitatorBuilder {}

/// Identifies a payment scheme by protocol version, chain namespace, and name.
pub trait X402SchemeId {
    /// The x402 protocol version (1 or 2).
    fn x402_version(&self) -> u8 {
        2
    }
    /// The chain namespace (e.g., "eip155").
    fn namespace(&self) -> &str;
    /// The scheme name (e.g., "exact").
    fn scheme(&self) -> &str;
    /// The full scheme identifier (e.g., "v2-eip155-exact").
    fn id(&self) -> String {
        format!(
            "v{}-{}-{}",
            self.x402_version(),
            self.namespace(),
            self.scheme(),
        )
    }
}

/// Builds scheme engines bound to a chain provider.
pub trait X402SchemeFacilitatorBuilder {
    /// Creates an engine for the given chain provider.
    ///
    /// `config` carries scheme-specific settings from the configuration file.
    fn build(
        &self,
        provider: Arc<Eip155ChainProvider>,
        config: Option<serde_json::Value>,
    ) -> Result<Box<dyn X402SchemeFacilitator>, Box<dyn std::error::Error>>;
}

/// Errors surfaced by scheme engines.
#[derive(Debug, thiserror::Error)]
pub enum X402SchemeFacilitatorError {
    /// Payment verification failed.
    #[error(transparent)]
    PaymentVerification(#[from] PaymentVerificationError),
    /// Settlement failed; the transaction hash stays observable when known.
    #[error("Settlement failed: {reason}")]
    Settlement {
        reason: SettleErrorReason,
        network: String,
        transaction: Option<String>,
        payer: Option<String>,
    },
    /// On-chain operation failed for reasons outside the payment taxonomy.
    #[error("Onchain error: {0}")]
    OnchainFailure(String),
}

impl AsPaymentProblem for X402SchemeFacilitatorError {
    fn as_payment_problem(&self) -> PaymentProblem {
        match self {
            X402SchemeFacilitatorError::PaymentVerification(e) => e.as_payment_problem(),
            X402SchemeFacilitatorError::Settlement { reason, .. } => {
                let error_reason = match reason {
                    SettleErrorReason::Reason(reason) => *reason,
                    SettleErrorReason::Other(_) => ErrorReason::UnexpectedSettleError,
                };
                PaymentProblem::new(error_reason, reason.to_string())
            }
            X402SchemeFacilitatorError::OnchainFailure(e) => {
                PaymentProblem::new(ErrorReason::UnexpectedVerifyError, e.to_string())
            }
        }
    }
}

/// Registry of scheme blueprints (factories).
#[derive(Default)]
pub struct SchemeBlueprints(HashMap<String, Box<dyn X402SchemeBlueprint>>);

impl Debug for SchemeBlueprints {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let slugs: Vec<String> = self.0.keys().map(|s| s.to_string()).collect();
        f.debug_tuple("SchemeBlueprints").field(&slugs).finish()
    }
}

impl SchemeBlueprints {
    /// Creates an empty blueprint registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in schemes: V1 and V2 Exact-EVM.
    pub fn full() -> Self {
        Self::new().and_register(V1ExactEvm).and_register(V2ExactEvm)
    }

    /// Registers a blueprint and returns self for chaining.
    pub fn and_register<B: X402SchemeBlueprint + 'static>(mut self, blueprint: B) -> Self {
        self.register(blueprint);
        self
    }

    /// Registers a scheme blueprint.
    pub fn register<B: X402SchemeBlueprint + 'static>(&mut self, blueprint: B) {
        self.0.insert(blueprint.id(), Box::new(blueprint));
    }

    /// Gets a blueprint by its ID.
    pub fn get(&self, id: &str) -> Option<&dyn X402SchemeBlueprint> {
        self.0.get(id).map(|v| v.deref())
    }
}

/// Unique identifier for a scheme engine instance: chain, protocol version,
/// and scheme name.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub struct SchemeHandlerSlug {
    /// The chain this engine operates on.
    pub chain_id: ChainId,
    /// The x402 protocol version.
    pub x402_version: u8,
    /// The scheme name (e.g., "exact").
    pub name: String,
}

impl SchemeHandlerSlug {
    /// Creates a new scheme handler slug.
    pub fn new(chain_id: ChainId, x402_version: u8, name: String) -> Self {
        Self {
            chain_id,
            x402_version,
            name,
        }
    }
}

impl Display for SchemeHandlerSlug {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:v{}:{}",
            self.chain_id.namespace, self.chain_id.reference, self.x402_version, self.name
        )
    }
}

/// Registry of active scheme engines, keyed by [`SchemeHandlerSlug`].
#[derive(Default)]
pub struct SchemeRegistry(HashMap<SchemeHandlerSlug, Box<dyn X402SchemeFacilitator>>);

impl Debug for SchemeRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let slugs: Vec<String> = self.0.keys().map(|s| s.to_string()).collect();
        f.debug_tuple("SchemeRegistry").field(&slugs).finish()
    }
}

impl SchemeRegistry {
    /// Builds a scheme registry from blueprints and configuration.
    ///
    /// For each enabled scheme in the config, finds the matching blueprint
    /// and every chain provider matching the chain pattern, then builds an
    /// engine per chain.
    pub fn build(
        chains: &ChainRegistry,
        blueprints: SchemeBlueprints,
        config: &Vec<SchemeConfig>,
    ) -> Self {
        let mut handlers = HashMap::with_capacity(config.len());
        for config in config {
            if !config.enabled {
                tracing::info!(
                    "Skipping disabled scheme {} for chains {}",
                    config.id,
                    config.chains
                );
                continue;
            }
            let blueprint = match blueprints.get(&config.id) {
                Some(blueprint) => blueprint,
                None => {
                    tracing::warn!("No scheme registered: {}", config.id);
                    continue;
                }
            };
            let chain_providers = chains.by_chain_id_pattern(&config.chains);
            if chain_providers.is_empty() {
                tracing::warn!("No chain provider found for {}", config.chains);
                continue;
            }

            for chain_provider in chain_providers {
                let chain_id = chain_provider.chain_id();
                let handler = match blueprint.build(chain_provider, config.config.clone()) {
                    Ok(handler) => handler,
                    Err(err) => {
                        tracing::error!("Error building scheme handler for {}: {}", config.id, err);
                        continue;
                    }
                };
                let slug = SchemeHandlerSlug::new(
                    chain_id.clone(),
                    blueprint.x402_version(),
                    blueprint.scheme().to_string(),
                );
                tracing::info!(chain_id = %chain_id, scheme = %blueprint.scheme(), id = blueprint.id(), "Registered scheme handler");
                handlers.insert(slug, handler);
            }
        }
        Self(handlers)
    }

    /// Gets an engine by its slug.
    pub fn by_slug(&self, slug: &SchemeHandlerSlug) -> Option<&dyn X402SchemeFacilitator> {
        let handler = self.0.get(slug)?.deref();
        Some(handler)
    }

    /// Returns an iterator over all registered engines.
    pub fn values(&self) -> impl Iterator<Item = &dyn X402SchemeFacilitator> {
        self.0.values().map(|v| v.deref())
    }
}
