//! Chain gateway types for x402 payment processing.
//!
//! The facilitator talks to EVM chains through [`eip155::Eip155ChainProvider`],
//! one instance per configured chain, collected in a [`ChainRegistry`] keyed
//! by CAIP-2 [`ChainId`].

pub mod chain_id;
pub mod eip155;

use std::collections::HashMap;
use std::sync::Arc;

pub use chain_id::{ChainId, ChainIdFormatError, ChainIdPattern};

use crate::config::ChainsConfig;
use eip155::Eip155ChainProvider;

/// Registry of configured chain providers.
///
/// Built once at startup from configuration; lookups are read-only afterwards.
#[derive(Debug, Default)]
pub struct ChainRegistry {
    providers: HashMap<ChainId, Arc<Eip155ChainProvider>>,
}

impl ChainRegistry {
    /// Initializes providers for all configured chains.
    ///
    /// # Errors
    ///
    /// Returns an error if any chain provider fails to initialize.
    pub async fn from_config(chains: &ChainsConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let mut providers = HashMap::new();
        for chain in chains.iter() {
            let provider = Eip155ChainProvider::from_config(chain).await?;
            providers.insert(provider.chain_id(), Arc::new(provider));
        }
        Ok(Self { providers })
    }

    /// Gets the provider for an exact chain id.
    pub fn by_chain_id(&self, chain_id: &ChainId) -> Option<Arc<Eip155ChainProvider>> {
        self.providers.get(chain_id).map(Arc::clone)
    }

    /// Gets all providers whose chain id matches the pattern.
    pub fn by_chain_id_pattern(&self, pattern: &ChainIdPattern) -> Vec<Arc<Eip155ChainProvider>> {
        self.providers
            .iter()
            .filter(|(chain_id, _)| pattern.matches(chain_id))
            .map(|(_, provider)| Arc::clone(provider))
            .collect()
    }
}
