//! Registry of known networks and their test asset deployments.
//!
//! The x402 protocol addresses chains by CAIP-2 identifier (e.g.
//! `eip155:56`), but V1 payloads and human-facing configuration also use
//! short network names. This module provides the name ↔ chain id mapping and
//! the stablecoin deployments used as default assets on each chain.

use alloy_primitives::address;
use once_cell::sync::Lazy;

use crate::chain::ChainId;
use crate::chain::eip155::{
    Eip155ChainReference, Eip155TokenDeployment, TokenDeploymentEip712,
};

/// A known network: short name plus CAIP-2 coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Short network name used by V1 payloads, e.g. `"bsc"`.
    pub name: &'static str,
    /// CAIP-2 namespace, always `eip155` here.
    pub namespace: &'static str,
    /// CAIP-2 reference (the decimal chain id).
    pub reference: &'static str,
}

/// Networks this facilitator knows by name.
pub static KNOWN_NETWORKS: &[NetworkInfo] = &[
    NetworkInfo {
        name: "bsc",
        namespace: "eip155",
        reference: "56",
    },
    NetworkInfo {
        name: "base",
        namespace: "eip155",
        reference: "8453",
    },
    NetworkInfo {
        name: "xlayer",
        namespace: "eip155",
        reference: "196",
    },
    NetworkInfo {
        name: "kite",
        namespace: "eip155",
        reference: "2366",
    },
];

/// Looks up a CAIP-2 chain id by short network name.
pub fn chain_id_by_network_name(network_name: &str) -> Option<ChainId> {
    KNOWN_NETWORKS
        .iter()
        .find(|n| n.name == network_name)
        .map(|n| ChainId::new(n.namespace, n.reference))
}

/// Looks up a short network name by CAIP-2 chain id.
pub fn network_name_by_chain_id(chain_id: &ChainId) -> Option<&'static str> {
    KNOWN_NETWORKS
        .iter()
        .find(|n| n.namespace == chain_id.namespace && n.reference == chain_id.reference)
        .map(|n| n.name)
}

/// Resolves a numeric EVM chain id from any of the accepted spellings:
/// a CAIP-2 string (`"eip155:56"`), a bare decimal (`"56"`), or a known
/// network name (`"bsc"`). Unknown names fall back to chain id 1.
pub fn eip155_reference_from_str(s: &str) -> Eip155ChainReference {
    if let Some((namespace, reference)) = s.split_once(':') {
        if namespace == "eip155" {
            if let Ok(id) = reference.parse::<u64>() {
                return Eip155ChainReference::new(id);
            }
        }
        return Eip155ChainReference::new(1);
    }
    if let Ok(id) = s.parse::<u64>() {
        return Eip155ChainReference::new(id);
    }
    match chain_id_by_network_name(s) {
        Some(chain_id) => chain_id
            .try_into()
            .unwrap_or(Eip155ChainReference::new(1)),
        None => Eip155ChainReference::new(1),
    }
}

/// USDC on Base.
pub static USDC_BASE: Lazy<Eip155TokenDeployment> = Lazy::new(|| Eip155TokenDeployment {
    chain_reference: Eip155ChainReference::new(8453),
    address: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
    decimals: 6,
    eip712: Some(TokenDeploymentEip712 {
        name: "USD Coin".to_string(),
        version: "2".to_string(),
    }),
});

/// Bridged USDT on BNB Chain. Not an EIP-3009 token; settlement goes through
/// the facilitator contract's allowance path.
pub static USDT_BSC: Lazy<Eip155TokenDeployment> = Lazy::new(|| Eip155TokenDeployment {
    chain_reference: Eip155ChainReference::new(56),
    address: address!("0x55d398326f99059fF775485246999027B3197955"),
    decimals: 18,
    eip712: None,
});

/// USDT on X Layer.
pub static USDT_XLAYER: Lazy<Eip155TokenDeployment> = Lazy::new(|| Eip155TokenDeployment {
    chain_reference: Eip155ChainReference::new(196),
    address: address!("0x1E4a5963aBFD975d8c9021ce480b42188849D41d"),
    decimals: 6,
    eip712: None,
});

/// Test USDT on Kite.
pub static USDT_KITE: Lazy<Eip155TokenDeployment> = Lazy::new(|| Eip155TokenDeployment {
    chain_reference: Eip155ChainReference::new(2366),
    address: address!("0x0ff5393387ad2f9f691fd6fd28e07e3969e27e63"),
    decimals: 18,
    eip712: None,
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caip2_decimal_and_name_resolve_to_bsc() {
        assert_eq!(eip155_reference_from_str("eip155:56").inner(), 56);
        assert_eq!(eip155_reference_from_str("56").inner(), 56);
        assert_eq!(eip155_reference_from_str("bsc").inner(), 56);
    }

    #[test]
    fn unknown_name_falls_back_to_mainnet() {
        assert_eq!(eip155_reference_from_str("arbitrum-nova").inner(), 1);
        assert_eq!(eip155_reference_from_str("eip155:notanumber").inner(), 1);
    }

    #[test]
    fn name_lookup_roundtrip() {
        let chain_id = chain_id_by_network_name("xlayer").unwrap();
        assert_eq!(chain_id.to_string(), "eip155:196");
        assert_eq!(network_name_by_chain_id(&chain_id), Some("xlayer"));
    }

    #[test]
    fn unknown_chain_has_no_name() {
        let chain_id = ChainId::new("eip155", "999999");
        assert!(network_name_by_chain_id(&chain_id).is_none());
    }
}
