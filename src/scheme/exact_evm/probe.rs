//! EIP-3009 capability probe.
//!
//! A token MAY implement ERC-3009 `transferWithAuthorization`. The probe
//! issues a view call with zero/empty arguments and classifies the revert:
//! a complaint about the arguments means the function exists; an unknown
//! selector means it does not. Ambiguous reverts are treated as absent, so a
//! flaky RPC can only downgrade a token to the allowance path, never invent
//! EIP-3009 support.
//!
//! Results are cached per `(chain id, asset)`; the cache is populated
//! monotonically and never invalidated within the process lifetime.

use alloy_primitives::{Address, B256, Bytes, U256};
use alloy_provider::Provider;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::instrument;

use crate::scheme::exact_evm::types::IEIP3009;

/// Revert fragments proving `transferWithAuthorization` exists: the token
/// got far enough to complain about the zeroed arguments.
const PRESENCE_PATTERNS: &[&str] = &[
    "authorization is expired",
    "authorization expired",
    "authorization is used",
    "authorization used",
    "not yet valid",
    "not-yet-valid",
    "invalid signature",
];

/// Revert fragments proving the function is absent. A bare
/// "execution reverted" with no message lands here too, since every
/// argument complaint is caught by [`PRESENCE_PATTERNS`] first.
const ABSENCE_PATTERNS: &[&str] = &[
    "function does not exist",
    "unknown selector",
    "not recognized",
    "execution reverted",
];

/// Cached per-token EIP-3009 support detection.
#[derive(Debug, Default, Clone)]
pub struct Eip3009Probe {
    cache: Arc<DashMap<(u64, Address), bool>>,
}

impl Eip3009Probe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `asset` on `chain_id` supports EIP-3009.
    ///
    /// The first call per `(chain_id, asset)` hits the chain; subsequent
    /// calls return the cached answer.
    #[instrument(skip(self, provider), fields(chain_id = chain_id, asset = %asset))]
    pub async fn supports_eip3009<P: Provider>(
        &self,
        provider: P,
        chain_id: u64,
        asset: Address,
    ) -> bool {
        if let Some(hit) = self.cache.get(&(chain_id, asset)) {
            return *hit;
        }
        let supports = Self::probe(provider, asset).await;
        tracing::debug!(supports, "probed token for EIP-3009 support");
        *self.cache.entry((chain_id, asset)).or_insert(supports)
    }

    async fn probe<P: Provider>(provider: P, asset: Address) -> bool {
        let contract = IEIP3009::new(asset, provider);
        let call = contract.transferWithAuthorization(
            Address::ZERO,
            Address::ZERO,
            U256::ZERO,
            U256::ZERO,
            U256::ZERO,
            B256::ZERO,
            Bytes::new(),
        );
        match call.call().await {
            // A zeroed call that does not revert still proves the selector exists.
            Ok(_) => true,
            Err(error) => classify_probe_revert(&error.to_string()).unwrap_or(false),
        }
    }
}

/// Classifies the revert text of the zero-argument probe call.
///
/// `Some(true)`: the function exists and rejected the arguments.
/// `Some(false)`: the function does not exist.
/// `None`: ambiguous; callers treat this as absent.
fn classify_probe_revert(text: &str) -> Option<bool> {
    let lowered = text.to_lowercase();
    if PRESENCE_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Some(true);
    }
    if ABSENCE_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Some(false);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_complaints_prove_presence() {
        assert_eq!(
            classify_probe_revert("execution reverted: FiatTokenV2: authorization is expired"),
            Some(true)
        );
        assert_eq!(
            classify_probe_revert("execution reverted: EIP3009: invalid signature length"),
            Some(true)
        );
        assert_eq!(
            classify_probe_revert("execution reverted: authorization is not yet valid"),
            Some(true)
        );
    }

    #[test]
    fn unknown_selector_proves_absence() {
        assert_eq!(
            classify_probe_revert("execution reverted: function does not exist"),
            Some(false)
        );
        assert_eq!(
            classify_probe_revert("the function selector was not recognized"),
            Some(false)
        );
    }

    #[test]
    fn empty_revert_is_absence() {
        assert_eq!(classify_probe_revert("execution reverted"), Some(false));
    }

    #[test]
    fn transport_noise_is_ambiguous() {
        assert_eq!(classify_probe_revert("connection refused"), None);
        assert_eq!(classify_probe_revert("request timed out"), None);
    }
}
