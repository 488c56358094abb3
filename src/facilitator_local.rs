//! Engine-backed facilitator.
//!
//! [`FacilitatorLocal`] routes each request to the scheme engine registered
//! for the request's `(scheme, network, version)` and relays the engine's
//! answer. It owns no chain state itself; everything on-chain lives behind
//! the engines.

use tracing::instrument;

use crate::facilitator::Facilitator;
use crate::proto;
use crate::scheme::{SchemeHandlerSlug, SchemeRegistry, X402SchemeFacilitatorError};

/// Errors surfaced by [`FacilitatorLocal`].
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorLocalError {
    /// The request envelope does not identify a protocol version and scheme.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    /// The declared x402 version is not accepted.
    #[error("Unsupported x402 version {0}")]
    UnsupportedVersion(u8),
    /// No engine is registered for the requested scheme and network.
    #[error("No scheme handler for {0}")]
    UnsupportedScheme(SchemeHandlerSlug),
    /// The engine rejected the payment during verification.
    #[error(transparent)]
    Verification(X402SchemeFacilitatorError),
    /// The engine failed to settle the payment.
    #[error(transparent)]
    Settlement(X402SchemeFacilitatorError),
}

/// A facilitator that verifies and settles payments with local scheme
/// engines talking directly to the chain.
pub struct FacilitatorLocal {
    schemes: SchemeRegistry,
}

impl FacilitatorLocal {
    /// Creates a facilitator over a built scheme registry.
    pub fn new(schemes: SchemeRegistry) -> Self {
        Self { schemes }
    }

    fn route(
        &self,
        request: &proto::VerifyRequest,
    ) -> Result<&dyn crate::scheme::X402SchemeFacilitator, FacilitatorLocalError> {
        let slug = match request.scheme_handler_slug() {
            Some(slug) => slug,
            None => {
                return Err(match request.x402_version() {
                    Some(version) if version != 1 && version != 2 => {
                        FacilitatorLocalError::UnsupportedVersion(version)
                    }
                    _ => FacilitatorLocalError::MalformedRequest(
                        "request does not carry a recognizable x402 version, scheme, and network"
                            .to_string(),
                    ),
                });
            }
        };
        self.schemes
            .by_slug(&slug)
            .ok_or(FacilitatorLocalError::UnsupportedScheme(slug))
    }
}

impl Facilitator for FacilitatorLocal {
    type Error = FacilitatorLocalError;

    /// Verifies a payment by delegating to the engine registered for the
    /// payload's scheme and network.
    #[instrument(skip_all, err)]
    async fn verify(
        &self,
        request: &proto::VerifyRequest,
    ) -> Result<proto::VerifyResponse, Self::Error> {
        let handler = self.route(request)?;
        handler
            .verify(request)
            .await
            .map_err(FacilitatorLocalError::Verification)
    }

    /// Settles a payment by delegating to the engine registered for the
    /// payload's scheme and network.
    #[instrument(skip_all, err)]
    async fn settle(
        &self,
        request: &proto::SettleRequest,
    ) -> Result<proto::SettleResponse, Self::Error> {
        let handler = self.route(request)?;
        handler
            .settle(request)
            .await
            .map_err(FacilitatorLocalError::Settlement)
    }

    /// Merges the supported payment kinds of every registered engine.
    #[instrument(skip_all)]
    async fn supported(&self) -> Result<proto::SupportedResponse, Self::Error> {
        let mut merged = proto::SupportedResponse::default();
        for handler in self.schemes.values() {
            match handler.supported().await {
                Ok(supported) => {
                    merged.kinds.extend(supported.kinds);
                    for (chain_id, signers) in supported.signers {
                        merged.signers.entry(chain_id).or_insert(signers);
                    }
                }
                Err(error) => {
                    tracing::warn!(error = %error, "scheme handler failed to report support");
                }
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::SchemeRegistry;
    use serde_json::json;

    fn empty_facilitator() -> FacilitatorLocal {
        FacilitatorLocal::new(SchemeRegistry::default())
    }

    #[tokio::test]
    async fn unknown_version_is_rejected() {
        let request: proto::VerifyRequest = json!({ "x402Version": 7 }).into();
        let error = empty_facilitator().verify(&request).await.unwrap_err();
        assert!(matches!(error, FacilitatorLocalError::UnsupportedVersion(7)));
    }

    #[tokio::test]
    async fn garbage_envelope_is_malformed() {
        let request: proto::VerifyRequest = json!({ "hello": "world" }).into();
        let error = empty_facilitator().verify(&request).await.unwrap_err();
        assert!(matches!(error, FacilitatorLocalError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn unregistered_scheme_is_rejected() {
        let request: proto::VerifyRequest = json!({
            "x402Version": 2,
            "paymentPayload": {
                "accepted": { "scheme": "exact", "network": "eip155:56" }
            },
            "paymentRequirements": {}
        })
        .into();
        let error = empty_facilitator().settle(&request).await.unwrap_err();
        match error {
            FacilitatorLocalError::UnsupportedScheme(slug) => {
                assert_eq!(slug.to_string(), "eip155:56:v2:exact");
            }
            other => panic!("expected UnsupportedScheme, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_registry_supports_nothing() {
        let supported = empty_facilitator().supported().await.unwrap();
        assert!(supported.kinds.is_empty());
        assert!(supported.signers.is_empty());
    }
}
