//! Core trait defining the verification and settlement interface of an x402
//! facilitator.
//!
//! Implementors validate incoming payment payloads against requirements
//! ([`Facilitator::verify`]) and execute on-chain transfers
//! ([`Facilitator::settle`]). The same trait is implemented by the local
//! engine-backed facilitator and by HTTP clients talking to a remote one.

use std::fmt::{Debug, Display};
use std::sync::Arc;

use crate::proto;

/// Asynchronous interface of an x402 payment facilitator.
pub trait Facilitator {
    /// The error type returned by this facilitator.
    type Error: Debug + Display;

    /// Verifies a proposed x402 payment payload against payment requirements.
    ///
    /// Checks payload integrity, contract-side signature validity, balance
    /// sufficiency, network compatibility, and requirement compliance.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if any validation step fails.
    fn verify(
        &self,
        request: &proto::VerifyRequest,
    ) -> impl Future<Output = Result<proto::VerifyResponse, Self::Error>> + Send;

    /// Executes an on-chain x402 settlement for a verified payload.
    ///
    /// # Errors
    ///
    /// Returns [`Self::Error`] if settlement fails; the error carries the
    /// transaction hash when one exists.
    fn settle(
        &self,
        request: &proto::SettleRequest,
    ) -> impl Future<Output = Result<proto::SettleResponse, Self::Error>> + Send;

    /// Lists the payment kinds this facilitator can handle.
    fn supported(
        &self,
    ) -> impl Future<Output = Result<proto::SupportedResponse, Self::Error>> + Send;
}

impl<T: Facilitator> Facilitator for Arc<T> {
    type Error = T::Error;

    fn verify(
        &self,
        request: &proto::VerifyRequest,
    ) -> impl Future<Output = Result<proto::VerifyResponse, Self::Error>> + Send {
        self.as_ref().verify(request)
    }

    fn settle(
        &self,
        request: &proto::SettleRequest,
    ) -> impl Future<Output = Result<proto::SettleResponse, Self::Error>> + Send {
        self.as_ref().settle(request)
    }

    fn supported(
        &self,
    ) -> impl Future<Output = Result<proto::SupportedResponse, Self::Error>> + Send {
        self.as_ref().supported()
    }
}
