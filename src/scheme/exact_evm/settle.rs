//! Settlement pipeline for the Exact-EVM scheme.
//!
//! Three stages with fallback:
//!
//! 1. **Deploy** (optional): counterfactual smart-wallet deployment from the
//!    EIP-6492 factory data, when enabled and the payer has no code.
//! 2. **Sponsored** (BNB Chain only): validate the call with the paymaster,
//!    then submit at zero gas price with a freshly fetched nonce. Nonce
//!    conflicts between concurrent settles are retried with per-kind
//!    backoff; the nonce is refetched from the chain on every attempt,
//!    never carried over in memory.
//! 3. **Direct**: the facilitator signer pays gas and calls the facilitator
//!    contract itself. Any sponsored-path error falls through here silently.

use alloy_primitives::{Address, TxHash};
use alloy_provider::Provider;
use alloy_transport::TransportError;
use std::time::Duration;
use tracing::instrument;

use crate::chain::eip155::{
    Eip155ChainProvider, MetaTransaction, MetaTransactionSendError, SponsoredTransaction,
};
use crate::proto::ErrorReason;
use crate::proto::PaymentVerificationError;
use crate::proto::v1::SettleErrorReason;
use crate::scheme::exact_evm::paymaster::{PaymasterClient, PaymasterError};
use crate::scheme::exact_evm::scan::{ScanRecord, ScanSink};
use crate::scheme::exact_evm::types::{ExactPayment, FacilitatorRevert, StructuredSignature};

/// Chain on which the sponsored path is attempted.
const SPONSORED_CHAIN_ID: u64 = 56;

/// Attempts before a nonce conflict is given up on.
const MAX_NONCE_ATTEMPTS: u32 = 5;

/// Everything one settlement needs besides the payment itself.
pub(super) struct SettleContext<'a> {
    pub provider: &'a Eip155ChainProvider,
    pub facilitator_address: Address,
    pub deploy_erc4337_with_eip6492: bool,
    pub paymaster: Option<&'a PaymasterClient>,
    pub scan: Option<&'a ScanSink>,
}

/// Terminal settlement failures.
#[derive(Debug, thiserror::Error)]
pub(super) enum SettleError {
    /// The transaction was mined but its receipt reports failure.
    #[error("Transaction {tx_hash} reverted")]
    Reverted { tx_hash: TxHash },
    /// A deterministic facilitator revert, classified into the taxonomy.
    #[error(transparent)]
    Verification(#[from] PaymentVerificationError),
    /// Transport failure. The message is kept verbatim (a receipt timeout
    /// mentions the hash, so callers can still observe it).
    #[error("{message}")]
    Transport {
        message: String,
        tx_hash: Option<TxHash>,
    },
}

impl SettleError {
    /// The transaction hash, when the transaction made it on-chain.
    pub fn tx_hash(&self) -> Option<TxHash> {
        match self {
            SettleError::Reverted { tx_hash } => Some(*tx_hash),
            SettleError::Verification(_) => None,
            SettleError::Transport { tx_hash, .. } => *tx_hash,
        }
    }

    /// The wire-format reason for this failure.
    pub fn settle_reason(&self) -> SettleErrorReason {
        match self {
            SettleError::Reverted { .. } => {
                SettleErrorReason::Reason(ErrorReason::InvalidTransactionState)
            }
            SettleError::Verification(e) => {
                use crate::proto::AsPaymentProblem;
                SettleErrorReason::Reason(e.as_payment_problem().reason())
            }
            SettleError::Transport { message, .. } => SettleErrorReason::Other(message.clone()),
        }
    }

    fn from_meta(error: MetaTransactionSendError) -> Self {
        match error {
            MetaTransactionSendError::Transport(e) => {
                let text = e.to_string();
                if let Some(revert) = FacilitatorRevert::from_error_text(&text) {
                    return SettleError::Verification(revert.as_verification_error());
                }
                SettleError::Transport {
                    message: text,
                    tx_hash: None,
                }
            }
            MetaTransactionSendError::PendingTransaction { tx_hash, source } => {
                SettleError::Transport {
                    message: source.to_string(),
                    tx_hash: Some(tx_hash),
                }
            }
        }
    }
}

/// Runs the full settlement pipeline for a verified payment.
#[instrument(skip_all, fields(from = %payment.from, asset = %payment.asset), err)]
pub(super) async fn settle_payment(
    ctx: &SettleContext<'_>,
    payment: &ExactPayment,
    supports_eip3009: bool,
) -> Result<TxHash, SettleError> {
    let deadline = Some(payment.max_timeout_seconds);

    // Stage 1: counterfactual wallet deployment.
    if ctx.deploy_erc4337_with_eip6492 {
        deploy_smart_wallet(ctx, payment, deadline).await?;
    }

    // The facilitator contract receives the inner signature of a 6492 blob;
    // EOA and EIP-1271 signatures pass through unchanged.
    let signature = match StructuredSignature::try_eip6492(&payment.signature) {
        Ok(Some(StructuredSignature::Eip6492 { inner, .. })) => inner,
        _ => payment.signature.clone(),
    };
    let calldata = payment.facilitator_calldata(!supports_eip3009, signature);

    // Stage 2: sponsored submission, BNB Chain only.
    if ctx.provider.chain().inner() == SPONSORED_CHAIN_ID {
        if let Some(paymaster) = ctx.paymaster {
            match settle_sponsored(ctx, paymaster, &calldata, deadline).await {
                Ok(tx_hash) => {
                    if let Some(scan) = ctx.scan {
                        scan.record(ScanRecord::for_settlement(payment, tx_hash));
                    }
                    return Ok(tx_hash);
                }
                Err(error) => {
                    tracing::debug!(error = %error, "sponsored settlement unavailable, falling back to direct submission");
                }
            }
        }
    }

    // Stage 3: direct facilitator call, gas paid by the facilitator signer.
    let result = ctx
        .provider
        .send_transaction(MetaTransaction {
            to: ctx.facilitator_address,
            calldata,
            confirmations: 1,
            deadline_secs: deadline,
        })
        .await;
    match result {
        Ok(receipt) if receipt.status() => Ok(receipt.transaction_hash),
        Ok(receipt) => Err(SettleError::Reverted {
            tx_hash: receipt.transaction_hash,
        }),
        Err(error) => Err(SettleError::from_meta(error)),
    }
}

/// Deploys the payer's smart wallet from EIP-6492 factory data, when the
/// signature carries one and no code is present yet. A failed deployment
/// receipt aborts the settlement.
async fn deploy_smart_wallet(
    ctx: &SettleContext<'_>,
    payment: &ExactPayment,
    deadline: Option<u64>,
) -> Result<(), SettleError> {
    let (factory, factory_calldata) = match StructuredSignature::try_eip6492(&payment.signature) {
        Ok(Some(StructuredSignature::Eip6492 {
            factory,
            factory_calldata,
            ..
        })) => (factory, factory_calldata),
        _ => return Ok(()),
    };
    let code = ctx
        .provider
        .inner()
        .get_code_at(payment.from)
        .await
        .map_err(|e| SettleError::Transport {
            message: e.to_string(),
            tx_hash: None,
        })?;
    if !code.is_empty() {
        return Ok(());
    }
    tracing::info!(wallet = %payment.from, %factory, "deploying counterfactual smart wallet");
    let receipt = ctx
        .provider
        .send_transaction(MetaTransaction {
            to: factory,
            calldata: factory_calldata,
            confirmations: 1,
            deadline_secs: deadline,
        })
        .await
        .map_err(SettleError::from_meta)?;
    if receipt.status() {
        Ok(())
    } else {
        Err(SettleError::Reverted {
            tx_hash: receipt.transaction_hash,
        })
    }
}

/// Errors internal to the sponsored path; every one of them falls through
/// to the direct submission stage.
#[derive(Debug, thiserror::Error)]
enum SponsoredError {
    #[error(transparent)]
    Paymaster(#[from] PaymasterError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Transaction {0} reverted")]
    Reverted(TxHash),
    #[error("{0}")]
    Receipt(String),
    #[error("Nonce conflict persisted after {attempts} attempts: {last}")]
    NonceConflictExhausted { attempts: u32, last: String },
}

/// Validates sponsorship, then submits at zero gas price with nonce-conflict
/// recovery: the nonce is refetched from the chain before every attempt
/// ("pending" normally, "latest" after a too-high conflict) and each
/// conflict kind gets its own backoff.
async fn settle_sponsored(
    ctx: &SettleContext<'_>,
    paymaster: &PaymasterClient,
    calldata: &alloy_primitives::Bytes,
    deadline: Option<u64>,
) -> Result<TxHash, SponsoredError> {
    let signer = ctx.provider.next_signer_address();
    let chain_id = ctx.provider.chain().inner();
    let decision = paymaster
        .validate(chain_id, signer, ctx.facilitator_address, calldata)
        .await?;

    let mut fetch_latest = false;
    let mut attempt: u32 = 1;
    loop {
        let nonce = if fetch_latest {
            ctx.provider.latest_nonce(signer).await?
        } else {
            ctx.provider.pending_nonce(signer).await?
        };
        fetch_latest = false;

        let submitted = ctx
            .provider
            .submit_sponsored(SponsoredTransaction {
                from: signer,
                to: ctx.facilitator_address,
                calldata: calldata.clone(),
                nonce,
                gas_limit: decision.gas_limit,
            })
            .await;

        match submitted {
            Ok(pending) => {
                let receipt = ctx
                    .provider
                    .wait_receipt(pending, deadline)
                    .await
                    .map_err(|e| SponsoredError::Receipt(e.to_string()))?;
                return if receipt.status() {
                    Ok(receipt.transaction_hash)
                } else {
                    Err(SponsoredError::Reverted(receipt.transaction_hash))
                };
            }
            Err(error) => {
                let text = error.to_string();
                let Some(conflict) = NonceConflict::classify(&text) else {
                    return Err(SponsoredError::Transport(error));
                };
                if attempt >= MAX_NONCE_ATTEMPTS {
                    return Err(SponsoredError::NonceConflictExhausted {
                        attempts: attempt,
                        last: text,
                    });
                }
                tracing::debug!(attempt, conflict = ?conflict, error = %text, "nonce conflict, retrying sponsored submission");
                if conflict == NonceConflict::TooHigh {
                    fetch_latest = true;
                }
                tokio::time::sleep(conflict.backoff(attempt)).await;
                attempt += 1;
            }
        }
    }
}

/// Kinds of nonce conflicts a submission can hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NonceConflict {
    TooLow,
    TooHigh,
    AlreadyUsed,
    Other,
}

impl NonceConflict {
    /// Classifies an RPC error message; `None` means not a nonce problem.
    fn classify(text: &str) -> Option<Self> {
        let lowered = text.to_lowercase();
        if lowered.contains("nonce too low") {
            Some(NonceConflict::TooLow)
        } else if lowered.contains("nonce too high") {
            Some(NonceConflict::TooHigh)
        } else if lowered.contains("already used") || lowered.contains("already known") {
            Some(NonceConflict::AlreadyUsed)
        } else if lowered.contains("nonce") {
            Some(NonceConflict::Other)
        } else {
            None
        }
    }

    /// Backoff before the next attempt.
    fn backoff(self, attempt: u32) -> Duration {
        match self {
            NonceConflict::TooLow => Duration::from_millis(2000) * attempt,
            NonceConflict::TooHigh => Duration::from_millis(300),
            NonceConflict::AlreadyUsed => Duration::from_millis(1500) * attempt,
            NonceConflict::Other => Duration::from_millis(1000) * attempt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    #[test]
    fn nonce_conflicts_classify_by_message() {
        assert_eq!(
            NonceConflict::classify("nonce too low: next nonce 17, tx nonce 15"),
            Some(NonceConflict::TooLow)
        );
        assert_eq!(
            NonceConflict::classify("Nonce too high"),
            Some(NonceConflict::TooHigh)
        );
        assert_eq!(
            NonceConflict::classify("nonce already used"),
            Some(NonceConflict::AlreadyUsed)
        );
        assert_eq!(
            NonceConflict::classify("invalid nonce"),
            Some(NonceConflict::Other)
        );
        assert_eq!(NonceConflict::classify("insufficient funds for gas"), None);
    }

    #[test]
    fn backoff_scales_with_attempt() {
        assert_eq!(
            NonceConflict::TooLow.backoff(3),
            Duration::from_millis(6000)
        );
        assert_eq!(
            NonceConflict::AlreadyUsed.backoff(2),
            Duration::from_millis(3000)
        );
        assert_eq!(NonceConflict::TooHigh.backoff(4), Duration::from_millis(300));
    }

    #[test]
    fn reverted_error_keeps_hash_and_reason() {
        let tx_hash =
            b256!("0x3333333333333333333333333333333333333333333333333333333333333333");
        let error = SettleError::Reverted { tx_hash };
        assert_eq!(error.tx_hash(), Some(tx_hash));
        assert_eq!(
            error.settle_reason(),
            SettleErrorReason::Reason(ErrorReason::InvalidTransactionState)
        );
    }

    #[test]
    fn transport_error_preserves_message_verbatim() {
        let message = "Transaction 0xabc timed out while waiting for receipt".to_string();
        let error = SettleError::Transport {
            message: message.clone(),
            tx_hash: None,
        };
        assert_eq!(error.settle_reason(), SettleErrorReason::Other(message));
    }

    #[test]
    fn classified_revert_maps_to_taxonomy() {
        let error = SettleError::Verification(
            FacilitatorRevert::NonceUsed.as_verification_error(),
        );
        assert_eq!(
            error.settle_reason(),
            SettleErrorReason::Reason(ErrorReason::NonceUsed)
        );
    }
}
