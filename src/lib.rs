//! x402 payments for BNB Chain and other EVM networks.
//!
//! This crate implements the facilitator side of the
//! [x402 protocol](https://www.x402.org): verification and on-chain
//! settlement of HTTP `402 Payment Required` micropayments, built around
//! the Exact-EVM payment scheme.
//!
//! # Overview
//!
//! A client that hits a payment-gated resource receives a 402 response with
//! a list of acceptable payments. It signs a one-shot transfer
//! authorization and retries; the resource server forwards the payload to a
//! facilitator, which verifies it against on-chain state and, once the
//! resource has been served, settles it by broadcasting the transfer.
//!
//! Settlement goes through the token's own ERC-3009
//! `transferWithAuthorization` when the token supports it, or through the
//! facilitator transfer contract (with a pre-approved allowance) when it
//! does not. On BNB Chain a sponsored, zero-gas-price path through a
//! paymaster is preferred.
//!
//! # Modules
//!
//! - [`chain`] - EVM chain gateway: providers, nonce discipline, CAIP-2 ids.
//! - [`config`] - Facilitator server configuration.
//! - [`facilitator`] - The [`Facilitator`](facilitator::Facilitator) trait.
//! - [`facilitator_local`] - Engine-backed facilitator implementation.
//! - [`handlers`] - HTTP endpoint handlers (`/verify`, `/settle`, `/supported`).
//! - [`networks`] - Known networks and default asset deployments.
//! - [`proto`] - Wire types for protocol versions 1 and 2.
//! - [`scheme`] - Scheme engine registry and the Exact-EVM engine.
//! - [`telemetry`] - Tracing and OpenTelemetry setup.
//! - [`timestamp`] - Unix timestamps for authorization windows.
//! - [`util`] - Base64, money parsing, graceful shutdown.
//!
//! The companion `aeon-x402-axum` crate provides the resource-server
//! middleware that gates Axum routes behind these payments.

pub mod chain;
pub mod config;
pub mod facilitator;
pub mod facilitator_local;
pub mod handlers;
pub mod networks;
pub mod proto;
pub mod scheme;
pub mod telemetry;
pub mod timestamp;
pub mod util;
