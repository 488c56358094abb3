//! Axum middleware for the [x402 protocol](https://www.x402.org): gate HTTP
//! routes behind EVM micropayments.
//!
//! Pair this crate with a facilitator (the `aeon-x402` binary or any
//! x402-compatible service): the middleware negotiates payment with the
//! client over `402 Payment Required` responses and delegates verification
//! and settlement to the facilitator over HTTP.
//!
//! See [`layer::X402Middleware`] for usage.

pub mod facilitator_client;
pub mod layer;
pub mod paygate;
pub mod paywall;
pub mod routes;

pub use facilitator_client::{FacilitatorClient, FacilitatorConfig};
pub use layer::X402Middleware;
pub use routes::{RouteConfig, RouteTable};
