//! Utility types shared across the crate:
//!
//! - [`b64`] - Base64 encoding/decoding of wire payloads
//! - [`money_amount`] - Human-readable currency amount parsing
//! - [`shutdown`] - SIGTERM/SIGINT handling for graceful shutdown

pub mod b64;
pub mod money_amount;
pub mod shutdown;

pub use b64::*;
pub use shutdown::*;
