//! Utility types used across the crate.
//!
//! - [`b64`] - Base64 encoding for HTTP headers
//! - [`lit_str`] - Compile-time string literal types
//! - [`money_amount`] - Human-readable price parsing
//! - [`sig_down`] - Graceful shutdown signal handling
//! - [`telemetry`] - Tracing and OpenTelemetry setup

pub mod b64;
pub mod lit_str;
pub mod money_amount;
pub mod sig_down;
pub mod telemetry;

pub use b64::*;
pub use sig_down::*;
pub use telemetry::*;
