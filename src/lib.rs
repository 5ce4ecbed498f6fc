//! Payment-gated access control for HTTP services, built on the
//! [x402 protocol](https://www.x402.org).
//!
//! A protected resource answers `402 Payment Required` with a challenge. The payer signs an
//! ERC-3009 `transferWithAuthorization` for the offered terms, the server verifies it
//! without touching the chain, and settlement moves the funds on-chain before the resource
//! is served.
//!
//! # Roles
//!
//! - **Seller**: [`paygate`] guards axum routes. Requirements come from
//!   [`requirement::RequirementBuilder`]; verification is local
//!   ([`verify::AuthorizationVerifier`]) or remote ([`facilitator_client`]).
//! - **Facilitator**: [`facilitator_local::FacilitatorService`] verifies and settles for
//!   others, served over HTTP by [`handlers`].
//! - **Payer**: [`client::ExactEvmPayer`] signs payments for a challenge.
//!
//! # Modules
//!
//! - [`chain`] - CAIP-2 identifiers, EVM typed data and the chain connection seam.
//! - [`networks`] - Registry of supported networks and their USDC deployments.
//! - [`proto`] - x402 v2 wire types and facilitator messages.
//! - [`requirement`] - Payment requirements and 402 challenges.
//! - [`verify`] - Pure, ordered checks of a signed authorization.
//! - [`settle`] - Direct on-chain broadcast or delegation to a remote facilitator.
//! - [`error_class`] - Stable taxonomy of settlement failures with remediation hints.
//! - [`facilitator`] - The [`Facilitator`](facilitator::Facilitator) trait.
//! - [`hooks`] - Audit and webhook hooks around verify and settle.
//! - [`config`] - Configuration file and CLI arguments.
//! - [`timestamp`] - Unix timestamps and clocks.
//! - [`util`] - Base64 headers, prices, telemetry and signal handling.

pub mod chain;
pub mod client;
pub mod config;
pub mod error_class;
pub mod facilitator;
pub mod facilitator_client;
pub mod facilitator_local;
pub mod handlers;
pub mod hooks;
pub mod networks;
pub mod paygate;
pub mod proto;
pub mod requirement;
pub mod settle;
pub mod timestamp;
pub mod util;
pub mod verify;

#[cfg(test)]
mod test_support;
