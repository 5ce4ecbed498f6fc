//! Chain identifiers and chain access.
//!
//! - [`ChainId`] - a CAIP-2 identifier such as `eip155:43113`
//! - [`Network`] - the canonical form of a network string as it appears on the wire
//! - [`eip155`] - EVM chain references, typed-data signing and the chain connection seam

mod chain_id;
pub mod eip155;
mod network;

pub use chain_id::*;
pub use network::*;
