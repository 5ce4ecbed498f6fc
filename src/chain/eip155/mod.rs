//! EVM (`eip155`) chain support.
//!
//! - [`Eip155ChainReference`] - numeric chain id, convertible from a CAIP-2 [`ChainId`]
//! - [`TransferWithAuthorization`] / [`IEIP3009`] - the ERC-3009 typed message and contract interface
//! - [`Eip155ChainConnection`] - the chain access a settlement needs, implemented by
//!   [`provider::Eip155ChainProvider`] on top of alloy
//! - [`PaymentSigner`] - key management for payers
//! - [`recover_typed_data_signer`] - local EIP-712 signature recovery

pub mod provider;

use alloy_primitives::{Address, B256, Bytes, Signature, SignatureError, TxHash};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{Eip712Domain, SolStruct, sol};
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::chain::ChainId;

/// The CAIP-2 namespace for EVM-compatible chains.
pub const EIP155_NAMESPACE: &str = "eip155";

sol! {
    /// ERC-3009 authorization message, signed as EIP-712 typed data.
    #[derive(Debug)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

sol! {
    /// The subset of an ERC-3009 token contract used for settlement.
    interface IEIP3009 {
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            uint8 v,
            bytes32 r,
            bytes32 s
        ) external;
        function balanceOf(address account) external view returns (uint256);
    }
}

/// A numeric chain ID for EVM-compatible networks.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Eip155ChainReference(u64);

impl Eip155ChainReference {
    pub fn new(chain_id: u64) -> Self {
        Self(chain_id)
    }

    pub fn inner(&self) -> u64 {
        self.0
    }
}

impl Display for Eip155ChainReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Eip155ChainReference> for ChainId {
    fn from(value: Eip155ChainReference) -> Self {
        ChainId::new(EIP155_NAMESPACE, value.0.to_string())
    }
}

/// Error returned when converting a [`ChainId`] to an [`Eip155ChainReference`].
#[derive(Debug, thiserror::Error)]
pub enum Eip155ChainReferenceFormatError {
    #[error("Invalid namespace {0}, expected eip155")]
    InvalidNamespace(String),
    #[error("Invalid eip155 chain reference {0}")]
    InvalidReference(String),
}

impl TryFrom<&ChainId> for Eip155ChainReference {
    type Error = Eip155ChainReferenceFormatError;

    fn try_from(value: &ChainId) -> Result<Self, Self::Error> {
        if value.namespace() != EIP155_NAMESPACE {
            return Err(Eip155ChainReferenceFormatError::InvalidNamespace(
                value.namespace().to_string(),
            ));
        }
        let chain_id: u64 = value.reference().parse().map_err(|_| {
            Eip155ChainReferenceFormatError::InvalidReference(value.reference().to_string())
        })?;
        Ok(Eip155ChainReference(chain_id))
    }
}

/// Target contract and calldata of a transaction the facilitator pays gas for.
#[derive(Debug, Clone)]
pub struct MetaTransaction {
    pub to: Address,
    pub calldata: Bytes,
}

/// Inclusion result of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOutcome {
    pub transaction_hash: TxHash,
    /// Receipt status flag: `true` for status 1, `false` for a revert.
    pub success: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] alloy_transport::TransportError),
    #[error(transparent)]
    PendingTransaction(#[from] alloy_provider::PendingTransactionError),
    #[error("{0}")]
    Custom(String),
}

/// Chain access used by settlement: contract reads, transaction submission and receipts.
///
/// Implementations hold exactly one signing key. Callers serialize
/// `send_transaction` + `wait_for_receipt` pairs themselves.
pub trait Eip155ChainConnection {
    fn chain(&self) -> Eip155ChainReference;

    /// Address paying gas for submitted transactions.
    fn signer_address(&self) -> Address;

    /// `eth_call` against `to`, returning raw return data.
    fn read_contract(
        &self,
        to: Address,
        calldata: Bytes,
    ) -> impl Future<Output = Result<Bytes, ConnectionError>> + Send;

    /// Signs and broadcasts a transaction, returning its hash once the node accepts it.
    fn send_transaction(
        &self,
        tx: MetaTransaction,
    ) -> impl Future<Output = Result<TxHash, ConnectionError>> + Send;

    /// Waits until the transaction is included.
    fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
    ) -> impl Future<Output = Result<TransactionOutcome, ConnectionError>> + Send;
}

impl<T: Eip155ChainConnection + Send + Sync> Eip155ChainConnection for Arc<T> {
    fn chain(&self) -> Eip155ChainReference {
        (**self).chain()
    }

    fn signer_address(&self) -> Address {
        (**self).signer_address()
    }

    fn read_contract(
        &self,
        to: Address,
        calldata: Bytes,
    ) -> impl Future<Output = Result<Bytes, ConnectionError>> + Send {
        (**self).read_contract(to, calldata)
    }

    fn send_transaction(
        &self,
        tx: MetaTransaction,
    ) -> impl Future<Output = Result<TxHash, ConnectionError>> + Send {
        (**self).send_transaction(tx)
    }

    fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
    ) -> impl Future<Output = Result<TransactionOutcome, ConnectionError>> + Send {
        (**self).wait_for_receipt(tx_hash)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureParseError {
    #[error("expected 64 or 65 signature bytes, got {0}")]
    InvalidLength(usize),
    #[error(transparent)]
    Malformed(#[from] SignatureError),
}

/// Parses a 65-byte `r || s || v` or a 64-byte EIP-2098 compact signature.
///
/// `s` is normalized to the lower half of the curve order, which is the only form
/// `ecrecover`-based token contracts accept.
pub fn parse_signature(bytes: &[u8]) -> Result<Signature, SignatureParseError> {
    match bytes.len() {
        65 => Ok(Signature::from_raw(bytes)?.normalized_s()),
        64 => Ok(Signature::from_erc2098(bytes).normalized_s()),
        len => Err(SignatureParseError::InvalidLength(len)),
    }
}

/// Recovers the address that signed `message` under `domain`.
///
/// Pure: no chain access. A signature made for another domain or over any other field
/// values recovers to a different address or fails.
pub fn recover_typed_data_signer(
    message: &TransferWithAuthorization,
    domain: &Eip712Domain,
    signature: &Signature,
) -> Result<Address, SignatureError> {
    let hash = message.eip712_signing_hash(domain);
    signature.recover_address_from_prehash(&hash)
}

/// The `(v, r, s)` triple expected by `transferWithAuthorization`.
pub fn split_signature(signature: &Signature) -> (u8, B256, B256) {
    let v = 27 + signature.v() as u8;
    let r = B256::from(signature.r());
    let s = B256::from(signature.s());
    (v, r, s)
}

/// Key management for payers: an address and EIP-712 signing.
#[async_trait]
pub trait PaymentSigner {
    fn address(&self) -> Address;

    async fn sign_typed_data(
        &self,
        message: &TransferWithAuthorization,
        domain: &Eip712Domain,
    ) -> Result<Signature, alloy_signer::Error>;
}

#[async_trait]
impl PaymentSigner for PrivateKeySigner {
    fn address(&self) -> Address {
        PrivateKeySigner::address(self)
    }

    async fn sign_typed_data(
        &self,
        message: &TransferWithAuthorization,
        domain: &Eip712Domain,
    ) -> Result<Signature, alloy_signer::Error> {
        let hash = message.eip712_signing_hash(domain);
        alloy_signer::Signer::sign_hash(self, &hash).await
    }
}

#[async_trait]
impl<T: PaymentSigner + Send + Sync> PaymentSigner for Arc<T> {
    fn address(&self) -> Address {
        (**self).address()
    }

    async fn sign_typed_data(
        &self,
        message: &TransferWithAuthorization,
        domain: &Eip712Domain,
    ) -> Result<Signature, alloy_signer::Error> {
        (**self).sign_typed_data(message, domain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{U256, address, b256};
    use alloy_signer::SignerSync;
    use alloy_sol_types::eip712_domain;

    fn fuji_domain() -> Eip712Domain {
        eip712_domain! {
            name: "USD Coin",
            version: "2",
            chain_id: 43113,
            verifying_contract: address!("0x5425890298aed601595a70AB815c96711a31Bc65"),
        }
    }

    fn message(from: Address) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from,
            to: address!("0x1111111111111111111111111111111111111111"),
            value: U256::from(100_000u64),
            validAfter: U256::from(1_700_000_000u64),
            validBefore: U256::from(1_700_000_600u64),
            nonce: b256!("0x0101010101010101010101010101010101010101010101010101010101010101"),
        }
    }

    fn signer() -> PrivateKeySigner {
        PrivateKeySigner::from_bytes(&b256!(
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
        ))
        .unwrap()
    }

    #[test]
    fn test_recover_matches_signer() {
        let signer = signer();
        let domain = fuji_domain();
        let msg = message(signer.address());
        let signature = signer
            .sign_hash_sync(&msg.eip712_signing_hash(&domain))
            .unwrap();
        let recovered = recover_typed_data_signer(&msg, &domain, &signature).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn test_parse_signature_round_trips_raw_and_compact() {
        let signer = signer();
        let domain = fuji_domain();
        let msg = message(signer.address());
        let signature = signer
            .sign_hash_sync(&msg.eip712_signing_hash(&domain))
            .unwrap();

        let raw = signature.as_bytes();
        let parsed = parse_signature(&raw).unwrap();
        assert_eq!(
            recover_typed_data_signer(&msg, &domain, &parsed).unwrap(),
            signer.address()
        );

        let compact = signature.as_erc2098();
        let parsed = parse_signature(&compact).unwrap();
        assert_eq!(
            recover_typed_data_signer(&msg, &domain, &parsed).unwrap(),
            signer.address()
        );

        assert!(matches!(
            parse_signature(&raw[..10]),
            Err(SignatureParseError::InvalidLength(10))
        ));
    }

    #[test]
    fn test_split_signature_uses_legacy_v() {
        let signer = signer();
        let signature = signer.sign_hash_sync(&B256::repeat_byte(7)).unwrap();
        let (v, r, s) = split_signature(&signature);
        assert!(v == 27 || v == 28);
        assert_eq!(r, B256::from(signature.r()));
        assert_eq!(s, B256::from(signature.s()));
    }

    #[test]
    fn test_chain_reference_from_chain_id() {
        let chain_id = ChainId::new("eip155", "43113");
        let reference = Eip155ChainReference::try_from(&chain_id).unwrap();
        assert_eq!(reference.inner(), 43113);
        assert_eq!(ChainId::from(reference), chain_id);
        assert!(Eip155ChainReference::try_from(&ChainId::new("solana", "1")).is_err());
        assert!(Eip155ChainReference::try_from(&ChainId::new("eip155", "x")).is_err());
    }
}
