//! Shared fixtures for unit tests.

use alloy_primitives::{
    Address, B256, Bytes, Signature, TxHash, U256, address, b256, hex, keccak256, uint,
};
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolCall, SolStruct, eip712_domain};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::chain::eip155::{
    ConnectionError, Eip155ChainConnection, Eip155ChainReference, IEIP3009, MetaTransaction,
    TransactionOutcome, TransferWithAuthorization,
};
use crate::networks::{NetworkInfo, NetworkRegistry, TokenEip712};
use crate::proto::{ExactEvmAuthorization, ExactEvmPayload, PaymentPayload, PaymentRequirements};
use crate::requirement::{PaymentOffer, RequirementBuilder};
use crate::util::money_amount::MoneyAmount;

pub const NOW: u64 = 1_750_000_000;

pub const FUJI_ASSET: Address = address!("0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");

pub const PAY_TO: Address = address!("0x209693Bc6afc0C5328bA36FaF03C514EF312287C");

/// Order `n` of the secp256k1 group.
pub const SECP256K1_ORDER: U256 =
    uint!(0xFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFEBAAEDCE6AF48A03BBFD25E8CD0364141_U256);

pub const REVERT_USED_NONCE: &str =
    "execution reverted: FiatTokenV2: authorization is used or canceled";

pub fn payer() -> PrivateKeySigner {
    PrivateKeySigner::from_bytes(&b256!(
        "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
    ))
    .unwrap()
}

pub fn other_signer() -> PrivateKeySigner {
    PrivateKeySigner::from_bytes(&b256!(
        "0x5de4111afa1a4b94908f83103eb1f1706367c2e68ca870fc3fb9a804cdab365a"
    ))
    .unwrap()
}

pub fn fuji_info() -> NetworkInfo {
    NetworkInfo {
        name: "avalanche-fuji".into(),
        chain_id: 43113,
        asset: FUJI_ASSET,
        decimals: 6,
        eip712: TokenEip712 {
            name: "USD Coin".into(),
            version: "2".into(),
        },
        display_name: "Avalanche Fuji".into(),
        explorer_url: "https://testnet.snowtrace.io".into(),
        default_rpc: "https://api.avax-test.network/ext/bc/C/rpc".into(),
    }
}

pub fn fuji_registry() -> Arc<NetworkRegistry> {
    Arc::new(NetworkRegistry::from_entries([fuji_info()]))
}

/// 0.10 USDC on `eip155:43113`, paid to [`PAY_TO`].
pub fn fuji_requirements() -> PaymentRequirements {
    let offer = PaymentOffer::new(
        MoneyAmount::parse("0.10").unwrap(),
        "eip155:43113".parse().unwrap(),
        PAY_TO,
    );
    RequirementBuilder::new(fuji_registry())
        .build(&offer)
        .unwrap()
}

#[derive(Debug, Clone)]
pub struct AuthorizationParams {
    pub value: U256,
    pub valid_after: u64,
    pub valid_before: u64,
    pub nonce: B256,
    pub chain_id: u64,
}

impl Default for AuthorizationParams {
    fn default() -> Self {
        Self {
            value: U256::from(100_000u64),
            valid_after: NOW - 600,
            valid_before: NOW + 600,
            nonce: B256::repeat_byte(0x42),
            chain_id: 43113,
        }
    }
}

/// A payload signed by [`payer`] paying `requirements`.
pub fn signed_payload(
    requirements: &PaymentRequirements,
    params: AuthorizationParams,
) -> PaymentPayload {
    let signer = payer();
    let message = TransferWithAuthorization {
        from: signer.address(),
        to: requirements.pay_to,
        value: params.value,
        validAfter: U256::from(params.valid_after),
        validBefore: U256::from(params.valid_before),
        nonce: params.nonce,
    };
    let domain = eip712_domain! {
        name: requirements.extra.name.clone(),
        version: requirements.extra.version.clone(),
        chain_id: params.chain_id,
        verifying_contract: requirements.asset,
    };
    let signature = signer
        .sign_hash_sync(&message.eip712_signing_hash(&domain))
        .unwrap();
    PaymentPayload {
        x402_version: Default::default(),
        accepted: requirements.clone(),
        payload: ExactEvmPayload {
            signature: Some(hex::encode_prefixed(signature.as_bytes())),
            authorization: Some(ExactEvmAuthorization {
                from: signer.address().to_string(),
                to: requirements.pay_to.to_string(),
                value: params.value.to_string(),
                valid_after: params.valid_after.to_string(),
                valid_before: params.valid_before.to_string(),
                nonce: hex::encode_prefixed(params.nonce),
            }),
        },
        resource: None,
    }
}

/// Swaps the payload's signature for its malleated twin (`n - s`, flipped parity).
/// Returns the original low-s signature.
pub fn with_high_s_signature(payload: &mut PaymentPayload) -> Signature {
    let encoded = payload.payload.signature.as_deref().unwrap();
    let low = Signature::from_raw(&hex::decode(encoded).unwrap()).unwrap();
    assert!(low.s() <= SECP256K1_ORDER >> 1);
    let high = Signature::new(low.r(), SECP256K1_ORDER - low.s(), !low.v());
    payload.payload.signature = Some(hex::encode_prefixed(high.as_bytes()));
    low
}

/// In-memory chain behaving like an ERC-3009 token: used nonces revert.
#[derive(Debug)]
pub struct MockConnection {
    pub chain: u64,
    pub signer: Address,
    pub balance: Option<U256>,
    pub receipt_success: bool,
    pub send_error: Option<String>,
    pub used_nonces: Mutex<HashSet<B256>>,
    pub sent: Mutex<Vec<MetaTransaction>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockConnection {
    pub fn new(chain: u64) -> Self {
        Self {
            chain,
            signer: address!("0xFac11174700000000000000000000000000000FF"),
            balance: Some(U256::MAX),
            receipt_success: true,
            send_error: None,
            used_nonces: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Highest number of sends observed between a send and its receipt.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Eip155ChainConnection for MockConnection {
    fn chain(&self) -> Eip155ChainReference {
        Eip155ChainReference::new(self.chain)
    }

    fn signer_address(&self) -> Address {
        self.signer
    }

    async fn read_contract(&self, _to: Address, calldata: Bytes) -> Result<Bytes, ConnectionError> {
        IEIP3009::balanceOfCall::abi_decode(&calldata)
            .map_err(|e| ConnectionError::Custom(e.to_string()))?;
        match self.balance {
            Some(balance) => Ok(Bytes::from(balance.to_be_bytes::<32>().to_vec())),
            None => Err(ConnectionError::Custom("connection refused".into())),
        }
    }

    async fn send_transaction(&self, tx: MetaTransaction) -> Result<TxHash, ConnectionError> {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if let Some(error) = &self.send_error {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionError::Custom(error.clone()));
        }
        let call = IEIP3009::transferWithAuthorizationCall::abi_decode(&tx.calldata)
            .map_err(|e| ConnectionError::Custom(e.to_string()))?;
        if !self.used_nonces.lock().unwrap().insert(call.nonce) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(ConnectionError::Custom(REVERT_USED_NONCE.into()));
        }
        let hash = keccak256(&tx.calldata);
        self.sent.lock().unwrap().push(tx);
        Ok(hash)
    }

    async fn wait_for_receipt(&self, tx_hash: TxHash) -> Result<TransactionOutcome, ConnectionError> {
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(TransactionOutcome {
            transaction_hash: tx_hash,
            success: self.receipt_success,
        })
    }
}
