//! Payer side of the `exact` EVM scheme.
//!
//! [`ExactEvmPayer`] answers a 402 challenge: it signs an ERC-3009
//! `transferWithAuthorization` for the offered requirements and returns the
//! [`PaymentPayload`], or its `Payment-Signature` header encoding.
//!
//! ```ignore
//! let payer = ExactEvmPayer::new(PrivateKeySigner::random(), Arc::new(NetworkRegistry::known()));
//! let header = payer.payment_header(&challenge.accepts[0]).await?;
//! ```

use alloy_primitives::{B256, U256, hex};
use alloy_sol_types::eip712_domain;
use rand::{Rng, rng};
use std::sync::Arc;

use crate::chain::eip155::{Eip155ChainReference, PaymentSigner, TransferWithAuthorization};
use crate::networks::{NetworkRegistry, NetworkRegistryError};
use crate::proto::{
    ExactEvmAuthorization, ExactEvmPayload, PaymentPayload, PaymentRequired, PaymentRequirements,
    X402Version2,
};
use crate::timestamp::{Clock, SystemClock, UnixTimestamp};
use crate::util::b64::Base64Bytes;

/// `validAfter` is backdated by this much so clock skew does not reject a fresh payment.
pub const VALID_AFTER_SKEW_SECS: u64 = 10 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Network(#[from] NetworkRegistryError),
    #[error("Failed to sign authorization: {0}")]
    Signing(#[from] alloy_signer::Error),
    #[error("Failed to encode payment payload: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("No acceptable payment requirements")]
    NoAcceptableRequirements,
}

/// Signs `exact` payments with `S`.
pub struct ExactEvmPayer<S> {
    signer: S,
    registry: Arc<NetworkRegistry>,
    clock: Arc<dyn Clock>,
    chain_id: Option<u64>,
}

impl<S: PaymentSigner + Send + Sync> ExactEvmPayer<S> {
    pub fn new(signer: S, registry: Arc<NetworkRegistry>) -> Self {
        Self {
            signer,
            registry,
            clock: Arc::new(SystemClock),
            chain_id: None,
        }
    }

    pub fn with_clock<K: Clock + 'static>(mut self, clock: K) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Signs for `chain_id` instead of the chain the requirements' network resolves to.
    pub fn with_chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    pub fn signer(&self) -> &S {
        &self.signer
    }

    /// The first offer in `challenge` on a network this payer knows.
    pub fn select<'a>(
        &self,
        challenge: &'a PaymentRequired,
    ) -> Result<&'a PaymentRequirements, ClientError> {
        challenge
            .accepts
            .iter()
            .find(|requirements| self.registry.resolve(&requirements.network).is_ok())
            .ok_or(ClientError::NoAcceptableRequirements)
    }

    fn chain_id(&self, requirements: &PaymentRequirements) -> Result<u64, ClientError> {
        if let Some(chain_id) = self.chain_id {
            return Ok(chain_id);
        }
        match self.registry.resolve(&requirements.network) {
            Ok(info) => Ok(info.chain_id),
            Err(err) => requirements
                .network
                .as_chain_id()
                .and_then(|chain_id| Eip155ChainReference::try_from(chain_id).ok())
                .map(|reference| reference.inner())
                .ok_or(ClientError::Network(err)),
        }
    }

    /// Signs a fresh authorization paying exactly `requirements.amount`.
    pub async fn sign(
        &self,
        requirements: &PaymentRequirements,
    ) -> Result<PaymentPayload, ClientError> {
        self.sign_at(requirements, self.clock.now()).await
    }

    pub async fn sign_at(
        &self,
        requirements: &PaymentRequirements,
        now: UnixTimestamp,
    ) -> Result<PaymentPayload, ClientError> {
        let domain = eip712_domain! {
            name: requirements.extra.name.clone(),
            version: requirements.extra.version.clone(),
            chain_id: self.chain_id(requirements)?,
            verifying_contract: requirements.asset,
        };
        let valid_after = now.saturating_sub(VALID_AFTER_SKEW_SECS);
        let valid_before = now + requirements.max_timeout_seconds;
        let nonce = B256::from(rng().random::<[u8; 32]>());
        let from = self.signer.address();
        let message = TransferWithAuthorization {
            from,
            to: requirements.pay_to,
            value: requirements.amount.0,
            validAfter: U256::from(valid_after.as_secs()),
            validBefore: U256::from(valid_before.as_secs()),
            nonce,
        };
        let signature = self.signer.sign_typed_data(&message, &domain).await?;
        Ok(PaymentPayload {
            x402_version: X402Version2,
            accepted: requirements.clone(),
            payload: ExactEvmPayload {
                signature: Some(hex::encode_prefixed(signature.as_bytes())),
                authorization: Some(ExactEvmAuthorization {
                    from: from.to_string(),
                    to: requirements.pay_to.to_string(),
                    value: requirements.amount.to_string(),
                    valid_after: valid_after.as_secs().to_string(),
                    valid_before: valid_before.as_secs().to_string(),
                    nonce: hex::encode_prefixed(nonce),
                }),
            },
            resource: None,
        })
    }

    /// The `Payment-Signature` header value for a fresh authorization.
    pub async fn payment_header(
        &self,
        requirements: &PaymentRequirements,
    ) -> Result<String, ClientError> {
        let payload = self.sign(requirements).await?;
        Ok(Base64Bytes::encode_json(&payload)?.to_string())
    }
}
