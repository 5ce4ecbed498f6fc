//! Local verification of ERC-3009 payment authorizations.
//!
//! [`AuthorizationVerifier::verify`] is pure: no I/O, no clock reads, no shared mutable
//! state. The same inputs, including `now`, always give the same [`VerifyResponse`].
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. authorization and signature are present
//! 2. the payload accepts the required network
//! 3. the authorization pays the required recipient
//! 4. the authorized value covers the required amount
//! 5. `validAfter < now < validBefore`
//! 6. the typed-data signature recovers to `authorization.from`
//!
//! Network checks come before any cryptographic work.

use alloy_primitives::{Address, B256, Signature, U256, hex};
use alloy_sol_types::{Eip712Domain, eip712_domain};
use std::str::FromStr;
use std::sync::Arc;

use crate::chain::eip155::{TransferWithAuthorization, parse_signature, recover_typed_data_signer};
use crate::networks::NetworkRegistry;
use crate::proto::{
    ExactEvmAuthorization, ExactEvmPayload, PaymentPayload, PaymentRequirements,
    PaymentVerificationError, VerifyResponse,
};
use crate::timestamp::UnixTimestamp;

/// A payment authorization with every field parsed.
#[derive(Debug, Clone)]
pub struct ExactEvmPayment {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: B256,
    pub signature: Signature,
}

impl ExactEvmPayment {
    /// The EIP-712 message this payment's signature is over.
    pub fn transfer(&self) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from: self.from,
            to: self.to,
            value: self.value,
            validAfter: U256::from(self.valid_after.as_secs()),
            validBefore: U256::from(self.valid_before.as_secs()),
            nonce: self.nonce,
        }
    }
}

fn present(
    payload: &ExactEvmPayload,
) -> Result<(&ExactEvmAuthorization, &str), PaymentVerificationError> {
    match (&payload.authorization, payload.signature.as_deref()) {
        (Some(authorization), Some(signature)) if !signature.trim().is_empty() => {
            Ok((authorization, signature))
        }
        _ => Err(PaymentVerificationError::MissingAuthorization),
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, PaymentVerificationError> {
    Address::from_str(value.trim())
        .map_err(|_| PaymentVerificationError::InvalidFormat(format!("{field} is not an address")))
}

fn parse_value(value: &str) -> Result<U256, PaymentVerificationError> {
    U256::from_str_radix(value.trim(), 10)
        .map_err(|_| PaymentVerificationError::InvalidAmount(value.to_string()))
}

fn parse_timestamp(field: &str, value: &str) -> Result<UnixTimestamp, PaymentVerificationError> {
    value
        .trim()
        .parse::<u64>()
        .map(UnixTimestamp::from_secs)
        .map_err(|_| {
            PaymentVerificationError::InvalidTimestamp(format!("{field} is not an integer"))
        })
}

fn parse_nonce(value: &str) -> Result<B256, PaymentVerificationError> {
    B256::from_str(value.trim()).map_err(|_| {
        PaymentVerificationError::InvalidFormat("nonce is not 32 bytes of hex".to_string())
    })
}

fn parse_signature_hex(value: &str) -> Result<Signature, PaymentVerificationError> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| PaymentVerificationError::InvalidSignature(e.to_string()))?;
    parse_signature(&bytes).map_err(|e| PaymentVerificationError::InvalidSignature(e.to_string()))
}

impl TryFrom<&ExactEvmPayload> for ExactEvmPayment {
    type Error = PaymentVerificationError;

    fn try_from(payload: &ExactEvmPayload) -> Result<Self, Self::Error> {
        let (authorization, signature) = present(payload)?;
        Ok(ExactEvmPayment {
            from: parse_address("from", &authorization.from)?,
            to: parse_address("to", &authorization.to)?,
            value: parse_value(&authorization.value)?,
            valid_after: parse_timestamp("validAfter", &authorization.valid_after)?,
            valid_before: parse_timestamp("validBefore", &authorization.valid_before)?,
            nonce: parse_nonce(&authorization.nonce)?,
            signature: parse_signature_hex(signature)?,
        })
    }
}

/// Verifies `exact` EVM payments without touching the chain.
#[derive(Debug, Clone)]
pub struct AuthorizationVerifier {
    registry: Arc<NetworkRegistry>,
    chain_id_override: Option<u64>,
}

impl AuthorizationVerifier {
    pub fn new(registry: Arc<NetworkRegistry>) -> Self {
        Self {
            registry,
            chain_id_override: None,
        }
    }

    /// Uses `chain_id` in the signing domain instead of the registry's.
    pub fn with_chain_id_override(mut self, chain_id: Option<u64>) -> Self {
        self.chain_id_override = chain_id;
        self
    }

    pub fn registry(&self) -> &Arc<NetworkRegistry> {
        &self.registry
    }

    pub fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        now: UnixTimestamp,
    ) -> VerifyResponse {
        match self.check(payload, requirements, now) {
            Ok(payment) => VerifyResponse::valid(payment.from),
            Err(error) => {
                let payer = payload
                    .payload
                    .authorization
                    .as_ref()
                    .and_then(|a| Address::from_str(a.from.trim()).ok());
                tracing::debug!(
                    category = %error.category(),
                    reason = %error,
                    "Payment verification failed"
                );
                VerifyResponse::invalid(&error, payer)
            }
        }
    }

    /// Runs the ordered checks and returns the parsed payment on success.
    pub fn check(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        now: UnixTimestamp,
    ) -> Result<ExactEvmPayment, PaymentVerificationError> {
        let (authorization, signature) = present(&payload.payload)?;

        let accepted = &payload.accepted.network;
        if !self.registry.same_chain(accepted, &requirements.network) {
            return Err(PaymentVerificationError::NetworkMismatch {
                accepted: accepted.clone(),
                required: requirements.network.clone(),
            });
        }

        let to = Address::from_str(authorization.to.trim()).ok();
        if to != Some(requirements.pay_to) {
            return Err(PaymentVerificationError::RecipientMismatch {
                expected: requirements.pay_to,
                actual: authorization.to.clone(),
            });
        }
        let to = requirements.pay_to;

        let value = parse_value(&authorization.value)?;
        if value < requirements.amount.0 {
            return Err(PaymentVerificationError::InsufficientAmount);
        }

        let valid_after = parse_timestamp("validAfter", &authorization.valid_after)?;
        let valid_before = parse_timestamp("validBefore", &authorization.valid_before)?;
        if now >= valid_before {
            return Err(PaymentVerificationError::Expired);
        }
        if now <= valid_after {
            return Err(PaymentVerificationError::Early);
        }

        let domain = self.domain(requirements)?;
        let payment = ExactEvmPayment {
            from: parse_address("from", &authorization.from)?,
            to,
            value,
            valid_after,
            valid_before,
            nonce: parse_nonce(&authorization.nonce)?,
            signature: parse_signature_hex(signature)?,
        };
        let recovered = recover_typed_data_signer(&payment.transfer(), &domain, &payment.signature)
            .map_err(|e| PaymentVerificationError::InvalidSignature(e.to_string()))?;
        if recovered != payment.from {
            return Err(PaymentVerificationError::SignerMismatch);
        }
        Ok(payment)
    }

    /// EIP-712 domain the payer must have signed under.
    pub fn domain(
        &self,
        requirements: &PaymentRequirements,
    ) -> Result<Eip712Domain, PaymentVerificationError> {
        let chain_id = match self.chain_id_override {
            Some(chain_id) => chain_id,
            None => {
                self.registry
                    .resolve(&requirements.network)
                    .map_err(|e| PaymentVerificationError::UnsupportedNetwork(e.to_string()))?
                    .chain_id
            }
        };
        Ok(eip712_domain! {
            name: requirements.extra.name.clone(),
            version: requirements.extra.version.clone(),
            chain_id: chain_id,
            verifying_contract: requirements.asset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Network;
    use crate::test_support::*;
    use alloy_signer::SignerSync;
    use alloy_sol_types::SolStruct;

    fn verifier() -> AuthorizationVerifier {
        AuthorizationVerifier::new(fuji_registry())
    }

    fn now() -> UnixTimestamp {
        UnixTimestamp::from_secs(NOW)
    }

    #[test]
    fn test_valid_payment_returns_payer() {
        let requirements = fuji_requirements();
        let payload = signed_payload(&requirements, AuthorizationParams::default());
        let response = verifier().verify(&payload, &requirements, now());
        assert_eq!(response, VerifyResponse::valid(payer().address()));
    }

    #[test]
    fn test_verify_is_pure() {
        let requirements = fuji_requirements();
        let payload = signed_payload(&requirements, AuthorizationParams::default());
        let verifier = verifier();
        let first = verifier.verify(&payload, &requirements, now());
        let second = verifier.verify(&payload, &requirements, now());
        assert_eq!(first, second);

        let mut garbled = payload.clone();
        garbled.payload.signature = Some("0xdeadbeef".into());
        let first = verifier.verify(&garbled, &requirements, now());
        let second = verifier.verify(&garbled, &requirements, now());
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_authorization_data() {
        let requirements = fuji_requirements();
        let mut payload = signed_payload(&requirements, AuthorizationParams::default());
        payload.payload.signature = None;
        let response = verifier().verify(&payload, &requirements, now());
        assert_eq!(response.invalid_reason(), Some("missing authorization data"));

        let mut payload = signed_payload(&requirements, AuthorizationParams::default());
        payload.payload.authorization = None;
        let response = verifier().verify(&payload, &requirements, now());
        assert_eq!(response.invalid_reason(), Some("missing authorization data"));
        assert_eq!(response.payer(), None);
    }

    #[test]
    fn test_network_mismatch_names_both_values() {
        let requirements = fuji_requirements();
        let mut payload = signed_payload(&requirements, AuthorizationParams::default());
        payload.accepted.network = Network::legacy("base");
        let response = verifier().verify(&payload, &requirements, now());
        let reason = response.invalid_reason().unwrap();
        assert!(reason.contains("base"), "{reason}");
        assert!(reason.contains("eip155:43113"), "{reason}");
    }

    #[test]
    fn test_network_legacy_name_matches_chain_id() {
        let requirements = fuji_requirements();
        let mut payload = signed_payload(&requirements, AuthorizationParams::default());
        payload.accepted.network = Network::legacy("avalanche-fuji");
        assert!(verifier().verify(&payload, &requirements, now()).is_valid());
    }

    #[test]
    fn test_recipient_mismatch_and_case_insensitivity() {
        let requirements = fuji_requirements();
        let mut payload = signed_payload(&requirements, AuthorizationParams::default());
        payload.payload.authorization.as_mut().unwrap().to =
            "0x3333333333333333333333333333333333333333".into();
        let response = verifier().verify(&payload, &requirements, now());
        assert!(response.invalid_reason().unwrap().starts_with("recipient mismatch"));

        let mut payload = signed_payload(&requirements, AuthorizationParams::default());
        let authorization = payload.payload.authorization.as_mut().unwrap();
        authorization.to = authorization.to.to_uppercase().replacen("0X", "0x", 1);
        assert!(verifier().verify(&payload, &requirements, now()).is_valid());
    }

    #[test]
    fn test_value_below_amount_is_insufficient() {
        let requirements = fuji_requirements();
        let params = AuthorizationParams {
            value: U256::from(99_999u64),
            ..Default::default()
        };
        let payload = signed_payload(&requirements, params);
        let response = verifier().verify(&payload, &requirements, now());
        assert_eq!(response.invalid_reason(), Some("insufficient amount"));
    }

    #[test]
    fn test_value_equal_to_amount_passes() {
        let requirements = fuji_requirements();
        let params = AuthorizationParams {
            value: requirements.amount.0,
            ..Default::default()
        };
        let payload = signed_payload(&requirements, params);
        assert!(verifier().verify(&payload, &requirements, now()).is_valid());
    }

    #[test]
    fn test_unparseable_value() {
        let requirements = fuji_requirements();
        let mut payload = signed_payload(&requirements, AuthorizationParams::default());
        payload.payload.authorization.as_mut().unwrap().value = "1e6".into();
        let response = verifier().verify(&payload, &requirements, now());
        assert_eq!(response.invalid_reason(), Some("invalid amount: 1e6"));
    }

    #[test]
    fn test_expired_regardless_of_signature() {
        let requirements = fuji_requirements();
        for valid_before in [NOW, NOW - 1] {
            let params = AuthorizationParams {
                valid_after: NOW - 1200,
                valid_before,
                ..Default::default()
            };
            let mut payload = signed_payload(&requirements, params);
            payload.payload.signature = Some(format!("0x{}", "11".repeat(65)));
            let response = verifier().verify(&payload, &requirements, now());
            assert_eq!(response.invalid_reason(), Some("expired"));
        }
    }

    #[test]
    fn test_not_yet_valid() {
        let requirements = fuji_requirements();
        let params = AuthorizationParams {
            valid_after: NOW,
            valid_before: NOW + 600,
            ..Default::default()
        };
        let payload = signed_payload(&requirements, params);
        let response = verifier().verify(&payload, &requirements, now());
        assert_eq!(response.invalid_reason(), Some("not yet valid"));
    }

    #[test]
    fn test_high_s_signature_is_normalized() {
        let requirements = fuji_requirements();
        let mut payload = signed_payload(&requirements, AuthorizationParams::default());
        let low = with_high_s_signature(&mut payload);

        let payment = ExactEvmPayment::try_from(&payload.payload).unwrap();
        assert_eq!(payment.signature, low);
        let response = verifier().verify(&payload, &requirements, now());
        assert_eq!(response.payer(), Some(payer().address()));
    }

    #[test]
    fn test_tampered_field_does_not_recover_payer() {
        let requirements = fuji_requirements();
        let domain = verifier().domain(&requirements).unwrap();
        let payload = signed_payload(&requirements, AuthorizationParams::default());
        let payment = ExactEvmPayment::try_from(&payload.payload).unwrap();
        let original = payment.transfer();
        assert_eq!(
            recover_typed_data_signer(&original, &domain, &payment.signature).unwrap(),
            payer().address()
        );

        let mutations: Vec<Box<dyn Fn(&mut TransferWithAuthorization)>> = vec![
            Box::new(|t| t.from = Address::repeat_byte(0x44)),
            Box::new(|t| t.to = Address::repeat_byte(0x55)),
            Box::new(|t| t.value += U256::from(1u64)),
            Box::new(|t| t.validAfter += U256::from(1u64)),
            Box::new(|t| t.validBefore += U256::from(1u64)),
            Box::new(|t| t.nonce = B256::repeat_byte(0x66)),
        ];
        for mutate in mutations {
            let mut tampered = payment.transfer();
            mutate(&mut tampered);
            let recovered = recover_typed_data_signer(&tampered, &domain, &payment.signature);
            assert_ne!(recovered.ok(), Some(payer().address()));
        }
    }

    #[test]
    fn test_tampered_value_fails_verification() {
        let requirements = fuji_requirements();
        let mut payload = signed_payload(&requirements, AuthorizationParams::default());
        payload.payload.authorization.as_mut().unwrap().value = "200000".into();
        let response = verifier().verify(&payload, &requirements, now());
        assert_eq!(response.invalid_reason(), Some("signature does not match payer"));
    }

    #[test]
    fn test_wrong_chain_id_is_signature_mismatch() {
        let requirements = fuji_requirements();
        let params = AuthorizationParams {
            chain_id: 1,
            ..Default::default()
        };
        let payload = signed_payload(&requirements, params);
        let response = verifier().verify(&payload, &requirements, now());
        assert_eq!(response.invalid_reason(), Some("signature does not match payer"));

        let overridden = verifier().with_chain_id_override(Some(1));
        assert!(overridden.verify(&payload, &requirements, now()).is_valid());
    }

    #[test]
    fn test_malformed_signature() {
        let requirements = fuji_requirements();
        let mut payload = signed_payload(&requirements, AuthorizationParams::default());
        payload.payload.signature = Some("0xzz".into());
        let response = verifier().verify(&payload, &requirements, now());
        assert!(response.invalid_reason().unwrap().starts_with("invalid signature"));

        payload.payload.signature = Some("0x0102".into());
        let response = verifier().verify(&payload, &requirements, now());
        assert!(response.invalid_reason().unwrap().starts_with("invalid signature"));
    }

    #[test]
    fn test_signature_from_other_key() {
        let requirements = fuji_requirements();
        let payload = signed_payload(&requirements, AuthorizationParams::default());
        let other = other_signer();
        let domain = verifier().domain(&requirements).unwrap();
        let payment = ExactEvmPayment::try_from(&payload.payload).unwrap();
        let forged = other
            .sign_hash_sync(&payment.transfer().eip712_signing_hash(&domain))
            .unwrap();
        let mut forged_payload = payload.clone();
        forged_payload.payload.signature = Some(hex::encode_prefixed(forged.as_bytes()));
        let response = verifier().verify(&forged_payload, &requirements, now());
        assert_eq!(response.invalid_reason(), Some("signature does not match payer"));
        assert_eq!(response.payer(), Some(payer().address()));
    }

    #[test]
    fn test_unknown_network_without_override() {
        let mut requirements = fuji_requirements();
        requirements.network = Network::legacy("mars");
        let mut payload = signed_payload(&fuji_requirements(), AuthorizationParams::default());
        payload.accepted.network = Network::legacy("mars");
        let response = verifier().verify(&payload, &requirements, now());
        assert!(response.invalid_reason().unwrap().starts_with("unsupported network"));
    }
}
