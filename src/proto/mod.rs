//! Facilitator protocol messages.
//!
//! - [`VerifyRequest`] / [`VerifyResponse`] - `POST /verify`
//! - [`SettleRequest`] / [`SettleResponse`] - `POST /settle`
//! - [`SupportedResponse`] - `GET /supported`
//! - [`PaymentVerificationError`] - why an authorization was rejected
//!
//! All types serialize to JSON using camelCase field names.

use alloy_primitives::Address;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{VecSkipError, serde_as};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use crate::chain::Network;

pub mod v2;

pub use v2::*;

/// `{x402Version, paymentPayload, paymentRequirements}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    #[serde(default)]
    pub x402_version: X402Version2,
    pub payment_payload: PaymentPayload,
    pub payment_requirements: PaymentRequirements,
}

pub type SettleRequest = VerifyRequest;

impl VerifyRequest {
    pub fn new(payment_payload: PaymentPayload, payment_requirements: PaymentRequirements) -> Self {
        Self {
            x402_version: X402Version2,
            payment_payload,
            payment_requirements,
        }
    }
}

/// Coarse class of a verification or settlement failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed or missing fields, or terms that do not match.
    Validation,
    /// Signature recovery failed or recovered someone else.
    Signature,
    /// The authorization window is closed or not open yet.
    Timing,
    /// RPC, broadcast or revert during settlement.
    Chain,
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Signature => "signature",
            ErrorCategory::Timing => "timing",
            ErrorCategory::Chain => "chain",
        };
        f.write_str(s)
    }
}

/// Reasons an authorization fails verification, in the order they are checked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentVerificationError {
    #[error("missing authorization data")]
    MissingAuthorization,
    #[error("network mismatch: payload accepts {accepted}, requirement is {required}")]
    NetworkMismatch { accepted: Network, required: Network },
    #[error("recipient mismatch: authorization pays {actual}, requirement is {expected}")]
    RecipientMismatch { expected: Address, actual: String },
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("insufficient amount")]
    InsufficientAmount,
    #[error("invalid validity window: {0}")]
    InvalidTimestamp(String),
    #[error("expired")]
    Expired,
    #[error("not yet valid")]
    Early,
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("signature does not match payer")]
    SignerMismatch,
}

impl PaymentVerificationError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PaymentVerificationError::Expired | PaymentVerificationError::Early => {
                ErrorCategory::Timing
            }
            PaymentVerificationError::InvalidSignature(_)
            | PaymentVerificationError::SignerMismatch => ErrorCategory::Signature,
            PaymentVerificationError::MissingAuthorization
            | PaymentVerificationError::NetworkMismatch { .. }
            | PaymentVerificationError::RecipientMismatch { .. }
            | PaymentVerificationError::InvalidAmount(_)
            | PaymentVerificationError::InsufficientAmount
            | PaymentVerificationError::InvalidTimestamp(_)
            | PaymentVerificationError::UnsupportedNetwork(_)
            | PaymentVerificationError::InvalidFormat(_) => ErrorCategory::Validation,
        }
    }
}

/// Result of `verify`. Always a value, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResponse {
    Valid {
        payer: Address,
    },
    Invalid {
        reason: String,
        payer: Option<Address>,
    },
}

impl VerifyResponse {
    pub fn valid(payer: Address) -> Self {
        VerifyResponse::Valid { payer }
    }

    pub fn invalid(error: &PaymentVerificationError, payer: Option<Address>) -> Self {
        VerifyResponse::Invalid {
            reason: error.to_string(),
            payer,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyResponse::Valid { .. })
    }

    pub fn payer(&self) -> Option<Address> {
        match self {
            VerifyResponse::Valid { payer } => Some(*payer),
            VerifyResponse::Invalid { payer, .. } => *payer,
        }
    }

    pub fn invalid_reason(&self) -> Option<&str> {
        match self {
            VerifyResponse::Valid { .. } => None,
            VerifyResponse::Invalid { reason, .. } => Some(reason),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponseWire {
    is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payer: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invalid_reason: Option<String>,
}

impl Serialize for VerifyResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let wire = match self {
            VerifyResponse::Valid { payer } => VerifyResponseWire {
                is_valid: true,
                payer: Some(*payer),
                invalid_reason: None,
            },
            VerifyResponse::Invalid { reason, payer } => VerifyResponseWire {
                is_valid: false,
                payer: *payer,
                invalid_reason: Some(reason.clone()),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = VerifyResponseWire::deserialize(deserializer)?;
        if wire.is_valid {
            let payer = wire
                .payer
                .ok_or_else(|| serde::de::Error::missing_field("payer"))?;
            Ok(VerifyResponse::Valid { payer })
        } else {
            Ok(VerifyResponse::Invalid {
                reason: wire
                    .invalid_reason
                    .unwrap_or_else(|| "unspecified".to_string()),
                payer: wire.payer,
            })
        }
    }
}

/// Result of `settle`. A failed settlement is a normal value with `success: false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    pub network: Network,
}

impl SettleResponse {
    pub fn settled(network: Network, payer: Address, transaction: String) -> Self {
        Self {
            success: true,
            error_reason: None,
            error_message: None,
            payer: Some(payer),
            transaction: Some(transaction),
            network,
        }
    }

    pub fn failed<R: Into<String>>(network: Network, error_reason: R) -> Self {
        Self {
            success: false,
            error_reason: Some(error_reason.into()),
            error_message: None,
            payer: None,
            transaction: None,
            network,
        }
    }

    pub fn with_message<M: Into<String>>(mut self, message: M) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_payer(mut self, payer: Option<Address>) -> Self {
        self.payer = payer;
        self
    }

    pub fn with_transaction(mut self, transaction: Option<String>) -> Self {
        self.transaction = transaction;
        self
    }
}

/// One `scheme`/`network` pair a facilitator can verify and settle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    pub x402_version: u8,
    pub scheme: String,
    pub network: String,
}

/// Body of `GET /supported`.
#[serde_as]
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    /// Unparseable entries from a peer are skipped.
    #[serde_as(as = "VecSkipError<_>")]
    pub kinds: Vec<SupportedPaymentKind>,
    /// Network to the addresses that pay gas there.
    #[serde(default)]
    pub signers: HashMap<String, Vec<String>>,
}
