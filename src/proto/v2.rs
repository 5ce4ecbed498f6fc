//! x402 version 2 payment messages.
//!
//! - [`PaymentRequired`] - the HTTP 402 challenge body
//! - [`PaymentRequirements`] - the terms of one way to pay
//! - [`PaymentPayload`] - a signed ERC-3009 authorization plus the terms it accepts
//!
//! Requirements are strictly typed: they are produced by the server or echoed from them.
//! The authorization inside a payload stays loosely typed (`Option`s of strings) so that
//! every field can be checked, and rejected with a precise reason, by
//! [`AuthorizationVerifier`](crate::verify::AuthorizationVerifier).

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::{Display, Formatter};

use crate::chain::Network;
use crate::lit_str;

lit_str!(ExactScheme, "exact");

/// Version marker that serializes as the integer `2`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version2;

impl X402Version2 {
    pub const VALUE: u8 = 2;
}

impl Serialize for X402Version2 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version2 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u8::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version2)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {}, got {}",
                Self::VALUE,
                num
            )))
        }
    }
}

/// Token amount in atomic units, as a base-10 string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TokenAmount(pub U256);

impl Display for TokenAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<U256> for TokenAmount {
    fn from(value: U256) -> Self {
        Self(value)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(&s, 10)
            .map(TokenAmount)
            .map_err(serde::de::Error::custom)
    }
}

/// EIP-712 domain name and version of the payment asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequirementsExtra {
    pub name: String,
    pub version: String,
}

/// One acceptable way to pay for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: ExactScheme,
    pub network: Network,
    pub asset: Address,
    pub pay_to: Address,
    pub amount: TokenAmount,
    pub max_timeout_seconds: u64,
    pub extra: PaymentRequirementsExtra,
}

/// Display metadata of the paid resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub name: String,
    pub description: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Body of an HTTP 402 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequired {
    pub x402_version: X402Version2,
    pub accepts: Vec<PaymentRequirements>,
    #[serde(default)]
    pub error: String,
    pub resource: ResourceInfo,
}

/// The six ERC-3009 authorization fields, as sent by the payer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmAuthorization {
    pub from: String,
    pub to: String,
    pub value: String,
    pub valid_after: String,
    pub valid_before: String,
    pub nonce: String,
}

/// Scheme payload of an `exact` EVM payment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExactEvmPayload {
    /// Hex-encoded 65-byte or 64-byte signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<ExactEvmAuthorization>,
}

/// A signed authorization together with the requirements it accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    #[serde(default)]
    pub x402_version: X402Version2,
    pub accepted: PaymentRequirements,
    pub payload: ExactEvmPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn requirements_json() -> serde_json::Value {
        json!({
            "scheme": "exact",
            "network": "eip155:43113",
            "asset": "0x5425890298aed601595a70AB815c96711a31Bc65",
            "payTo": "0x1111111111111111111111111111111111111111",
            "amount": "100000",
            "maxTimeoutSeconds": 600,
            "extra": { "name": "USD Coin", "version": "2" }
        })
    }

    #[test]
    fn test_requirements_wire_shape() {
        let requirements: PaymentRequirements =
            serde_json::from_value(requirements_json()).unwrap();
        assert_eq!(requirements.amount.0, U256::from(100_000u64));
        assert_eq!(requirements.network.to_string(), "eip155:43113");
        let back = serde_json::to_value(&requirements).unwrap();
        let original = requirements_json();
        for field in ["scheme", "network", "payTo", "amount", "maxTimeoutSeconds", "extra"] {
            assert_eq!(back[field], original[field], "field {field}");
        }
        assert_eq!(
            back["asset"].as_str().unwrap().to_lowercase(),
            original["asset"].as_str().unwrap().to_lowercase()
        );
    }

    #[test]
    fn test_requirements_reject_other_scheme() {
        let mut value = requirements_json();
        value["scheme"] = json!("upto");
        assert!(serde_json::from_value::<PaymentRequirements>(value).is_err());
    }

    #[test]
    fn test_payment_required_wire_shape() {
        let required = PaymentRequired {
            x402_version: X402Version2,
            accepts: vec![serde_json::from_value(requirements_json()).unwrap()],
            error: "Payment required".into(),
            resource: ResourceInfo {
                name: "report".into(),
                description: "Quality report".into(),
                mime_type: "application/json".into(),
                url: None,
            },
        };
        let value = serde_json::to_value(&required).unwrap();
        assert_eq!(value["x402Version"], json!(2));
        assert_eq!(value["resource"]["mimeType"], json!("application/json"));
        assert_eq!(value["accepts"][0]["amount"], json!("100000"));
    }

    #[test]
    fn test_payload_tolerates_missing_authorization() {
        let payload: PaymentPayload = serde_json::from_value(json!({
            "accepted": requirements_json(),
            "payload": { "signature": "0x00" }
        }))
        .unwrap();
        assert!(payload.payload.authorization.is_none());
        assert_eq!(payload.x402_version, X402Version2);
    }
}
