//! Canonical network identifiers.
//!
//! Payment messages name networks either by a legacy name (`"base-sepolia"`) or by a
//! CAIP-2 chain id (`"eip155:84532"`). [`Network`] parses either form once, at the wire
//! boundary. Resolving a [`Network`] to chain metadata is the job of
//! [`NetworkRegistry`](crate::networks::NetworkRegistry).

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::fmt;
use std::str::FromStr;

use crate::chain::{ChainId, ChainIdFormatError};

/// A network as named by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Network {
    /// A well-known network name such as `avalanche-fuji`.
    Legacy(String),
    /// A chain-agnostic `namespace:reference` identifier.
    ChainId(ChainId),
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkParseError {
    #[error("Network identifier is empty")]
    Empty,
    #[error(transparent)]
    ChainId(#[from] ChainIdFormatError),
}

impl Network {
    pub fn legacy<S: Into<String>>(name: S) -> Self {
        Network::Legacy(name.into())
    }

    pub fn as_chain_id(&self) -> Option<&ChainId> {
        match self {
            Network::ChainId(chain_id) => Some(chain_id),
            Network::Legacy(_) => None,
        }
    }
}

impl FromStr for Network {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(NetworkParseError::Empty);
        }
        if s.contains(':') {
            Ok(Network::ChainId(s.parse()?))
        } else {
            Ok(Network::Legacy(s.to_string()))
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Legacy(name) => write!(f, "{name}"),
            Network::ChainId(chain_id) => write!(f, "{chain_id}"),
        }
    }
}

impl From<ChainId> for Network {
    fn from(value: ChainId) -> Self {
        Network::ChainId(value)
    }
}

impl Serialize for Network {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
