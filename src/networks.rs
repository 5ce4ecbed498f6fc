//! Registry of networks a payment may target.
//!
//! Each entry ties a network name to its EVM chain id, the USDC deployment used for
//! payments on it (address, decimals, EIP-712 domain name and version) and the
//! endpoints a human or a node operator needs: display name, block explorer and a
//! public RPC.
//!
//! The registry is built once at startup from the built-in table plus any custom entries
//! from configuration, and is read-only afterwards. Share it behind an [`Arc`](std::sync::Arc).
//!
//! ```
//! use x402_gate::chain::Network;
//! use x402_gate::networks::NetworkRegistry;
//!
//! let registry = NetworkRegistry::known();
//! let fuji = registry.resolve(&"eip155:43113".parse::<Network>().unwrap()).unwrap();
//! assert_eq!(fuji.name, "avalanche-fuji");
//! assert!(registry.same_chain(&Network::legacy("avalanche-fuji"), &"eip155:43113".parse().unwrap()));
//! ```

use alloy_primitives::{Address, address};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::chain::eip155::{EIP155_NAMESPACE, Eip155ChainReference};
use crate::chain::{ChainId, Network};

/// EIP-712 domain name and version of a token contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEip712 {
    pub name: String,
    pub version: String,
}

/// Chain metadata and payment asset of a single network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    /// Legacy network name, e.g. `base-sepolia`.
    pub name: String,
    /// Numeric EVM chain id.
    pub chain_id: u64,
    /// Stablecoin contract accepting `transferWithAuthorization`.
    pub asset: Address,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
    pub eip712: TokenEip712,
    pub display_name: String,
    /// Block explorer base URL, without a trailing slash.
    pub explorer_url: String,
    pub default_rpc: String,
}

fn default_decimals() -> u8 {
    6
}

impl NetworkInfo {
    pub fn chain_reference(&self) -> Eip155ChainReference {
        Eip155ChainReference::new(self.chain_id)
    }

    pub fn caip2(&self) -> ChainId {
        self.chain_reference().into()
    }

    pub fn network(&self) -> Network {
        Network::legacy(self.name.clone())
    }

    /// Link to a transaction on the block explorer.
    pub fn explorer_tx_url(&self, tx_hash: &str) -> String {
        format!("{}/tx/{}", self.explorer_url.trim_end_matches('/'), tx_hash)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkRegistryError {
    #[error("Unknown network {0}")]
    UnknownNetwork(String),
    #[error("Unsupported chain namespace {0}, only eip155 is supported")]
    UnsupportedNamespace(String),
}

struct KnownNetwork {
    name: &'static str,
    chain_id: u64,
    asset: Address,
    eip712_name: &'static str,
    display_name: &'static str,
    explorer_url: &'static str,
    default_rpc: &'static str,
}

static KNOWN_NETWORKS: &[KnownNetwork] = &[
    KnownNetwork {
        name: "base",
        chain_id: 8453,
        asset: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
        eip712_name: "USD Coin",
        display_name: "Base",
        explorer_url: "https://basescan.org",
        default_rpc: "https://mainnet.base.org",
    },
    KnownNetwork {
        name: "base-sepolia",
        chain_id: 84532,
        asset: address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
        eip712_name: "USDC",
        display_name: "Base Sepolia",
        explorer_url: "https://sepolia.basescan.org",
        default_rpc: "https://sepolia.base.org",
    },
    KnownNetwork {
        name: "polygon",
        chain_id: 137,
        asset: address!("0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359"),
        eip712_name: "USDC",
        display_name: "Polygon",
        explorer_url: "https://polygonscan.com",
        default_rpc: "https://polygon-rpc.com",
    },
    KnownNetwork {
        name: "polygon-amoy",
        chain_id: 80002,
        asset: address!("0x41E94Eb019C0762f9Bfcf9Fb1E58725BfB0e7582"),
        eip712_name: "USDC",
        display_name: "Polygon Amoy",
        explorer_url: "https://amoy.polygonscan.com",
        default_rpc: "https://rpc-amoy.polygon.technology",
    },
    KnownNetwork {
        name: "avalanche",
        chain_id: 43114,
        asset: address!("0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E"),
        eip712_name: "USD Coin",
        display_name: "Avalanche C-Chain",
        explorer_url: "https://snowtrace.io",
        default_rpc: "https://api.avax.network/ext/bc/C/rpc",
    },
    KnownNetwork {
        name: "avalanche-fuji",
        chain_id: 43113,
        asset: address!("0x5425890298aed601595a70AB815c96711a31Bc65"),
        eip712_name: "USD Coin",
        display_name: "Avalanche Fuji",
        explorer_url: "https://testnet.snowtrace.io",
        default_rpc: "https://api.avax-test.network/ext/bc/C/rpc",
    },
    KnownNetwork {
        name: "sei",
        chain_id: 1329,
        asset: address!("0xe15fC38F6D8c56aF07bbCBe3BAf5708A2Bf42392"),
        eip712_name: "USDC",
        display_name: "Sei",
        explorer_url: "https://seitrace.com",
        default_rpc: "https://evm-rpc.sei-apis.com",
    },
    KnownNetwork {
        name: "sei-testnet",
        chain_id: 1328,
        asset: address!("0x4fCF1784B31630811181f670Aea7A7bEF803eaED"),
        eip712_name: "USDC",
        display_name: "Sei Testnet",
        explorer_url: "https://testnet.seitrace.com",
        default_rpc: "https://evm-rpc-testnet.sei-apis.com",
    },
    KnownNetwork {
        name: "celo",
        chain_id: 42220,
        asset: address!("0xcebA9300f2b948710d2653dD7B07f33A8B32118C"),
        eip712_name: "USDC",
        display_name: "Celo",
        explorer_url: "https://celoscan.io",
        default_rpc: "https://forno.celo.org",
    },
    KnownNetwork {
        name: "celo-sepolia",
        chain_id: 11142220,
        asset: address!("0x01C5C0122039549AD1493B8220cABEdD739BC44E"),
        eip712_name: "USDC",
        display_name: "Celo Sepolia",
        explorer_url: "https://celo-sepolia.blockscout.com",
        default_rpc: "https://forno.celo-sepolia.celo-testnet.org",
    },
];

impl From<&KnownNetwork> for NetworkInfo {
    fn from(known: &KnownNetwork) -> Self {
        NetworkInfo {
            name: known.name.to_string(),
            chain_id: known.chain_id,
            asset: known.asset,
            decimals: 6,
            eip712: TokenEip712 {
                name: known.eip712_name.to_string(),
                version: "2".to_string(),
            },
            display_name: known.display_name.to_string(),
            explorer_url: known.explorer_url.to_string(),
            default_rpc: known.default_rpc.to_string(),
        }
    }
}

/// Immutable lookup table from network identifiers to [`NetworkInfo`].
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    entries: Vec<NetworkInfo>,
    by_name: HashMap<String, usize>,
    by_chain_id: HashMap<u64, usize>,
}

impl NetworkRegistry {
    /// Registry holding only the built-in networks.
    pub fn known() -> Self {
        Self::from_entries(KNOWN_NETWORKS.iter().map(NetworkInfo::from))
    }

    /// Built-in networks extended with `custom` entries.
    ///
    /// A custom entry replaces a built-in one with the same name or chain id.
    pub fn with_custom<I: IntoIterator<Item = NetworkInfo>>(custom: I) -> Self {
        Self::from_entries(
            KNOWN_NETWORKS
                .iter()
                .map(NetworkInfo::from)
                .chain(custom),
        )
    }

    pub fn from_entries<I: IntoIterator<Item = NetworkInfo>>(entries: I) -> Self {
        let mut registry = NetworkRegistry::default();
        for entry in entries {
            let replaced = registry
                .by_name
                .get(&entry.name)
                .or_else(|| registry.by_chain_id.get(&entry.chain_id))
                .copied();
            let index = match replaced {
                Some(index) => {
                    let old = &registry.entries[index];
                    registry.by_name.remove(&old.name);
                    registry.by_chain_id.remove(&old.chain_id);
                    registry.entries[index] = entry;
                    index
                }
                None => {
                    registry.entries.push(entry);
                    registry.entries.len() - 1
                }
            };
            let entry = &registry.entries[index];
            registry.by_name.insert(entry.name.clone(), index);
            registry.by_chain_id.insert(entry.chain_id, index);
        }
        registry
    }

    pub fn by_name(&self, name: &str) -> Option<&NetworkInfo> {
        self.by_name.get(name).map(|i| &self.entries[*i])
    }

    pub fn by_chain_id(&self, chain_id: u64) -> Option<&NetworkInfo> {
        self.by_chain_id.get(&chain_id).map(|i| &self.entries[*i])
    }

    /// Resolves a wire network identifier to its registry entry.
    pub fn resolve(&self, network: &Network) -> Result<&NetworkInfo, NetworkRegistryError> {
        match network {
            Network::Legacy(name) => self
                .by_name(name)
                .ok_or_else(|| NetworkRegistryError::UnknownNetwork(name.clone())),
            Network::ChainId(chain_id) => {
                if chain_id.namespace() != EIP155_NAMESPACE {
                    return Err(NetworkRegistryError::UnsupportedNamespace(
                        chain_id.namespace().to_string(),
                    ));
                }
                chain_id
                    .reference()
                    .parse::<u64>()
                    .ok()
                    .and_then(|id| self.by_chain_id(id))
                    .ok_or_else(|| NetworkRegistryError::UnknownNetwork(chain_id.to_string()))
            }
        }
    }

    /// True when both identifiers are equal or name the same chain.
    pub fn same_chain(&self, a: &Network, b: &Network) -> bool {
        if a == b {
            return true;
        }
        match (self.resolve(a), self.resolve(b)) {
            (Ok(a), Ok(b)) => a.chain_id == b.chain_id,
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkInfo> {
        self.entries.iter()
    }
}
