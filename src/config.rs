//! Configuration for the x402 gate server.
//!
//! Loaded once at startup from a JSON file and passed by value into every component.
//! String values may reference environment variables through [`LiteralOrEnv`].

use alloy_primitives::{Address, B256};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::chain::Network;
use crate::networks::NetworkInfo;
use crate::proto::ResourceInfo;
use crate::util::money_amount::MoneyAmount;

/// CLI arguments for the x402 gate server.
#[derive(Parser, Debug)]
#[command(name = "x402-gate")]
#[command(about = "x402 payment gate and facilitator HTTP server")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Server configuration.
///
/// Fields use serde defaults that fall back to environment variables,
/// then to hardcoded defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default)]
    networks: NetworksConfig,
    #[serde(default)]
    custom_networks: Vec<NetworkInfo>,
    #[serde(default)]
    hooks: HooksConfig,
    #[serde(default)]
    paygate: Option<PaygateConfig>,
}

/// RPC provider configuration for a single endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcConfig {
    pub http: Url,
    /// Requests per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
}

/// Settlement settings of one network the facilitator broadcasts on.
///
/// ```json
/// {
///   "signer": "$FUJI_SIGNER_KEY",
///   "rpc": [{ "http": "https://api.avax-test.network/ext/bc/C/rpc", "rate_limit": 20 }],
///   "eip1559": true,
///   "receipt_timeout_secs": 30
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub signer: LiteralOrEnv<EvmPrivateKey>,
    /// Falls back to the registry's default RPC when empty.
    #[serde(default)]
    pub rpc: Vec<RpcConfig>,
    #[serde(default = "config_defaults::default_eip1559")]
    pub eip1559: bool,
    /// How long to wait for a transaction receipt.
    #[serde(default = "config_defaults::default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
}

impl NetworkConfig {
    /// Configured RPC endpoints, or the registry default for `info`.
    pub fn rpc_or_default(&self, info: &NetworkInfo) -> Result<Vec<RpcConfig>, ConfigError> {
        if !self.rpc.is_empty() {
            return Ok(self.rpc.clone());
        }
        let http = Url::parse(&info.default_rpc)
            .map_err(|e| ConfigError::InvalidUrl(info.default_rpc.clone(), e))?;
        Ok(vec![RpcConfig {
            http,
            rate_limit: None,
        }])
    }
}

/// Networks the facilitator settles on, keyed by network id in JSON.
///
/// Keys accept both legacy names (`"avalanche-fuji"`) and CAIP-2 ids (`"eip155:43113"`).
#[derive(Debug, Clone, Default)]
pub struct NetworksConfig(pub Vec<(Network, NetworkConfig)>);

impl Deref for NetworksConfig {
    type Target = Vec<(Network, NetworkConfig)>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de> Deserialize<'de> for NetworksConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{MapAccess, Visitor};
        use std::fmt;

        struct NetworksVisitor;

        impl<'de> Visitor<'de> for NetworksVisitor {
            type Value = NetworksConfig;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of network identifiers to network configurations")
            }

            fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut networks = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(network) = access.next_key::<Network>()? {
                    let config: NetworkConfig = access.next_value()?;
                    networks.push((network, config));
                }
                Ok(NetworksConfig(networks))
            }
        }

        deserializer.deserialize_map(NetworksVisitor)
    }
}

/// Observation hooks around verify and settle.
#[derive(Debug, Clone, Deserialize)]
pub struct HooksConfig {
    /// Log every verify and settle outcome.
    #[serde(default)]
    pub audit_log: bool,
    /// POST settlement outcomes to this URL.
    #[serde(default)]
    pub webhook_url: Option<LiteralOrEnv<Url>>,
    #[serde(default = "config_defaults::default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            audit_log: false,
            webhook_url: None,
            webhook_timeout_secs: config_defaults::default_webhook_timeout_secs(),
        }
    }
}

/// Where a paygate verifies payments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMode {
    #[default]
    Local,
    Remote,
}

/// How a paygate settles payments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SettlementMode {
    /// Broadcast from this process, using the matching `networks` entry.
    #[default]
    Direct,
    /// Relay to the remote facilitator.
    Delegate,
}

/// A payment-gated route served by this process.
///
/// ```json
/// {
///   "price": "$0.10",
///   "network": "eip155:43113",
///   "pay_to": "$PAY_TO_ADDRESS",
///   "path": "/report",
///   "resource": { "name": "report", "description": "Repository report", "mimeType": "application/json" },
///   "verification": "remote",
///   "settlement": { "mode": "delegate" },
///   "facilitator_url": "https://facilitator.example.com"
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PaygateConfig {
    pub price: LiteralOrEnv<MoneyAmount>,
    pub network: Network,
    pub pay_to: LiteralOrEnv<Address>,
    #[serde(default)]
    pub asset: Option<Address>,
    #[serde(default)]
    pub max_timeout_seconds: Option<u64>,
    #[serde(default = "config_defaults::default_paygate_path")]
    pub path: String,
    pub resource: ResourceInfo,
    #[serde(default)]
    pub verification: VerificationMode,
    #[serde(default)]
    pub settlement: SettlementMode,
    #[serde(default)]
    pub facilitator_url: Option<LiteralOrEnv<Url>>,
    /// Signing-domain chain id used instead of the registry's, for local verification.
    #[serde(default)]
    pub chain_id_override: Option<u64>,
}

impl PaygateConfig {
    /// The facilitator URL, required when verification or settlement is remote.
    pub fn facilitator_url(&self) -> Result<Option<&Url>, ConfigError> {
        let needs_remote = self.verification == VerificationMode::Remote
            || self.settlement == SettlementMode::Delegate;
        match (&self.facilitator_url, needs_remote) {
            (Some(url), _) => Ok(Some(url.inner())),
            (None, false) => Ok(None),
            (None, true) => Err(ConfigError::MissingFacilitatorUrl),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            networks: NetworksConfig::default(),
            custom_networks: Vec::new(),
            hooks: HooksConfig::default(),
            paygate: None,
        }
    }
}

pub mod config_defaults {
    use std::env;
    use std::net::{IpAddr, Ipv4Addr};

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    /// Returns the default port value with fallback: $PORT env var -> 8080
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// Returns the default host value with fallback: $HOST env var -> "0.0.0.0"
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_HOST)
    }

    pub fn default_eip1559() -> bool {
        true
    }

    pub fn default_receipt_timeout_secs() -> u64 {
        30
    }

    pub fn default_webhook_timeout_secs() -> u64 {
        5
    }

    pub fn default_paygate_path() -> String {
        "/paid".to_string()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid URL {0}: {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("Paygate uses a remote facilitator but facilitator_url is not set")]
    MissingFacilitatorUrl,
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Networks the facilitator settles on.
    pub fn networks(&self) -> &NetworksConfig {
        &self.networks
    }

    /// Registry entries added to the built-in ones.
    pub fn custom_networks(&self) -> &[NetworkInfo] {
        &self.custom_networks
    }

    pub fn hooks(&self) -> &HooksConfig {
        &self.hooks
    }

    pub fn paygate(&self) -> Option<&PaygateConfig> {
        self.paygate.as_ref()
    }

    /// Load configuration from CLI arguments and JSON file.
    ///
    /// The config file path is determined by:
    /// 1. `--config <path>` CLI argument
    /// 2. `CONFIG` environment variable
    /// 3. `./config.json`
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        let config_path = Path::new(&cli_args.config)
            .canonicalize()
            .map_err(|e| ConfigError::FileRead(cli_args.config, e))?;
        Self::load_from_path(config_path)
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        if let Some(paygate) = &config.paygate {
            paygate.facilitator_url()?;
        }
        Ok(config)
    }
}

/// A transparent wrapper that resolves environment variables during deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"http://localhost:8083"`
/// - Simple env var: `"$FACILITATOR_URL"`
/// - Braced env var: `"${FACILITATOR_URL}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn from_literal(value: T) -> Self {
        Self(value)
    }

    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Returns the variable name if `s` is `$VAR` or `${VAR}`.
    fn parse_env_var_syntax(s: &str) -> Option<&str> {
        if let Some(braced) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
            return Some(braced);
        }
        let var_name = s.strip_prefix('$')?;
        let starts_like_name = var_name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if starts_like_name && var_name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            Some(var_name)
        } else {
            None
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for LiteralOrEnv<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = match Self::parse_env_var_syntax(&s) {
            Some(var_name) => std::env::var(var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{}' not found (referenced as '{}')",
                    var_name, s
                ))
            })?,
            None => s,
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {}", e)))?;
        Ok(LiteralOrEnv(parsed))
    }
}

/// A validated EVM private key (32 bytes).
///
/// `Debug` output is redacted.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EvmPrivateKey(B256);

impl EvmPrivateKey {
    pub fn as_b256(&self) -> &B256 {
        &self.0
    }
}

impl std::fmt::Debug for EvmPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EvmPrivateKey(..)")
    }
}

impl FromStr for EvmPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid evm private key: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    const KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    #[test]
    fn test_parse_env_var_syntax() {
        assert_eq!(LiteralOrEnv::<String>::parse_env_var_syntax("$FOO"), Some("FOO"));
        assert_eq!(LiteralOrEnv::<String>::parse_env_var_syntax("${FOO_BAR}"), Some("FOO_BAR"));
        assert_eq!(LiteralOrEnv::<String>::parse_env_var_syntax("$"), None);
        assert_eq!(LiteralOrEnv::<String>::parse_env_var_syntax("$FOO/bar"), None);
        assert_eq!(LiteralOrEnv::<String>::parse_env_var_syntax("$10"), None);
        assert_eq!(LiteralOrEnv::<String>::parse_env_var_syntax("plain"), None);
    }

    #[test]
    fn test_literal_or_env_resolves_variable() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("X402_GATE_TEST_PAY_TO", "0x1111111111111111111111111111111111111111") };
        let value: LiteralOrEnv<Address> =
            serde_json::from_str("\"${X402_GATE_TEST_PAY_TO}\"").unwrap();
        assert_eq!(
            *value,
            address!("0x1111111111111111111111111111111111111111")
        );
        let missing = serde_json::from_str::<LiteralOrEnv<Address>>("\"$X402_GATE_TEST_MISSING\"");
        assert!(missing.unwrap_err().to_string().contains("X402_GATE_TEST_MISSING"));
    }

    #[test]
    fn test_full_config() {
        let json = format!(
            r#"{{
                "port": 3000,
                "host": "127.0.0.1",
                "networks": {{
                    "avalanche-fuji": {{ "signer": "{KEY}" }},
                    "eip155:84532": {{
                        "signer": "{KEY}",
                        "rpc": [{{ "http": "https://sepolia.base.org", "rate_limit": 10 }}],
                        "eip1559": false,
                        "receipt_timeout_secs": 60
                    }}
                }},
                "hooks": {{ "audit_log": true, "webhook_url": "https://hooks.example.com/x402" }},
                "paygate": {{
                    "price": "$0.10",
                    "network": "eip155:43113",
                    "pay_to": "0x1111111111111111111111111111111111111111",
                    "resource": {{ "name": "report", "description": "Report", "mimeType": "application/json" }},
                    "verification": "remote",
                    "settlement": {{ "mode": "delegate" }},
                    "facilitator_url": "https://facilitator.example.com"
                }}
            }}"#
        );
        let config = Config::from_json(&json).unwrap();
        assert_eq!(config.port(), 3000);
        assert_eq!(config.host().to_string(), "127.0.0.1");
        assert_eq!(config.networks().len(), 2);

        let (network, fuji) = &config.networks()[0];
        assert_eq!(network, &Network::legacy("avalanche-fuji"));
        assert!(fuji.eip1559);
        assert_eq!(fuji.receipt_timeout_secs, 30);
        assert!(fuji.rpc.is_empty());

        let (network, base) = &config.networks()[1];
        assert_eq!(network.to_string(), "eip155:84532");
        assert!(!base.eip1559);
        assert_eq!(base.rpc[0].rate_limit, Some(10));

        assert!(config.hooks().audit_log);
        assert_eq!(config.hooks().webhook_timeout_secs, 5);

        let paygate = config.paygate().unwrap();
        assert_eq!(paygate.price.to_string(), MoneyAmount::parse("0.10").unwrap().to_string());
        assert_eq!(paygate.verification, VerificationMode::Remote);
        assert_eq!(paygate.settlement, SettlementMode::Delegate);
        assert_eq!(paygate.path, "/paid");
        assert!(paygate.facilitator_url().unwrap().is_some());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert!(config.networks().is_empty());
        assert!(config.paygate().is_none());
        assert!(!config.hooks().audit_log);
    }

    #[test]
    fn test_delegate_without_facilitator_url_fails() {
        let json = r#"{
            "paygate": {
                "price": "0.10",
                "network": "avalanche-fuji",
                "pay_to": "0x1111111111111111111111111111111111111111",
                "resource": { "name": "r", "description": "d", "mimeType": "text/plain" },
                "settlement": { "mode": "delegate" }
            }
        }"#;
        assert!(matches!(
            Config::from_json(json),
            Err(ConfigError::MissingFacilitatorUrl)
        ));
    }

    #[test]
    fn test_invalid_signer_is_rejected() {
        let json = r#"{ "networks": { "avalanche-fuji": { "signer": "0x1234" } } }"#;
        assert!(matches!(Config::from_json(json), Err(ConfigError::JsonParse(_))));
    }

    #[test]
    fn test_rpc_falls_back_to_registry_default() {
        let config: NetworkConfig = serde_json::from_str(&format!(r#"{{ "signer": "{KEY}" }}"#)).unwrap();
        let registry = crate::networks::NetworkRegistry::known();
        let info = registry.by_name("avalanche-fuji").unwrap();
        let rpc = config.rpc_or_default(info).unwrap();
        assert_eq!(rpc.len(), 1);
        assert_eq!(rpc[0].http.as_str().trim_end_matches('/'), info.default_rpc.trim_end_matches('/'));
        assert!(format!("{:?}", config.signer).contains(".."));
    }
}
