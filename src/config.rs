//! Configuration for the facilitator server.
//!
//! The server reads a JSON config file selected by `--config` (or `CONFIG`
//! env var, default `config.json`). String values support environment
//! variable references (`$VAR` / `${VAR}`), resolved at deserialize time,
//! so private keys never live in the file itself.

use alloy_primitives::B256;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::chain::eip155::{EIP155_NAMESPACE, Eip155ChainReference};
use crate::chain::{ChainId, ChainIdPattern};

/// CLI arguments for the facilitator server.
#[derive(Parser, Debug)]
#[command(name = "aeon-x402")]
#[command(about = "x402 facilitator HTTP server")]
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
    /// API key required as `Authorization: Bearer` on protocol endpoints.
    #[serde(default, alias = "apiKey")]
    api_key: Option<LiteralOrEnv<String>>,
    #[serde(default)]
    chains: ChainsConfig,
    #[serde(default)]
    schemes: Vec<SchemeConfig>,
}

/// Configuration of one scheme: which engine, on which chains, with which
/// engine-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemeConfig {
    /// Whether this scheme is enabled (defaults to true).
    #[serde(default = "scheme_config_defaults::default_enabled")]
    pub enabled: bool,
    /// The scheme id (e.g., "v2-eip155-exact").
    pub id: String,
    /// The chain pattern this scheme applies to (e.g., "eip155:56",
    /// "eip155:*", "eip155:{56,8453}").
    pub chains: ChainIdPattern,
    /// Scheme-specific configuration (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

mod scheme_config_defaults {
    pub fn default_enabled() -> bool {
        true
    }
}

/// RPC provider configuration for a single endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcConfig {
    /// HTTP URL for the RPC endpoint.
    pub http: Url,
    /// Rate limit in requests per second (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
}

/// A transparent wrapper that resolves environment variables during
/// deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"http://localhost:8083"`
/// - Simple env var: `"$FACILITATOR_KEY"`
/// - Braced env var: `"${FACILITATOR_KEY}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    /// Get a reference to the inner value
    pub fn inner(&self) -> &T {
        &self.0
    }

    /// Consume the wrapper and return the inner value
    pub fn into_inner(self) -> T {
        self.0
    }

    /// Parse environment variable syntax from a string.
    /// Returns the variable name when the string matches `$VAR` or `${VAR}`.
    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if s.starts_with("${") && s.ends_with('}') {
            Some(s[2..s.len() - 1].to_string())
        } else if s.starts_with('$') && s.len() > 1 {
            let var_name = &s[1..];
            if var_name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                Some(var_name.to_string())
            } else {
                None
            }
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

        let value = if let Some(var_name) = Self::parse_env_var_syntax(&s) {
            std::env::var(&var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{}' not found (referenced as '{}')",
                    var_name, s
                ))
            })?
        } else {
            s
        };

        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {}", e)))?;

        Ok(LiteralOrEnv(parsed))
    }
}

impl<T> Serialize for LiteralOrEnv<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

/// A validated EVM private key (32 bytes).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EvmPrivateKey(B256);

impl EvmPrivateKey {
    /// Get the raw 32 bytes of the private key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_ref()
    }
}

impl PartialEq for EvmPrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
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

/// Signer configuration: an array of private keys (hex, 0x-prefixed) or
/// env var references.
///
/// Example JSON:
/// ```json
/// {
///   "signers": [
///     "$HOT_WALLET_KEY",
///     "0xcafe000000000000000000000000000000000000000000000000000000000001"
///   ]
/// }
/// ```
pub type Eip155SignersConfig = Vec<LiteralOrEnv<EvmPrivateKey>>;

/// Configuration for one EVM chain, keyed by its CAIP-2 id in the config map.
#[derive(Debug, Clone)]
pub struct Eip155ChainConfig {
    pub chain_reference: Eip155ChainReference,
    pub inner: Eip155ChainConfigInner,
}

impl Eip155ChainConfig {
    pub fn chain_id(&self) -> ChainId {
        self.chain_reference.into()
    }
    pub fn eip1559(&self) -> bool {
        self.inner.eip1559
    }
    pub fn receipt_timeout_secs(&self) -> u64 {
        self.inner.receipt_timeout_secs
    }
    pub fn signers(&self) -> &Eip155SignersConfig {
        &self.inner.signers
    }
    pub fn rpc(&self) -> &Vec<RpcConfig> {
        &self.inner.rpc
    }
    pub fn chain_reference(&self) -> Eip155ChainReference {
        self.chain_reference
    }
}

/// Chain settings as they appear in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eip155ChainConfigInner {
    /// Whether the chain supports EIP-1559 gas pricing.
    #[serde(default = "eip155_chain_config::default_eip1559")]
    pub eip1559: bool,
    /// Signer private keys (hex format) or env var references (required).
    pub signers: Eip155SignersConfig,
    /// RPC endpoints for this chain (required, at least one).
    pub rpc: Vec<RpcConfig>,
    /// How long to wait for a transaction receipt (optional).
    #[serde(default = "eip155_chain_config::default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
}

mod eip155_chain_config {
    pub fn default_eip1559() -> bool {
        true
    }
    pub fn default_receipt_timeout_secs() -> u64 {
        30
    }
}

/// Configured chains: a map from CAIP-2 chain id to chain settings.
#[derive(Debug, Clone, Default)]
pub struct ChainsConfig(pub Vec<Eip155ChainConfig>);

impl Deref for ChainsConfig {
    type Target = Vec<Eip155ChainConfig>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Serialize for ChainsConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;

        let chains = &self.0;
        let mut map = serializer.serialize_map(Some(chains.len()))?;
        for chain_config in chains {
            map.serialize_entry(&chain_config.chain_id(), &chain_config.inner)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ChainsConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{MapAccess, Visitor};
        use std::fmt;

        struct ChainsVisitor;

        impl<'de> Visitor<'de> for ChainsVisitor {
            type Value = ChainsConfig;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of eip155 chain identifiers to chain configurations")
            }

            fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut chains = Vec::with_capacity(access.size_hint().unwrap_or(0));

                while let Some(chain_id) = access.next_key::<ChainId>()? {
                    if chain_id.namespace() != EIP155_NAMESPACE {
                        return Err(serde::de::Error::custom(format!(
                            "Unexpected namespace: {}",
                            chain_id.namespace()
                        )));
                    }
                    let inner: Eip155ChainConfigInner = access.next_value()?;
                    let config = Eip155ChainConfig {
                        chain_reference: (&chain_id)
                            .try_into()
                            .map_err(|e| serde::de::Error::custom(format!("{}", e)))?,
                        inner,
                    };
                    chains.push(config)
                }

                Ok(ChainsConfig(chains))
            }
        }

        deserializer.deserialize_map(ChainsVisitor)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: config_defaults::default_port(),
            host: config_defaults::default_host(),
            api_key: None,
            chains: ChainsConfig::default(),
            schemes: Vec::new(),
        }
    }
}

pub mod config_defaults {
    use std::env;
    use std::net::IpAddr;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: &str = "0.0.0.0";

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
            .unwrap_or(IpAddr::V4(DEFAULT_HOST.parse().expect("valid literal")))
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    /// The port to bind.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host address to bind.
    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// The API key required on protocol endpoints, when configured.
    pub fn api_key(&self) -> Option<String> {
        self.api_key.as_ref().map(|k| k.inner().clone())
    }

    /// The scheme configuration list.
    pub fn schemes(&self) -> &Vec<SchemeConfig> {
        &self.schemes
    }

    /// The chains configuration map.
    pub fn chains(&self) -> &ChainsConfig {
        &self.chains
    }

    /// Load configuration from CLI arguments and JSON file.
    ///
    /// The config file path is taken from `--config <path>` (or the `CONFIG`
    /// env var), defaulting to `./config.json`. Values not present in the
    /// file resolve via environment variables or defaults during
    /// deserialization.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        let config_path = Path::new(&cli_args.config)
            .canonicalize()
            .map_err(|e| ConfigError::FileRead(cli_args.config, e))?;
        Self::load_from_path(config_path)
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chain_map() {
        let json = r#"{
            "port": 9090,
            "chains": {
                "eip155:56": {
                    "eip1559": false,
                    "signers": ["0xcafe000000000000000000000000000000000000000000000000000000000001"],
                    "rpc": [{ "http": "https://bsc-dataseed.bnbchain.org" }]
                }
            },
            "schemes": [
                { "id": "v2-eip155-exact", "chains": "eip155:*" }
            ]
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.port(), 9090);
        assert_eq!(config.chains().len(), 1);
        assert_eq!(config.chains()[0].chain_reference().inner(), 56);
        assert!(!config.chains()[0].eip1559());
        assert_eq!(config.schemes().len(), 1);
        assert!(config.schemes()[0].enabled);
    }

    #[test]
    fn rejects_foreign_namespace() {
        let json = r#"{
            "chains": {
                "solana:mainnet": { "signers": [], "rpc": [] }
            }
        }"#;
        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }

    #[test]
    fn resolves_env_reference() {
        // SAFETY: test-local variable name, no concurrent reader depends on it.
        unsafe { std::env::set_var("AEON_X402_TEST_KEY", "sekrit") };
        let json = r#"{ "apiKey": "$AEON_X402_TEST_KEY" }"#;
        #[derive(Deserialize)]
        struct JustKey {
            #[serde(rename = "apiKey")]
            api_key: LiteralOrEnv<String>,
        }
        let parsed: JustKey = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.api_key.inner(), "sekrit");
    }

    #[test]
    fn missing_env_reference_fails() {
        let json = r#"{ "port": 1, "apiKey": "$AEON_X402_DEFINITELY_UNSET" }"#;
        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
