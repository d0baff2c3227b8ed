//! Configuration management for the pivot reconciler
//!
//! Loads configuration from TOML files with environment variable substitution
//! and turns it into the immutable [`ChainDirectory`] injected into sessions
//! and indexer clients.

use crate::coordination::topology::Medium;
use crate::error::{ReconcilerError, ReconcilerResult};
use crate::events::IdentifierField;

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub polling: PollingConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub message_indexer: MessageIndexerConfig,
    #[serde(default)]
    pub events: EventsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

/// Poll cadence. Defaults were tuned against public indexer rate limits and
/// are not protocol guarantees.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub asset_initial_delay_secs: u64,
    pub message_initial_delay_secs: u64,
    pub asset_poll_interval_secs: u64,
    pub message_poll_interval_secs: u64,
    pub refresh_interval_secs: u64,
    pub completion_refresh_delay_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            asset_initial_delay_secs: 20,
            message_initial_delay_secs: 70,
            asset_poll_interval_secs: 90,
            message_poll_interval_secs: 120,
            refresh_interval_secs: 60,
            completion_refresh_delay_secs: 30,
            request_timeout_secs: 30,
        }
    }
}

impl PollingConfig {
    /// Bias wait before the first poll of a hop
    pub fn initial_delay(&self, medium: Medium) -> Duration {
        match medium {
            Medium::AssetBridge => Duration::from_secs(self.asset_initial_delay_secs),
            Medium::MessageBridge => Duration::from_secs(self.message_initial_delay_secs),
        }
    }

    /// Recurring poll interval for a hop
    pub fn poll_interval(&self, medium: Medium) -> Duration {
        match medium {
            Medium::AssetBridge => Duration::from_secs(self.asset_poll_interval_secs),
            Medium::MessageBridge => Duration::from_secs(self.message_poll_interval_secs),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn completion_refresh_delay(&self) -> Duration {
        Duration::from_secs(self.completion_refresh_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageIndexerConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Event signature plus where its identifier lives in the log
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EventConfig {
    pub signature: String,
    pub identifier: IdentifierField,
}

impl EventConfig {
    fn new(signature: &str, identifier: IdentifierField) -> Self {
        Self {
            signature: signature.to_string(),
            identifier,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Asset-bridge deposit on the source chain
    pub asset_deposit: EventConfig,
    /// Asset-bridge fill on the destination chain
    pub relay_filled: EventConfig,
    /// Where the fill event carries the origin chain id, if at all
    pub relay_origin_chain: Option<IdentifierField>,
    /// Message-bridge send on the source chain
    pub message_sent: EventConfig,
    /// Pool pivot initiation, identifier is the pivot nonce
    pub pivot_initiated: EventConfig,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            asset_deposit: EventConfig::new(
                "V3FundsDeposited(address,address,uint256,uint256,uint256,uint32,uint32,uint32,uint32,address,address,address,bytes)",
                IdentifierField::Topic(2),
            ),
            relay_filled: EventConfig::new(
                "FilledV3Relay(address,address,uint256,uint256,uint256,uint256,uint32,uint32,uint32,address,address,address,address,bytes,(address,bytes,uint256,uint8))",
                IdentifierField::Topic(2),
            ),
            relay_origin_chain: Some(IdentifierField::Topic(1)),
            message_sent: EventConfig::new(
                "MessageSent(bytes32,uint64,address,bytes,address,uint256)",
                IdentifierField::Topic(1),
            ),
            pivot_initiated: EventConfig::new(
                "PivotInitiated(uint256,uint256,address,uint256)",
                IdentifierField::Topic(1),
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub log_indexer_url: String,
    #[serde(default)]
    pub log_indexer_api_key: Option<String>,
    pub asset_bridge: String,
    /// Contract emitting message-bridge sends; the pool itself when absent
    #[serde(default)]
    pub message_sender: Option<String>,
    #[serde(default)]
    pub pivot_emitter: Option<String>,
    #[serde(default)]
    pub search_from_block: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Load settings from the file named by `PIVOT_RECONCILER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("PIVOT_RECONCILER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::from_path(&config_path)
    }

    /// Load settings from a specific file
    pub fn from_path(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text, substituting `${VAR}` references first
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let mut seen = HashMap::new();
        for (name, chain) in self.enabled_chains() {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.log_indexer_url.is_empty() {
                anyhow::bail!("Chain {} has no log indexer configured", name);
            }
            if let Some(other) = seen.insert(chain.chain_id, name) {
                anyhow::bail!(
                    "Chains {} and {} share chain id {}",
                    other,
                    name,
                    chain.chain_id
                );
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Contract addresses the reconciler reads on a single chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainContracts {
    pub chain_id: u64,
    pub name: String,
    pub asset_bridge: Address,
    pub message_sender: Option<Address>,
    pub pivot_emitter: Option<Address>,
    pub search_from_block: u64,
}

impl ChainContracts {
    /// Contract emitting the send events of `medium` for `pool`.
    ///
    /// Message-bridge routers do not log application sends; the sending
    /// contract does, which is the pool unless a dedicated sender is set.
    pub fn send_emitter(&self, medium: Medium, pool: Address) -> Address {
        match medium {
            Medium::AssetBridge => self.asset_bridge,
            Medium::MessageBridge => self.message_sender.unwrap_or(pool),
        }
    }
}

/// Immutable chain-id to contracts map
#[derive(Debug, Clone, Default)]
pub struct ChainDirectory {
    chains: HashMap<u64, ChainContracts>,
}

impl ChainDirectory {
    pub fn new(chains: impl IntoIterator<Item = ChainContracts>) -> Self {
        Self {
            chains: chains.into_iter().map(|c| (c.chain_id, c)).collect(),
        }
    }

    /// Build the directory from every enabled chain in `settings`
    pub fn from_settings(settings: &Settings) -> ReconcilerResult<Self> {
        let mut chains = Vec::new();
        for (name, chain) in settings.enabled_chains() {
            chains.push(ChainContracts {
                chain_id: chain.chain_id,
                name: chain.name.clone(),
                asset_bridge: parse_address(name, "asset_bridge", &chain.asset_bridge)?,
                message_sender: chain
                    .message_sender
                    .as_deref()
                    .map(|a| parse_address(name, "message_sender", a))
                    .transpose()?,
                pivot_emitter: chain
                    .pivot_emitter
                    .as_deref()
                    .map(|a| parse_address(name, "pivot_emitter", a))
                    .transpose()?,
                search_from_block: chain.search_from_block,
            });
        }
        Ok(Self::new(chains))
    }

    /// Look up a chain, failing with [`ReconcilerError::UnknownChain`]
    pub fn get(&self, chain_id: u64) -> ReconcilerResult<&ChainContracts> {
        self.chains
            .get(&chain_id)
            .ok_or(ReconcilerError::UnknownChain { chain_id })
    }
}

fn parse_address(chain: &str, field: &str, value: &str) -> ReconcilerResult<Address> {
    Address::from_str(value).map_err(|e| {
        ReconcilerError::Config(format!("Chain {} has invalid {}: {}", chain, field, e))
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
