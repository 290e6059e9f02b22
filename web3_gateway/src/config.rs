//! CLI flags and the toml config file.

use std::collections::HashMap;

use argh::FromArgs;
use serde::Deserialize;

use crate::quota::TenantInfo;
use crate::rpcs::endpoint::EndpointType;

#[derive(Debug, FromArgs)]
/// web3_gateway is a caching, quota-enforcing reverse proxy for Web3
/// (Ethereum or similar) JSON-RPC endpoints.
pub struct CliConfig {
    /// what port the gateway should listen on
    #[argh(option, default = "8080")]
    pub port: u16,

    /// number of worker threads. Defaults to the number of logical processors
    #[argh(option, default = "0")]
    pub workers: usize,

    /// path to a toml of chains, endpoints and tenants
    #[argh(option, default = "\"./config/development.toml\".to_string()")]
    pub config: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TopConfig {
    #[serde(default)]
    pub app: AppConfig,

    /// chains keyed by numeric id or chain code. The same chain may appear
    /// under both keys; entries are matched by `chain_id` internally.
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,

    #[serde(default)]
    pub cache: CacheConfig,

    /// shared KV for tenant quotas. Without it every request is anonymous.
    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub amqp: Option<AmqpConfig>,

    #[serde(default)]
    pub tenants: Vec<TenantInfo>,

    #[serde(default)]
    pub catalog: Option<CatalogConfig>,

    #[serde(default)]
    pub schema: Option<SchemaConfig>,

    #[serde(default = "default_refresh_secs")]
    pub endpoints_refresh_interval_secs: u64,
}

fn default_refresh_secs() -> u64 {
    30
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
}

fn default_app_name() -> String {
    "web3-gateway".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub chain_code: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default, rename = "type")]
    pub endpoint_type: EndpointType,
    #[serde(default)]
    pub weight: Option<i64>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub disable: bool,

    /// total size in bytes
    #[serde(default = "default_cache_size")]
    pub size: usize,

    /// per-method TTLs as humantime strings, e.g. `eth_chainId = "1h"`.
    /// Methods without an entry are never cached.
    #[serde(default)]
    pub expiry: HashMap<String, String>,
}

fn default_cache_size() -> usize {
    512 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disable: false,
            size: default_cache_size(),
            expiry: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AmqpConfig {
    pub url: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
}

fn default_exchange() -> String {
    "web3gateway.query.topic".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct CatalogConfig {
    pub url: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SchemaConfig {
    /// path to an OpenRPC document
    pub path: String,

    /// coerce mistyped scalar fields instead of failing validation. Leave
    /// this off unless an upstream is known to return numbers as strings.
    #[serde(default)]
    pub revise: bool,
}

/// A chain as the request path names it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chain {
    pub id: u64,
    pub code: String,
}

impl TopConfig {
    /// Resolve a path segment to a chain: by config key, then by chain
    /// code, then as a bare numeric id.
    pub fn resolve_chain(&self, segment: &str) -> Chain {
        let found = self
            .chains
            .get(segment)
            .or_else(|| self.chains.values().find(|c| c.chain_code == segment));

        if let Some(chain) = found {
            return Chain {
                id: chain.chain_id,
                code: chain.chain_code.clone(),
            };
        }

        Chain {
            id: segment.parse().unwrap_or(0),
            code: String::new(),
        }
    }

    pub fn chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}
