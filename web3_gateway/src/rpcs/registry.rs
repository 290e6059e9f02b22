//! Chain → endpoint index.
//!
//! Chains are materialized lazily from static config plus the optional
//! external catalog. Records for the same (chain, url) merge, later sources
//! overriding whatever attributes they carry.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::config::{EndpointConfig, TopConfig};
use crate::rpcs::catalog::EndpointCatalog;
use crate::rpcs::endpoint::{ChainId, Endpoint};

#[derive(Default)]
struct Index {
    chains: HashMap<ChainId, Vec<String>>,
    endpoints: HashMap<String, Arc<Endpoint>>,
}

pub struct EndpointRegistry {
    index: RwLock<Index>,
    config: Arc<TopConfig>,
    catalog: Option<EndpointCatalog>,
}

impl EndpointRegistry {
    pub fn new(config: Arc<TopConfig>, catalog: Option<EndpointCatalog>) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            config,
            catalog,
        }
    }

    /// Start the periodic refresh that folds each endpoint's rolling window
    /// into its p95 attributes.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            // the first tick fires immediately and would drain empty windows
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.refresh();
            }
        });
    }

    fn refresh(&self) {
        let endpoints: Vec<Arc<Endpoint>> =
            self.index.read().endpoints.values().cloned().collect();

        for endpoint in endpoints {
            if let Some(window) = endpoint.drain_window() {
                let healthy = window.p95_status.map(|q| (200..300).contains(&q));
                endpoint.apply_p95(window.p95_duration_ms, healthy);
                debug!(
                    %endpoint,
                    p95_duration = ?window.p95_duration_ms,
                    p95_status = ?window.p95_status,
                    "refreshed endpoint"
                );
            }
        }
    }

    pub fn chains(&self) -> Vec<ChainId> {
        self.index.read().chains.keys().copied().collect()
    }

    pub fn get(&self, url: &str) -> Option<Arc<Endpoint>> {
        self.index.read().endpoints.get(url).cloned()
    }

    fn lookup(&self, chain_id: ChainId) -> Option<Vec<Arc<Endpoint>>> {
        let index = self.index.read();
        let urls = index.chains.get(&chain_id)?;
        if urls.is_empty() {
            return None;
        }

        Some(
            urls.iter()
                .filter_map(|url| index.endpoints.get(url).cloned())
                .collect(),
        )
    }

    /// The chain's endpoint set, loading it on first access.
    pub async fn get_all(&self, chain_id: ChainId) -> Option<Vec<Arc<Endpoint>>> {
        if let Some(endpoints) = self.lookup(chain_id) {
            return Some(endpoints);
        }

        self.load(chain_id).await;

        self.lookup(chain_id)
    }

    /// Drop every chain set. The next access reloads from config + catalog.
    pub fn purge(&self) {
        let mut index = self.index.write();
        index.chains.clear();
        index.endpoints.clear();
    }

    async fn load(&self, chain_id: ChainId) {
        let mut chain_code = String::new();

        if let Some(chain) = self.config.chain_by_id(chain_id) {
            chain_code = chain.chain_code.clone();
            for endpoint in &chain.endpoints {
                self.put_config(chain_id, &chain_code, endpoint);
            }
        }

        let Some(catalog) = &self.catalog else { return };

        match catalog.fetch(&[chain_id]).await {
            Ok(records) => {
                for record in records {
                    if record.chain_id != chain_id {
                        continue;
                    }
                    self.put(chain_id, &chain_code, &record.url, None, None, None);
                }
            }
            Err(err) => warn!(?err, chain_id, "failed to fetch endpoint catalog"),
        }
    }

    fn put_config(&self, chain_id: ChainId, chain_code: &str, config: &EndpointConfig) {
        self.put(
            chain_id,
            chain_code,
            &config.url,
            Some(config.endpoint_type),
            config.weight,
            config
                .headers
                .as_ref()
                .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
    }

    /// Insert or merge one endpoint record.
    fn put(
        &self,
        chain_id: ChainId,
        chain_code: &str,
        url: &str,
        endpoint_type: Option<crate::rpcs::endpoint::EndpointType>,
        weight: Option<i64>,
        headers: Option<HashMap<String, String>>,
    ) {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(?err, url, "skipping unparseable endpoint url");
                return;
            }
        };
        let key = parsed.to_string();

        let mut index = self.index.write();

        if let Some(existing) = index.endpoints.get(&key) {
            // an endpoint lives in exactly one chain list
            if existing.chain_id() != chain_id {
                return;
            }
            existing.merge_config(endpoint_type, weight, headers);
            return;
        }

        let endpoint = Arc::new(Endpoint::new(
            parsed,
            chain_id,
            chain_code.to_string(),
            endpoint_type.unwrap_or_default(),
            weight,
            headers,
        ));

        index.endpoints.insert(key.clone(), endpoint);
        index.chains.entry(chain_id).or_default().push(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::rpcs::endpoint::EndpointType;

    fn config() -> Arc<TopConfig> {
        let mut config = TopConfig::default();
        config.chains.insert(
            "1".to_string(),
            ChainConfig {
                chain_id: 1,
                chain_code: "mainnet".to_string(),
                endpoints: vec![
                    EndpointConfig {
                        url: "https://a.example.com/".to_string(),
                        endpoint_type: EndpointType::Fullnode,
                        weight: Some(5),
                        headers: None,
                    },
                    EndpointConfig {
                        url: "https://b.example.com/".to_string(),
                        endpoint_type: EndpointType::Activenode,
                        weight: None,
                        headers: None,
                    },
                ],
            },
        );
        Arc::new(config)
    }

    #[test_log::test(tokio::test)]
    async fn lazy_loads_from_config() {
        let registry = EndpointRegistry::new(config(), None);

        assert!(registry.chains().is_empty());

        let endpoints = registry.get_all(1).await.unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(registry.chains(), vec![1]);

        assert!(registry.get_all(9999).await.is_none());
    }

    #[test_log::test(tokio::test)]
    async fn merge_overrides_present_fields_only() {
        let registry = EndpointRegistry::new(config(), None);
        registry.get_all(1).await.unwrap();

        // a later record for the same (chain, url) with only a weight
        registry.put(1, "mainnet", "https://a.example.com/", None, Some(9), None);

        let endpoint = registry.get("https://a.example.com/").unwrap();
        assert_eq!(endpoint.weight(), 9);
        assert_eq!(endpoint.endpoint_type(), EndpointType::Fullnode);

        // the same url under a different chain is ignored
        registry.put(2, "other", "https://a.example.com/", None, Some(1), None);
        assert_eq!(registry.get("https://a.example.com/").unwrap().chain_id(), 1);
        assert_eq!(endpoint.weight(), 9);
    }

    #[test_log::test(tokio::test)]
    async fn purge_drops_all_chains() {
        let registry = EndpointRegistry::new(config(), None);
        registry.get_all(1).await.unwrap();

        registry.purge();

        assert!(registry.chains().is_empty());
        // and reloads on the next access
        assert_eq!(registry.get_all(1).await.unwrap().len(), 2);
    }
}
