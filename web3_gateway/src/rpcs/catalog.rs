//! Client for the optional external endpoint catalog.

use serde::Deserialize;
use tracing::trace;

use crate::config::CatalogConfig;
use crate::rpcs::endpoint::ChainId;

#[derive(Clone, Debug, Deserialize)]
pub struct CatalogRecord {
    #[serde(rename = "chainId")]
    pub chain_id: ChainId,
    pub url: String,
}

pub struct EndpointCatalog {
    config: CatalogConfig,
    client: reqwest::Client,
}

impl EndpointCatalog {
    pub fn new(config: CatalogConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Fetch the catalog's records for the given chains. An empty result is
    /// not an error; callers fall back to their static config.
    pub async fn fetch(&self, chain_ids: &[ChainId]) -> anyhow::Result<Vec<CatalogRecord>> {
        let mut query: Vec<(&str, String)> = self
            .config
            .sources
            .iter()
            .map(|source| ("sources[]", source.clone()))
            .collect();
        query.extend(chain_ids.iter().map(|id| ("chains[]", id.to_string())));

        let records: Vec<CatalogRecord> = self
            .client
            .get(&self.config.url)
            .query(&query)
            .send()
            .await?
            .json()
            .await
            .unwrap_or_default();

        trace!(count = records.len(), "fetched endpoint catalog");

        Ok(records)
    }
}
