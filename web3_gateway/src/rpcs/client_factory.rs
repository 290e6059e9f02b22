//! URL → upstream client cache.
//!
//! A bounded LRU keyed by URL. Eviction closes the client; `Arc` refcounts
//! keep an evicted client alive until its in-flight calls finish.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::jsonrpc_schema::JsonRpcSchema;
use crate::rpcs::dispatcher::{ClientProvider, UpstreamClient};
use crate::rpcs::endpoint::Endpoint;
use crate::rpcs::http_client::HttpUpstream;
use crate::rpcs::ws_client::WsUpstream;

pub const DEFAULT_CLIENTS_SIZE: usize = 64;

const WS_CONNECT_RETRIES: usize = 3;

pub struct ClientFactoryConfig {
    pub schema: Option<Arc<JsonRpcSchema>>,
    pub clients_size: usize,
}

pub struct ClientFactory {
    cache: Mutex<LruCache<String, Arc<dyn UpstreamClient>>>,
    config: ClientFactoryConfig,
}

impl ClientFactory {
    pub fn new(config: ClientFactoryConfig) -> Self {
        let capacity = NonZeroUsize::new(config.clients_size.max(1)).expect("capacity is nonzero");

        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            config,
        }
    }

    /// Close and drop every cached client.
    pub fn clear(&self) {
        let mut cache = self.cache.lock();
        for (_, client) in cache.iter() {
            client.close();
        }
        cache.clear();
    }

    async fn build(&self, endpoint: &Arc<Endpoint>) -> Option<Arc<dyn UpstreamClient>> {
        if endpoint.is_ws() {
            for _ in 0..WS_CONNECT_RETRIES {
                match WsUpstream::connect(endpoint.clone(), self.config.schema.clone()).await {
                    Ok(client) => return Some(Arc::new(client)),
                    Err(err) => warn!(%err, %endpoint, "websocket connect failed"),
                }
            }
            None
        } else {
            match HttpUpstream::new(endpoint.clone(), self.config.schema.clone()) {
                Ok(client) => Some(Arc::new(client)),
                Err(err) => {
                    error!(?err, %endpoint, "error creating client");
                    None
                }
            }
        }
    }
}

#[async_trait]
impl ClientProvider for ClientFactory {
    async fn get(&self, endpoint: &Arc<Endpoint>) -> Option<Arc<dyn UpstreamClient>> {
        let url = endpoint.url().to_string();

        if let Some(client) = self.cache.lock().get(&url) {
            return Some(client.clone());
        }

        // two callers can race here and build twice; the loser's client is
        // closed when the push returns it
        let client = self.build(endpoint).await?;

        if let Some((_, evicted)) = self.cache.lock().push(url, client.clone()) {
            if !Arc::ptr_eq(&evicted, &client) {
                evicted.close();
            }
        }

        Some(client)
    }
}
