//! Method-scoped TTL cache of JSON-RPC results.
//!
//! Keys are `base36(chain):method:digest(params)`. TTLs come from config per
//! method; requests addressing a floating block tag are never cached.
//! Oversized values are deflate-compressed off the request path.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use moka::sync::SegmentedCache;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::digest::{base36, short};
use crate::jsonrpc::JsonRpcRequest;
use crate::rpcs::endpoint::{ChainId, Endpoint};
use crate::stats::now_millis;

/// Values larger than this are compressed, and dropped if they stay larger.
pub const MAX_ENTRY_SIZE: usize = 512 * 1024;

/// Entries older than this are evicted regardless of their method TTL.
const LIFE_WINDOW: Duration = Duration::from_secs(15 * 60);

const BLOCK_TAGS: &[&str] = &["earliest", "latest", "pending"];

#[derive(Clone)]
enum CacheValue {
    Plain(Arc<Value>, u32),
    Compressed(Arc<Vec<u8>>),
}

#[derive(Clone)]
pub struct CacheEntry {
    value: CacheValue,
    timestamp_ms: i64,
}

impl CacheEntry {
    fn weight(&self) -> u32 {
        match &self.value {
            CacheValue::Plain(_, size) => *size,
            CacheValue::Compressed(bytes) => bytes.len() as u32,
        }
    }
}

pub struct ResponseCache {
    entries: SegmentedCache<String, CacheEntry>,
    expiry: hashbrown::HashMap<String, Duration>,
}

/// Smallest power of two that covers every chain, capped so each segment
/// keeps at least 8 MiB.
fn segment_count(chains: usize, total_size: usize) -> usize {
    let by_size = (total_size / (8 * 1024 * 1024)).max(1);

    let mut segments = chains.max(1).next_power_of_two();
    if segments > by_size {
        segments = by_size.next_power_of_two();
        if segments > by_size {
            segments /= 2;
        }
    }

    segments.max(1)
}

impl ResponseCache {
    pub fn new(config: &CacheConfig, chain_count: usize) -> Self {
        let mut expiry = hashbrown::HashMap::with_capacity(config.expiry.len());
        for (method, ttl) in &config.expiry {
            match humantime::parse_duration(ttl) {
                Ok(ttl) => {
                    expiry.insert(method.clone(), ttl);
                }
                Err(err) => warn!(?err, method, ttl, "ignoring bad cache expiry"),
            }
        }

        let entries = SegmentedCache::builder(segment_count(chain_count, config.size))
            .max_capacity(config.size as u64)
            .weigher(|_key, entry: &CacheEntry| entry.weight())
            .time_to_live(LIFE_WINDOW)
            .build();

        Self { entries, expiry }
    }

    /// The TTL for this sub-call, or `None` when it must not be cached:
    /// unconfigured method, floating block tag, or missing positional arg.
    pub fn cacheable(&self, request: &JsonRpcRequest) -> Option<Duration> {
        let ttl = *self.expiry.get(request.method())?;

        let ok = match request.method() {
            "eth_getBlockByNumber"
            | "eth_getTransactionByBlockNumberAndIndex"
            | "eth_getUncleByBlockNumberAndIndex"
            | "eth_getUncleCountByBlockNumber"
            | "eth_getBlockTransactionCountByNumber" => position_is_concrete(request, 0),
            "eth_getTransactionCount" => position_is_concrete(request, 1),
            "eth_getLogs" => logs_are_concrete(request),
            _ => true,
        };

        ok.then_some(ttl)
    }

    pub fn get(&self, key: &str, ttl: Duration) -> Option<Value> {
        let entry = self.entries.get(key)?;

        if now_millis() > entry.timestamp_ms + ttl.as_millis() as i64 {
            // expired. delete off the request path and report a miss
            let entries = self.entries.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                entries.invalidate(&key);
            });
            return None;
        }

        match &entry.value {
            CacheValue::Plain(value, _) => Some((**value).clone()),
            CacheValue::Compressed(bytes) => match decompress(bytes) {
                Ok(data) => serde_json::from_slice(&data)
                    .map_err(|err| warn!(?err, "failed to unmarshal cache"))
                    .ok(),
                Err(err) => {
                    warn!(?err, "failed to decompress cache");
                    None
                }
            },
        }
    }

    pub fn store(&self, key: String, value: &Value) {
        let Ok(data) = serde_json::to_vec(value) else {
            return;
        };
        let timestamp_ms = now_millis();

        if data.len() <= MAX_ENTRY_SIZE {
            self.entries.insert(
                key,
                CacheEntry {
                    value: CacheValue::Plain(Arc::new(value.clone()), data.len() as u32),
                    timestamp_ms,
                },
            );
            return;
        }

        // large values compress off the request path
        let entries = self.entries.clone();
        tokio::spawn(async move {
            let compressed = match tokio::task::spawn_blocking(move || compress(&data)).await {
                Ok(Ok(compressed)) => compressed,
                Ok(Err(err)) => {
                    warn!(?err, "failed to compress");
                    return;
                }
                Err(err) => {
                    warn!(?err, "compression task failed");
                    return;
                }
            };

            // still too big after compression, skip the cache entirely
            if compressed.len() > MAX_ENTRY_SIZE {
                debug!(size = compressed.len(), "cache entry too large");
                return;
            }

            entries.insert(
                key,
                CacheEntry {
                    value: CacheValue::Compressed(Arc::new(compressed)),
                    timestamp_ms,
                },
            );
        });
    }

    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        self.entries.get(key).is_some()
    }
}

pub fn cache_key(chain_id: ChainId, request: &JsonRpcRequest) -> String {
    let params = request
        .raw()
        .get("params")
        .cloned()
        .unwrap_or_else(|| Value::Array(vec![]));

    let digest = serde_json::to_string(&params)
        .map(|params| short(&params))
        .unwrap_or_default();

    format!("{}:{}:{}", base36(chain_id), request.method(), digest)
}

/// A cached `eth_blockNumber` answer may lag the chain; serve whichever is
/// higher, the cached value or the best height any endpoint has seen.
pub fn merge_block_number(cached: Value, endpoints: &[Arc<Endpoint>]) -> Value {
    let height = endpoints
        .iter()
        .map(|e| e.block_number())
        .max()
        .unwrap_or(0);
    if height == 0 {
        return cached;
    }

    let cached_height = cached
        .as_str()
        .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok());

    match cached_height {
        Some(n) if n >= height => cached,
        _ => Value::String(format!("0x{:x}", height)),
    }
}

fn position_is_concrete(request: &JsonRpcRequest, index: usize) -> bool {
    match request.param(index) {
        Some(value) => !is_block_tag(value),
        // missing required positional arg
        None => false,
    }
}

fn logs_are_concrete(request: &JsonRpcRequest) -> bool {
    for param in request.params() {
        if let Value::Object(filter) = param {
            let floating = [filter.get("fromBlock"), filter.get("toBlock")]
                .into_iter()
                .flatten()
                .any(is_block_tag);
            if floating {
                return false;
            }
        }
    }

    true
}

fn is_block_tag(value: &Value) -> bool {
    value
        .as_str()
        .map(|s| BLOCK_TAGS.contains(&s))
        .unwrap_or(false)
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpcs::endpoint::EndpointType;
    use moka::sync::ConcurrentCacheExt;
    use serde_json::json;
    use url::Url;

    fn cache(pairs: &[(&str, &str)]) -> ResponseCache {
        let config = CacheConfig {
            disable: false,
            size: 64 * 1024 * 1024,
            expiry: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        ResponseCache::new(&config, 4)
    }

    fn request(value: Value) -> JsonRpcRequest {
        match value {
            Value::Object(map) => JsonRpcRequest::new(map),
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn segment_count_follows_chains_and_size() {
        // power of two >= chains
        assert_eq!(segment_count(3, 512 * 1024 * 1024), 4);
        assert_eq!(segment_count(4, 512 * 1024 * 1024), 4);
        assert_eq!(segment_count(0, 512 * 1024 * 1024), 1);

        // but capped by 8 MiB per segment
        assert_eq!(segment_count(64, 16 * 1024 * 1024), 2);
        assert_eq!(segment_count(64, 8 * 1024 * 1024), 1);
    }

    #[test]
    fn unconfigured_methods_are_not_cacheable() {
        let cache = cache(&[("eth_chainId", "1h")]);

        assert!(cache
            .cacheable(&request(json!({"method":"eth_chainId","params":[]})))
            .is_some());
        assert!(cache
            .cacheable(&request(json!({"method":"eth_blockNumber","params":[]})))
            .is_none());
    }

    #[test]
    fn block_tags_are_excluded_in_their_positions() {
        let cache = cache(&[
            ("eth_getBlockByNumber", "30s"),
            ("eth_getTransactionCount", "30s"),
            ("eth_getLogs", "30s"),
        ]);

        for tag in ["earliest", "latest", "pending"] {
            assert!(cache
                .cacheable(&request(
                    json!({"method":"eth_getBlockByNumber","params":[tag, false]})
                ))
                .is_none());
        }
        assert!(cache
            .cacheable(&request(
                json!({"method":"eth_getBlockByNumber","params":["0x10", false]})
            ))
            .is_some());

        // the tag sits in the second position here
        assert!(cache
            .cacheable(&request(
                json!({"method":"eth_getTransactionCount","params":["0xabc", "latest"]})
            ))
            .is_none());
        assert!(cache
            .cacheable(&request(
                json!({"method":"eth_getTransactionCount","params":["0xabc", "0x10"]})
            ))
            .is_some());

        // and inside the filter object for logs
        assert!(cache
            .cacheable(&request(
                json!({"method":"eth_getLogs","params":[{"fromBlock":"0x1","toBlock":"latest"}]})
            ))
            .is_none());
        assert!(cache
            .cacheable(&request(
                json!({"method":"eth_getLogs","params":[{"fromBlock":"0x1","toBlock":"0x2"}]})
            ))
            .is_some());
    }

    #[test]
    fn missing_positional_args_are_not_cacheable() {
        let cache = cache(&[("eth_getBlockByNumber", "30s"), ("eth_getTransactionCount", "30s")]);

        assert!(cache
            .cacheable(&request(json!({"method":"eth_getBlockByNumber","params":[]})))
            .is_none());
        assert!(cache
            .cacheable(&request(
                json!({"method":"eth_getTransactionCount","params":["0xabc"]})
            ))
            .is_none());
    }

    #[test_log::test(tokio::test)]
    async fn store_and_get_round_trip() {
        let cache = cache(&[("eth_chainId", "1h")]);
        let req = request(json!({"method":"eth_chainId","params":[]}));
        let key = cache_key(1, &req);

        assert!(cache.get(&key, Duration::from_secs(3600)).is_none());

        cache.store(key.clone(), &json!("0x1"));
        cache.entries.sync();

        assert_eq!(
            cache.get(&key, Duration::from_secs(3600)),
            Some(json!("0x1"))
        );
    }

    #[test_log::test(tokio::test)]
    async fn expired_entries_miss() {
        let cache = cache(&[("eth_chainId", "1h")]);
        let key = "1:eth_chainId:x".to_string();

        cache.store(key.clone(), &json!("0x1"));
        cache.entries.sync();

        // a zero TTL expires as soon as the clock moves
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get(&key, Duration::ZERO).is_none());
    }

    #[test_log::test(tokio::test)]
    async fn large_values_are_compressed() {
        let cache = cache(&[("eth_getLogs", "30s")]);
        let key = "1:eth_getLogs:x".to_string();

        // compressible content well over the entry limit
        let value = json!("a".repeat(MAX_ENTRY_SIZE + 1024));
        cache.store(key.clone(), &value);

        // compression happens off the calling task
        for _ in 0..50 {
            cache.entries.sync();
            if cache.contains(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let entry = cache.entries.get(&key).expect("compressed entry landed");
        assert!(matches!(entry.value, CacheValue::Compressed(_)));
        assert!((entry.weight() as usize) < MAX_ENTRY_SIZE);

        assert_eq!(cache.get(&key, Duration::from_secs(30)), Some(value));
    }

    #[test]
    fn cache_keys_separate_chains_and_params() {
        let a = request(json!({"method":"eth_getBlockByNumber","params":["0x1", false]}));
        let b = request(json!({"method":"eth_getBlockByNumber","params":["0x2", false]}));

        assert_ne!(cache_key(1, &a), cache_key(1, &b));
        assert_ne!(cache_key(1, &a), cache_key(2, &a));
        assert_eq!(cache_key(1, &a), cache_key(1, &a));
    }

    #[test]
    fn block_number_merge_is_monotone() {
        let endpoint = Arc::new(Endpoint::new(
            Url::parse("https://rpc.example.com/").unwrap(),
            1,
            "mainnet".to_string(),
            EndpointType::Default,
            None,
            None,
        ));
        endpoint.observe_block_number(0x20);
        let endpoints = vec![endpoint];

        // stale cache value is replaced by the endpoint height
        assert_eq!(
            merge_block_number(json!("0x10"), &endpoints),
            json!("0x20")
        );
        // fresher cache value wins
        assert_eq!(
            merge_block_number(json!("0x30"), &endpoints),
            json!("0x30")
        );
        // no known height leaves the value alone
        assert_eq!(merge_block_number(json!("0x10"), &[]), json!("0x10"));
    }
}
