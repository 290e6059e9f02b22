//! Wires the engine together and runs one inbound call end to end:
//! parse, validate, cache fan-in, select, dispatch, cache fan-out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tracing::{error, info};

use crate::config::TopConfig;
use crate::errors::{GatewayError, GatewayResult, QueryStatus};
use crate::jsonrpc::{
    parse_payload, JsonRpcForwardedResponse, JsonRpcPayload, JsonRpcRequest, SealedRequest,
};
use crate::jsonrpc_schema::JsonRpcSchema;
use crate::quota::{ConfigTenantStore, TenantQuota};
use crate::reqctx::RequestContext;
use crate::response_cache::{cache_key, merge_block_number, ResponseCache};
use crate::rpcs::catalog::EndpointCatalog;
use crate::rpcs::client_factory::{ClientFactory, ClientFactoryConfig, DEFAULT_CLIENTS_SIZE};
use crate::rpcs::dispatcher::{ClientProvider, Dispatcher};
use crate::rpcs::endpoint::Endpoint;
use crate::rpcs::registry::EndpointRegistry;
use crate::rpcs::selector::select;
use crate::digest::short;
use crate::stats::{AuditPublisher, QueryProfile, TOTAL_CACHES};

pub struct Web3Gateway {
    pub config: Arc<TopConfig>,
    pub registry: Arc<EndpointRegistry>,
    pub quota: Option<Arc<TenantQuota>>,
    pub audit: Option<AuditPublisher>,
    dispatcher: Dispatcher,
    response_cache: Option<ResponseCache>,
    schema: Option<Arc<JsonRpcSchema>>,
}

impl Web3Gateway {
    pub async fn spawn(config: TopConfig) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);

        let schema = match &config.schema {
            Some(schema_config) => {
                let document = tokio::fs::read(&schema_config.path)
                    .await
                    .with_context(|| format!("reading schema at {}", schema_config.path))?;
                Some(Arc::new(JsonRpcSchema::new(&document, schema_config.revise)?))
            }
            None => None,
        };

        let catalog = config.catalog.clone().map(EndpointCatalog::new);
        let registry = Arc::new(EndpointRegistry::new(config.clone(), catalog));
        registry.clone().spawn_refresh(Duration::from_secs(
            config.endpoints_refresh_interval_secs.max(1),
        ));

        let factory: Arc<dyn ClientProvider> = Arc::new(ClientFactory::new(ClientFactoryConfig {
            schema: schema.clone(),
            clients_size: DEFAULT_CLIENTS_SIZE,
        }));

        let response_cache = if config.cache.disable || config.cache.expiry.is_empty() {
            info!("result cache disabled");
            None
        } else {
            info!(size_mb = config.cache.size / 1024 / 1024, "result cache");
            Some(ResponseCache::new(
                &config.cache,
                config.chains.len().max(1),
            ))
        };

        let quota = match &config.redis_url {
            Some(redis_url) => {
                let store = Arc::new(redis_quota::RedisQuotaStore::new(redis_url)?);
                let tenants = Arc::new(ConfigTenantStore::new(config.tenants.clone()));
                Some(TenantQuota::new(store, tenants))
            }
            None => {
                info!("no redis, tenant quotas disabled");
                None
            }
        };

        let audit = config.amqp.clone().map(AuditPublisher::spawn);

        Ok(Arc::new(Self {
            config,
            registry,
            quota,
            audit,
            dispatcher: Dispatcher::new(factory),
            response_cache,
            schema,
        }))
    }

    /// Test constructor: no background services, canned clients.
    #[cfg(test)]
    pub(crate) fn for_tests(
        config: Arc<TopConfig>,
        clients: Arc<dyn ClientProvider>,
        response_cache: Option<ResponseCache>,
    ) -> Self {
        Self {
            registry: Arc::new(EndpointRegistry::new(config.clone(), None)),
            config,
            quota: None,
            audit: None,
            dispatcher: Dispatcher::new(clients),
            response_cache,
            schema: None,
        }
    }

    /// Run the parsed body against the chain's endpoints. Returns the
    /// marshalled response body; `profile.status` reflects whether any
    /// result carried a JSON-RPC error.
    pub async fn proxy(
        &self,
        rc: &RequestContext,
        endpoints: &[Arc<Endpoint>],
        app_name: &str,
        profile: &mut QueryProfile,
    ) -> GatewayResult<Vec<u8>> {
        let payload = parse_payload(&rc.body)
            .map_err(|err| GatewayError::BadRequest(err.to_string().into()))?;

        let (calls, is_batch) = match payload {
            JsonRpcPayload::Single(call) => (vec![call], false),
            JsonRpcPayload::Batch(calls) => (calls, true),
        };

        if calls.is_empty() {
            profile.status = QueryStatus::Success;
            return Ok(b"[]".to_vec());
        }

        let mut seen = HashSet::with_capacity(calls.len());
        for call in &calls {
            if let Some(schema) = &self.schema {
                schema
                    .validate_request(call.method(), call.raw())
                    .map_err(|msg| GatewayError::BadRequest(msg.into()))?;
            }
            // correlation needs unique ids within a batch
            if !call.is_notify() && !seen.insert(call.correlation_id()) {
                return Err(GatewayError::BadRequest(
                    "duplicate request ids in batch".into(),
                ));
            }
        }

        let use_cache = rc.options.use_cache && self.response_cache.is_some();
        if !use_cache {
            let results = self.call(rc, endpoints, &calls, profile).await?;
            profile.status = batch_status(&results);
            return marshal(&results, is_batch);
        }
        let cache = self.response_cache.as_ref().expect("checked above");

        let mut results: Vec<Option<JsonRpcForwardedResponse>> = vec![None; calls.len()];
        let mut misses: Vec<JsonRpcRequest> = vec![];
        let mut mapping: HashMap<String, Vec<usize>> = HashMap::new();

        for (i, call) in calls.iter().enumerate() {
            let mut hit = None;
            if let Some(ttl) = cache.cacheable(call) {
                if let Some(mut value) = cache.get(&cache_key(rc.chain.id, call), ttl) {
                    if call.method() == "eth_blockNumber" {
                        value = merge_block_number(value, endpoints);
                    }
                    hit = Some(value);
                }
            }

            match hit {
                Some(value) => {
                    results[i] = Some(call.make_result(Some(value), None));
                    TOTAL_CACHES
                        .with_label_values(&[rc.chain.code.as_str(), app_name, call.method(), "mem"])
                        .inc();
                }
                None => {
                    TOTAL_CACHES
                        .with_label_values(&[
                            rc.chain.code.as_str(),
                            app_name,
                            call.method(),
                            "miss",
                        ])
                        .inc();
                    mapping
                        .entry(raw_id_key(call.raw_id()))
                        .or_default()
                        .push(i);
                    misses.push(call.clone());
                }
            }
        }

        if misses.is_empty() {
            let results: Vec<JsonRpcForwardedResponse> =
                results.into_iter().flatten().collect();
            profile.status = batch_status(&results);
            return marshal(&results, is_batch);
        }

        let dispatched = self.call(rc, endpoints, &misses, profile).await?;

        for result in dispatched {
            let Some(indexes) = mapping.get(&raw_id_key(Some(&result.id))) else {
                continue;
            };
            for &i in indexes {
                if results[i].is_none() {
                    results[i] = Some(result.clone());
                }
            }
        }

        let results: Vec<JsonRpcForwardedResponse> = results
            .into_iter()
            .map(|r| r.unwrap_or_default())
            .collect();
        profile.status = batch_status(&results);
        marshal(&results, is_batch)
    }

    /// Select, seal with the correlation prefix, dispatch, and bind the
    /// upstream batch back onto the original calls.
    async fn call(
        &self,
        rc: &RequestContext,
        endpoints: &[Arc<Endpoint>],
        calls: &[JsonRpcRequest],
        profile: &mut QueryProfile,
    ) -> GatewayResult<Vec<JsonRpcForwardedResponse>> {
        let refs: Vec<&JsonRpcRequest> = calls.iter().collect();
        let selected = select(&rc.options, endpoints, &refs);
        if selected.is_empty() {
            error!(chain = %rc.chain.code, "no available endpoints");
            return Err(GatewayError::Internal("No available endpoints".into()));
        }

        let prefix = short(&rc.req_id);
        let sealed: Vec<SealedRequest> = calls
            .iter()
            .map(|call| {
                let mut sealed = call.seal();
                sealed.id = format!("{}{}", prefix, sealed.id);
                sealed
            })
            .collect();

        let upstream = self
            .dispatcher
            .request(rc, &selected, &sealed, profile)
            .await?;

        // bind the upstream batch back onto the original calls, restoring
        // the client's positional order; unmatched responses pass through
        // behind the matched ones with whatever id the upstream used
        let mut positional: Vec<Option<JsonRpcForwardedResponse>> = vec![None; calls.len()];
        let mut passthrough = Vec::new();

        for response in &upstream {
            let position = sealed
                .iter()
                .position(|s| s.id == response.correlation_id());

            match position {
                Some(j) if positional[j].is_none() => {
                    positional[j] = Some(
                        calls[j].make_result(response.result().cloned(), response.error().cloned()),
                    );

                    // write-through whenever the cache is configured; read
                    // opt-out doesn't stop fresher data from landing
                    if let Some(cache) = &self.response_cache {
                        if !response.is_error() {
                            if let (Some(result), Some(_)) =
                                (response.result(), cache.cacheable(&calls[j]))
                            {
                                cache.store(cache_key(rc.chain.id, &calls[j]), result);
                            }
                        }
                    }
                }
                _ => passthrough.push(JsonRpcForwardedResponse::from_upstream(response)),
            }
        }

        let mut results: Vec<JsonRpcForwardedResponse> = Vec::with_capacity(upstream.len());
        results.extend(positional.into_iter().flatten());
        results.extend(passthrough);

        Ok(results)
    }
}

fn batch_status(results: &[JsonRpcForwardedResponse]) -> QueryStatus {
    if results.iter().any(|r| r.error.is_some()) {
        QueryStatus::Fail
    } else {
        QueryStatus::Success
    }
}

/// Cache-merge lookup form of an id: bare text for strings, JSON text for
/// everything else.
fn raw_id_key(id: Option<&Value>) -> String {
    match id {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

fn marshal(results: &[JsonRpcForwardedResponse], is_batch: bool) -> GatewayResult<Vec<u8>> {
    // a single call echoes a single object; so does a one-element batch the
    // server rejected with a lone error
    if !is_batch || (results.len() == 1 && results[0].error.is_some()) {
        match results.first() {
            Some(result) => Ok(serde_json::to_vec(result)?),
            None => Ok(serde_json::to_vec(&JsonRpcForwardedResponse::default())?),
        }
    } else {
        Ok(serde_json::to_vec(&results)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::config::EndpointConfig;
    use crate::errors::GatewayResult;
    use crate::jsonrpc::{parse_upstream, UpstreamResponse};
    use crate::reqctx::CallOptions;
    use crate::rpcs::dispatcher::UpstreamClient;
    use crate::rpcs::endpoint::EndpointType;
    use crate::stats::ResponseProfile;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use http::HeaderMap;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Echoes a scripted result for every sub-request, optionally shuffled,
    /// and counts calls.
    struct EchoClient {
        calls: Arc<Mutex<Vec<usize>>>,
        result: Value,
        reverse: bool,
    }

    #[async_trait]
    impl UpstreamClient for EchoClient {
        async fn call(
            &self,
            data: &[SealedRequest],
            profile: &mut ResponseProfile,
        ) -> GatewayResult<Vec<UpstreamResponse>> {
            self.calls.lock().push(data.len());
            profile.status = 200;
            profile.duration = 1;

            let mut body: Vec<Value> = data
                .iter()
                .map(|d| json!({"jsonrpc": "2.0", "id": d.id, "result": self.result}))
                .collect();
            if self.reverse {
                body.reverse();
            }

            let (results, _) = parse_upstream(json!(body).to_string().as_bytes()).unwrap();
            Ok(results)
        }

        fn close(&self) {}
    }

    struct EchoProvider {
        client: Arc<EchoClient>,
    }

    #[async_trait]
    impl ClientProvider for EchoProvider {
        async fn get(&self, _endpoint: &Arc<Endpoint>) -> Option<Arc<dyn UpstreamClient>> {
            Some(self.client.clone() as Arc<dyn UpstreamClient>)
        }
    }

    struct Harness {
        gateway: Web3Gateway,
        endpoints: Vec<Arc<Endpoint>>,
        calls: Arc<Mutex<Vec<usize>>>,
    }

    fn config() -> Arc<TopConfig> {
        let mut config = TopConfig::default();
        config.cache.expiry = [("eth_chainId".to_string(), "1h".to_string())]
            .into_iter()
            .collect();
        config.chains.insert(
            "1".to_string(),
            ChainConfig {
                chain_id: 1,
                chain_code: "mainnet".to_string(),
                endpoints: vec![EndpointConfig {
                    url: "https://rpc.example.com/".to_string(),
                    endpoint_type: EndpointType::Fullnode,
                    weight: None,
                    headers: None,
                }],
            },
        );
        Arc::new(config)
    }

    async fn harness(result: Value, reverse: bool, cached: bool) -> Harness {
        let calls = Arc::new(Mutex::new(vec![]));
        let client = Arc::new(EchoClient {
            calls: calls.clone(),
            result,
            reverse,
        });

        let config = config();
        let response_cache =
            cached.then(|| ResponseCache::new(&config.cache, config.chains.len()));
        let gateway = Web3Gateway::for_tests(
            config,
            Arc::new(EchoProvider { client }),
            response_cache,
        );
        let endpoints = gateway.registry.get_all(1).await.unwrap();

        Harness {
            gateway,
            endpoints,
            calls,
        }
    }

    fn context(body: &str) -> RequestContext {
        let mut rc = RequestContext::new(
            &TopConfig::default(),
            "1",
            None,
            &HeaderMap::new(),
            &std::collections::HashMap::new(),
            Bytes::copy_from_slice(body.as_bytes()),
        );
        rc.chain = crate::config::Chain {
            id: 1,
            code: "mainnet".to_string(),
        };
        rc.options = CallOptions::default();
        rc
    }

    async fn run(h: &Harness, body: &str) -> (Vec<u8>, QueryStatus) {
        let rc = context(body);
        let mut profile = QueryProfile::default();
        let out = h
            .gateway
            .proxy(&rc, &h.endpoints, "tester", &mut profile)
            .await
            .unwrap();
        (out, profile.status)
    }

    #[test_log::test(tokio::test)]
    async fn single_requests_echo_single_objects() {
        let h = harness(json!("0x1"), false, false).await;

        let (out, status) = run(&h, r#"{"jsonrpc":"2.0","id":1,"method":"eth_chainId"}"#).await;

        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"{"id":1,"result":"0x1","jsonrpc":"2.0"}"#
        );
        assert_eq!(status, QueryStatus::Success);
    }

    #[test_log::test(tokio::test)]
    async fn batches_preserve_positions_even_when_upstream_reorders() {
        let h = harness(json!("0x1"), true, false).await;

        let body =
            r#"[{"jsonrpc":"2.0","id":1,"method":"eth_chainId"},{"jsonrpc":"2.0","id":"a","method":"net_version"}]"#;
        let (out, _) = run(&h, body).await;

        let results: Vec<Value> = serde_json::from_slice(&out).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["id"], json!(1));
        assert_eq!(results[1]["id"], json!("a"));
    }

    #[test_log::test(tokio::test)]
    async fn empty_batches_answer_without_dispatching() {
        let h = harness(json!("0x1"), false, false).await;

        let (out, _) = run(&h, "[]").await;

        assert_eq!(out, b"[]");
        assert!(h.calls.lock().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn duplicate_batch_ids_are_rejected() {
        let h = harness(json!("0x1"), false, false).await;
        let rc = context(
            r#"[{"jsonrpc":"2.0","id":1,"method":"eth_chainId"},{"jsonrpc":"2.0","id":1,"method":"eth_chainId"}]"#,
        );
        let mut profile = QueryProfile::default();

        let err = h
            .gateway
            .proxy(&rc, &h.endpoints, "tester", &mut profile)
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::BadRequest(_)));
        assert!(h.calls.lock().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn malformed_bodies_are_bad_requests() {
        let h = harness(json!("0x1"), false, false).await;
        let rc = context("definitely not json");
        let mut profile = QueryProfile::default();

        let err = h
            .gateway
            .proxy(&rc, &h.endpoints, "tester", &mut profile)
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::BadRequest(_)));
    }

    #[test_log::test(tokio::test)]
    async fn cache_serves_the_second_identical_request() {
        let h = harness(json!("0x1"), false, true).await;
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"eth_chainId"}"#;

        let (first, _) = run(&h, body).await;
        assert_eq!(h.calls.lock().len(), 1);

        let (second, _) = run(&h, body).await;

        // exactly one upstream call, byte-identical bodies
        assert_eq!(h.calls.lock().len(), 1);
        assert_eq!(first, second);
    }

    #[test_log::test(tokio::test)]
    async fn only_cache_misses_are_dispatched() {
        let h = harness(json!("0x1"), false, true).await;

        // warm eth_chainId
        run(&h, r#"{"jsonrpc":"2.0","id":1,"method":"eth_chainId"}"#).await;
        assert_eq!(*h.calls.lock(), vec![1]);

        // a batch of one cached and one uncacheable method dispatches only
        // the miss, and the merged response keeps its position
        let body =
            r#"[{"jsonrpc":"2.0","id":7,"method":"eth_chainId"},{"jsonrpc":"2.0","id":8,"method":"net_version"}]"#;
        let (out, _) = run(&h, body).await;

        assert_eq!(*h.calls.lock(), vec![1, 1]);
        let results: Vec<Value> = serde_json::from_slice(&out).unwrap();
        assert_eq!(results[0]["id"], json!(7));
        assert_eq!(results[0]["result"], json!("0x1"));
        assert_eq!(results[1]["id"], json!(8));
    }

    #[test_log::test(tokio::test)]
    async fn cache_opt_out_skips_reads() {
        let h = harness(json!("0x1"), false, true).await;
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"eth_chainId"}"#;

        run(&h, body).await;

        let mut rc = context(body);
        rc.options.use_cache = false;
        let mut profile = QueryProfile::default();
        h.gateway
            .proxy(&rc, &h.endpoints, "tester", &mut profile)
            .await
            .unwrap();

        // the second call went upstream despite the warm cache
        assert_eq!(h.calls.lock().len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn error_results_mark_the_profile_failed() {
        let calls = Arc::new(Mutex::new(vec![]));
        let client = Arc::new(ErrorClient {
            calls: calls.clone(),
        });
        let gateway = Web3Gateway::for_tests(
            config(),
            Arc::new(ErrorProvider { client }),
            None,
        );
        let endpoints = gateway.registry.get_all(1).await.unwrap();

        let mut rc = context(r#"{"jsonrpc":"2.0","id":1,"method":"eth_chainId"}"#);
        rc.options.attempts = 1;
        let mut profile = QueryProfile::default();

        let out = gateway
            .proxy(&rc, &endpoints, "tester", &mut profile)
            .await
            .unwrap();

        assert_eq!(profile.status, QueryStatus::Fail);
        let body: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(body["error"]["code"], json!(-32000));
        assert_eq!(body["id"], json!(1));
    }

    struct ErrorClient {
        calls: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl UpstreamClient for ErrorClient {
        async fn call(
            &self,
            data: &[SealedRequest],
            profile: &mut ResponseProfile,
        ) -> GatewayResult<Vec<UpstreamResponse>> {
            self.calls.lock().push(data.len());
            profile.status = 200;

            let body: Vec<Value> = data
                .iter()
                .map(|d| {
                    json!({"jsonrpc": "2.0", "id": d.id, "error": {"code": -32000, "message": "execution reverted"}})
                })
                .collect();
            let (results, _) = parse_upstream(json!(body).to_string().as_bytes()).unwrap();
            Ok(results)
        }

        fn close(&self) {}
    }

    struct ErrorProvider {
        client: Arc<ErrorClient>,
    }

    #[async_trait]
    impl ClientProvider for ErrorProvider {
        async fn get(&self, _endpoint: &Arc<Endpoint>) -> Option<Arc<dyn UpstreamClient>> {
            Some(self.client.clone() as Arc<dyn UpstreamClient>)
        }
    }
}
