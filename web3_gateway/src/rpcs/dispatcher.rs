//! Walks the selector's ordered list, one upstream attempt at a time.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::errors::{GatewayError, GatewayResult};
use crate::jsonrpc::{SealedRequest, UpstreamResponse};
use crate::reqctx::{RequestContext, RetryStrategy};
use crate::rpcs::endpoint::Endpoint;
use crate::stats::{
    now_millis, QueryProfile, RequestProfile, ResponseProfile, ENDPOINT_DURATIONS, TOTAL_ENDPOINTS,
};

/// An unhealthy endpoint never gets less than this to prove itself.
pub const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// One upstream transport. The dispatcher treats HTTP and WebSocket clients
/// identically through this.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn call(
        &self,
        data: &[SealedRequest],
        profile: &mut ResponseProfile,
    ) -> GatewayResult<Vec<UpstreamResponse>>;

    fn close(&self);
}

/// Hands out clients for endpoints. Production uses the LRU factory; tests
/// substitute canned clients.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn get(&self, endpoint: &Arc<Endpoint>) -> Option<Arc<dyn UpstreamClient>>;
}

pub struct Dispatcher {
    clients: Arc<dyn ClientProvider>,
}

impl Dispatcher {
    pub fn new(clients: Arc<dyn ClientProvider>) -> Self {
        Self { clients }
    }

    /// Issue the batch against the ordered endpoint list, retrying per the
    /// request's options. Returns the first clean batch, the last batch on
    /// exhaustion, or the terminal error.
    pub async fn request(
        &self,
        rc: &RequestContext,
        endpoints: &[Arc<Endpoint>],
        data: &[SealedRequest],
        profile: &mut QueryProfile,
    ) -> GatewayResult<Vec<UpstreamResponse>> {
        if endpoints.is_empty() {
            return Err(GatewayError::Internal("No available endpoints".into()));
        }

        let options = &rc.options;
        let endpoints = match options.strategy {
            RetryStrategy::Same => &endpoints[..1],
            RetryStrategy::Rotation => endpoints,
        };
        let count = endpoints.len();

        let per_attempt = cmp::max(options.timeout / count as u32, MIN_ATTEMPT_TIMEOUT)
            .min(options.timeout);

        let methods: Vec<String> = data.iter().map(|d| d.method.clone()).collect();
        let chain_label = rc.chain.id.to_string();

        debug!(endpoints = count, ?methods, "dispatching");

        let mut results: Option<Vec<UpstreamResponse>> = None;
        let mut last_err: Option<GatewayError> = None;

        for attempt in 1..=options.attempts {
            let endpoint = &endpoints[(attempt - 1) % count];
            let Some(client) = self.clients.get(endpoint).await else {
                if count <= 1 {
                    break;
                }
                continue;
            };

            let req_id = Uuid::new_v4().to_string();
            let url = endpoint.url().to_string();
            profile.requests.push(RequestProfile {
                req_id: req_id.clone(),
                timestamp: now_millis(),
                url: url.clone(),
                methods: methods.clone(),
            });

            let mut response_profile = ResponseProfile {
                req_id: req_id.clone(),
                ..Default::default()
            };

            // healthy endpoints get the full remaining deadline; unhealthy
            // ones are boxed into the per-attempt budget
            let budget = if endpoint.health() {
                rc.remaining()
            } else {
                per_attempt.min(rc.remaining())
            };

            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(budget, client.call(data, &mut response_profile)).await
                {
                    Ok(outcome) => outcome,
                    Err(elapsed) => Err(GatewayError::Timeout(Some(elapsed))),
                };

            if response_profile.duration == 0 {
                response_profile.duration = started.elapsed().as_millis() as i64;
            }
            if let Err(err) = &outcome {
                if response_profile.error.is_none() {
                    response_profile.error = Some(err.to_string());
                }
            }
            response_profile.respond = true;

            ENDPOINT_DURATIONS
                .with_label_values(&[chain_label.as_str(), url.as_str()])
                .observe(response_profile.duration as f64 / 1000.0);
            let status_label = response_profile.status.to_string();
            TOTAL_ENDPOINTS
                .with_label_values(&[chain_label.as_str(), url.as_str(), status_label.as_str()])
                .inc();
            debug!(
                %req_id,
                "{}/#{} call: {} {} {}ms",
                options.attempts,
                attempt,
                url,
                response_profile.status,
                response_profile.duration
            );

            profile.responses.push(response_profile);

            match outcome {
                Ok(batch) => {
                    let clean = !batch.iter().any(|r| r.is_error());
                    results = Some(batch);
                    last_err = None;
                    if clean {
                        break;
                    }
                }
                Err(err) => {
                    let terminal = matches!(err, GatewayError::Timeout(_));
                    results = None;
                    last_err = Some(err);
                    if terminal {
                        break;
                    }
                }
            }
        }

        if let Some(err) = last_err {
            return Err(err);
        }

        match results {
            Some(results) if !results.is_empty() => Ok(results),
            _ => Err(GatewayError::Internal(
                "All endpoints are unavailable".into(),
            )),
        }
    }
}
