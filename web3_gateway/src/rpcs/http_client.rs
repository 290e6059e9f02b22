//! HTTP(S) upstream transport.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{GatewayError, GatewayResult};
use crate::jsonrpc::{parse_upstream, SealedRequest, UpstreamResponse};
use crate::jsonrpc_schema::JsonRpcSchema;
use crate::rpcs::dispatcher::UpstreamClient;
use crate::rpcs::endpoint::Endpoint;
use crate::rpcs::{note_block_numbers, record_error_result, validate_results};
use crate::stats::ResponseProfile;

pub struct HttpUpstream {
    endpoint: Arc<Endpoint>,
    client: reqwest::Client,
    schema: Option<Arc<JsonRpcSchema>>,
}

impl HttpUpstream {
    pub fn new(endpoint: Arc<Endpoint>, schema: Option<Arc<JsonRpcSchema>>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in endpoint.headers() {
            headers.insert(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(&value)?,
            );
        }

        let client = reqwest::Client::builder().default_headers(headers).build()?;

        Ok(Self {
            endpoint,
            client,
            schema,
        })
    }

    async fn call_inner(
        &self,
        data: &[SealedRequest],
        profile: &mut ResponseProfile,
    ) -> GatewayResult<Vec<UpstreamResponse>> {
        let body = serde_json::to_vec(data)
            .map_err(|_| GatewayError::Internal("Marshalling request failed".into()))?;

        let _inflight = self.endpoint.inflight_guard();

        let started = Instant::now();
        let response = self
            .client
            .post(self.endpoint.url().as_str())
            .body(body)
            .send()
            .await;
        profile.duration = started.elapsed().as_millis() as i64;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                warn!(?err, endpoint = %self.endpoint, "error sending request");
                profile.error = Some(err.to_string());

                if err.is_timeout() {
                    return Err(GatewayError::Timeout(None));
                }
                return Err(GatewayError::Upstream("Error connection to endpoint".into()));
            }
        };

        let status = response.status();
        profile.status = status.as_u16();

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(err) => {
                warn!(?err, endpoint = %self.endpoint, "error reading response");
                profile.code = Some("connection_error".to_string());
                profile.error = Some(err.to_string());
                return Err(GatewayError::Upstream("Reading response failed".into()));
            }
        };
        profile.traffic = body.len();

        if !status.is_success() {
            profile.code = Some("http_error".to_string());
            debug!(status = status.as_u16(), endpoint = %self.endpoint, "http error");
            return Err(GatewayError::Upstream("HTTP error".into()));
        }

        let (mut results, is_batch) = match parse_upstream(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(endpoint = %self.endpoint, "failed to unmarshal response");
                profile.code = Some("request_error".to_string());
                profile.error = Some(err.to_string());
                return Err(GatewayError::Internal("Unmarshalling response failed".into()));
            }
        };

        if !is_batch && results.len() == 1 && results[0].is_error() {
            record_error_result(profile, &results[0]);
            return Ok(results);
        }

        // a short array can be the server answering only part of the batch;
        // hand it back as-is
        if results.len() != data.len() {
            return Ok(results);
        }

        note_block_numbers(&self.endpoint, data, &results);

        if let Some(schema) = &self.schema {
            validate_results(schema, profile, data, &mut results)?;
        }

        Ok(results)
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn call(
        &self,
        data: &[SealedRequest],
        profile: &mut ResponseProfile,
    ) -> GatewayResult<Vec<UpstreamResponse>> {
        let out = self.call_inner(data, profile).await;

        self.endpoint.note_request(profile);

        out
    }

    fn close(&self) {
        // reqwest drops idle connections with the client
    }
}
