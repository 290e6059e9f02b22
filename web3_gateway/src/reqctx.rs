//! Per-request context: who is calling, which chain, and the knobs the
//! caller set through query args. Legacy query-arg names are honored.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use axum::body::Bytes;
use http::HeaderMap;
use uuid::Uuid;

use crate::config::{Chain, TopConfig};
use crate::rpcs::endpoint::EndpointType;

pub const MAX_ATTEMPTS: usize = 30;
pub const DEFAULT_ATTEMPTS: usize = 3;
pub const MAX_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RetryStrategy {
    /// always retry the same endpoint
    Same,
    /// cycle through the candidate list
    Rotation,
}

impl RetryStrategy {
    pub fn parse(s: &str) -> Self {
        match s {
            "same" | "Same" => Self::Same,
            _ => Self::Rotation,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CallOptions {
    pub use_cache: bool,
    pub attempts: usize,
    pub timeout: Duration,
    pub endpoint_types: Vec<EndpointType>,
    pub strategy: RetryStrategy,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            attempts: DEFAULT_ATTEMPTS,
            timeout: DEFAULT_TIMEOUT,
            endpoint_types: vec![EndpointType::Default],
            strategy: RetryStrategy::Rotation,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

fn parse_types(csv: &str) -> Vec<EndpointType> {
    csv.split(',')
        .filter_map(|s| EndpointType::from_str(s.trim()).ok())
        .collect()
}

impl CallOptions {
    pub fn from_query(query: &HashMap<String, String>) -> Self {
        let mut options = Self::default();

        for key in ["cache", "useCache"] {
            if let Some(v) = query.get(key).and_then(|v| parse_bool(v)) {
                options.use_cache = v;
                break;
            }
        }

        for key in ["attempts", "maxRetryCount"] {
            if let Some(v) = query.get(key).and_then(|v| v.parse::<usize>().ok()) {
                if v > 0 {
                    options.attempts = v.min(MAX_ATTEMPTS);
                    break;
                }
            }
        }

        if let Some(v) = query.get("timeout").and_then(|v| v.parse::<u64>().ok()) {
            options.timeout = Duration::from_millis(v).min(MAX_TIMEOUT);
        }

        if let Some(csv) = query.get("endpoint_type") {
            options.endpoint_types = parse_types(csv);
        } else if let Some(t) = query.get("forceUpstreamType") {
            let mut types = parse_types(t);
            types.push(EndpointType::Default);
            options.endpoint_types = types;
        } else if let Some(csv) = query.get("specifiedUpstreamTypes") {
            options.endpoint_types = parse_types(csv);
        }

        if let Some(s) = query.get("attempt_strategy") {
            options.strategy = RetryStrategy::parse(s);
        }

        options
    }
}

/// Everything about one inbound call that the engine needs downstream.
#[derive(Debug)]
pub struct RequestContext {
    pub req_id: String,
    pub chain: Chain,
    pub body: Bytes,
    pub options: CallOptions,
    pub token: Option<String>,
    pub bucket: String,
    pub deadline: tokio::time::Instant,
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl RequestContext {
    pub fn new(
        config: &TopConfig,
        chain_segment: &str,
        apikey: Option<String>,
        headers: &HeaderMap,
        query: &HashMap<String, String>,
        body: Bytes,
    ) -> Self {
        let req_id = header_str(headers, "x-req-id")
            .or_else(|| header_str(headers, "x-request-id"))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let token = apikey
            .filter(|t| !t.is_empty())
            .or_else(|| header_str(headers, "x-api-key").map(str::to_string))
            .or_else(|| query.get("x_api_key").cloned())
            .filter(|t| !t.is_empty());

        let bucket = header_str(headers, "x-api-bucket")
            .map(str::to_string)
            .or_else(|| query.get("x_api_bucket").cloned())
            .unwrap_or_else(|| "default".to_string());

        let options = CallOptions::from_query(query);
        let deadline = tokio::time::Instant::now() + options.timeout;

        Self {
            req_id,
            chain: config.resolve_chain(chain_segment),
            body,
            options,
            token,
            bucket,
            deadline,
        }
    }

    /// Time left before the caller's deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline
            .saturating_duration_since(tokio::time::Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_without_query_args() {
        let options = CallOptions::from_query(&HashMap::new());

        assert!(options.use_cache);
        assert_eq!(options.attempts, 3);
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.endpoint_types, vec![EndpointType::Default]);
        assert_eq!(options.strategy, RetryStrategy::Rotation);
    }

    #[test]
    fn legacy_aliases_are_honored() {
        let options = CallOptions::from_query(&query(&[
            ("useCache", "false"),
            ("maxRetryCount", "7"),
            ("attempt_strategy", "same"),
        ]));

        assert!(!options.use_cache);
        assert_eq!(options.attempts, 7);
        assert_eq!(options.strategy, RetryStrategy::Same);
    }

    #[test]
    fn attempts_and_timeout_are_clamped() {
        let options = CallOptions::from_query(&query(&[("attempts", "500"), ("timeout", "900000")]));

        assert_eq!(options.attempts, MAX_ATTEMPTS);
        assert_eq!(options.timeout, MAX_TIMEOUT);

        // zero attempts falls back to the default
        let options = CallOptions::from_query(&query(&[("attempts", "0")]));
        assert_eq!(options.attempts, 3);
    }

    #[test]
    fn endpoint_type_args_parse_to_types() {
        let options = CallOptions::from_query(&query(&[("endpoint_type", "fullnode,activenode")]));
        assert_eq!(
            options.endpoint_types,
            vec![EndpointType::Fullnode, EndpointType::Activenode]
        );

        let options = CallOptions::from_query(&query(&[("forceUpstreamType", "activenode")]));
        assert_eq!(
            options.endpoint_types,
            vec![EndpointType::Activenode, EndpointType::Default]
        );

        let options = CallOptions::from_query(&query(&[("specifiedUpstreamTypes", "fullnode")]));
        assert_eq!(options.endpoint_types, vec![EndpointType::Fullnode]);
    }

    #[test]
    fn token_and_bucket_precedence() {
        let config = TopConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "header-token".parse().unwrap());
        headers.insert("x-api-bucket", "header-bucket".parse().unwrap());

        // the path segment wins over the header
        let rc = RequestContext::new(
            &config,
            "1",
            Some("path-token".to_string()),
            &headers,
            &HashMap::new(),
            Bytes::new(),
        );
        assert_eq!(rc.token.as_deref(), Some("path-token"));
        assert_eq!(rc.bucket, "header-bucket");

        // then the header, then the query arg
        let rc = RequestContext::new(
            &config,
            "1",
            None,
            &HeaderMap::new(),
            &query(&[("x_api_key", "query-token"), ("x_api_bucket", "q")]),
            Bytes::new(),
        );
        assert_eq!(rc.token.as_deref(), Some("query-token"));
        assert_eq!(rc.bucket, "q");

        // nothing at all
        let rc = RequestContext::new(
            &config,
            "1",
            None,
            &HeaderMap::new(),
            &HashMap::new(),
            Bytes::new(),
        );
        assert_eq!(rc.token, None);
        assert_eq!(rc.bucket, "default");
    }
}
