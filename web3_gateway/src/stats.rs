//! Prometheus metrics, per-request profiles, and the audit publisher.

use std::time::{SystemTime, UNIX_EPOCH};

use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::{AmqpConfig, Chain};
use crate::errors::QueryStatus;
use crate::reqctx::CallOptions;

const DURATION_BUCKETS: &[f64] = &[0.02, 0.05, 0.08, 0.1, 0.25, 0.5, 0.85, 1.0, 2.0, 5.0, 10.0];

pub static TOTAL_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "total_requests",
        "Total number of requests processed",
        &["chain", "app", "status"]
    )
    .expect("metric registers once")
});

pub static REQUEST_DURATIONS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "request_durations",
        "Total seconds of durations for request",
        &["chain", "app"],
        DURATION_BUCKETS.to_vec()
    )
    .expect("metric registers once")
});

pub static TOTAL_ENDPOINTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "total_endpoints",
        "Total number of endpoints processed",
        &["chain", "url", "status"]
    )
    .expect("metric registers once")
});

pub static ENDPOINT_DURATIONS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "endpoint_durations",
        "Total seconds of durations for the endpoint",
        &["chain", "url"],
        DURATION_BUCKETS.to_vec()
    )
    .expect("metric registers once")
});

pub static TOTAL_CACHES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "total_caches",
        "Total number of requests cached",
        &["chain", "app", "method", "status"]
    )
    .expect("metric registers once")
});

pub static TOTAL_AUDIT_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "total_audit_messages",
        "Total number of published audit records",
        &["chain", "app"]
    )
    .expect("metric registers once")
});

pub static ENDPOINT_INFLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "endpoint_inflight",
        "In-flight calls per endpoint",
        &["chain", "url"]
    )
    .expect("metric registers once")
});

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The options the caller picked, echoed into the audit record.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsProfile {
    pub timeout: f64,
    pub use_cache: bool,
    pub max_retry_count: usize,
    pub attempt_strategy: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub specified_upstream_types: Vec<String>,
}

impl From<&CallOptions> for OptionsProfile {
    fn from(options: &CallOptions) -> Self {
        Self {
            timeout: options.timeout.as_millis() as f64,
            use_cache: options.use_cache,
            max_retry_count: options.attempts,
            attempt_strategy: options.strategy.to_string(),
            specified_upstream_types: options
                .endpoint_types
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

/// One upstream call the dispatcher issued.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestProfile {
    pub methods: Vec<String>,
    pub req_id: String,
    pub url: String,
    pub timestamp: i64,
}

/// What came back for one upstream call. `responses[i]` pairs with
/// `requests[i]`.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseProfile {
    pub req_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// milliseconds
    pub duration: i64,
    /// response bytes
    pub traffic: usize,
    pub status: u16,
    /// whether this attempt's batch went back to the client
    pub respond: bool,
}

/// One inbound call, start to finish.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryProfile {
    pub options: OptionsProfile,
    pub requests: Vec<RequestProfile>,
    pub responses: Vec<ResponseProfile>,
    pub id: String,
    pub href: String,
    pub method: String,
    pub ip: String,
    pub ip_country: String,
    pub status: QueryStatus,
    pub app_id: u64,
    pub chain_id: u64,
    pub start_time: i64,
    pub end_time: i64,
}

pub struct AuditRecord {
    pub chain: Chain,
    pub app_id: u64,
    pub app_name: String,
    pub profile: QueryProfile,
}

/// Publishes completed profiles to an AMQP topic exchange with routing key
/// `query.<chain_id>.<app_id>`. Publishing is fire-and-forget; a full
/// channel drops the record rather than slowing the request path.
pub struct AuditPublisher {
    tx: flume::Sender<AuditRecord>,
}

impl AuditPublisher {
    pub fn spawn(config: AmqpConfig) -> Self {
        let (tx, rx) = flume::bounded(1024);

        tokio::spawn(publisher_loop(config, rx));

        Self { tx }
    }

    pub fn publish(&self, record: AuditRecord) {
        if self.tx.try_send(record).is_err() {
            debug!("audit channel full, dropping record");
        }
    }
}

async fn publisher_loop(config: AmqpConfig, rx: flume::Receiver<AuditRecord>) {
    let mut channel: Option<lapin::Channel> = None;

    while let Ok(record) = rx.recv_async().await {
        if channel.is_none() {
            match Connection::connect(&config.url, ConnectionProperties::default()).await {
                Ok(conn) => match conn.create_channel().await {
                    Ok(ch) => channel = Some(ch),
                    Err(err) => {
                        warn!(?err, "failed to open amqp channel");
                        continue;
                    }
                },
                Err(err) => {
                    warn!(?err, "failed to connect to amqp");
                    continue;
                }
            }
        }

        let Some(ch) = channel.as_ref() else { continue };

        let body = match serde_json::to_vec(&record.profile) {
            Ok(body) => body,
            Err(err) => {
                warn!(?err, "failed to serialize profile");
                continue;
            }
        };

        let key = format!("query.{}.{}", record.chain.id, record.app_id);
        match ch
            .basic_publish(
                &config.exchange,
                &key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
        {
            Ok(_confirm) => {
                trace!(%key, "published audit record");
                TOTAL_AUDIT_MESSAGES
                    .with_label_values(&[record.chain.code.as_str(), record.app_name.as_str()])
                    .inc();
            }
            Err(err) => {
                warn!(?err, "amqp publish failed, reconnecting");
                channel = None;
            }
        }
    }
}
