//! Per-endpoint dynamic state.
//!
//! Reads take consistent snapshots under a shared lock; every mutation goes
//! through a typed method holding the write lock. Latency and status also
//! feed two rolling windows that the registry's refresh ticker collapses
//! into `p95_duration` / `p95_health` every interval.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use hashbrown::HashMap;
use hdrhistogram::Histogram;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::stats::{ResponseProfile, ENDPOINT_INFLIGHT};

pub type ChainId = u64;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EndpointType {
    Fullnode,
    Activenode,
    Default,
}

impl Default for EndpointType {
    fn default() -> Self {
        Self::Default
    }
}

#[derive(Debug)]
struct EndpointState {
    endpoint_type: EndpointType,
    weight: i64,
    headers: HashMap<String, String>,
    health: bool,
    p95_health: bool,
    duration_ms: f64,
    p95_duration_ms: f64,
    block_number: u64,
    count: u64,
    last_update: Instant,
}

struct RollingWindows {
    durations: Histogram<u64>,
    statuses: Histogram<u64>,
}

impl RollingWindows {
    fn new() -> Self {
        Self {
            durations: Histogram::new_with_bounds(1, 600_000, 3).expect("static bounds are valid"),
            statuses: Histogram::new_with_bounds(1, 999, 3).expect("static bounds are valid"),
        }
    }
}

/// Quantiles of one refresh window.
#[derive(Clone, Copy, Debug)]
pub struct WindowQuantiles {
    pub p95_duration_ms: Option<f64>,
    pub p95_status: Option<u64>,
}

pub struct Endpoint {
    url: Url,
    chain_id: ChainId,
    chain_code: String,
    state: RwLock<EndpointState>,
    inflight: AtomicU64,
    rolling: Mutex<RollingWindows>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {}]", self.chain_id, self.url)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("chain_id", &self.chain_id)
            .field("url", &self.url.as_str())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    pub fn new(
        url: Url,
        chain_id: ChainId,
        chain_code: String,
        endpoint_type: EndpointType,
        weight: Option<i64>,
        headers: Option<HashMap<String, String>>,
    ) -> Self {
        Self {
            url,
            chain_id,
            chain_code,
            state: RwLock::new(EndpointState {
                endpoint_type,
                weight: weight.unwrap_or(0),
                headers: headers.unwrap_or_default(),
                health: true,
                p95_health: true,
                duration_ms: 0.0,
                p95_duration_ms: 0.0,
                block_number: 0,
                count: 0,
                last_update: Instant::now(),
            }),
            inflight: AtomicU64::new(0),
            rolling: Mutex::new(RollingWindows::new()),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn chain_code(&self) -> &str {
        &self.chain_code
    }

    pub fn is_ws(&self) -> bool {
        matches!(self.url.scheme(), "ws" | "wss")
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.state.read().endpoint_type
    }

    pub fn weight(&self) -> i64 {
        self.state.read().weight
    }

    pub fn headers(&self) -> HashMap<String, String> {
        self.state.read().headers.clone()
    }

    pub fn health(&self) -> bool {
        self.state.read().health
    }

    pub fn p95_health(&self) -> bool {
        self.state.read().p95_health
    }

    pub fn duration_ms(&self) -> f64 {
        self.state.read().duration_ms
    }

    pub fn p95_duration_ms(&self) -> f64 {
        self.state.read().p95_duration_ms
    }

    pub fn block_number(&self) -> u64 {
        self.state.read().block_number
    }

    pub fn count(&self) -> u64 {
        self.state.read().count
    }

    pub fn last_update(&self) -> Instant {
        self.state.read().last_update
    }

    /// Merge attributes from a later source. Absent fields are left alone.
    pub fn merge_config(
        &self,
        endpoint_type: Option<EndpointType>,
        weight: Option<i64>,
        headers: Option<HashMap<String, String>>,
    ) {
        let mut state = self.state.write();

        if let Some(endpoint_type) = endpoint_type {
            state.endpoint_type = endpoint_type;
        }
        if let Some(weight) = weight {
            state.weight = weight;
        }
        if let Some(headers) = headers {
            state.headers = headers;
        }
    }

    /// Record the outcome of one upstream call.
    pub fn note_request(&self, profile: &ResponseProfile) {
        let ok = profile.code.is_none() && (200..300).contains(&profile.status);
        let duration = (profile.duration > 0).then_some(profile.duration as f64);

        {
            let mut state = self.state.write();
            state.count += 1;
            state.last_update = Instant::now();
            state.health = ok;
            if let Some(duration) = duration {
                state.duration_ms = duration;
            }
        }

        self.record_window(duration, ok);
    }

    /// Record a WebSocket connect outcome. Counts toward health and latency
    /// but not toward the request count.
    pub fn note_connect(&self, duration_ms: Option<f64>, ok: bool) {
        {
            let mut state = self.state.write();
            state.last_update = Instant::now();
            state.health = ok;
            if let Some(duration) = duration_ms {
                state.duration_ms = duration;
            }
        }

        self.record_window(duration_ms, ok);
    }

    pub fn set_health(&self, ok: bool) {
        {
            let mut state = self.state.write();
            state.health = ok;
            state.last_update = Instant::now();
        }

        self.record_window(None, ok);
    }

    /// Highest block seen flowing through this endpoint. Never decreases.
    pub fn observe_block_number(&self, block_number: u64) {
        let mut state = self.state.write();
        if block_number > state.block_number {
            state.block_number = block_number;
        }
    }

    pub fn apply_p95(&self, duration_ms: Option<f64>, healthy: Option<bool>) {
        let mut state = self.state.write();

        if let Some(duration_ms) = duration_ms {
            state.p95_duration_ms = duration_ms;
        }
        if let Some(healthy) = healthy {
            state.p95_health = healthy;
        }
        state.last_update = Instant::now();
    }

    fn record_window(&self, duration_ms: Option<f64>, ok: bool) {
        let mut rolling = self.rolling.lock();

        if let Some(duration) = duration_ms {
            let _ = rolling.durations.record((duration as u64).max(1));
        }
        let _ = rolling.statuses.record(if ok { 200 } else { 500 });
    }

    /// Drain the rolling windows, returning their p95s. `None` when nothing
    /// was observed since the last drain.
    pub fn drain_window(&self) -> Option<WindowQuantiles> {
        let mut rolling = self.rolling.lock();

        if rolling.durations.is_empty() && rolling.statuses.is_empty() {
            return None;
        }

        let quantiles = WindowQuantiles {
            p95_duration_ms: (!rolling.durations.is_empty())
                .then(|| rolling.durations.value_at_quantile(0.95) as f64),
            p95_status: (!rolling.statuses.is_empty())
                .then(|| rolling.statuses.value_at_quantile(0.95)),
        };

        *rolling = RollingWindows::new();

        Some(quantiles)
    }

    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        ENDPOINT_INFLIGHT
            .with_label_values(&[self.chain_code.as_str(), self.url.as_str()])
            .inc();

        InflightGuard { endpoint: self }
    }
}

pub struct InflightGuard<'a> {
    endpoint: &'a Endpoint,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.endpoint.inflight.fetch_sub(1, Ordering::AcqRel);
        ENDPOINT_INFLIGHT
            .with_label_values(&[self.endpoint.chain_code.as_str(), self.endpoint.url.as_str()])
            .dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new(
            Url::parse("https://rpc.example.com/").unwrap(),
            1,
            "mainnet".to_string(),
            EndpointType::Fullnode,
            None,
            None,
        )
    }

    fn profile(status: u16, duration: i64, code: Option<&str>) -> ResponseProfile {
        ResponseProfile {
            status,
            duration,
            code: code.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn note_request_tracks_count_health_and_latency() {
        let e = endpoint();

        e.note_request(&profile(200, 120, None));
        assert_eq!(e.count(), 1);
        assert!(e.health());
        assert_eq!(e.duration_ms(), 120.0);

        e.note_request(&profile(500, 40, Some("http_error")));
        assert_eq!(e.count(), 2);
        assert!(!e.health());
        assert_eq!(e.duration_ms(), 40.0);

        // a set profile code marks the call unhealthy even on a 200
        e.note_request(&profile(200, 10, Some("schema_validation_failed")));
        assert!(!e.health());
    }

    #[test]
    fn drain_window_reports_p95_and_resets() {
        let e = endpoint();

        for duration in [10, 20, 30, 40, 1000] {
            e.note_request(&profile(200, duration, None));
        }

        let window = e.drain_window().unwrap();
        assert!(window.p95_duration_ms.unwrap() >= 40.0);
        assert_eq!(window.p95_status, Some(200));

        // drained
        assert!(e.drain_window().is_none());
    }

    #[test]
    fn merge_config_only_touches_present_fields() {
        let e = endpoint();
        e.merge_config(None, Some(7), None);

        assert_eq!(e.weight(), 7);
        assert_eq!(e.endpoint_type(), EndpointType::Fullnode);

        e.merge_config(Some(EndpointType::Activenode), None, None);
        assert_eq!(e.endpoint_type(), EndpointType::Activenode);
        assert_eq!(e.weight(), 7);
    }

    #[test]
    fn block_number_is_monotone() {
        let e = endpoint();

        e.observe_block_number(100);
        e.observe_block_number(50);

        assert_eq!(e.block_number(), 100);
    }

    #[test]
    fn inflight_guard_balances() {
        let e = endpoint();

        {
            let _a = e.inflight_guard();
            let _b = e.inflight_guard();
            assert_eq!(e.inflight(), 2);
        }

        assert_eq!(e.inflight(), 0);
    }
}
