//! Ranks a chain's endpoints for one request.
//!
//! Candidates are filtered by type, scored on normalized dynamic
//! attributes, and ordered healthy-first. Long-timeout rotation requests
//! occasionally promote an unhealthy endpoint to probe recovery.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use nanorand::Rng;

use crate::jsonrpc::JsonRpcRequest;
use crate::reqctx::{CallOptions, RetryStrategy, MAX_TIMEOUT};
use crate::rpcs::endpoint::{Endpoint, EndpointType};

/// Methods that any synced node can answer; these prefer fullnodes when the
/// caller didn't pin a type.
const FULLNODE_METHODS: &[&str] = &[
    "eth_getBlockByNumber",
    "eth_getBlockByHash",
    "eth_getTransactionByHash",
    "eth_getTransactionByBlockHashAndIndex",
    "eth_getTransactionByBlockNumberAndIndex",
    "eth_getTransactionReceipt",
    "eth_getTransactionCount",
    "eth_getUncleByBlockHashAndIndex",
    "eth_getUncleByBlockNumberAndIndex",
    "eth_getBlockTransactionCountByHash",
    "eth_getBlockTransactionCountByNumber",
    "eth_getUncleCountByBlockHash",
    "eth_getUncleCountByBlockNumber",
    "eth_blockNumber",
    "eth_accounts",
    "eth_gasPrice",
    "eth_chainId",
    "net_version",
];

struct Rank {
    health: bool,
    p95_health: bool,
    score: f64,
    last_update: Instant,
}

/// Snapshot of the attributes that feed the score, taken once so the sort
/// sees consistent values.
struct Snapshot {
    block_number: f64,
    duration: f64,
    p95_duration: f64,
    count: f64,
    weight: f64,
}

impl Snapshot {
    fn of(endpoint: &Endpoint) -> Self {
        Self {
            block_number: endpoint.block_number() as f64,
            duration: endpoint.duration_ms(),
            p95_duration: endpoint.p95_duration_ms(),
            count: endpoint.count() as f64,
            weight: endpoint.weight() as f64,
        }
    }

    fn attrs(&self) -> [f64; 5] {
        [
            self.block_number,
            self.duration,
            self.p95_duration,
            self.count,
            self.weight,
        ]
    }
}

pub fn select(
    options: &CallOptions,
    endpoints: &[Arc<Endpoint>],
    calls: &[&JsonRpcRequest],
) -> Vec<Arc<Endpoint>> {
    if endpoints.is_empty() {
        return vec![];
    }
    if endpoints.len() == 1 {
        return endpoints.to_vec();
    }

    let mut candidates: Vec<Arc<Endpoint>> = if options.endpoint_types.is_empty() {
        vec![]
    } else {
        endpoints
            .iter()
            .filter(|e| options.endpoint_types.contains(&e.endpoint_type()))
            .cloned()
            .collect()
    };

    if candidates.is_empty() {
        if calls
            .iter()
            .all(|call| FULLNODE_METHODS.contains(&call.method()))
        {
            candidates = endpoints
                .iter()
                .filter(|e| e.endpoint_type() == EndpointType::Fullnode)
                .cloned()
                .collect();
        }

        // nothing matched the type preference, use everything
        if candidates.is_empty() {
            candidates = endpoints.to_vec();
        }
    }

    match arrange(&mut candidates) {
        Ok(()) => promote_unhealthy_probe(options, &mut candidates),
        Err(DegenerateScores) => {
            nanorand::tls_rng().shuffle(&mut candidates);
        }
    }

    candidates
}

struct DegenerateScores;

/// Sort in place: health, then p95 health, then score, then the staler
/// endpoint first so underused ones get another look.
fn arrange(endpoints: &mut Vec<Arc<Endpoint>>) -> Result<(), DegenerateScores> {
    if endpoints.len() <= 1 {
        return Ok(());
    }

    let snapshots: Vec<Snapshot> = endpoints.iter().map(|e| Snapshot::of(e)).collect();
    let scores = calculate_scores(&snapshots)?;

    let mut pairs: Vec<(Arc<Endpoint>, Rank)> = endpoints
        .drain(..)
        .zip(scores)
        .map(|(endpoint, score)| {
            let rank = Rank {
                health: endpoint.health(),
                p95_health: endpoint.p95_health(),
                score,
                last_update: endpoint.last_update(),
            };
            (endpoint, rank)
        })
        .collect();

    pairs.sort_by(|(_, a), (_, b)| {
        b.health
            .cmp(&a.health)
            .then(b.p95_health.cmp(&a.p95_health))
            .then(b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
            .then(a.last_update.cmp(&b.last_update))
    });

    *endpoints = pairs.into_iter().map(|(endpoint, _)| endpoint).collect();

    Ok(())
}

/// Normalize each attribute to [0, 100] across the set and combine:
/// block number counts double, latency and load count against, weight adds.
fn calculate_scores(snapshots: &[Snapshot]) -> Result<Vec<f64>, DegenerateScores> {
    let mut mins = [f64::MAX; 5];
    let mut maxs = [f64::MIN; 5];
    for snapshot in snapshots {
        for (i, v) in snapshot.attrs().into_iter().enumerate() {
            mins[i] = mins[i].min(v);
            maxs[i] = maxs[i].max(v);
        }
    }

    let normalize = |i: usize, v: f64| -> f64 {
        if maxs[i] - mins[i] > 0.0 {
            (v - mins[i]) / (maxs[i] - mins[i]) * 100.0
        } else {
            0.0
        }
    };

    let mut total = 0.0;
    let scores: Vec<f64> = snapshots
        .iter()
        .map(|snapshot| {
            let [block_number, duration, p95_duration, count, weight] = snapshot.attrs();

            let mut score = normalize(0, block_number) * 2.0;
            score += 100.0 - normalize(1, duration).min(normalize(2, p95_duration));
            score += 100.0 - normalize(3, count) * 1.1;
            score += normalize(4, weight);

            let score = score.max(0.0);
            total += score;
            score
        })
        .collect();

    if total <= 0.0 {
        return Err(DegenerateScores);
    }

    Ok(scores)
}

/// With rotation and more than one attempt, occasionally move the first
/// unhealthy endpoint to the front. The longer the caller's timeout, the
/// more likely the probe.
fn promote_unhealthy_probe(options: &CallOptions, endpoints: &mut Vec<Arc<Endpoint>>) {
    if endpoints.is_empty()
        || !endpoints[0].health()
        || options.attempts <= 1
        || options.strategy != RetryStrategy::Rotation
    {
        return;
    }

    let chance =
        (options.timeout.as_millis() as f64 / MAX_TIMEOUT.as_millis() as f64 * 100.0) as u64;
    if nanorand::tls_rng().generate_range(0u64..100) >= chance {
        return;
    }

    if let Some(i) = endpoints.iter().position(|e| !e.health()) {
        let unhealthy = endpoints.remove(i);
        endpoints.insert(0, unhealthy);
    }
}
