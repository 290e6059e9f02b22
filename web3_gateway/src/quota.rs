//! Tenant resolution and token-bucket accounting.
//!
//! Apps resolve through three layers: an in-process cache, the shared KV's
//! tenant blob, and finally the tenant store. Debits go through the atomic
//! balance script; usage write-back is debounced per bucket so a burst of
//! requests costs one KV round trip.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis_quota::QuotaStore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::errors::{GatewayError, GatewayResult};
use crate::stats::now_millis;

/// How long a tenant blob lives in the shared KV.
pub const TENANT_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// In-process app cache lifetime.
const APP_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

const DEBOUNCE: Duration = Duration::from_millis(1);

/// Static facts about a tenant.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TenantInfo {
    pub id: u64,
    pub name: String,
    pub token: String,
    /// units recovered per second
    pub rate: f64,
    pub capacity: f64,
    pub preferences: serde_json::Map<String, serde_json::Value>,
}

/// A tenant bound to one bucket, plus its live accounting state.
#[derive(Debug)]
pub struct App {
    pub info: TenantInfo,
    pub bucket: String,
    balance: AtomicI64,
    last_time: AtomicI64,
    offset: AtomicI64,
}

pub fn tenant_key(parts: &[&str]) -> String {
    format!("app#{}", parts.join(":"))
}

impl App {
    fn new(info: TenantInfo, bucket: String) -> Self {
        Self {
            info,
            bucket,
            balance: AtomicI64::new(0),
            last_time: AtomicI64::new(0),
            offset: AtomicI64::new(0),
        }
    }

    fn key(&self) -> String {
        tenant_key(&[&self.info.token, &self.bucket])
    }

    pub fn balance(&self) -> i64 {
        self.balance.load(Ordering::Relaxed)
    }
}

/// Where tenants authoritatively live. The relational store stays outside
/// the core; config-seeded tenants are the built-in implementation.
#[async_trait]
pub trait TenantStore: Send + Sync + 'static {
    async fn lookup_by_token(&self, token: &str) -> GatewayResult<Option<TenantInfo>>;
}

pub struct ConfigTenantStore {
    by_token: hashbrown::HashMap<String, TenantInfo>,
}

impl ConfigTenantStore {
    pub fn new(tenants: Vec<TenantInfo>) -> Self {
        Self {
            by_token: tenants
                .into_iter()
                .map(|info| (info.token.clone(), info))
                .collect(),
        }
    }
}

#[async_trait]
impl TenantStore for ConfigTenantStore {
    async fn lookup_by_token(&self, token: &str) -> GatewayResult<Option<TenantInfo>> {
        Ok(self.by_token.get(token).cloned())
    }
}

pub struct TenantQuota {
    store: Arc<dyn QuotaStore>,
    tenants: Arc<dyn TenantStore>,
    apps: moka::sync::Cache<String, Arc<App>>,
    /// per-token locks that coalesce concurrent tenant-store loads
    loads: DashMap<String, Arc<RwLock<()>>>,
    /// buckets with a pending debounced flush
    timers: DashMap<String, ()>,
}

impl TenantQuota {
    pub fn new(store: Arc<dyn QuotaStore>, tenants: Arc<dyn TenantStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            tenants,
            apps: moka::sync::Cache::builder()
                .time_to_live(APP_CACHE_TTL)
                .max_capacity(10_000)
                .build(),
            loads: DashMap::new(),
            timers: DashMap::new(),
        })
    }

    /// Resolve the app for `token`+`bucket` and debit one unit. The caller
    /// rejects when the returned app's balance is ≤ -1.
    pub async fn access(&self, token: &str, bucket: &str) -> GatewayResult<Arc<App>> {
        let key = tenant_key(&[token, bucket]);

        let app = match self.apps.get(&key) {
            Some(app) => app,
            None => {
                let info = self.tenant_info(token).await?;
                let app = Arc::new(App::new(info, bucket.to_string()));
                self.apps.insert(key, app.clone());
                app
            }
        };

        let balance = self.debit(&app).await?;
        app.balance.store(balance, Ordering::Relaxed);

        Ok(app)
    }

    async fn debit(&self, app: &App) -> GatewayResult<i64> {
        let capacity = app.info.capacity as i64;
        // the script recovers per millisecond
        let rate = app.info.rate / 1000.0;

        self.store
            .balance(&app.key(), capacity, rate)
            .await
            .map_err(|err| {
                error!(?err, bucket = %app.bucket, "read balance error");
                GatewayError::Internal("Read balance error".into())
            })
    }

    async fn tenant_info(&self, token: &str) -> GatewayResult<TenantInfo> {
        let key = tenant_key(&[token]);

        let lock = self
            .loads
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone();

        {
            let _read = lock.read().await;
            match self.store.get_blob(&key).await {
                Ok(Some(blob)) => match serde_json::from_slice(&blob) {
                    Ok(info) => return Ok(info),
                    Err(err) => warn!(?err, "tenant blob unmarshal error"),
                },
                Ok(None) => {}
                Err(err) => warn!(?err, "tenant blob read error"),
            }
        }

        debug!("tenant not in kv, trying the tenant store");

        let _write = lock.write().await;

        let info = self
            .tenants
            .lookup_by_token(token)
            .await?
            .ok_or_else(|| GatewayError::Forbidden("Token is invalid".into()))?;

        // write back off the request path
        if let Ok(blob) = serde_json::to_vec(&info) {
            let store = self.store.clone();
            let key = key.clone();
            tokio::spawn(async move {
                if let Err(err) = store.set_blob(&key, blob, TENANT_CACHE_TTL).await {
                    warn!(?err, "failed to save tenant blob");
                }
            });
        }

        self.loads.remove(&key);

        Ok(info)
    }

    /// The call consumed quota (upstream JSON-RPC errors included): stamp the
    /// last access time for recovery math.
    pub fn affected(self: &Arc<Self>, app: &Arc<App>) {
        app.last_time.store(now_millis(), Ordering::Relaxed);
        self.schedule_flush(app);
    }

    /// The call died inside the gateway and is not billable: queue one unit
    /// of compensation.
    pub fn unaffected(self: &Arc<Self>, app: &Arc<App>) {
        app.offset.fetch_add(1, Ordering::Relaxed);
        self.schedule_flush(app);
    }

    /// Debounced write-back. Whatever accumulated on the app within the
    /// window goes to the KV in one trip.
    fn schedule_flush(self: &Arc<Self>, app: &Arc<App>) {
        let key = app.key();

        if self.timers.insert(key.clone(), ()).is_some() {
            // a flush is already pending for this bucket
            return;
        }

        let quota = self.clone();
        let app = app.clone();
        tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;

            let last_time = app.last_time.load(Ordering::Relaxed);
            let offset = app.offset.load(Ordering::Relaxed);

            let flushed = quota
                .store
                .flush_usage(&key, (last_time > 0).then_some(last_time), offset)
                .await;

            quota.timers.remove(&key);

            match flushed {
                Ok(()) => {
                    if offset > 0 {
                        app.offset.fetch_sub(offset, Ordering::Relaxed);
                    }
                    // refresh the in-process entry's lifetime
                    quota.apps.insert(key, app.clone());
                }
                Err(err) => warn!(?err, "failed to flush usage"),
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`QuotaStore`] mirroring the balance script, with a
    //! controllable clock.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MemoryQuotaStore {
        pub hashes: Mutex<HashMap<String, HashMap<String, i64>>>,
        pub blobs: Mutex<HashMap<String, Vec<u8>>>,
        pub now_ms: AtomicI64,
        pub blob_reads: AtomicI64,
    }

    impl MemoryQuotaStore {
        pub fn new(now_ms: i64) -> Arc<Self> {
            let store = Self::default();
            store.now_ms.store(now_ms, Ordering::Relaxed);
            Arc::new(store)
        }

        pub fn advance(&self, ms: i64) {
            self.now_ms.fetch_add(ms, Ordering::Relaxed);
        }

        pub fn field(&self, key: &str, field: &str) -> Option<i64> {
            self.hashes.lock().get(key)?.get(field).copied()
        }
    }

    #[async_trait]
    impl QuotaStore for MemoryQuotaStore {
        async fn balance(&self, key: &str, capacity: i64, rate: f64) -> anyhow::Result<i64> {
            if capacity <= 0 || rate <= 0.0 {
                return Ok(0);
            }

            let now = self.now_ms.load(Ordering::Relaxed);
            let mut hashes = self.hashes.lock();
            let hash = hashes.entry(key.to_string()).or_default();

            hash.entry("balance".to_string()).or_insert(capacity);

            let last = (*hash.get("last").unwrap_or(&now)).min(now);
            let recovery = ((now - last) as f64 * rate).floor() as i64;

            let residual = *hash
                .entry("balance".to_string())
                .and_modify(|b| *b -= 1)
                .or_insert(-1);
            let current = (capacity - 1).min(residual + recovery);
            hash.insert("balance".to_string(), current);

            Ok(current)
        }

        async fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            self.blob_reads.fetch_add(1, Ordering::Relaxed);
            Ok(self.blobs.lock().get(key).cloned())
        }

        async fn set_blob(&self, key: &str, value: Vec<u8>, _ttl: Duration) -> anyhow::Result<()> {
            self.blobs.lock().insert(key.to_string(), value);
            Ok(())
        }

        async fn flush_usage(
            &self,
            key: &str,
            last_time: Option<i64>,
            offset: i64,
        ) -> anyhow::Result<()> {
            let mut hashes = self.hashes.lock();
            let hash = hashes.entry(key.to_string()).or_default();

            if let Some(last_time) = last_time {
                hash.insert("last".to_string(), last_time);
            }
            if offset > 0 {
                *hash.entry("balance".to_string()).or_insert(0) += offset;
            }

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryQuotaStore;
    use super::*;

    fn tenant(token: &str, capacity: f64, rate: f64) -> TenantInfo {
        TenantInfo {
            id: 7,
            name: "acme".to_string(),
            token: token.to_string(),
            rate,
            capacity,
            preferences: Default::default(),
        }
    }

    fn quota(store: Arc<MemoryQuotaStore>, info: TenantInfo) -> Arc<TenantQuota> {
        TenantQuota::new(store, Arc::new(ConfigTenantStore::new(vec![info])))
    }

    #[test_log::test(tokio::test)]
    async fn unknown_tokens_are_forbidden() {
        let store = MemoryQuotaStore::new(1_000_000);
        let quota = quota(store, tenant("good", 10.0, 1.0));

        let err = quota.access("bad", "default").await.unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[test_log::test(tokio::test)]
    async fn capacity_bounds_successful_accesses() {
        let store = MemoryQuotaStore::new(1_000_000);
        let quota = quota(store.clone(), tenant("t", 3.0, 0.000001));

        let mut balances = vec![];
        for _ in 0..5 {
            balances.push(quota.access("t", "default").await.unwrap().balance());
        }

        // exactly `capacity` calls see a balance >= 0
        assert_eq!(balances.iter().filter(|b| **b >= 0).count(), 3);
        assert_eq!(balances.iter().filter(|b| **b <= -1).count(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn quiescence_recovers_the_bucket() {
        let store = MemoryQuotaStore::new(1_000_000);
        let quota = quota(store.clone(), tenant("t", 10.0, 2.0));

        // drain one unit and stamp last via a flush
        let app = quota.access("t", "default").await.unwrap();
        assert_eq!(app.balance(), 9);
        store
            .flush_usage(&app.key(), Some(1_000_000), 0)
            .await
            .unwrap();

        // 2 units/second for 3 seconds, capped at capacity - 1
        store.advance(3_000);
        let app = quota.access("t", "default").await.unwrap();
        assert_eq!(app.balance(), 9);

        // with a fresh last stamp there is nothing to recover yet
        store
            .flush_usage(&app.key(), Some(1_003_000), 0)
            .await
            .unwrap();
        let before = quota.access("t", "default").await.unwrap().balance();
        assert_eq!(before, 8);

        // one more second pays back floor(1000ms * 2/s / 1000) = 2 units
        store.advance(1_000);
        let after = quota.access("t", "default").await.unwrap().balance();
        assert_eq!(after, before - 1 + 2);
    }

    #[test_log::test(tokio::test)]
    async fn zero_rate_or_capacity_short_circuits() {
        let store = MemoryQuotaStore::new(1_000_000);
        let quota = quota(store, tenant("t", 0.0, 1.0));

        let app = quota.access("t", "default").await.unwrap();
        assert_eq!(app.balance(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn tenant_blob_is_written_back_and_reused() {
        let store = MemoryQuotaStore::new(1_000_000);
        let quota = quota(store.clone(), tenant("t", 10.0, 1.0));

        quota.access("t", "default").await.unwrap();

        // the blob write-back is detached
        for _ in 0..50 {
            if store.blobs.lock().contains_key(&tenant_key(&["t"])) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.blobs.lock().contains_key(&tenant_key(&["t"])));

        // a different bucket resolves through the blob, not the store
        let app = quota.access("t", "other").await.unwrap();
        assert_eq!(app.bucket, "other");

        // and a cached app skips the blob entirely
        let reads_before = store.blob_reads.load(Ordering::Relaxed);
        quota.access("t", "other").await.unwrap();
        assert_eq!(store.blob_reads.load(Ordering::Relaxed), reads_before);
    }

    #[test_log::test(tokio::test)]
    async fn affected_flushes_last_time_and_unaffected_compensates() {
        let store = MemoryQuotaStore::new(1_000_000);
        let quota = quota(store.clone(), tenant("t", 10.0, 1.0));

        let app = quota.access("t", "default").await.unwrap();
        let key = app.key();
        assert_eq!(store.field(&key, "balance"), Some(9));

        quota.affected(&app);
        for _ in 0..50 {
            if store.field(&key, "last").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.field(&key, "last").unwrap() > 0);

        // two in-gateway failures put two units back
        quota.unaffected(&app);
        quota.unaffected(&app);
        for _ in 0..50 {
            if store.field(&key, "balance") == Some(11) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.field(&key, "balance"), Some(11));
        assert_eq!(app.offset.load(Ordering::Relaxed), 0);
    }
}
