//! TTL'd keyed cache over Redis
//!
//! Strictly an optimization: every read path has a store-backed fallback,
//! and every cache failure is logged and degraded to a miss. The engine
//! runs with the cache disabled (no `CACHE_URL`) without behavioral change
//! beyond latency.
//!
//! `get_or_compute` deduplicates concurrent producers per key within this
//! process; pattern invalidation exists but targeted `del` is preferred
//! since `KEYS` walks the keyspace.

use crate::errors::Result;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Cache key prefixes
pub mod keys {
    use divvy_core::{ScopeId, UserId};

    pub const USER_BALANCES: &str = "bal:user";
    pub const SCOPE_BALANCES: &str = "bal:scope";
    pub const USER_PLAN: &str = "set:user";
    pub const SCOPE_PLAN: &str = "set:scope";

    pub fn user_balances(user: UserId) -> String {
        format!("{USER_BALANCES}:{user}")
    }

    pub fn scope_balances(scope: ScopeId) -> String {
        format!("{SCOPE_BALANCES}:{scope}")
    }

    pub fn user_plan(user: UserId) -> String {
        format!("{USER_PLAN}:{user}")
    }

    pub fn scope_plan(scope: ScopeId) -> String {
        format!("{SCOPE_PLAN}:{scope}")
    }
}

#[derive(Default, Debug, Clone)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64) / (total as f64) * 100.0
        }
    }
}

#[derive(Clone)]
pub struct CacheLayer {
    redis: Option<ConnectionManager>,
    ttl_seconds: u64,
    inflight: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    metrics: Arc<RwLock<CacheMetrics>>,
}

impl CacheLayer {
    pub fn new(redis: ConnectionManager, ttl_seconds: u64) -> Self {
        CacheLayer {
            redis: Some(redis),
            ttl_seconds,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(RwLock::new(CacheMetrics::default())),
        }
    }

    /// A cache layer with no backend; every read falls through
    pub fn disabled() -> Self {
        CacheLayer {
            redis: None,
            ttl_seconds: 0,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(RwLock::new(CacheMetrics::default())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.redis.is_some()
    }

    /// Fetch and deserialize a cached value; any failure is a miss
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let redis = self.redis.as_ref()?;

        match redis.clone().get::<_, Option<String>>(key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => {
                    self.record_hit().await;
                    Some(value)
                }
                Err(e) => {
                    warn!(key, "failed to deserialize cached value: {e}");
                    self.record_miss().await;
                    None
                }
            },
            Ok(None) => {
                self.record_miss().await;
                None
            }
            Err(e) => {
                warn!(key, "cache get failed: {e}");
                self.record_miss().await;
                None
            }
        }
    }

    /// Cache a value under the configured TTL; best effort
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        let Some(redis) = self.redis.as_ref() else {
            return;
        };
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, "failed to serialize value for cache: {e}");
                return;
            }
        };

        match redis.clone().set_ex::<_, _, ()>(key, json, self.ttl_seconds).await {
            Ok(()) => {
                self.record_set().await;
                debug!(key, "cached");
            }
            Err(e) => warn!(key, "cache set failed: {e}"),
        }
    }

    /// Drop specific keys; best effort
    pub async fn del(&self, keys: &[String]) {
        let Some(redis) = self.redis.as_ref() else {
            return;
        };
        if keys.is_empty() {
            return;
        }

        match redis.clone().del::<_, ()>(keys).await {
            Ok(()) => {
                let mut metrics = self.metrics.write().await;
                metrics.deletes += keys.len() as u64;
            }
            Err(e) => warn!("cache delete failed: {e}"),
        }
    }

    /// Drop every key under `prefix`. O(keyspace); prefer targeted `del`.
    pub async fn del_prefix(&self, prefix: &str) {
        let Some(redis) = self.redis.as_ref() else {
            return;
        };

        let pattern = format!("{prefix}*");
        let found: Vec<String> = match redis.clone().keys(&pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(prefix, "cache pattern scan failed: {e}");
                return;
            }
        };
        self.del(&found).await;
    }

    /// Read through the cache, computing on miss.
    ///
    /// Concurrent callers on the same key within this process run the
    /// producer once; the rest wait and re-read. Producer errors propagate;
    /// cache errors never do.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, producer: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.redis.is_none() {
            return producer().await;
        }

        if let Some(cached) = self.get_json::<T>(key).await {
            return Ok(cached);
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = gate.lock().await;

        // A concurrent producer may have filled the key while we waited
        if let Some(cached) = self.get_json::<T>(key).await {
            self.inflight.lock().await.remove(key);
            return Ok(cached);
        }

        let result = producer().await;
        if let Ok(value) = &result {
            self.set_json(key, value).await;
        }
        self.inflight.lock().await.remove(key);
        result
    }

    pub async fn metrics(&self) -> CacheMetrics {
        self.metrics.read().await.clone()
    }

    async fn record_hit(&self) {
        self.metrics.write().await.hits += 1;
    }

    async fn record_miss(&self) {
        self.metrics.write().await.misses += 1;
    }

    async fn record_set(&self) {
        self.metrics.write().await.sets += 1;
    }
}

// =========================================================================
// INVALIDATION JOB
// =========================================================================

/// Payload of an `invalidate_cache` job
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct InvalidationRequest {
    pub keys: Vec<String>,
    pub prefixes: Vec<String>,
}

/// Job handler that applies queued invalidations.
///
/// Deleting keys is idempotent, so at-least-once delivery is safe here.
pub struct InvalidateCacheHandler {
    cache: CacheLayer,
}

impl InvalidateCacheHandler {
    pub fn new(cache: CacheLayer) -> Self {
        Self { cache }
    }
}

#[async_trait::async_trait]
impl crate::jobs::JobHandler for InvalidateCacheHandler {
    async fn handle(&self, payload: &serde_json::Value) -> Result<()> {
        let request: InvalidationRequest = serde_json::from_value(payload.clone())
            .map_err(|e| crate::errors::EngineError::Internal(format!("bad invalidation payload: {e}")))?;

        self.cache.del(&request.keys).await;
        for prefix in &request.prefixes {
            self.cache.del_prefix(prefix).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use divvy_core::{GroupId, ScopeId, UserId};

    #[test]
    fn test_hit_rate() {
        let mut metrics = CacheMetrics::default();
        assert_eq!(metrics.hit_rate(), 0.0);

        metrics.hits = 8;
        metrics.misses = 2;
        assert_eq!(metrics.hit_rate(), 80.0);
    }

    #[test]
    fn test_key_layout() {
        let user = UserId::new();
        let scope = ScopeId::Group(GroupId::new());
        assert_eq!(keys::user_balances(user), format!("bal:user:{user}"));
        assert_eq!(keys::scope_balances(scope), format!("bal:scope:{scope}"));
        assert_eq!(
            keys::scope_balances(ScopeId::Direct),
            "bal:scope:direct".to_string()
        );
        assert_eq!(keys::user_plan(user), format!("set:user:{user}"));
    }

    #[tokio::test]
    async fn test_disabled_cache_falls_through_to_producer() {
        let cache = CacheLayer::disabled();
        assert!(!cache.is_enabled());

        let value: i64 = cache
            .get_or_compute("bal:user:x", || async { Ok(41 + 1) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        // reads and writes are no-ops
        assert_eq!(cache.get_json::<i64>("bal:user:x").await, None);
        cache.set_json("bal:user:x", &1i64).await;
        cache.del(&["bal:user:x".to_string()]).await;
        cache.del_prefix("bal:").await;
    }

    #[tokio::test]
    async fn test_disabled_cache_propagates_producer_error() {
        let cache = CacheLayer::disabled();
        let result: Result<i64> = cache
            .get_or_compute("k", || async {
                Err(crate::errors::EngineError::StoreUnavailable("down".into()))
            })
            .await;
        assert_eq!(result.unwrap_err().slug(), "store_unavailable");
    }
}
