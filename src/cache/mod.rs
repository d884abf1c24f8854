//! Two-tier decision cache
//!
//! Tier-1 caches per-rule results, Tier-2 whole-endpoint decisions. Both
//! tiers share one backend (in-process or Redis) and one key namespace
//! `<namespace>:<epoch>:`. Configuration reload bumps the epoch and
//! prefix-deletes the previous one, invalidating every entry of both tiers
//! at once.
//!
//! Cache failures never fail a request: lookups degrade to misses and
//! stores are dropped, with a warning log and an `error`-labelled metric.

pub mod key;
pub mod memory;
pub mod redis;
pub mod ttl;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pipeline::state::Outcome;

/// Storage operations shared by both tiers
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch a raw entry
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a raw entry with a TTL
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Delete every key with the given prefix; returns the count removed
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Number of stored entries (whole store for remote backends)
    async fn entries(&self) -> Result<u64>;
}

/// Tier-2 payload: one completed endpoint evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDecision {
    /// Decision outcome
    pub outcome: Outcome,

    /// Rendered response status
    pub status: u16,

    /// Rendered response headers
    pub headers: BTreeMap<String, String>,

    /// Rendered response body
    pub body: String,

    /// Store time
    pub stored_at: DateTime<Utc>,

    /// Expiry time
    pub expires_at: DateTime<Utc>,
}

/// Tier-1 payload: one completed rule evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedRuleResult {
    /// Rule outcome
    pub outcome: Outcome,

    /// Reason attached to the outcome
    pub reason: String,

    /// Variables the rule exported
    pub exports: BTreeMap<String, Value>,

    /// Outcome-scoped response headers the rule rendered
    pub response_headers: BTreeMap<String, String>,

    /// Store time
    pub stored_at: DateTime<Utc>,

    /// Expiry time
    pub expires_at: DateTime<Utc>,
}

/// Both cache tiers behind one namespaced, epoch-scoped facade
pub struct DecisionCache {
    backend: Arc<dyn CacheBackend>,
    namespace: String,
    epoch: AtomicU64,
    metrics: Arc<Metrics>,
}

impl DecisionCache {
    /// Wrap a backend with the given namespace and starting epoch
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        namespace: impl Into<String>,
        epoch: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            epoch: AtomicU64::new(epoch),
            metrics,
        }
    }

    /// Build the configured backend ("memory" or "redis")
    pub async fn from_config(config: &CacheConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let backend: Arc<dyn CacheBackend> = match config.backend.as_str() {
            "memory" => Arc::new(memory::MemoryBackend::new()),
            "redis" => {
                let redis_config = config.redis.as_ref().ok_or_else(|| {
                    Error::InvalidConfig("redis cache backend requires server.cache.redis".into())
                })?;
                Arc::new(redis::RedisBackend::connect(redis_config).await?)
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown cache backend {other:?}"
                )))
            }
        };
        Ok(Self::new(backend, &config.namespace, config.epoch, metrics))
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Key prefix for the current epoch
    pub fn prefix(&self) -> String {
        format!("{}:{}:", self.namespace, self.epoch())
    }

    /// Bump the epoch; returns the now-stale prefix for purging
    pub fn advance_epoch(&self) -> String {
        let old = self.epoch.fetch_add(1, Ordering::SeqCst);
        format!("{}:{old}:", self.namespace)
    }

    /// Prefix-delete a stale epoch across both tiers
    pub async fn purge_prefix(&self, prefix: &str) {
        let started = Instant::now();
        match self.backend.delete_prefix(prefix).await {
            Ok(removed) => {
                tracing::info!(prefix, removed, "purged stale cache epoch");
                self.metrics
                    .cache_operations_total
                    .with_label_values(&["", "invalidate", "purged"])
                    .inc();
            }
            Err(e) => {
                tracing::warn!(prefix, "cache purge failed: {e}");
                self.metrics
                    .cache_operations_total
                    .with_label_values(&["", "invalidate", "error"])
                    .inc();
            }
        }
        self.metrics
            .cache_operation_duration_seconds
            .with_label_values(&["", "invalidate"])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Number of stored entries, for health reporting
    pub async fn entry_count(&self) -> u64 {
        self.backend.entries().await.unwrap_or(0)
    }

    /// Tier-2 lookup
    pub async fn lookup_decision(&self, endpoint: &str, base: &str) -> Option<CachedDecision> {
        self.lookup(endpoint, "lookup", &format!("{}{base}", self.prefix()))
            .await
    }

    /// Tier-2 store
    pub async fn store_decision(
        &self,
        endpoint: &str,
        base: &str,
        decision: &CachedDecision,
        ttl: Duration,
    ) -> bool {
        self.store(endpoint, "store", &format!("{}{base}", self.prefix()), decision, ttl)
            .await
    }

    /// Tier-1 lookup by compound key suffix
    pub async fn lookup_rule(&self, endpoint: &str, suffix: &str) -> Option<CachedRuleResult> {
        self.lookup(endpoint, "rule_lookup", &format!("{}{suffix}", self.prefix()))
            .await
    }

    /// Tier-1 store by compound key suffix
    pub async fn store_rule(
        &self,
        endpoint: &str,
        suffix: &str,
        result: &CachedRuleResult,
        ttl: Duration,
    ) -> bool {
        self.store(
            endpoint,
            "rule_store",
            &format!("{}{suffix}", self.prefix()),
            result,
            ttl,
        )
        .await
    }

    async fn lookup<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        operation: &str,
        full_key: &str,
    ) -> Option<T> {
        let started = Instant::now();
        let outcome = match self.backend.get(full_key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(entry) => ("hit", Some(entry)),
                Err(e) => {
                    tracing::warn!(key = full_key, "cache entry decode failed: {e}");
                    ("error", None)
                }
            },
            Ok(None) => ("miss", None),
            Err(e) => {
                tracing::warn!(key = full_key, "cache lookup failed: {e}");
                ("error", None)
            }
        };

        self.metrics
            .cache_operations_total
            .with_label_values(&[endpoint, operation, outcome.0])
            .inc();
        self.metrics
            .cache_operation_duration_seconds
            .with_label_values(&[endpoint, operation])
            .observe(started.elapsed().as_secs_f64());
        outcome.1
    }

    async fn store<T: Serialize>(
        &self,
        endpoint: &str,
        operation: &str,
        full_key: &str,
        entry: &T,
        ttl: Duration,
    ) -> bool {
        let started = Instant::now();
        let result = match serde_json::to_string(entry) {
            Ok(raw) => match self.backend.set(full_key, raw, ttl).await {
                Ok(()) => ("stored", true),
                Err(e) => {
                    tracing::warn!(key = full_key, "cache store failed: {e}");
                    ("error", false)
                }
            },
            Err(e) => {
                tracing::warn!(key = full_key, "cache entry encode failed: {e}");
                ("error", false)
            }
        };

        self.metrics
            .cache_operations_total
            .with_label_values(&[endpoint, operation, result.0])
            .inc();
        self.metrics
            .cache_operation_duration_seconds
            .with_label_values(&[endpoint, operation])
            .observe(started.elapsed().as_secs_f64());
        result.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> DecisionCache {
        DecisionCache::new(
            Arc::new(memory::MemoryBackend::new()),
            "passctrl",
            3,
            Arc::new(Metrics::new()),
        )
    }

    fn decision() -> CachedDecision {
        CachedDecision {
            outcome: Outcome::Pass,
            status: 200,
            headers: BTreeMap::new(),
            body: "integration ok".into(),
            stored_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn test_decision_roundtrip() {
        let cache = cache();
        assert!(cache.lookup_decision("default", "base").await.is_none());

        assert!(
            cache
                .store_decision("default", "base", &decision(), Duration::from_secs(60))
                .await
        );
        let replayed = cache.lookup_decision("default", "base").await.unwrap();
        assert_eq!(replayed.outcome, Outcome::Pass);
        assert_eq!(replayed.body, "integration ok");
    }

    #[tokio::test]
    async fn test_epoch_advance_invalidates() {
        let cache = cache();
        cache
            .store_decision("default", "base", &decision(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.prefix(), "passctrl:3:");

        let old_prefix = cache.advance_epoch();
        assert_eq!(old_prefix, "passctrl:3:");
        assert_eq!(cache.epoch(), 4);

        // The new epoch prefix no longer finds the entry even before purge.
        assert!(cache.lookup_decision("default", "base").await.is_none());

        cache.purge_prefix(&old_prefix).await;
        assert_eq!(cache.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_rule_result_roundtrip() {
        let cache = cache();
        let suffix = key::tier1_key("base", "check-team", "aa", "bb");
        let result = CachedRuleResult {
            outcome: Outcome::Fail,
            reason: "not a member".into(),
            exports: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            stored_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        };

        cache
            .store_rule("default", &suffix, &result, Duration::from_secs(30))
            .await;
        let replayed = cache.lookup_rule("default", &suffix).await.unwrap();
        assert_eq!(replayed.outcome, Outcome::Fail);
        assert_eq!(replayed.reason, "not a member");
    }

    #[tokio::test]
    async fn test_lookup_metrics_labels() {
        let metrics = Arc::new(Metrics::new());
        let cache = DecisionCache::new(
            Arc::new(memory::MemoryBackend::new()),
            "passctrl",
            0,
            metrics.clone(),
        );

        cache.lookup_decision("default", "base").await;
        cache
            .store_decision("default", "base", &decision(), Duration::from_secs(60))
            .await;
        cache.lookup_decision("default", "base").await;

        let text = metrics.render().unwrap();
        assert!(text.contains("operation=\"lookup\",result=\"miss\""));
        assert!(text.contains("operation=\"lookup\",result=\"hit\""));
        assert!(text.contains("operation=\"store\",result=\"stored\""));
    }
}
