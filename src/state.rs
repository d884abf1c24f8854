//! Application state shared across handlers
//!
//! The active endpoint snapshot sits behind a readers-writer lock holding an
//! `Arc`: request handlers clone the `Arc` under the shared lock, the
//! reloader swaps in a fresh snapshot under the exclusive lock. A request
//! therefore either sees the whole old set or the whole new set, never a
//! mixture.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::cache::DecisionCache;
use crate::config::Config;
use crate::engine::TemplateEngine;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::rules::EndpointSnapshot;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    snapshot: Arc<RwLock<Arc<EndpointSnapshot>>>,
    cache: Arc<DecisionCache>,
    pipeline: Arc<Pipeline>,
    metrics: Arc<Metrics>,
    environment: Arc<BTreeMap<String, String>>,
    secrets: Arc<BTreeMap<String, String>>,
}

impl AppState {
    /// Build the full application state from validated configuration
    ///
    /// Resolves environment and secret variables (startup-fatal when
    /// missing), connects the cache backend, compiles the initial endpoint
    /// snapshot, and assembles the pipeline.
    pub async fn build(config: Config) -> Result<Self> {
        config.validate()?;

        let environment = Arc::new(config.resolve_environment()?);
        let secrets = Arc::new(config.resolve_secrets()?);

        let metrics = Arc::new(Metrics::new());
        let templates = TemplateEngine::new(&config.server.templates)?;
        let cache =
            Arc::new(DecisionCache::from_config(&config.server.cache, metrics.clone()).await?);

        let snapshot = EndpointSnapshot::build(&config, &templates)?;
        tracing::info!(
            endpoints = snapshot.endpoints.len(),
            skipped = snapshot.skipped.len(),
            using_fallback = snapshot.using_fallback,
            "endpoint snapshot compiled"
        );

        let pipeline = Arc::new(Pipeline::new(
            &config,
            templates,
            cache.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            snapshot: Arc::new(RwLock::new(Arc::new(snapshot))),
            cache,
            pipeline,
            metrics,
            environment,
            secrets,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current endpoint snapshot (cheap `Arc` clone under the shared lock)
    pub async fn snapshot(&self) -> Arc<EndpointSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// The decision cache
    pub fn cache(&self) -> &DecisionCache {
        &self.cache
    }

    /// The decision pipeline
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Metric families
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Resolved environment variables
    pub fn environment(&self) -> Arc<BTreeMap<String, String>> {
        self.environment.clone()
    }

    /// Resolved secrets
    pub fn secrets(&self) -> Arc<BTreeMap<String, String>> {
        self.secrets.clone()
    }

    /// Lowercased correlation header name
    pub fn correlation_header(&self) -> String {
        self.config
            .server
            .logging
            .correlation_header
            .to_ascii_lowercase()
    }

    /// Hot-reload the rule bundle
    ///
    /// Recompiles the snapshot from the configured sources, bumps the cache
    /// epoch, swaps the snapshot atomically, and purges the stale epoch
    /// across both tiers. On failure the previous snapshot keeps serving.
    pub async fn reload(&self) -> Result<()> {
        let rebuilt = EndpointSnapshot::build(&self.config, self.pipeline.templates())?;
        tracing::info!(
            endpoints = rebuilt.endpoints.len(),
            skipped = rebuilt.skipped.len(),
            "reloaded endpoint snapshot"
        );

        let old_prefix = self.cache.advance_epoch();
        {
            let mut guard = self.snapshot.write().await;
            *guard = Arc::new(rebuilt);
        }
        self.cache.purge_prefix(&old_prefix).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{EndpointDoc, RuleDoc};

    fn config() -> Config {
        let mut config = Config::default();
        let mut rule = RuleDoc::default();
        rule.conditions.pass = vec!["true".into()];
        config.rules.insert("allow-all".into(), rule);
        let mut endpoint = EndpointDoc::default();
        endpoint.rules = vec!["allow-all".into()];
        config.endpoints.insert("default".into(), endpoint);
        config
    }

    #[tokio::test]
    async fn test_build_and_snapshot() {
        let state = AppState::build(config()).await.unwrap();
        let snapshot = state.snapshot().await;
        assert!(snapshot.resolve(Some("default")).is_some());
        assert!(!snapshot.degraded());
    }

    #[tokio::test]
    async fn test_reload_bumps_epoch_and_swaps_snapshot() {
        let state = AppState::build(config()).await.unwrap();
        let before = state.cache().epoch();
        let old_snapshot = state.snapshot().await;

        state.reload().await.unwrap();

        assert_eq!(state.cache().epoch(), before + 1);
        let after = state.snapshot().await;
        assert!(!Arc::ptr_eq(&old_snapshot, &after));
        assert!(after.resolve(Some("default")).is_some());
    }
}
