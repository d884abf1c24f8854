//! The nine-stage decision pipeline
//!
//! A fixed agent sequence over one [`RequestState`]: admission, forward
//! policy, endpoint variables, rule chain (with per-rule execution and
//! backend interaction), response policy, result caching. Data flow is
//! strictly forward; agents write disjoint state and never unwind on
//! recoverable failures — they record an outcome and reason instead.
//!
//! The Tier-2 lookup runs as soon as the base key is computable (after the
//! forward-policy agent); a hit replays the stored decision verbatim and
//! skips every later agent.

pub mod admission;
pub mod backend;
pub mod chain;
pub mod forward;
pub mod response;
pub mod rule_exec;
pub mod state;
pub mod variables;

use chrono::Utc;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{key, CachedDecision, DecisionCache};
use crate::config::Config;
use crate::engine::TemplateEngine;
use crate::metrics::Metrics;
use crate::pipeline::admission::AdmissionFailure;
use crate::pipeline::backend::BackendExecutor;
use crate::pipeline::rule_exec::ChainContext;
use crate::pipeline::state::{Outcome, RequestState};
use crate::rules::compile::EndpointDefinition;

/// The pipeline with its shared collaborators
pub struct Pipeline {
    templates: TemplateEngine,
    cache: Arc<DecisionCache>,
    executor: BackendExecutor,
    metrics: Arc<Metrics>,
    key_salt: String,
    server_max_ttl: u64,
}

impl Pipeline {
    /// Assemble the pipeline from configuration and shared collaborators
    pub fn new(
        config: &Config,
        templates: TemplateEngine,
        cache: Arc<DecisionCache>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            templates,
            cache,
            executor: BackendExecutor::new(config.backend_timeout()),
            metrics,
            key_salt: config.server.cache.key_salt.clone(),
            server_max_ttl: config.server.cache.ttl_seconds,
        }
    }

    /// The template engine shared with snapshot compilation
    pub fn templates(&self) -> &TemplateEngine {
        &self.templates
    }

    /// Evaluate one request against an endpoint
    pub async fn execute(
        &self,
        state: &mut RequestState,
        endpoint: &EndpointDefinition,
        peer: IpAddr,
    ) {
        let started = Instant::now();

        // 1. Admission.
        let admission_failure = admission::run(state, endpoint, peer);
        if let Some(failure) = admission_failure {
            let outcome = match failure {
                AdmissionFailure::Forwarding => Outcome::Error,
                AdmissionFailure::Credentials => Outcome::Fail,
            };
            state.rule.settle(outcome, state.admission.reason.clone());
            response::run(state, endpoint, &self.templates);
            self.observe(state, started);
            return;
        }

        // 2. Forward policy, then the base key becomes computable.
        forward::run(state, endpoint);
        state.cache.key = key::base_key(&endpoint.name, &state.raw, &state.forward, &self.key_salt);

        // Anonymous admission collapses the key across unrelated clients, so
        // Tier-2 is disabled for endpoints that allow `none`.
        let cacheable_endpoint =
            !endpoint.authentication.allows_none() && !state.cache.key.is_empty();

        // Tier-2 lookup; a hit short-circuits agents 3 onward.
        if cacheable_endpoint {
            if let Some(hit) = self
                .cache
                .lookup_decision(&endpoint.name, &state.cache.key)
                .await
            {
                state.cache.hit = true;
                state.cache.decision = hit.outcome.as_str().to_string();
                state.cache.stored_at = Some(hit.stored_at);
                state.cache.expires_at = Some(hit.expires_at);
                state.rule.settle(hit.outcome, "decision cache replay");
                state.response.status = hit.status;
                state.response.headers = hit.headers;
                state.response.message = hit.body;
                response::run(state, endpoint, &self.templates);
                self.observe(state, started);
                return;
            }
        }

        // 3. Endpoint variables.
        variables::run(state, endpoint, &self.templates);

        // 4–6. Rule chain with per-rule execution and backend interaction.
        let base_key = if cacheable_endpoint {
            state.cache.key.clone()
        } else {
            String::new()
        };
        let ctx = ChainContext {
            endpoint,
            templates: &self.templates,
            cache: &self.cache,
            executor: &self.executor,
            base_key: &base_key,
            server_max_ttl: self.server_max_ttl,
        };
        chain::run(state, &ctx).await;

        // 7. Response policy.
        response::run(state, endpoint, &self.templates);

        // 8. Result caching.
        if cacheable_endpoint && state.rule.outcome.is_cacheable() {
            self.store_decision(state, endpoint).await;
        }

        self.observe(state, started);
    }

    /// Store the rendered decision as a Tier-2 entry
    async fn store_decision(&self, state: &mut RequestState, endpoint: &EndpointDefinition) {
        let deciding_rule = state
            .rule
            .history
            .last()
            .and_then(|record| endpoint.rules.iter().find(|r| r.name == record.name));

        let ttl = crate::cache::ttl::effective_ttl(crate::cache::ttl::TtlInputs {
            outcome: state.rule.outcome,
            cache_control: state
                .backend
                .headers
                .get("cache-control")
                .map(String::as_str),
            follow_cache_control: deciding_rule
                .map(|r| r.cache.follow_cache_control)
                .unwrap_or(false),
            rule_ttl: deciding_rule.and_then(|r| match state.rule.outcome {
                Outcome::Pass => r.cache.pass_ttl,
                Outcome::Fail => r.cache.fail_ttl,
                _ => None,
            }),
            endpoint_ttl: match state.rule.outcome {
                Outcome::Pass => endpoint.cache.pass_ttl,
                Outcome::Fail => endpoint.cache.fail_ttl,
                _ => None,
            },
            server_max: self.server_max_ttl,
        });
        if ttl == 0 {
            return;
        }

        let now = Utc::now();
        let entry = CachedDecision {
            outcome: state.rule.outcome,
            status: state.response.status,
            headers: state.response.headers.clone(),
            body: state.response.message.clone(),
            stored_at: now,
            expires_at: now + chrono::Duration::seconds(ttl as i64),
        };
        state.cache.stored = self
            .cache
            .store_decision(
                &endpoint.name,
                &state.cache.key,
                &entry,
                Duration::from_secs(ttl),
            )
            .await;
    }

    fn observe(&self, state: &RequestState, started: Instant) {
        let outcome = if state.rule.outcome.is_terminal() {
            state.rule.outcome.as_str()
        } else {
            "unknown"
        };
        let status_code = state.response.status.to_string();
        self.metrics
            .auth_requests_total
            .with_label_values(&[
                state.endpoint.as_str(),
                outcome,
                status_code.as_str(),
                if state.cache.hit { "true" } else { "false" },
            ])
            .inc();
        self.metrics
            .auth_request_duration_seconds
            .with_label_values(&[state.endpoint.as_str(), outcome])
            .observe(started.elapsed().as_secs_f64());
    }
}

