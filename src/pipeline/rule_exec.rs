//! Rule Execution agent (one rule per invocation)
//!
//! Steps, in order: credential matching, backend descriptor rendering,
//! Tier-1 cache lookup, backend call, condition evaluation, variable
//! export, Tier-1 store, response header exports. Credential sources
//! declared by ANY match group are stripped from the curated view before a
//! backend call, not only the winning group's, so a later rule reusing the
//! same header cannot leak it.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::cache::key::{backend_hash, tier1_key, upstream_vars_hash, BackendDescriptor};
use crate::cache::ttl::{effective_ttl, TtlInputs};
use crate::cache::{CachedRuleResult, DecisionCache};
use crate::engine::{Activation, TemplateEngine};
use crate::error::Result;
use crate::pipeline::backend::BackendExecutor;
use crate::pipeline::state::{BackendState, Outcome, RequestState, RuleRecord};
use crate::rules::compile::{CompiledMatchGroup, EndpointDefinition, RuleDefinition};

/// Shared context for every rule of one chain run
pub struct ChainContext<'a> {
    /// Endpoint whose chain is running
    pub endpoint: &'a EndpointDefinition,

    /// Template renderer
    pub templates: &'a TemplateEngine,

    /// Decision cache (both tiers)
    pub cache: &'a DecisionCache,

    /// Backend HTTP executor
    pub executor: &'a BackendExecutor,

    /// Tier-2 base key; empty when caching is unavailable
    pub base_key: &'a str,

    /// Server-wide TTL maximum, seconds
    pub server_max_ttl: u64,
}

/// Execute one rule against the request state
pub async fn execute_rule(
    state: &mut RequestState,
    rule: &RuleDefinition,
    ctx: &ChainContext<'_>,
) {
    let started = Instant::now();
    state.variables.local.clear();
    state.backend = BackendState::default();

    // a. Credential matching; stripping is fail-closed across all groups.
    let matched_group = find_matching_group(state, rule);
    strip_credentials(state, rule);

    if !rule.match_groups.is_empty() {
        match matched_group {
            Some(index) => {
                if let Err(e) = apply_forward_as(state, &rule.match_groups[index], ctx) {
                    finish(state, rule, ctx, started, Outcome::Error,
                        format!("credential forwarding failed: {e}"), BTreeMap::new(), None).await;
                    return;
                }
            }
            None if rule.conditions.accept_no_match => {}
            None => {
                finish(state, rule, ctx, started, Outcome::Error,
                    "no credential match group matched".to_string(), BTreeMap::new(), None).await;
                return;
            }
        }
    }

    // Descriptor rendering precedes the Tier-1 lookup: the compound key
    // includes the descriptor hash.
    let descriptor = match render_descriptor(state, rule, ctx) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            finish(state, rule, ctx, started, Outcome::Error,
                format!("backend descriptor rendering failed: {e}"), BTreeMap::new(), None).await;
            return;
        }
    };

    // b. Tier-1 lookup.
    let tier1_suffix = if ctx.base_key.is_empty() {
        None
    } else {
        let bhash = backend_hash(descriptor.as_ref().unwrap_or(&BackendDescriptor::default()));
        let vhash = upstream_vars_hash(&state.variables.rule, rule.cache.strict);
        Some(tier1_key(ctx.base_key, &rule.name, &bhash, &vhash))
    };

    if let Some(suffix) = &tier1_suffix {
        if let Some(hit) = ctx.cache.lookup_rule(&ctx.endpoint.name, suffix).await {
            state
                .variables
                .rule
                .insert(rule.name.clone(), hit.exports.clone());
            for (name, value) in &hit.response_headers {
                state.response.headers.insert(name.clone(), value.clone());
            }
            state.rule.executed = true;
            if hit.outcome.is_terminal() {
                state.rule.from_cache = true;
                state.rule.settle(hit.outcome, hit.reason.clone());
            }
            state.rule.history.push(RuleRecord {
                name: rule.name.clone(),
                outcome: hit.outcome,
                reason: hit.reason,
                duration_ms: elapsed_ms(started),
                exports: hit.exports,
                from_cache: true,
            });
            state.variables.local.clear();
            return;
        }
    }

    // c. Backend call.
    if let Some(descriptor) = &descriptor {
        let api = rule.backend.as_ref().expect("descriptor implies backend");
        state.backend.requested = true;
        let result = ctx
            .executor
            .execute(descriptor, &api.accepted_status, api.pagination)
            .await;

        state.backend.pages = result.pages;
        if let Some(last) = state.backend.pages.last() {
            state.backend.status = last.status;
            state.backend.headers = last.headers.clone();
            state.backend.body = last.body.clone();
            state.backend.body_text = last.body_text.clone();
            state.backend.accepted = last.accepted;
        }
        state.backend.error = result.error;
    }

    let (mut outcome, mut reason) = if let Some(error) = state.backend.error.clone() {
        (Outcome::Error, format!("backend error: {error}"))
    } else {
        evaluate_locals(state, rule, ctx);
        // d. Condition evaluation, error > fail > pass.
        evaluate_conditions(state, rule, ctx)
    };

    // e. Variable export. A failing export downgrades a pass to an error.
    let mut exports = BTreeMap::new();
    if outcome != Outcome::Error {
        match evaluate_exports(state, rule, ctx) {
            Ok(map) => exports = map,
            Err(e) => {
                if outcome == Outcome::Pass {
                    outcome = Outcome::Error;
                    reason = format!("variable export failed: {e}");
                } else {
                    tracing::warn!(
                        rule = %rule.name,
                        correlation_id = %state.correlation_id,
                        "variable export failed on non-pass outcome: {e}"
                    );
                }
            }
        }
    }

    finish(state, rule, ctx, started, outcome, reason, exports, tier1_suffix).await;
}

/// Steps f–g plus bookkeeping, shared by every exit path
#[allow(clippy::too_many_arguments)]
async fn finish(
    state: &mut RequestState,
    rule: &RuleDefinition,
    ctx: &ChainContext<'_>,
    started: Instant,
    outcome: Outcome,
    reason: String,
    exports: BTreeMap<String, Value>,
    tier1_suffix: Option<String>,
) {
    state
        .variables
        .rule
        .insert(rule.name.clone(), exports.clone());

    // g. Response header exports, rendered before the Tier-1 store so they
    // replay from cache.
    let response_headers = render_response_headers(state, rule, ctx, outcome);
    for (name, value) in &response_headers {
        state.response.headers.insert(name.clone(), value.clone());
    }

    // f. Tier-1 store under the same compound key the lookup used; errors
    // are never cached.
    if outcome.is_cacheable() && tier1_suffix.is_some() {
        let ttl = effective_ttl(TtlInputs {
            outcome,
            cache_control: state.backend.headers.get("cache-control").map(String::as_str),
            follow_cache_control: rule.cache.follow_cache_control,
            rule_ttl: rule_ttl(rule, outcome),
            endpoint_ttl: endpoint_ttl(ctx.endpoint, outcome),
            server_max: ctx.server_max_ttl,
        });
        if ttl > 0 {
            let suffix = tier1_suffix.expect("checked above");
            let now = Utc::now();
            let entry = CachedRuleResult {
                outcome,
                reason: reason.clone(),
                exports: exports.clone(),
                response_headers,
                stored_at: now,
                expires_at: now + chrono::Duration::seconds(ttl as i64),
            };
            ctx.cache
                .store_rule(&ctx.endpoint.name, &suffix, &entry, Duration::from_secs(ttl))
                .await;
        }
    }

    state.rule.executed = true;
    if outcome.is_terminal() {
        state.rule.settle(outcome, reason.clone());
    }
    state.rule.history.push(RuleRecord {
        name: rule.name.clone(),
        outcome,
        reason,
        duration_ms: elapsed_ms(started),
        exports,
        from_cache: false,
    });
    state.variables.local.clear();
}

/// First group whose matchers all find a non-empty value in `raw`
fn find_matching_group(state: &RequestState, rule: &RuleDefinition) -> Option<usize> {
    rule.match_groups.iter().position(|group| {
        group.matchers.iter().all(|matcher| {
            use crate::rules::model::MatcherKind;
            match matcher.kind {
                MatcherKind::Bearer => credential_value(state, "bearer").is_some(),
                MatcherKind::Basic => credential_value(state, "basic").is_some(),
                MatcherKind::Header => matcher
                    .name
                    .as_ref()
                    .and_then(|n| state.raw.headers.get(n))
                    .is_some_and(|v| !v.is_empty()),
                MatcherKind::Query => matcher
                    .name
                    .as_ref()
                    .and_then(|n| state.raw.query.get(n))
                    .is_some_and(|v| !v.is_empty()),
            }
        })
    })
}

/// The credential payload of an `Authorization` header with the given scheme
fn credential_value<'a>(state: &'a RequestState, scheme: &str) -> Option<&'a str> {
    let value = state.raw.headers.get("authorization")?;
    let (s, rest) = value.split_once(' ')?;
    (s.eq_ignore_ascii_case(scheme) && !rest.trim().is_empty()).then(|| rest.trim())
}

/// Remove every declared credential source from the curated view
fn strip_credentials(state: &mut RequestState, rule: &RuleDefinition) {
    let sources = &rule.credential_sources;
    if sources.authorization {
        state.forward.headers.remove("authorization");
    }
    for name in &sources.headers {
        state.forward.headers.remove(name);
    }
    for name in &sources.query {
        state.forward.query.remove(name);
    }
}

/// Render the winning group's forward-as payload into the curated view
fn apply_forward_as(
    state: &mut RequestState,
    group: &CompiledMatchGroup,
    ctx: &ChainContext<'_>,
) -> Result<()> {
    let mut headers = Vec::with_capacity(group.forward_headers.len());
    let mut query = Vec::with_capacity(group.forward_query.len());
    {
        let activation = Activation::snapshot(state);
        for (name, program) in &group.forward_headers {
            headers.push((
                name.to_ascii_lowercase(),
                program.eval_string(&activation, ctx.templates)?,
            ));
        }
        for (name, program) in &group.forward_query {
            query.push((name.clone(), program.eval_string(&activation, ctx.templates)?));
        }
    }
    for (name, value) in headers {
        state.forward.headers.insert(name, value);
    }
    for (name, value) in query {
        state.forward.query.insert(name, value);
    }
    Ok(())
}

/// Render the rule's backend descriptor, when it declares one
fn render_descriptor(
    state: &RequestState,
    rule: &RuleDefinition,
    ctx: &ChainContext<'_>,
) -> Result<Option<BackendDescriptor>> {
    let Some(api) = &rule.backend else {
        return Ok(None);
    };
    let activation = Activation::snapshot(state);

    let mut headers = BTreeMap::new();
    for (name, program) in &api.headers {
        headers.insert(
            name.to_ascii_lowercase(),
            program.eval_string(&activation, ctx.templates)?,
        );
    }

    let mut query = BTreeMap::new();
    for (name, program) in &api.query {
        query.insert(name.clone(), program.eval_string(&activation, ctx.templates)?);
    }

    let body = match (&api.body, &api.body_file) {
        (Some(body), _) => Some(body.eval_string(&activation, ctx.templates)?),
        (None, Some(path_program)) => {
            // The rendered path resolves inside the template sandbox; the
            // file content is itself a template.
            let path = path_program.eval_string(&activation, ctx.templates)?;
            let source = ctx.templates.load_file(&path)?;
            Some(ctx.templates.render(&source, &activation)?)
        }
        (None, None) => None,
    };

    Ok(Some(BackendDescriptor {
        method: api.method.clone(),
        url: api.url.eval_string(&activation, ctx.templates)?,
        headers,
        query,
        body,
    }))
}

/// Evaluate local variables, fail-soft to the empty string
fn evaluate_locals(state: &mut RequestState, rule: &RuleDefinition, ctx: &ChainContext<'_>) {
    for (name, program) in &rule.locals {
        let result = {
            let activation = Activation::snapshot(state);
            program.eval_json(&activation, ctx.templates)
        };
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    rule = %rule.name,
                    variable = %name,
                    correlation_id = %state.correlation_id,
                    "local variable evaluation failed: {e}"
                );
                Value::String(String::new())
            }
        };
        state.variables.local.insert(name.clone(), value);
    }
}

/// Evaluate the condition lists; priority is error > fail > pass
fn evaluate_conditions(
    state: &RequestState,
    rule: &RuleDefinition,
    ctx: &ChainContext<'_>,
) -> (Outcome, String) {
    let activation = Activation::snapshot(state);
    let sets = [
        (Outcome::Error, &rule.conditions.error),
        (Outcome::Fail, &rule.conditions.fail),
        (Outcome::Pass, &rule.conditions.pass),
    ];
    for (outcome, programs) in sets {
        for program in programs {
            match program.eval_bool(&activation, ctx.templates) {
                Ok(true) => {
                    return (
                        outcome,
                        format!("{} condition matched: {}", outcome, program.source()),
                    )
                }
                Ok(false) => {}
                Err(e) => {
                    return (
                        Outcome::Error,
                        format!("condition evaluation failed: {e}"),
                    )
                }
            }
        }
    }
    (Outcome::None, String::new())
}

/// Evaluate export variables; the first failure aborts
fn evaluate_exports(
    state: &RequestState,
    rule: &RuleDefinition,
    ctx: &ChainContext<'_>,
) -> Result<BTreeMap<String, Value>> {
    let activation = Activation::snapshot(state);
    let mut exports = BTreeMap::new();
    for (name, program) in &rule.exports {
        exports.insert(name.clone(), program.eval_json(&activation, ctx.templates)?);
    }
    Ok(exports)
}

/// Render outcome-scoped response headers, fail-soft per header
fn render_response_headers(
    state: &RequestState,
    rule: &RuleDefinition,
    ctx: &ChainContext<'_>,
    outcome: Outcome,
) -> BTreeMap<String, String> {
    let programs = match outcome {
        Outcome::Pass => &rule.responses.pass,
        Outcome::Fail => &rule.responses.fail,
        Outcome::Error => &rule.responses.error,
        Outcome::None => return BTreeMap::new(),
    };
    let activation = Activation::snapshot(state);
    let mut headers = BTreeMap::new();
    for (name, program) in programs {
        match program.eval_string(&activation, ctx.templates) {
            Ok(value) => {
                headers.insert(name.to_ascii_lowercase(), value);
            }
            Err(e) => {
                tracing::warn!(
                    rule = %rule.name,
                    header = %name,
                    "response header rendering failed: {e}"
                );
            }
        }
    }
    headers
}

fn rule_ttl(rule: &RuleDefinition, outcome: Outcome) -> Option<u64> {
    match outcome {
        Outcome::Pass => rule.cache.pass_ttl,
        Outcome::Fail => rule.cache.fail_ttl,
        _ => None,
    }
}

fn endpoint_ttl(endpoint: &EndpointDefinition, outcome: Outcome) -> Option<u64> {
    match outcome {
        Outcome::Pass => endpoint.cache.pass_ttl,
        Outcome::Fail => endpoint.cache.fail_ttl,
        _ => None,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
