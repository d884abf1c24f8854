//! Effective-TTL computation for cacheable outcomes
//!
//! The TTL for a decision is selected by precedence and then clamped by
//! every non-zero ceiling above it:
//!
//! 1. `error` outcomes are never cached.
//! 2. With `followCacheControl`, a backend `Cache-Control` header decides:
//!    `no-cache` / `no-store` / `private` forbid caching; `s-maxage`
//!    (preferred) or `max-age` supply the TTL.
//! 3. Otherwise the rule's manual TTL for the outcome.
//! 4. Otherwise the endpoint's per-outcome ceiling.
//! 5. Otherwise the server-wide maximum.
//!
//! A zero at the selected stage short-circuits to "don't cache".

use crate::pipeline::state::Outcome;

/// Parsed subset of a `Cache-Control` response header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `no-cache`, `no-store`, or `private` was present
    pub forbid: bool,

    /// `max-age=<secs>`
    pub max_age: Option<u64>,

    /// `s-maxage=<secs>`
    pub s_maxage: Option<u64>,
}

/// Parse the directives relevant to decision caching
pub fn parse_cache_control(header: &str) -> CacheControl {
    let mut parsed = CacheControl::default();
    for directive in header.split(',') {
        let directive = directive.trim();
        let (name, value) = match directive.split_once('=') {
            Some((n, v)) => (n.trim(), Some(v.trim().trim_matches('"'))),
            None => (directive, None),
        };
        match name.to_ascii_lowercase().as_str() {
            "no-cache" | "no-store" | "private" => parsed.forbid = true,
            "max-age" => parsed.max_age = value.and_then(|v| v.parse().ok()),
            "s-maxage" => parsed.s_maxage = value.and_then(|v| v.parse().ok()),
            _ => {}
        }
    }
    parsed
}

/// Inputs to the TTL decision
#[derive(Debug, Clone, Copy, Default)]
pub struct TtlInputs<'a> {
    /// Outcome being stored
    pub outcome: Outcome,

    /// Backend `Cache-Control` header, when one was observed
    pub cache_control: Option<&'a str>,

    /// The rule opted into honoring `Cache-Control`
    pub follow_cache_control: bool,

    /// Rule manual TTL for this outcome, seconds
    pub rule_ttl: Option<u64>,

    /// Endpoint ceiling for this outcome, seconds
    pub endpoint_ttl: Option<u64>,

    /// Server-wide maximum, seconds
    pub server_max: u64,
}

/// Compute the effective TTL in seconds; 0 means "don't cache"
pub fn effective_ttl(inputs: TtlInputs<'_>) -> u64 {
    if !inputs.outcome.is_cacheable() {
        return 0;
    }

    let from_header = if inputs.follow_cache_control {
        match inputs.cache_control.map(parse_cache_control) {
            Some(cc) if cc.forbid => return 0,
            Some(cc) => cc.s_maxage.or(cc.max_age),
            None => None,
        }
    } else {
        None
    };

    let selected = from_header
        .or(inputs.rule_ttl)
        .or(inputs.endpoint_ttl)
        .unwrap_or(inputs.server_max);
    if selected == 0 {
        return 0;
    }

    let mut ttl = selected;
    if let Some(ceiling) = inputs.endpoint_ttl.filter(|c| *c > 0) {
        ttl = ttl.min(ceiling);
    }
    if inputs.server_max > 0 {
        ttl = ttl.min(inputs.server_max);
    }
    ttl
}
