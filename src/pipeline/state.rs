//! Per-request evaluation state threaded through the pipeline agents
//!
//! Each agent reads fields produced by earlier agents and writes a disjoint
//! subset. `raw` and `admission` are never mutated after their writing agent
//! returns. Map-shaped fields are `BTreeMap` so iteration order — and with it
//! cache-key computation — is deterministic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Immutable request facts captured at pipeline entry
#[derive(Debug, Clone, Default, Serialize)]
pub struct RawRequest {
    /// HTTP method, uppercased
    pub method: String,

    /// Request path as received by the proxy sub-request
    pub path: String,

    /// Host header value
    pub host: String,

    /// Headers: lowercased keys, first value only
    pub headers: BTreeMap<String, String>,

    /// Query parameters: lowercased keys, first value only
    pub query: BTreeMap<String, String>,

    /// Correlation ID (request header or generated)
    pub correlation_id: String,
}

/// Admission agent output
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdmissionState {
    /// Whether the request is admitted as authenticated
    pub authenticated: bool,

    /// Human-readable admission reason
    pub reason: String,

    /// Normalized client IP
    pub client_ip: String,

    /// The remote peer matched a trusted proxy CIDR
    pub trusted_proxy: bool,

    /// Proxy metadata was stripped (development-mode annotation)
    pub proxy_stripped: bool,

    /// First hop from `X-Forwarded-For`, when trusted
    pub forwarded_for: String,

    /// First `for=` element from RFC 7239 `Forwarded`, when trusted
    pub forwarded: String,

    /// Admission decision: "admit", "deny", or "strip"
    pub decision: String,

    /// The credential source that satisfied admission, e.g. "authorization",
    /// "header:x-api-key", "query:token", or "none"
    pub source: String,
}

/// Curated request view produced by the Forward Policy agent
///
/// This is the view rule backends observe; rule execution strips credential
/// source names from it before any backend call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ForwardState {
    /// Curated headers (lowercased keys)
    pub headers: BTreeMap<String, String>,

    /// Curated query parameters (lowercased keys)
    pub query: BTreeMap<String, String>,
}

/// Variable scopes visible to expressions and templates
#[derive(Debug, Clone, Default)]
pub struct VariableScopes {
    /// Process-wide environment-sourced variables (read-only)
    pub environment: Arc<BTreeMap<String, String>>,

    /// Process-wide secret-sourced variables (read-only)
    pub secrets: Arc<BTreeMap<String, String>>,

    /// Endpoint-level variables, filled once per request
    pub global: BTreeMap<String, Value>,

    /// Per-rule local variables; cleared between rules
    pub local: BTreeMap<String, Value>,

    /// Exports of completed rules, keyed by rule name
    pub rule: BTreeMap<String, BTreeMap<String, Value>>,
}

/// One fetched backend page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSnapshot {
    /// Fetched URL
    pub url: String,

    /// Response status
    pub status: u16,

    /// Response headers (lowercased keys, first value only)
    pub headers: BTreeMap<String, String>,

    /// Parsed JSON body (`null` for non-JSON responses)
    pub body: Value,

    /// Raw body text, capped at 1 MiB
    pub body_text: String,

    /// Status was in the accepted set
    pub accepted: bool,
}

/// Backend Interaction output; scalar fields reflect the last page
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendState {
    /// A backend call was made for the current rule
    pub requested: bool,

    /// Last page status (0 when no call was made)
    pub status: u16,

    /// Last page headers
    pub headers: BTreeMap<String, String>,

    /// Last page parsed JSON body
    pub body: Value,

    /// Last page body text
    pub body_text: String,

    /// Last page status was in the accepted set
    pub accepted: bool,

    /// Network/read/decode failure, when one occurred
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Snapshot per fetched page
    pub pages: Vec<PageSnapshot>,
}

/// Terminal outcome of a rule or of the whole chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// No terminal outcome yet
    #[default]
    #[serde(rename = "")]
    None,
    /// Admit the original request
    Pass,
    /// Deny the original request
    Fail,
    /// Evaluation failed; never cached
    Error,
}

impl Outcome {
    /// String form used in logs, metrics labels, and cache payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::None => "",
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Error => "error",
        }
    }

    /// A pass/fail/error outcome has been reached
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::None)
    }

    /// Only pass and fail decisions are cacheable
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Outcome::Pass | Outcome::Fail)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// History record of one executed rule
#[derive(Debug, Clone, Serialize)]
pub struct RuleRecord {
    /// Rule name
    pub name: String,

    /// Outcome the rule produced (may be empty)
    pub outcome: Outcome,

    /// Reason string
    pub reason: String,

    /// Wall time spent in the rule, milliseconds
    pub duration_ms: u64,

    /// Variables the rule exported
    pub exports: BTreeMap<String, Value>,

    /// The record was replayed from the Tier-1 cache
    pub from_cache: bool,
}

/// Rule-chain output
#[derive(Debug, Clone, Default)]
pub struct RuleState {
    /// Final chain outcome
    pub outcome: Outcome,

    /// Reason attached to the final outcome
    pub reason: String,

    /// At least one rule executed without error
    pub executed: bool,

    /// The deciding rule result came from the Tier-1 cache
    pub from_cache: bool,

    /// Per-rule execution history, in chain order
    pub history: Vec<RuleRecord>,
}

impl RuleState {
    /// Transition the chain outcome; once terminal it never changes
    pub fn settle(&mut self, outcome: Outcome, reason: impl Into<String>) {
        if self.outcome.is_terminal() {
            return;
        }
        self.outcome = outcome;
        self.reason = reason.into();
    }
}

/// Decision-cache bookkeeping for the request
#[derive(Debug, Clone, Default)]
pub struct CacheState {
    /// Tier-2 base key (empty when caching is unavailable)
    pub key: String,

    /// The request was answered from the Tier-2 cache
    pub hit: bool,

    /// The decision was stored into the Tier-2 cache
    pub stored: bool,

    /// Outcome string of the replayed decision
    pub decision: String,

    /// Store time of the replayed entry
    pub stored_at: Option<DateTime<Utc>>,

    /// Expiry of the replayed entry
    pub expires_at: Option<DateTime<Utc>>,
}

/// Response under construction
#[derive(Debug, Clone, Default)]
pub struct ResponseState {
    /// Status code; 0 means "not rendered yet" (a non-zero value at Response
    /// Policy entry signals a cache replay that must not be re-rendered)
    pub status: u16,

    /// Response headers; later writers overwrite earlier ones
    pub headers: BTreeMap<String, String>,

    /// Response body
    pub message: String,
}

/// The per-request record threaded through all agents
#[derive(Debug, Clone, Default)]
pub struct RequestState {
    /// Immutable request input
    pub raw: RawRequest,

    /// Admission agent output
    pub admission: AdmissionState,

    /// Curated request view
    pub forward: ForwardState,

    /// Variable scopes
    pub variables: VariableScopes,

    /// Backend interaction output
    pub backend: BackendState,

    /// Rule-chain output
    pub rule: RuleState,

    /// Cache bookkeeping
    pub cache: CacheState,

    /// Response under construction
    pub response: ResponseState,

    /// Endpoint name serving this request
    pub endpoint: String,

    /// Correlation ID for logging
    pub correlation_id: String,
}

impl RequestState {
    /// Create a fresh state for one request
    pub fn new(
        raw: RawRequest,
        endpoint: impl Into<String>,
        environment: Arc<BTreeMap<String, String>>,
        secrets: Arc<BTreeMap<String, String>>,
    ) -> Self {
        let correlation_id = raw.correlation_id.clone();
        Self {
            raw,
            variables: VariableScopes {
                environment,
                secrets,
                ..VariableScopes::default()
            },
            endpoint: endpoint.into(),
            correlation_id,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_transitions_are_monotone() {
        let mut rule = RuleState::default();
        assert!(!rule.outcome.is_terminal());

        rule.settle(Outcome::Fail, "quota exceeded");
        assert_eq!(rule.outcome, Outcome::Fail);

        // A later settle does not overwrite the terminal outcome.
        rule.settle(Outcome::Pass, "should not apply");
        assert_eq!(rule.outcome, Outcome::Fail);
        assert_eq!(rule.reason, "quota exceeded");
    }

    #[test]
    fn test_outcome_cacheability() {
        assert!(Outcome::Pass.is_cacheable());
        assert!(Outcome::Fail.is_cacheable());
        assert!(!Outcome::Error.is_cacheable());
        assert!(!Outcome::None.is_cacheable());
    }

    #[test]
    fn test_outcome_serializes_as_lowercase_string() {
        assert_eq!(serde_json::to_string(&Outcome::Pass).unwrap(), "\"pass\"");
        assert_eq!(serde_json::to_string(&Outcome::None).unwrap(), "\"\"");
    }

    #[test]
    fn test_new_state_carries_correlation_id() {
        let raw = RawRequest {
            method: "GET".into(),
            correlation_id: "abc-123".into(),
            ..RawRequest::default()
        };
        let state = RequestState::new(
            raw,
            "default",
            Arc::new(BTreeMap::new()),
            Arc::new(BTreeMap::new()),
        );
        assert_eq!(state.correlation_id, "abc-123");
        assert_eq!(state.endpoint, "default");
        assert_eq!(state.response.status, 0);
    }
}
