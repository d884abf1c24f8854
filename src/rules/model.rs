//! Raw (pre-compilation) rule and endpoint documents
//!
//! These are the serde shapes of `rules.*` and `endpoints.*` sections,
//! whether declared inline in the server config or loaded from the rules
//! folder/file. Expression-valued fields are plain strings here; dialect
//! detection and compilation happen in [`crate::rules::compile`].

use indexmap::IndexMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A rule document as authored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDoc {
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,

    /// Ordered credential match groups; first matching group wins
    #[serde(default)]
    pub auth: Vec<MatchGroupDoc>,

    /// Backend request descriptor (templated)
    #[serde(default)]
    pub backend_api: Option<BackendApiDoc>,

    /// Outcome condition expressions
    #[serde(default)]
    pub conditions: ConditionsDoc,

    /// Outcome-scoped response header templates
    #[serde(default)]
    pub responses: RuleResponsesDoc,

    /// Local and exported variable expressions
    #[serde(default)]
    pub variables: RuleVariablesDoc,

    /// Rule cache policy
    #[serde(default)]
    pub cache: RuleCacheDoc,
}

/// One credential match group: every matcher must find a non-empty value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchGroupDoc {
    /// Matchers that must all succeed for the group to win
    #[serde(default)]
    pub matchers: Vec<MatcherDoc>,

    /// Credential payload templates applied when the group wins
    #[serde(default)]
    pub forward_as: ForwardAsDoc,
}

/// A single credential matcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatcherDoc {
    /// Matcher kind
    #[serde(rename = "type")]
    pub kind: MatcherKind,

    /// Header or query parameter name (required for `header`/`query`)
    #[serde(default)]
    pub name: Option<String>,
}

/// Credential source kinds a matcher can read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherKind {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `Authorization: Basic <credentials>`
    Basic,
    /// A named request header
    Header,
    /// A named query parameter
    Query,
}

/// Credential payload rendered when a match group wins
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardAsDoc {
    /// Header name → value template
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Query parameter name → value template
    #[serde(default)]
    pub query: BTreeMap<String, String>,
}

/// Backend request descriptor; every value is a template or expression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendApiDoc {
    /// HTTP method
    #[serde(default = "default_method")]
    pub method: String,

    /// Request URL template
    pub url: String,

    /// Header name → value template
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Query parameter name → value template
    #[serde(default)]
    pub query: BTreeMap<String, String>,

    /// Inline body template
    #[serde(default)]
    pub body: Option<String>,

    /// Body file path template, resolved inside the template sandbox
    #[serde(default)]
    pub body_file: Option<String>,

    /// Status codes treated as accepted
    #[serde(default = "default_accepted_status")]
    pub accepted_status: Vec<u16>,

    /// Pagination behaviour
    #[serde(default)]
    pub pagination: Option<PaginationDoc>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_accepted_status() -> Vec<u16> {
    vec![200]
}

/// Pagination hints for a backend call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationDoc {
    /// Pagination mode; only `link-header` is supported
    #[serde(rename = "type")]
    pub kind: PaginationKind,

    /// Maximum number of pages to fetch
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

/// Supported pagination modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaginationKind {
    /// Follow `Link: <url>; rel="next"` response headers
    #[serde(rename = "link-header")]
    LinkHeader,
}

fn default_max_pages() -> usize {
    5
}

/// Outcome condition expression lists, evaluated error > fail > pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionsDoc {
    /// Expressions that produce a `pass` outcome
    #[serde(default)]
    pub pass: Vec<String>,

    /// Expressions that produce a `fail` outcome
    #[serde(default)]
    pub fail: Vec<String>,

    /// Expressions that produce an `error` outcome
    #[serde(default)]
    pub error: Vec<String>,

    /// Accept a rule with match groups but no matching group instead of erroring
    #[serde(default)]
    pub accept_no_match: bool,
}

/// Outcome-scoped response header templates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResponsesDoc {
    /// Headers merged into the response on `pass`
    #[serde(default)]
    pub pass: BTreeMap<String, String>,

    /// Headers merged into the response on `fail`
    #[serde(default)]
    pub fail: BTreeMap<String, String>,

    /// Headers merged into the response on `error`
    #[serde(default)]
    pub error: BTreeMap<String, String>,
}

/// Local and exported variable expressions, in declaration order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleVariablesDoc {
    /// Variables visible only inside this rule's conditions
    #[serde(default)]
    pub local: IndexMap<String, String>,

    /// Variables exported to later rules under `vars.rule[<name>]`
    #[serde(default)]
    pub export: IndexMap<String, String>,
}

/// Rule cache policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCacheDoc {
    /// Honor backend `Cache-Control` response headers
    #[serde(default)]
    pub follow_cache_control: bool,

    /// Manual TTL in seconds for `pass` outcomes
    #[serde(default)]
    pub pass_ttl: Option<u64>,

    /// Manual TTL in seconds for `fail` outcomes
    #[serde(default)]
    pub fail_ttl: Option<u64>,

    /// Include the upstream-variables hash in the Tier-1 key
    #[serde(default = "default_strict")]
    pub strict: bool,
}

impl Default for RuleCacheDoc {
    fn default() -> Self {
        Self {
            follow_cache_control: false,
            pass_ttl: None,
            fail_ttl: None,
            strict: default_strict(),
        }
    }
}

fn default_strict() -> bool {
    true
}

/// An endpoint document as authored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDoc {
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,

    /// Endpoint variables, evaluated in declaration order into `variables.global`
    #[serde(default)]
    pub variables: IndexMap<String, String>,

    /// Admission configuration
    #[serde(default)]
    pub authentication: AuthenticationDoc,

    /// Proxy trust and header forwarding policy
    #[serde(default)]
    pub forward_proxy_policy: ForwardProxyPolicyDoc,

    /// Curation of the request view forwarded to rule backends
    #[serde(default)]
    pub forward_request_policy: ForwardRequestPolicyDoc,

    /// Ordered rule references
    #[serde(default)]
    pub rules: Vec<String>,

    /// Per-outcome response templates
    #[serde(default)]
    pub response_policy: ResponsePolicyDoc,

    /// Per-outcome TTL ceilings
    #[serde(default)]
    pub cache: EndpointCacheDoc,
}

/// Admission configuration for an endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationDoc {
    /// Whether a credential is required for admission
    #[serde(default)]
    pub required: bool,

    /// Permitted credential sources, walked in order
    #[serde(default)]
    pub allow: Vec<AllowSourceDoc>,

    /// Challenge metadata for 401 responses
    #[serde(default)]
    pub challenge: ChallengeDoc,
}

/// One permitted credential source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowSourceDoc {
    /// Source kind
    #[serde(rename = "type")]
    pub kind: AllowSourceKind,

    /// Header or query parameter name (required for `header`/`query`)
    #[serde(default)]
    pub name: Option<String>,
}

/// Kinds of credential sources an endpoint can permit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowSourceKind {
    /// The `Authorization` header (bearer or basic)
    Authorization,
    /// A named request header
    Header,
    /// A named query parameter
    Query,
    /// Anonymous requests are admitted
    None,
}

/// `WWW-Authenticate` challenge metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeDoc {
    /// Challenge scheme: "basic" or "bearer"
    #[serde(default = "default_challenge_scheme")]
    pub scheme: String,

    /// Realm attribute
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Optional charset attribute (basic only)
    #[serde(default)]
    pub charset: Option<String>,
}

impl Default for ChallengeDoc {
    fn default() -> Self {
        Self {
            scheme: default_challenge_scheme(),
            realm: default_realm(),
            charset: None,
        }
    }
}

fn default_challenge_scheme() -> String {
    "bearer".to_string()
}

fn default_realm() -> String {
    "passctrl".to_string()
}

/// Proxy trust and proxy-header forwarding policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardProxyPolicyDoc {
    /// CIDRs of proxies whose forwarding metadata is trusted
    #[serde(default)]
    pub trusted_proxies: Vec<IpNet>,

    /// Forward proxy metadata headers (`forwarded`, `x-forwarded-*`) downstream
    #[serde(default)]
    pub forward_proxy_headers: bool,

    /// Development mode: forwarding inconsistencies strip-and-annotate instead of failing
    #[serde(default)]
    pub development_mode: bool,
}

/// Curation of the request view forwarded to rule backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequestPolicyDoc {
    /// When non-empty, only these headers survive into the curated view
    #[serde(default)]
    pub allow_headers: Vec<String>,

    /// Headers removed from the curated view
    #[serde(default)]
    pub strip_headers: Vec<String>,
}

/// Per-outcome response templates
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePolicyDoc {
    /// Rendering for `pass` outcomes
    #[serde(default)]
    pub pass: ResponseCategoryDoc,

    /// Rendering for `fail` outcomes
    #[serde(default)]
    pub fail: ResponseCategoryDoc,

    /// Rendering for `error` outcomes
    #[serde(default)]
    pub error: ResponseCategoryDoc,
}

/// Response rendering for a single outcome category
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseCategoryDoc {
    /// Status code override
    #[serde(default)]
    pub status: Option<u16>,

    /// Inline body template
    #[serde(default)]
    pub body: Option<String>,

    /// Body file path template, resolved inside the template sandbox
    #[serde(default)]
    pub body_file: Option<String>,

    /// Header shaping for this category
    #[serde(default)]
    pub headers: HeaderShapingDoc,
}

/// Allow / strip / custom header shaping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderShapingDoc {
    /// When non-empty, only these response headers survive
    #[serde(default)]
    pub allow: Vec<String>,

    /// Response headers removed
    #[serde(default)]
    pub strip: Vec<String>,

    /// Header name → value template merged last; empty render removes the header
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

/// Per-outcome TTL ceilings for an endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCacheDoc {
    /// Ceiling in seconds for cached `pass` decisions
    #[serde(default)]
    pub pass_ttl: Option<u64>,

    /// Ceiling in seconds for cached `fail` decisions
    #[serde(default)]
    pub fail_ttl: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_doc_from_yaml() {
        let doc: RuleDoc = serde_yaml_compat(
            r#"
description: team membership check
auth:
  - matchers:
      - type: bearer
    forwardAs:
      headers:
        authorization: "Bearer {{ vars.local.token }}"
backendApi:
  method: GET
  url: "https://api.example.com/user"
  acceptedStatus: [200, 404]
  pagination:
    type: link-header
    maxPages: 3
conditions:
  pass: ["backend.status == 200"]
  fail: ["backend.status == 404"]
cache:
  followCacheControl: true
  passTtl: 120
"#,
        );
        assert_eq!(doc.auth.len(), 1);
        assert_eq!(doc.auth[0].matchers[0].kind, MatcherKind::Bearer);
        let api = doc.backend_api.unwrap();
        assert_eq!(api.accepted_status, vec![200, 404]);
        assert_eq!(api.pagination.unwrap().max_pages, 3);
        assert!(doc.cache.follow_cache_control);
        assert_eq!(doc.cache.pass_ttl, Some(120));
        assert!(doc.cache.strict);
    }

    #[test]
    fn test_endpoint_doc_from_yaml() {
        let doc: EndpointDoc = serde_yaml_compat(
            r#"
variables:
  tier_value: variables.environment.TIER
  support_email: "{{ variables.environment.SUPPORT_EMAIL }}"
authentication:
  required: true
  allow:
    - type: authorization
    - type: header
      name: x-api-key
forwardProxyPolicy:
  trustedProxies: ["10.0.0.0/8"]
rules: [check-team]
responsePolicy:
  pass:
    status: 200
    body: "integration ok"
    headers:
      custom:
        X-Test: integration
"#,
        );
        // Declaration order is preserved for endpoint variables.
        let names: Vec<&str> = doc.variables.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["tier_value", "support_email"]);
        assert!(doc.authentication.required);
        assert_eq!(doc.authentication.allow.len(), 2);
        assert_eq!(doc.rules, vec!["check-team"]);
        assert_eq!(doc.response_policy.pass.status, Some(200));
    }

    #[test]
    fn test_backend_api_defaults() {
        let api: BackendApiDoc =
            serde_yaml_compat("url: \"https://api.example.com/check\"");
        assert_eq!(api.method, "GET");
        assert_eq!(api.accepted_status, vec![200]);
        assert!(api.pagination.is_none());
    }

    fn serde_yaml_compat<T: serde::de::DeserializeOwned>(yaml: &str) -> T {
        serde_yaml::from_str(yaml).expect("document parses")
    }
}
