//! Cache key construction
//!
//! Every stored key is `<namespace>:<epoch>:<suffix>`. The suffix for a
//! Tier-2 (whole-endpoint) entry is the base key alone; a Tier-1 (per-rule)
//! entry appends the rule name, the backend-descriptor hash, and the
//! upstream-variables hash:
//!
//! ```text
//! base                                 (Tier-2)
//! base|ruleName|backendHash|varsHash   (Tier-1)
//! ```
//!
//! The base key is a salted blake3 hash of the endpoint name and the request
//! fingerprint (method, path, sorted curated headers and query), so two
//! requests that are indistinguishable to the rule chain share a key. The
//! descriptor and variables hashes are 64-bit FNV-1a in hex; session-variable
//! headers (correlation, forwarding, tracing, CDN) are excluded from the
//! descriptor hash so different sessions hitting the same backend collide
//! intentionally.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::pipeline::state::{ForwardState, RawRequest};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Headers excluded from the backend-descriptor hash
///
/// These vary per session or per hop without changing what the backend
/// observes as the logical request.
pub const EXCLUDED_BACKEND_HEADERS: &[&str] = &[
    // correlation / request identity
    "x-correlation-id",
    "x-request-id",
    // forwarding metadata
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-forwarded-prefix",
    "x-real-ip",
    // tracing families
    "traceparent",
    "tracestate",
    "b3",
    "x-b3-traceid",
    "x-b3-spanid",
    "x-b3-parentspanid",
    "x-b3-sampled",
    "x-b3-flags",
    "x-amzn-trace-id",
    "x-cloud-trace-context",
    // CDN metadata
    "cf-ray",
    "cf-connecting-ip",
    "cf-ipcountry",
    "true-client-ip",
];

/// 64-bit FNV-1a over a byte stream
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Base key: salted hash of endpoint name and request fingerprint
pub fn base_key(
    endpoint: &str,
    raw: &RawRequest,
    forward: &ForwardState,
    salt: &str,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(endpoint.as_bytes());
    hasher.update(b"\n");
    hasher.update(raw.method.as_bytes());
    hasher.update(b"\n");
    hasher.update(raw.path.as_bytes());
    hasher.update(b"\n");
    for (name, value) in &forward.headers {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"\n");
    for (name, value) in &forward.query {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"\n");
    hasher.update(salt.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// A fully rendered backend request descriptor
#[derive(Debug, Clone, Default)]
pub struct BackendDescriptor {
    /// HTTP method, uppercased
    pub method: String,

    /// Request URL
    pub url: String,

    /// Rendered headers (lowercased names)
    pub headers: BTreeMap<String, String>,

    /// Rendered query parameters
    pub query: BTreeMap<String, String>,

    /// Rendered body, when one is declared
    pub body: Option<String>,
}

/// Stable hash of a backend descriptor, excluding session-variable headers
pub fn backend_hash(descriptor: &BackendDescriptor) -> String {
    let mut input = String::new();
    input.push_str(&descriptor.method);
    input.push('\n');
    input.push_str(&descriptor.url);
    input.push('\n');
    for (name, value) in &descriptor.headers {
        if EXCLUDED_BACKEND_HEADERS.contains(&name.as_str()) {
            continue;
        }
        input.push_str(name);
        input.push('=');
        input.push_str(value);
        input.push('\n');
    }
    input.push('\n');
    for (name, value) in &descriptor.query {
        input.push_str(name);
        input.push('=');
        input.push_str(value);
        input.push('\n');
    }
    input.push('\n');
    if let Some(body) = &descriptor.body {
        input.push_str(body);
    }
    format!("{:016x}", fnv1a64(input.as_bytes()))
}

/// Stable hash over the JSON-encoded exports of every earlier rule
///
/// `BTreeMap` serialization sorts keys, so the encoding is independent of
/// insertion order. Returns the empty string when strict mode is off.
pub fn upstream_vars_hash(
    exports: &BTreeMap<String, BTreeMap<String, Value>>,
    strict: bool,
) -> String {
    if !strict {
        return String::new();
    }
    let encoded = serde_json::to_string(exports).unwrap_or_default();
    format!("{:016x}", fnv1a64(encoded.as_bytes()))
}

/// Tier-1 compound key suffix
pub fn tier1_key(base: &str, rule_name: &str, backend: &str, vars: &str) -> String {
    format!("{base}|{rule_name}|{backend}|{vars}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> (RawRequest, ForwardState) {
        let mut raw = RawRequest::default();
        raw.method = "GET".into();
        raw.path = "/auth".into();
        let mut forward = ForwardState::default();
        forward.headers.insert("authorization".into(), "Bearer x".into());
        forward.query.insert("tier".into(), "premium".into());
        (raw, forward)
    }

    #[test]
    fn test_fnv1a64_known_vectors() {
        // Reference values for the 64-bit FNV-1a parameters.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_base_key_is_deterministic() {
        let (raw, forward) = request();
        let a = base_key("default", &raw, &forward, "salt");
        let b = base_key("default", &raw, &forward, "salt");
        assert_eq!(a, b);
    }

    #[test]
    fn test_base_key_varies_with_inputs() {
        let (raw, forward) = request();
        let base = base_key("default", &raw, &forward, "salt");
        assert_ne!(base, base_key("other", &raw, &forward, "salt"));
        assert_ne!(base, base_key("default", &raw, &forward, "pepper"));

        let mut other_forward = forward.clone();
        other_forward
            .headers
            .insert("authorization".into(), "Bearer y".into());
        assert_ne!(base, base_key("default", &raw, &other_forward, "salt"));
    }

    #[test]
    fn test_backend_hash_ignores_session_headers() {
        let mut descriptor = BackendDescriptor {
            method: "GET".into(),
            url: "https://api.example.com/user".into(),
            ..BackendDescriptor::default()
        };
        descriptor
            .headers
            .insert("accept".into(), "application/json".into());
        let bare = backend_hash(&descriptor);

        for name in EXCLUDED_BACKEND_HEADERS {
            descriptor
                .headers
                .insert((*name).to_string(), "varies-per-session".into());
        }
        assert_eq!(bare, backend_hash(&descriptor));

        descriptor.headers.insert("accept".into(), "text/plain".into());
        assert_ne!(bare, backend_hash(&descriptor));
    }

    #[test]
    fn test_vars_hash_is_order_independent() {
        let mut a = BTreeMap::new();
        let mut inner = BTreeMap::new();
        inner.insert("role".to_string(), json!("admin"));
        inner.insert("team".to_string(), json!("core"));
        a.insert("lookup-user".to_string(), inner);

        // Same logical content inserted in the opposite order.
        let mut b = BTreeMap::new();
        let mut inner = BTreeMap::new();
        inner.insert("team".to_string(), json!("core"));
        inner.insert("role".to_string(), json!("admin"));
        b.insert("lookup-user".to_string(), inner);

        assert_eq!(upstream_vars_hash(&a, true), upstream_vars_hash(&b, true));
    }

    #[test]
    fn test_vars_hash_empty_when_strict_off() {
        let exports = BTreeMap::new();
        assert_eq!(upstream_vars_hash(&exports, false), "");
        assert_ne!(upstream_vars_hash(&exports, true), "");
    }

    #[test]
    fn test_tier1_key_shape() {
        let key = tier1_key("base", "check-team", "abc", "def");
        assert_eq!(key, "base|check-team|abc|def");
    }
}
