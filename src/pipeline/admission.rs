//! Admission agent
//!
//! Establishes proxy trust, normalizes the client IP, and classifies
//! credentials against the endpoint's allow list. Proxy metadata
//! (`Forwarded`, `X-Forwarded-For`) is only honored when the remote peer's
//! address falls inside a trusted-proxy CIDR; when both families are present
//! they must agree on the first hop. Disagreement or malformed syntax is a
//! hard failure in production and a strip-with-annotation in development
//! mode.

use std::net::IpAddr;

use crate::rules::compile::{AllowSource, EndpointDefinition};
use crate::pipeline::state::RequestState;

/// Decision values written to `admission.decision`
pub const DECISION_ADMIT: &str = "admit";
/// The request is denied at admission
pub const DECISION_DENY: &str = "deny";
/// Proxy metadata was stripped (development mode)
pub const DECISION_STRIP: &str = "strip";

/// How admission failed, when it did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionFailure {
    /// Forwarding metadata inconsistent or malformed (maps to a 400-class error)
    Forwarding,

    /// Required credential absent or unusable (maps to 401 with a challenge)
    Credentials,
}

/// Run the admission agent; returns the failure kind on deny
pub fn run(
    state: &mut RequestState,
    endpoint: &EndpointDefinition,
    peer: IpAddr,
) -> Option<AdmissionFailure> {
    let trusted = endpoint
        .trusted_proxies
        .iter()
        .any(|net| net.contains(&peer));

    state.admission.trusted_proxy = trusted;
    state.admission.client_ip = peer.to_string();
    state.admission.decision = DECISION_ADMIT.to_string();

    if trusted {
        if let Some(failure) = apply_forwarding(state, endpoint) {
            return Some(failure);
        }
    } else if state.raw.headers.contains_key("forwarded")
        || state.raw.headers.contains_key("x-forwarded-for")
    {
        tracing::debug!(
            peer = %peer,
            "ignoring forwarding headers from untrusted peer"
        );
    }

    classify_credentials(state, endpoint)
}

/// Parse and reconcile `Forwarded` and `X-Forwarded-For` from a trusted proxy
fn apply_forwarding(
    state: &mut RequestState,
    endpoint: &EndpointDefinition,
) -> Option<AdmissionFailure> {
    let forwarded_raw = state.raw.headers.get("forwarded").cloned();
    let xff_raw = state.raw.headers.get("x-forwarded-for").cloned();

    let forwarded_hop = match forwarded_raw.as_deref().map(parse_forwarded_first) {
        Some(Ok(hop)) => Some(hop),
        Some(Err(reason)) => return forwarding_failure(state, endpoint, reason),
        None => None,
    };
    let xff_hop = match xff_raw.as_deref().map(parse_xff_first) {
        Some(Ok(hop)) => Some(hop),
        Some(Err(reason)) => return forwarding_failure(state, endpoint, reason),
        None => None,
    };

    if let (Some(f), Some(x)) = (&forwarded_hop, &xff_hop) {
        if f != x {
            return forwarding_failure(
                state,
                endpoint,
                format!("Forwarded first hop {f:?} disagrees with X-Forwarded-For {x:?}"),
            );
        }
    }

    if let Some(hop) = forwarded_hop.clone().or(xff_hop.clone()) {
        state.admission.client_ip = hop;
    }
    state.admission.forwarded = forwarded_hop.unwrap_or_default();
    state.admission.forwarded_for = xff_hop.unwrap_or_default();
    None
}

fn forwarding_failure(
    state: &mut RequestState,
    endpoint: &EndpointDefinition,
    reason: String,
) -> Option<AdmissionFailure> {
    if endpoint.development_mode {
        // Development mode keeps serving off the peer address and annotates.
        tracing::warn!(
            endpoint = %endpoint.name,
            correlation_id = %state.correlation_id,
            "stripping inconsistent forwarding metadata: {reason}"
        );
        state.admission.proxy_stripped = true;
        state.admission.decision = DECISION_STRIP.to_string();
        state.admission.reason = reason;
        None
    } else {
        state.admission.decision = DECISION_DENY.to_string();
        state.admission.authenticated = false;
        state.admission.reason = reason;
        Some(AdmissionFailure::Forwarding)
    }
}

/// Walk the allow list in order; the first source with a value wins
fn classify_credentials(
    state: &mut RequestState,
    endpoint: &EndpointDefinition,
) -> Option<AdmissionFailure> {
    let policy = &endpoint.authentication;

    let mut matched: Option<String> = None;
    for source in &policy.allow {
        match source {
            AllowSource::Authorization => {
                if authorization_scheme(state).is_some() {
                    matched = Some("authorization".to_string());
                    break;
                }
            }
            AllowSource::Header(name) => {
                if state.raw.headers.get(name).is_some_and(|v| !v.is_empty()) {
                    matched = Some(format!("header:{name}"));
                    break;
                }
            }
            AllowSource::Query(name) => {
                if state.raw.query.get(name).is_some_and(|v| !v.is_empty()) {
                    matched = Some(format!("query:{name}"));
                    break;
                }
            }
            AllowSource::None => {
                // Anonymous admission: no earlier source found a credential.
                matched = Some("none".to_string());
                break;
            }
        }
    }

    match matched {
        Some(source) => {
            state.admission.authenticated = true;
            state.admission.source = source.clone();
            state.admission.reason = format!("credential source {source} accepted");
            None
        }
        None if policy.required => {
            state.admission.decision = DECISION_DENY.to_string();
            state.admission.authenticated = false;
            state.admission.reason = "authentication required".to_string();
            Some(AdmissionFailure::Credentials)
        }
        None => {
            state.admission.authenticated = false;
            state.admission.reason = "no credential presented".to_string();
            None
        }
    }
}

/// Scheme of a usable `Authorization` header ("bearer" or "basic")
fn authorization_scheme(state: &RequestState) -> Option<&'static str> {
    let value = state.raw.headers.get("authorization")?;
    let (scheme, rest) = value.split_once(' ')?;
    if rest.trim().is_empty() {
        return None;
    }
    if scheme.eq_ignore_ascii_case("bearer") {
        Some("bearer")
    } else if scheme.eq_ignore_ascii_case("basic") {
        Some("basic")
    } else {
        None
    }
}

/// First `for=` hop of an RFC 7239 `Forwarded` header, normalized to an IP
fn parse_forwarded_first(header: &str) -> std::result::Result<String, String> {
    let first = header
        .split(',')
        .next()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| "empty Forwarded header".to_string())?;

    for param in first.split(';') {
        let (name, value) = param
            .trim()
            .split_once('=')
            .ok_or_else(|| format!("malformed Forwarded parameter {param:?}"))?;
        if name.trim().eq_ignore_ascii_case("for") {
            return normalize_node(value.trim());
        }
    }
    Err("Forwarded header missing for= parameter".to_string())
}

/// First entry of an `X-Forwarded-For` header, normalized to an IP
fn parse_xff_first(header: &str) -> std::result::Result<String, String> {
    let first = header
        .split(',')
        .next()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .ok_or_else(|| "empty X-Forwarded-For header".to_string())?;
    normalize_node(first)
}

/// Normalize an RFC 7239 node: strip quotes, brackets, and a port
fn normalize_node(node: &str) -> std::result::Result<String, String> {
    let unquoted = node.trim_matches('"');
    let host = if let Some(rest) = unquoted.strip_prefix('[') {
        // "[2001:db8::1]:4711" or "[2001:db8::1]"
        rest.split(']')
            .next()
            .ok_or_else(|| format!("malformed node {node:?}"))?
    } else if let Some((host, port)) = unquoted.rsplit_once(':') {
        // Only strip a port when the remainder parses as an IPv4 address;
        // a bare IPv6 address also contains colons.
        if port.chars().all(|c| c.is_ascii_digit()) && host.parse::<IpAddr>().is_ok() {
            host
        } else {
            unquoted
        }
    } else {
        unquoted
    };

    host.parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| format!("unparseable address {node:?}"))
}
