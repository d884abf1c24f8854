//! Forward Policy agent
//!
//! Produces the curated request view rule backends observe. Hop-by-hop
//! headers never survive; proxy metadata survives only when the endpoint
//! opts in with `forwardProxyHeaders`. The endpoint's request policy can
//! further restrict the view with an allow list and a strip list. Per-rule
//! credential stripping happens later, in rule execution.

use crate::pipeline::state::RequestState;
use crate::rules::compile::EndpointDefinition;

/// Headers that never survive into the curated view
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "transfer-encoding",
    "upgrade",
    "proxy-authorization",
    "proxy-connection",
];

/// Proxy metadata headers, forwarded only with `forwardProxyHeaders`
const PROXY_HEADERS: &[&str] = &[
    "forwarded",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-forwarded-proto",
    "x-forwarded-port",
    "x-forwarded-prefix",
    "x-real-ip",
];

/// Run the forward-policy agent
pub fn run(state: &mut RequestState, endpoint: &EndpointDefinition) {
    let policy = &endpoint.forward_request;

    for (name, value) in &state.raw.headers {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if PROXY_HEADERS.contains(&name.as_str()) && !endpoint.forward_proxy_headers {
            continue;
        }
        if !policy.allow.is_empty() && !policy.allow.contains(name) {
            continue;
        }
        if policy.strip.contains(name) {
            continue;
        }
        state
            .forward
            .headers
            .insert(name.clone(), value.clone());
    }

    state.forward.query = state.raw.query.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TemplateEngine;
    use crate::rules::model::EndpointDoc;
    use std::collections::BTreeMap;

    fn endpoint(doc: EndpointDoc) -> EndpointDefinition {
        crate::rules::compile::compile_endpoint(
            "default",
            &doc,
            &BTreeMap::new(),
            &TemplateEngine::default(),
        )
        .unwrap()
    }

    fn state() -> RequestState {
        let mut state = RequestState::default();
        for (name, value) in [
            ("authorization", "Bearer x"),
            ("accept", "application/json"),
            ("connection", "keep-alive"),
            ("x-forwarded-for", "203.0.113.9"),
        ] {
            state.raw.headers.insert(name.into(), value.into());
        }
        state.raw.query.insert("tier".into(), "premium".into());
        state
    }

    #[test]
    fn test_hop_by_hop_and_proxy_headers_dropped_by_default() {
        let endpoint = endpoint(EndpointDoc::default());
        let mut state = state();
        run(&mut state, &endpoint);

        assert!(state.forward.headers.contains_key("authorization"));
        assert!(state.forward.headers.contains_key("accept"));
        assert!(!state.forward.headers.contains_key("connection"));
        assert!(!state.forward.headers.contains_key("x-forwarded-for"));
        assert_eq!(state.forward.query.get("tier").unwrap(), "premium");
    }

    #[test]
    fn test_proxy_headers_forwarded_on_opt_in() {
        let mut doc = EndpointDoc::default();
        doc.forward_proxy_policy.forward_proxy_headers = true;
        let endpoint = endpoint(doc);

        let mut state = state();
        run(&mut state, &endpoint);
        assert!(state.forward.headers.contains_key("x-forwarded-for"));
    }

    #[test]
    fn test_allow_list_restricts_view() {
        let mut doc = EndpointDoc::default();
        doc.forward_request_policy.allow_headers = vec!["Accept".into()];
        let endpoint = endpoint(doc);

        let mut state = state();
        run(&mut state, &endpoint);
        assert_eq!(state.forward.headers.len(), 1);
        assert!(state.forward.headers.contains_key("accept"));
    }

    #[test]
    fn test_strip_list_removes_headers() {
        let mut doc = EndpointDoc::default();
        doc.forward_request_policy.strip_headers = vec!["Authorization".into()];
        let endpoint = endpoint(doc);

        let mut state = state();
        run(&mut state, &endpoint);
        assert!(!state.forward.headers.contains_key("authorization"));
        assert!(state.forward.headers.contains_key("accept"));
    }
}
