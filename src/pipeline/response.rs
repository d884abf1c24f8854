//! Response Policy agent
//!
//! Maps the final outcome to status, headers, and body through the
//! endpoint's category templates. Admission failures keep their dedicated
//! status mapping: missing or rejected credentials answer 401 with a
//! `WWW-Authenticate` challenge, forwarding failures answer 400. A non-zero
//! `response.status` at entry signals a cache replay and makes the agent a
//! no-op.

use crate::engine::{Activation, TemplateEngine};
use crate::pipeline::admission::DECISION_DENY;
use crate::pipeline::state::{Outcome, RequestState};
use crate::rules::compile::{CompiledResponseCategory, EndpointDefinition};

/// Sentinel header carrying the decision outcome
pub const OUTCOME_HEADER: &str = "x-passctrl-outcome";

/// Run the response-policy agent
pub fn run(state: &mut RequestState, endpoint: &EndpointDefinition, templates: &TemplateEngine) {
    if state.response.status != 0 {
        // Cache replay: status, headers, and body are already final.
        return;
    }

    let outcome = state.rule.outcome;
    let admission_denied = state.admission.decision == DECISION_DENY;

    let default_status = match outcome {
        Outcome::Pass => 200,
        Outcome::Fail if admission_denied => 401,
        Outcome::Fail => 403,
        Outcome::Error if admission_denied => 400,
        Outcome::Error => 502,
        Outcome::None => 500,
    };

    let category = category_for(endpoint, outcome);
    state.response.status = category.and_then(|c| c.status).unwrap_or(default_status);

    // Challenge the client when a required credential was absent or rejected.
    if outcome == Outcome::Fail && admission_denied {
        state.response.headers.insert(
            "www-authenticate".to_string(),
            endpoint.authentication.challenge.header_value(),
        );
    }

    if let Some(category) = category {
        shape_headers(state, category, endpoint, templates);
        render_body(state, category, endpoint, templates);
    }

    let sentinel = if outcome.is_terminal() {
        outcome.as_str()
    } else {
        "unknown"
    };
    state
        .response
        .headers
        .insert(OUTCOME_HEADER.to_string(), sentinel.to_string());
}

fn category_for(
    endpoint: &EndpointDefinition,
    outcome: Outcome,
) -> Option<&CompiledResponseCategory> {
    match outcome {
        Outcome::Pass => Some(&endpoint.response_policy.pass),
        Outcome::Fail => Some(&endpoint.response_policy.fail),
        Outcome::Error => Some(&endpoint.response_policy.error),
        Outcome::None => None,
    }
}

/// Filter by allow, prune by strip, then merge rendered custom headers
fn shape_headers(
    state: &mut RequestState,
    category: &CompiledResponseCategory,
    endpoint: &EndpointDefinition,
    templates: &TemplateEngine,
) {
    if !category.allow.is_empty() {
        state
            .response
            .headers
            .retain(|name, _| category.allow.contains(name));
    }
    for name in &category.strip {
        state.response.headers.remove(name);
    }

    let mut rendered = Vec::with_capacity(category.custom.len());
    {
        let activation = Activation::snapshot(state);
        for (name, program) in &category.custom {
            match program.eval_string(&activation, templates) {
                Ok(value) => rendered.push((name.to_ascii_lowercase(), value)),
                Err(e) => {
                    tracing::warn!(
                        endpoint = %endpoint.name,
                        header = %name,
                        correlation_id = %state.correlation_id,
                        "custom response header rendering failed: {e}"
                    );
                }
            }
        }
    }
    for (name, value) in rendered {
        if value.is_empty() {
            state.response.headers.remove(&name);
        } else {
            state.response.headers.insert(name, value);
        }
    }
}

/// Render the category body; inline body wins over a body file
fn render_body(
    state: &mut RequestState,
    category: &CompiledResponseCategory,
    endpoint: &EndpointDefinition,
    templates: &TemplateEngine,
) {
    let rendered = {
        let activation = Activation::snapshot(state);
        match (&category.body, &category.body_file) {
            (Some(body), _) => Some(body.eval_string(&activation, templates)),
            (None, Some(path_program)) => {
                Some(path_program.eval_string(&activation, templates).and_then(
                    |path| {
                        let source = templates.load_file(&path)?;
                        templates.render(&source, &activation)
                    },
                ))
            }
            (None, None) => None,
        }
    };

    match rendered {
        Some(Ok(body)) => state.response.message = body,
        Some(Err(e)) => {
            tracing::warn!(
                endpoint = %endpoint.name,
                correlation_id = %state.correlation_id,
                "response body rendering failed: {e}"
            );
        }
        None => {}
    }
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

    fn templates() -> TemplateEngine {
        TemplateEngine::default()
    }

    #[test]
    fn test_default_statuses() {
        for (outcome, status) in [
            (Outcome::Pass, 200),
            (Outcome::Fail, 403),
            (Outcome::Error, 502),
            (Outcome::None, 500),
        ] {
            let endpoint = endpoint(EndpointDoc::default());
            let mut state = RequestState::default();
            state.rule.outcome = outcome;
            run(&mut state, &endpoint, &templates());
            assert_eq!(state.response.status, status, "outcome {outcome:?}");
        }
    }

    #[test]
    fn test_sentinel_header_always_set() {
        let endpoint = endpoint(EndpointDoc::default());
        let mut state = RequestState::default();
        state.rule.outcome = Outcome::Pass;
        run(&mut state, &endpoint, &templates());
        assert_eq!(state.response.headers[OUTCOME_HEADER], "pass");

        let mut state = RequestState::default();
        run(&mut state, &endpoint, &templates());
        assert_eq!(state.response.headers[OUTCOME_HEADER], "unknown");
    }

    #[test]
    fn test_admission_denial_statuses_and_challenge() {
        let mut doc = EndpointDoc::default();
        doc.authentication.challenge.scheme = "bearer".into();
        doc.authentication.challenge.realm = "internal".into();
        let endpoint = endpoint(doc);

        // Credential failure: 401 with a challenge.
        let mut state = RequestState::default();
        state.admission.decision = DECISION_DENY.into();
        state.rule.outcome = Outcome::Fail;
        run(&mut state, &endpoint, &templates());
        assert_eq!(state.response.status, 401);
        assert_eq!(
            state.response.headers["www-authenticate"],
            "Bearer realm=\"internal\""
        );

        // Forwarding failure: 400, no challenge.
        let mut state = RequestState::default();
        state.admission.decision = DECISION_DENY.into();
        state.rule.outcome = Outcome::Error;
        run(&mut state, &endpoint, &templates());
        assert_eq!(state.response.status, 400);
        assert!(!state.response.headers.contains_key("www-authenticate"));
    }

    #[test]
    fn test_category_overrides() {
        let mut doc = EndpointDoc::default();
        doc.response_policy.pass.status = Some(204);
        doc.response_policy.pass.body = Some("integration ok".into());
        doc.response_policy
            .pass
            .headers
            .custom
            .insert("X-Test".into(), "integration".into());
        let endpoint = endpoint(doc);

        let mut state = RequestState::default();
        state.rule.outcome = Outcome::Pass;
        run(&mut state, &endpoint, &templates());

        assert_eq!(state.response.status, 204);
        assert_eq!(state.response.message, "integration ok");
        assert_eq!(state.response.headers["x-test"], "integration");
    }

    #[test]
    fn test_header_shaping_allow_strip_custom() {
        let mut doc = EndpointDoc::default();
        doc.response_policy.pass.headers.allow =
            vec!["x-keep".into(), "x-gone".into(), "x-empty".into()];
        doc.response_policy.pass.headers.strip = vec!["x-gone".into()];
        doc.response_policy
            .pass
            .headers
            .custom
            .insert("x-empty".into(), "{{ '' }}".into());
        let endpoint = endpoint(doc);

        let mut state = RequestState::default();
        state.rule.outcome = Outcome::Pass;
        for name in ["x-keep", "x-gone", "x-dropped-by-allow", "x-empty"] {
            state.response.headers.insert(name.into(), "v".into());
        }
        run(&mut state, &endpoint, &templates());

        assert!(state.response.headers.contains_key("x-keep"));
        assert!(!state.response.headers.contains_key("x-gone"));
        assert!(!state.response.headers.contains_key("x-dropped-by-allow"));
        // Custom header rendering to empty removes it.
        assert!(!state.response.headers.contains_key("x-empty"));
        // The sentinel is added after shaping.
        assert!(state.response.headers.contains_key(OUTCOME_HEADER));
    }

    #[test]
    fn test_replay_is_a_no_op() {
        let endpoint = endpoint(EndpointDoc::default());
        let mut state = RequestState::default();
        state.response.status = 200;
        state.response.message = "cached body".into();
        state.rule.outcome = Outcome::Fail;
        run(&mut state, &endpoint, &templates());

        assert_eq!(state.response.status, 200);
        assert_eq!(state.response.message, "cached body");
    }

    #[test]
    fn test_body_template_renders_activation() {
        let mut doc = EndpointDoc::default();
        doc.response_policy.pass.body =
            Some("{\"tier\":\"{{ variables.global.tier_value }}\"}".into());
        let endpoint = endpoint(doc);

        let mut state = RequestState::default();
        state
            .variables
            .global
            .insert("tier_value".into(), serde_json::json!("premium"));
        state.rule.outcome = Outcome::Pass;
        run(&mut state, &endpoint, &templates());
        assert_eq!(state.response.message, "{\"tier\":\"premium\"}");
    }
}
