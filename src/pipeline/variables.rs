//! Endpoint Variables agent
//!
//! Evaluates the endpoint's variable programs in declaration order into
//! `variables.global`. Evaluation is fail-soft: a failing variable becomes
//! the empty string and the pipeline continues. Variables evaluated earlier
//! are visible to later ones through the activation.

use serde_json::Value;

use crate::engine::{Activation, TemplateEngine};
use crate::pipeline::state::RequestState;
use crate::rules::compile::EndpointDefinition;

/// Run the endpoint-variables agent
pub fn run(state: &mut RequestState, endpoint: &EndpointDefinition, templates: &TemplateEngine) {
    for (name, program) in &endpoint.variables {
        let result = {
            let activation = Activation::snapshot(state);
            program.eval_json(&activation, templates)
        };
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    endpoint = %endpoint.name,
                    variable = %name,
                    correlation_id = %state.correlation_id,
                    "endpoint variable evaluation failed: {e}"
                );
                Value::String(String::new())
            }
        };
        state.variables.global.insert(name.clone(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TemplateEngine;
    use crate::rules::model::EndpointDoc;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn endpoint_with_variables(vars: &[(&str, &str)]) -> EndpointDefinition {
        let mut doc = EndpointDoc::default();
        for (name, source) in vars {
            doc.variables
                .insert((*name).to_string(), (*source).to_string());
        }
        crate::rules::compile::compile_endpoint(
            "default",
            &doc,
            &BTreeMap::new(),
            &TemplateEngine::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_expression_and_template_variables() {
        let endpoint = endpoint_with_variables(&[
            ("tier_value", "variables.environment.TIER"),
            ("support_email", "{{ variables.environment.SUPPORT_EMAIL }}"),
        ]);

        let mut state = RequestState::default();
        let mut env = BTreeMap::new();
        env.insert("TIER".to_string(), "premium".to_string());
        env.insert("SUPPORT_EMAIL".to_string(), "support@example.com".to_string());
        state.variables.environment = Arc::new(env);

        run(&mut state, &endpoint, &TemplateEngine::default());

        assert_eq!(state.variables.global["tier_value"], json!("premium"));
        assert_eq!(
            state.variables.global["support_email"],
            json!("support@example.com")
        );
    }

    #[test]
    fn test_later_variables_see_earlier_ones() {
        let endpoint = endpoint_with_variables(&[
            ("first", "'one'"),
            ("second", "variables.global.first + '-two'"),
        ]);

        let mut state = RequestState::default();
        run(&mut state, &endpoint, &TemplateEngine::default());
        assert_eq!(state.variables.global["second"], json!("one-two"));
    }

    #[test]
    fn test_failing_variable_is_empty_string() {
        // Dividing by zero fails at evaluation time, not compile time.
        let endpoint =
            endpoint_with_variables(&[("broken", "1 / 0"), ("after", "'still-runs'")]);

        let mut state = RequestState::default();
        run(&mut state, &endpoint, &TemplateEngine::default());

        assert_eq!(state.variables.global["broken"], json!(""));
        assert_eq!(state.variables.global["after"], json!("still-runs"));
    }
}
