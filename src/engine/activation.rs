//! Read-only evaluation snapshot of the request state
//!
//! An [`Activation`] borrows the namespaces an expression or template may
//! observe. It is rebuilt cheaply before every evaluation so each program
//! sees the state as of its own pipeline step.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::pipeline::state::{
    AdmissionState, BackendState, ForwardState, RawRequest, RequestState,
};

/// The `vars` namespace: rule exports and the current rule's locals
#[derive(Debug, Serialize)]
pub struct VarsView<'a> {
    /// Exports of completed rules, keyed by rule name
    pub rule: &'a BTreeMap<String, BTreeMap<String, Value>>,

    /// Local variables of the rule currently executing
    pub local: &'a BTreeMap<String, Value>,
}

/// The `variables` namespace: process- and endpoint-scoped values
#[derive(Debug, Serialize)]
pub struct VariablesView<'a> {
    /// Environment-sourced variables
    pub environment: &'a BTreeMap<String, String>,

    /// Secret-sourced variables
    pub secrets: &'a BTreeMap<String, String>,

    /// Endpoint variables
    pub global: &'a BTreeMap<String, Value>,
}

/// Read-only snapshot evaluated by both dialects
#[derive(Debug, Serialize)]
pub struct Activation<'a> {
    /// Immutable request input
    pub raw: &'a RawRequest,

    /// Admission agent output
    pub admission: &'a AdmissionState,

    /// Curated request view
    pub forward: &'a ForwardState,

    /// Backend interaction output
    pub backend: &'a BackendState,

    /// Rule exports and locals
    pub vars: VarsView<'a>,

    /// Process- and endpoint-scoped variables
    pub variables: VariablesView<'a>,
}

impl<'a> Activation<'a> {
    /// Snapshot the given request state
    pub fn snapshot(state: &'a RequestState) -> Self {
        Self {
            raw: &state.raw,
            admission: &state.admission,
            forward: &state.forward,
            backend: &state.backend,
            vars: VarsView {
                rule: &state.variables.rule,
                local: &state.variables.local,
            },
            variables: VariablesView {
                environment: &state.variables.environment,
                secrets: &state.variables.secrets,
                global: &state.variables.global,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activation_serializes_namespaces() {
        let mut state = RequestState::default();
        state.raw.method = "GET".into();
        state
            .variables
            .global
            .insert("tier_value".into(), Value::String("premium".into()));

        let activation = Activation::snapshot(&state);
        let json = serde_json::to_value(&activation).unwrap();

        assert_eq!(json["raw"]["method"], "GET");
        assert_eq!(json["variables"]["global"]["tier_value"], "premium");
        assert!(json["vars"]["rule"].is_object());
        assert!(json["forward"]["headers"].is_object());
    }
}
