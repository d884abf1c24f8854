//! Hybrid expression engine: typed expressions and text templates
//!
//! Every expression-valued configuration field accepts either dialect.
//! Dialect detection is a context-free presence check: a value containing
//! the literal `{{` is a template, anything else is a typed expression.
//! Detection never depends on where the value appears.
//!
//! Programs are compiled once at configuration load; compiled programs are
//! immutable and safe for concurrent evaluation. A compilation failure
//! quarantines the owning rule or endpoint rather than failing the server.

pub mod activation;
pub mod expr;
pub mod template;

pub use activation::Activation;
pub use expr::CompiledExpression;
pub use template::TemplateEngine;

use serde_json::Value;

use crate::error::Result;

/// The literal that classifies a value as a template
pub const TEMPLATE_MARKER: &str = "{{";

/// Returns true when the value belongs to the template dialect
pub fn is_template(source: &str) -> bool {
    source.contains(TEMPLATE_MARKER)
}

/// A compiled program in either dialect
#[derive(Debug)]
pub enum Program {
    /// Typed expression (CEL)
    Expression(CompiledExpression),

    /// Text template (validated source; rendered per evaluation)
    Template(String),
}

impl Program {
    /// Detect the dialect and compile
    ///
    /// Used for value positions where typed results matter: endpoint and
    /// rule variables, and conditions.
    pub fn compile(source: &str, templates: &TemplateEngine) -> Result<Self> {
        if is_template(source) {
            templates.check(source)?;
            Ok(Program::Template(source.to_string()))
        } else {
            Ok(Program::Expression(CompiledExpression::compile(source)?))
        }
    }

    /// Compile as a template regardless of content
    ///
    /// Used for render positions — bodies, header and query values, backend
    /// descriptors — where plain text must pass through verbatim.
    pub fn template(source: &str, templates: &TemplateEngine) -> Result<Self> {
        templates.check(source)?;
        Ok(Program::Template(source.to_string()))
    }

    /// The original source text
    pub fn source(&self) -> &str {
        match self {
            Program::Expression(e) => e.source(),
            Program::Template(s) => s,
        }
    }

    /// Evaluate to a string (template render, or stringified expression value)
    pub fn eval_string(
        &self,
        activation: &Activation<'_>,
        templates: &TemplateEngine,
    ) -> Result<String> {
        match self {
            Program::Expression(e) => Ok(expr::value_to_string(&e.eval(activation)?)),
            Program::Template(s) => templates.render(s, activation),
        }
    }

    /// Evaluate to a JSON value (expression value, or rendered string)
    pub fn eval_json(
        &self,
        activation: &Activation<'_>,
        templates: &TemplateEngine,
    ) -> Result<Value> {
        match self {
            Program::Expression(e) => Ok(expr::value_to_json(&e.eval(activation)?)),
            Program::Template(s) => Ok(Value::String(templates.render(s, activation)?)),
        }
    }

    /// Evaluate as a condition
    ///
    /// Expressions require a boolean `true`; templates compare the trimmed
    /// render against `"true"`.
    pub fn eval_bool(
        &self,
        activation: &Activation<'_>,
        templates: &TemplateEngine,
    ) -> Result<bool> {
        match self {
            Program::Expression(e) => e.eval_bool(activation),
            Program::Template(s) => Ok(templates.render(s, activation)?.trim() == "true"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::RequestState;
    use serde_json::json;

    #[test]
    fn test_dialect_detection_is_context_free() {
        assert!(is_template("{{ variables.global.tier }}"));
        assert!(is_template("prefix {{ x }} suffix"));
        assert!(!is_template("variables.environment.TIER"));
        assert!(!is_template("lookup(forward.query, 'tier') == 'premium'"));
    }

    #[test]
    fn test_compile_picks_dialect() {
        let templates = TemplateEngine::default();
        let expr = Program::compile("raw.method == 'GET'", &templates).unwrap();
        assert!(matches!(expr, Program::Expression(_)));

        let tmpl = Program::compile("{{ raw.method }}", &templates).unwrap();
        assert!(matches!(tmpl, Program::Template(_)));
    }

    #[test]
    fn test_template_constructor_renders_plain_text_verbatim() {
        let templates = TemplateEngine::default();
        let state = RequestState::default();
        let activation = Activation::snapshot(&state);

        let plain = Program::template("integration ok", &templates).unwrap();
        assert_eq!(
            plain.eval_string(&activation, &templates).unwrap(),
            "integration ok"
        );
    }

    #[test]
    fn test_eval_string_both_dialects() {
        let templates = TemplateEngine::default();
        let mut state = RequestState::default();
        state.raw.method = "GET".into();
        state
            .variables
            .global
            .insert("tier_value".into(), json!("premium"));
        let activation = Activation::snapshot(&state);

        let expr = Program::compile("variables.global.tier_value", &templates).unwrap();
        assert_eq!(expr.eval_string(&activation, &templates).unwrap(), "premium");

        let tmpl =
            Program::compile("{{ variables.global.tier_value }}", &templates).unwrap();
        assert_eq!(tmpl.eval_string(&activation, &templates).unwrap(), "premium");
    }

    #[test]
    fn test_eval_bool_template_compares_render() {
        let templates = TemplateEngine::default();
        let state = RequestState::default();
        let activation = Activation::snapshot(&state);

        let yes = Program::compile("{{ 'tr' ~ 'ue' }}", &templates).unwrap();
        assert!(yes.eval_bool(&activation, &templates).unwrap());

        let no = Program::compile("{{ 'yes' }}", &templates).unwrap();
        assert!(!no.eval_bool(&activation, &templates).unwrap());
    }
}
