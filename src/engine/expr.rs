//! Typed expression dialect (CEL)
//!
//! Expressions are compiled ahead of time and evaluated against an
//! [`Activation`] snapshot. The language is sandboxed by construction: no
//! I/O, no environment access; process data is reachable only through the
//! `variables` namespace. The helper `lookup(map, key)` returns the mapped
//! value or `null` so conditions can probe optional keys without erroring.

use cel::objects::Key;
use cel::{Context, ExecutionError, Program, Value};
use once_cell::sync::Lazy;

use crate::engine::activation::Activation;
use crate::error::{Error, Result};

/// Root context with helper functions; per-evaluation contexts scope from it
static ROOT_CONTEXT: Lazy<Context<'static>> = Lazy::new(|| {
    let mut ctx = Context::default();
    ctx.add_function("lookup", lookup);
    ctx
});

/// `lookup(map, key)` → mapped value or `null`
fn lookup(map: Value, key: Value) -> std::result::Result<Value, ExecutionError> {
    let Value::Map(map) = map else {
        return Ok(Value::Null);
    };
    let key = match key {
        Value::String(s) => Key::String(s),
        Value::Int(i) => Key::Int(i),
        Value::UInt(u) => Key::Uint(u),
        Value::Bool(b) => Key::Bool(b),
        _ => return Ok(Value::Null),
    };
    Ok(map.map.get(&key).cloned().unwrap_or(Value::Null))
}

/// A compiled expression, immutable and safe for concurrent evaluation
#[derive(Debug)]
pub struct CompiledExpression {
    program: Program,
    source: String,
}

impl CompiledExpression {
    /// Compile the expression; failures quarantine the owning definition
    pub fn compile(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let program = Program::compile(&source)
            .map_err(|e| Error::Expression(format!("{source:?}: {e}")))?;
        Ok(Self { program, source })
    }

    /// The original expression text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against an activation snapshot
    pub fn eval(&self, activation: &Activation<'_>) -> Result<Value> {
        let ctx = build_context(activation)?;
        self.program
            .execute(&ctx)
            .map_err(|e| Error::Expression(format!("{:?}: {e}", self.source)))
    }

    /// Evaluate as a condition: `true` only for a boolean `true` result
    pub fn eval_bool(&self, activation: &Activation<'_>) -> Result<bool> {
        Ok(matches!(self.eval(activation)?, Value::Bool(true)))
    }
}

fn build_context<'a>(activation: &Activation<'_>) -> Result<Context<'a>> {
    let mut ctx = ROOT_CONTEXT.new_inner_scope();
    ctx.add_variable_from_value("raw", to_value(activation.raw)?);
    ctx.add_variable_from_value("admission", to_value(activation.admission)?);
    ctx.add_variable_from_value("forward", to_value(activation.forward)?);
    ctx.add_variable_from_value("backend", to_value(activation.backend)?);
    ctx.add_variable_from_value("vars", to_value(&activation.vars)?);
    ctx.add_variable_from_value("variables", to_value(&activation.variables)?);
    ctx.add_variable_from_value(
        "now",
        Value::Timestamp(chrono::Utc::now().fixed_offset()),
    );
    Ok(ctx)
}

fn to_value<S: serde::Serialize>(v: S) -> Result<Value> {
    cel::to_value(v).map_err(|e| Error::Expression(e.to_string()))
}

/// Convert an evaluation result into a JSON value (for variable export)
pub fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::json;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::UInt(u) => json!(u),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => json!(s.as_str()),
        Value::Bytes(b) => {
            // Bytes have no JSON shape; expose them as a lossy string.
            json!(String::from_utf8_lossy(b.as_slice()).into_owned())
        }
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
        Value::Map(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map.map.iter() {
                obj.insert(key_to_string(k), value_to_json(v));
            }
            serde_json::Value::Object(obj)
        }
        Value::Timestamp(ts) => json!(ts.to_rfc3339()),
        Value::Duration(d) => json!(d.to_string()),
        _ => serde_json::Value::Null,
    }
}

/// Convert an evaluation result into its string form (for rendered values)
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.to_string(),
        Value::Bytes(b) => String::from_utf8_lossy(b.as_slice()).into_owned(),
        Value::Timestamp(ts) => ts.to_rfc3339(),
        Value::Duration(d) => d.to_string(),
        other => serde_json::to_string(&value_to_json(other)).unwrap_or_default(),
    }
}

fn key_to_string(key: &Key) -> String {
    match key {
        Key::String(s) => s.to_string(),
        Key::Int(i) => i.to_string(),
        Key::Uint(u) => u.to_string(),
        Key::Bool(b) => b.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::state::RequestState;
    use serde_json::json;
    use std::sync::Arc;

    fn eval(state: &RequestState, src: &str) -> Value {
        let expr = CompiledExpression::compile(src).unwrap();
        let activation = Activation::snapshot(state);
        expr.eval(&activation).unwrap()
    }

    #[test]
    fn test_compile_failure_is_reported() {
        assert!(CompiledExpression::compile("1 +").is_err());
    }

    #[test]
    fn test_raw_namespace_is_visible() {
        let mut state = RequestState::default();
        state.raw.method = "GET".into();
        assert_eq!(eval(&state, "raw.method == 'GET'"), Value::Bool(true));
    }

    #[test]
    fn test_lookup_present_and_absent_keys() {
        let mut state = RequestState::default();
        state
            .forward
            .query
            .insert("tier".into(), "premium".into());

        assert_eq!(
            eval(&state, "lookup(forward.query, 'tier') == 'premium'"),
            Value::Bool(true)
        );
        assert_eq!(
            eval(&state, "lookup(forward.query, 'missing')"),
            Value::Null
        );
    }

    #[test]
    fn test_environment_variables_visible() {
        let mut state = RequestState::default();
        let mut env = std::collections::BTreeMap::new();
        env.insert("TIER".to_string(), "premium".to_string());
        state.variables.environment = Arc::new(env);

        assert_eq!(
            eval(&state, "variables.environment.TIER"),
            Value::String(Arc::new("premium".to_string()))
        );
    }

    #[test]
    fn test_eval_bool_requires_boolean_true() {
        let state = RequestState::default();
        let t = CompiledExpression::compile("true").unwrap();
        let s = CompiledExpression::compile("'nonempty'").unwrap();
        let activation = Activation::snapshot(&state);
        assert!(t.eval_bool(&activation).unwrap());
        assert!(!s.eval_bool(&activation).unwrap());
    }

    #[test]
    fn test_value_to_json_preserves_integers() {
        let mut state = RequestState::default();
        state.backend.body = json!({"count": 3});
        let v = eval(&state, "backend.body.count");
        assert_eq!(value_to_json(&v), json!(3));
    }

    #[test]
    fn test_value_to_string_forms() {
        assert_eq!(value_to_string(&Value::Null), "");
        assert_eq!(value_to_string(&Value::Int(7)), "7");
        assert_eq!(value_to_string(&Value::Bool(false)), "false");
    }
}
