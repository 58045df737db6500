//! Embedded expression sandbox.
//!
//! Formulas and rule conditions are evalexpr expressions evaluated over
//! read-only variable bindings. The sandbox has no I/O, no assignment into
//! shared state, and a parse-time size bound; a fresh context is built per
//! evaluation so nothing leaks between scripts.
//!
//! Available surface: arithmetic, comparison and boolean operators with
//! standard precedence, plus the evalexpr builtins (`min`, `max`, `floor`,
//! `ceil`, `round`, `if`, `math::abs`, ...). A condition script returns a
//! boolean, or a tuple `(triggered, message)` / `(triggered, message,
//! severity)` to override the rule's message and severity.

use evalexpr::{build_operator_tree, ContextWithMutableVariables, HashMapContext, Node};
use gridflow_protocol::{Value, ValueType};
use thiserror::Error;

/// Upper bound on operator-tree nodes; scripts past this are configuration
/// errors, not data.
pub const MAX_SCRIPT_NODES: usize = 256;

pub type Result<T> = std::result::Result<T, ScriptError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("script too large: {nodes} nodes (max {max})")]
    TooLarge { nodes: usize, max: usize },

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("unbound variable: {0}")]
    Unbound(String),

    #[error("result {got} cannot coerce to {want:?}")]
    ResultType { got: String, want: ValueType },
}

/// A parsed, size-checked script ready for repeated evaluation.
#[derive(Debug, Clone)]
pub struct CompiledScript {
    source: String,
    node: Node,
    variables: Vec<String>,
}

impl CompiledScript {
    /// Parse and bound-check a script.
    pub fn compile(source: &str) -> Result<Self> {
        let node = build_operator_tree(source).map_err(|e| ScriptError::Parse(e.to_string()))?;
        let nodes = node.iter().count();
        if nodes > MAX_SCRIPT_NODES {
            return Err(ScriptError::TooLarge { nodes, max: MAX_SCRIPT_NODES });
        }
        let mut variables: Vec<String> = node
            .iter_variable_identifiers()
            .map(|s| s.to_string())
            .collect();
        variables.sort();
        variables.dedup();
        Ok(Self { source: source.to_string(), node, variables })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Variable names the script reads; drives dependency wiring.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    fn context(&self, bindings: &[(&str, Value)]) -> Result<HashMapContext> {
        let mut ctx = HashMapContext::new();
        for (name, value) in bindings {
            ctx.set_value((*name).to_string(), to_eval(value))
                .map_err(|e| ScriptError::Eval(e.to_string()))?;
        }
        // Reject scripts referencing variables the caller did not bind,
        // before evalexpr turns them into opaque identifier errors.
        for var in &self.variables {
            if !bindings.iter().any(|(name, _)| name == var) {
                return Err(ScriptError::Unbound(var.clone()));
            }
        }
        Ok(ctx)
    }

    fn eval_raw(&self, bindings: &[(&str, Value)]) -> Result<evalexpr::Value> {
        let ctx = self.context(bindings)?;
        self.node
            .eval_with_context(&ctx)
            .map_err(|e| ScriptError::Eval(e.to_string()))
    }

    /// Evaluate to a pipeline value coerced to `target`.
    pub fn eval_value(&self, bindings: &[(&str, Value)], target: ValueType) -> Result<Value> {
        let raw = self.eval_raw(bindings)?;
        let value = from_eval(&raw)
            .ok_or_else(|| ScriptError::ResultType { got: type_name(&raw).into(), want: target })?;
        value
            .coerce(target)
            .ok_or_else(|| ScriptError::ResultType { got: type_name(&raw).into(), want: target })
    }

    /// Evaluate as an alarm condition.
    pub fn eval_condition(&self, bindings: &[(&str, Value)]) -> Result<ConditionOutcome> {
        let raw = self.eval_raw(bindings)?;
        match raw {
            evalexpr::Value::Boolean(triggered) => Ok(ConditionOutcome {
                triggered,
                message: None,
                severity: None,
            }),
            evalexpr::Value::Tuple(parts) => {
                let mut iter = parts.into_iter();
                let triggered = match iter.next() {
                    Some(evalexpr::Value::Boolean(b)) => b,
                    other => {
                        return Err(ScriptError::Eval(format!(
                            "condition tuple must start with a boolean, got {other:?}"
                        )))
                    }
                };
                let message = iter.next().and_then(|v| match v {
                    evalexpr::Value::String(s) => Some(s),
                    _ => None,
                });
                let severity = iter.next().and_then(|v| match v {
                    evalexpr::Value::String(s) => Some(s),
                    _ => None,
                });
                Ok(ConditionOutcome { triggered, message, severity })
            }
            other => Err(ScriptError::Eval(format!(
                "condition must return a boolean or tuple, got {}",
                type_name(&other)
            ))),
        }
    }
}

/// Result of a condition script.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    pub triggered: bool,
    pub message: Option<String>,
    /// Severity name override: "critical" | "high" | "medium" | "low" | "info".
    pub severity: Option<String>,
}

fn to_eval(value: &Value) -> evalexpr::Value {
    match value {
        Value::Bool(b) => evalexpr::Value::Boolean(*b),
        Value::Int(i) => evalexpr::Value::Int(*i),
        Value::Float(f) => evalexpr::Value::Float(*f),
        Value::Text(s) => evalexpr::Value::String(s.clone()),
    }
}

fn from_eval(value: &evalexpr::Value) -> Option<Value> {
    match value {
        evalexpr::Value::Boolean(b) => Some(Value::Bool(*b)),
        evalexpr::Value::Int(i) => Some(Value::Int(*i)),
        evalexpr::Value::Float(f) => Some(Value::Float(*f)),
        evalexpr::Value::String(s) => Some(Value::Text(s.clone())),
        _ => None,
    }
}

fn type_name(value: &evalexpr::Value) -> &'static str {
    match value {
        evalexpr::Value::Boolean(_) => "boolean",
        evalexpr::Value::Int(_) => "int",
        evalexpr::Value::Float(_) => "float",
        evalexpr::Value::String(_) => "string",
        evalexpr::Value::Tuple(_) => "tuple",
        evalexpr::Value::Empty => "empty",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_over_bindings() {
        let script = CompiledScript::compile("dp1 + dp2").unwrap();
        assert_eq!(script.variables(), ["dp1", "dp2"]);
        let result = script
            .eval_value(
                &[("dp1", Value::Float(60.0)), ("dp2", Value::Float(45.0))],
                ValueType::Float,
            )
            .unwrap();
        assert_eq!(result, Value::Float(105.0));
    }

    #[test]
    fn condition_boolean() {
        let script = CompiledScript::compile("tempC > 80 && pressureBar > 5").unwrap();
        let fire = script
            .eval_condition(&[("tempC", Value::Float(85.0)), ("pressureBar", Value::Float(6.0))])
            .unwrap();
        assert!(fire.triggered);
        let clear = script
            .eval_condition(&[("tempC", Value::Float(85.0)), ("pressureBar", Value::Float(4.0))])
            .unwrap();
        assert!(!clear.triggered);
    }

    #[test]
    fn condition_tuple_overrides() {
        let script =
            CompiledScript::compile(r#"(level > 90, "tank nearly full", "critical")"#).unwrap();
        let outcome = script.eval_condition(&[("level", Value::Float(95.0))]).unwrap();
        assert!(outcome.triggered);
        assert_eq!(outcome.message.as_deref(), Some("tank nearly full"));
        assert_eq!(outcome.severity.as_deref(), Some("critical"));
    }

    #[test]
    fn unbound_variables_are_named() {
        let script = CompiledScript::compile("a + b").unwrap();
        let err = script.eval_value(&[("a", Value::Int(1))], ValueType::Int).unwrap_err();
        assert_eq!(err, ScriptError::Unbound("b".into()));
    }

    #[test]
    fn parse_errors_are_reported() {
        assert!(matches!(CompiledScript::compile("1 +"), Err(ScriptError::Parse(_))));
    }

    #[test]
    fn oversized_scripts_rejected() {
        let big = (0..200).map(|i| format!("x{i}")).collect::<Vec<_>>().join(" + ");
        assert!(matches!(
            CompiledScript::compile(&big),
            Err(ScriptError::TooLarge { .. })
        ));
    }

    #[test]
    fn same_snapshot_same_result() {
        let script = CompiledScript::compile("min(a, b) * 2").unwrap();
        let bindings = [("a", Value::Float(3.0)), ("b", Value::Float(7.0))];
        let first = script.eval_value(&bindings, ValueType::Float).unwrap();
        let second = script.eval_value(&bindings, ValueType::Float).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Value::Float(6.0));
    }

    #[test]
    fn result_coerces_to_declared_type() {
        let script = CompiledScript::compile("a / b").unwrap();
        let result = script
            .eval_value(&[("a", Value::Int(7)), ("b", Value::Int(2))], ValueType::Int)
            .unwrap();
        // Integer division stays integral under Int bindings.
        assert_eq!(result, Value::Int(3));
    }
}
