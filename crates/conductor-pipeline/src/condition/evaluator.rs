//! Tree-walking evaluation of parsed expressions against a context snapshot.

use std::collections::BTreeMap;

use conductor_types::{metadata_keys, AgentResult, ContextSnapshot, Result};

use super::make_error;
use super::parser::{BinaryOp, Expr, LiteralValue};

/// Returned for missing shared-state and metadata keys.
pub const MISSING: &str = "missing";

/// Runtime value of an expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Map(BTreeMap<String, String>),
}

impl Value {
    /// Strings that look like numbers or booleans become those.
    fn coerce(self) -> Value {
        match self {
            Value::Str(s) => {
                let trimmed = s.trim();
                if let Ok(n) = trimmed.parse::<f64>() {
                    if !trimmed.is_empty() && n.is_finite() {
                        return Value::Number(n);
                    }
                }
                if trimmed.eq_ignore_ascii_case("true") {
                    Value::Bool(true)
                } else if trimmed.eq_ignore_ascii_case("false") {
                    Value::Bool(false)
                } else {
                    Value::Str(s)
                }
            }
            other => other,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self.clone().coerce() {
            Value::Null => false,
            Value::Bool(b) => b,
            Value::Number(n) => n != 0.0,
            Value::Str(s) => !(s.is_empty() || s.eq_ignore_ascii_case("false")),
            Value::Map(_) => true,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::Str(s) => s.clone(),
            Value::Map(m) => {
                let body = m
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{body}}}")
            }
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::Str(s.clone()),
            other => Value::Str(other.to_string()),
        }
    }
}

fn optional(v: Option<&String>) -> Value {
    v.map(|s| Value::Str(s.clone())).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

pub fn evaluate_expr(expr: &Expr, ctx: &ContextSnapshot) -> Result<Value> {
    match expr {
        Expr::Literal(lit) => Ok(match lit {
            LiteralValue::Bool(b) => Value::Bool(*b),
            LiteralValue::Number(n) => Value::Number(*n),
            LiteralValue::Str(s) => Value::Str(s.clone()),
        }),
        Expr::Grouping(inner) => evaluate_expr(inner, ctx),
        Expr::Unary(inner) => Ok(Value::Bool(!evaluate_expr(inner, ctx)?.is_truthy())),
        Expr::Variable(name) => Ok(resolve_identifier(name, ctx)),
        Expr::Call { function, argument } => {
            let attribute = match function.to_ascii_lowercase().as_str() {
                "success" => "success".to_string(),
                "tokens" => format!("metadata.{}", metadata_keys::TOKENS),
                "output" => "output".to_string(),
                "reason" => "error".to_string(),
                other => return Err(make_error(&format!("unknown function '{other}'"))),
            };
            Ok(resolve_identifier(&format!("{argument}.{attribute}"), ctx))
        }
        Expr::Binary { left, op, right } => evaluate_binary(left, *op, right, ctx),
    }
}

fn evaluate_binary(left: &Expr, op: BinaryOp, right: &Expr, ctx: &ContextSnapshot) -> Result<Value> {
    match op {
        BinaryOp::Or => {
            if evaluate_expr(left, ctx)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(evaluate_expr(right, ctx)?.is_truthy()))
        }
        BinaryOp::And => {
            if !evaluate_expr(left, ctx)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(evaluate_expr(right, ctx)?.is_truthy()))
        }
        // Text operators see the operands as written.
        BinaryOp::Contains | BinaryOp::Matches => {
            let l = evaluate_expr(left, ctx)?;
            let r = evaluate_expr(right, ctx)?;
            compare(&l, op, &r).map(Value::Bool)
        }
        _ => {
            let l = evaluate_expr(left, ctx)?.coerce();
            let r = evaluate_expr(right, ctx)?.coerce();
            compare(&l, op, &r).map(Value::Bool)
        }
    }
}

fn compare(l: &Value, op: BinaryOp, r: &Value) -> Result<bool> {
    match op {
        BinaryOp::Equal => Ok(values_equal(l, r)),
        BinaryOp::NotEqual => Ok(!values_equal(l, r)),
        BinaryOp::Greater | BinaryOp::GreaterEqual | BinaryOp::Less | BinaryOp::LessEqual => {
            let (Some(a), Some(b)) = (l.as_number(), r.as_number()) else {
                return Ok(false);
            };
            Ok(match op {
                BinaryOp::Greater => a > b,
                BinaryOp::GreaterEqual => a >= b,
                BinaryOp::Less => a < b,
                _ => a <= b,
            })
        }
        BinaryOp::Contains => Ok(l
            .render()
            .to_lowercase()
            .contains(&r.render().to_lowercase())),
        BinaryOp::Matches => match regex::Regex::new(&r.render()) {
            Ok(re) => Ok(re.is_match(&l.render())),
            Err(e) => {
                tracing::debug!(pattern = %r.render(), error = %e, "invalid regex in condition");
                Ok(false)
            }
        },
        BinaryOp::Or | BinaryOp::And => Ok(l.is_truthy() && r.is_truthy()),
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => l.render().to_lowercase() == r.render().to_lowercase(),
    }
}

// ---------------------------------------------------------------------------
// Identifier resolution
// ---------------------------------------------------------------------------

fn resolve_identifier(name: &str, ctx: &ContextSnapshot) -> Value {
    if let Some(key) = name.strip_prefix("context.sharedState.") {
        return ctx
            .shared_state
            .get(key)
            .map(Value::from)
            .unwrap_or_else(|| Value::Str(MISSING.to_string()));
    }
    if let Some(key) = name.strip_prefix("context.metadata.") {
        return ctx
            .metadata
            .get(key)
            .map(|v| Value::Str(v.clone()))
            .unwrap_or_else(|| Value::Str(MISSING.to_string()));
    }
    if name == "context.elapsedTimeMs" {
        return Value::Number(ctx.elapsed_ms as f64);
    }
    resolve_stage_reference(name, ctx)
}

fn resolve_stage_reference(name: &str, ctx: &ContextSnapshot) -> Value {
    let mut parts = name.split('.');
    let stage_id = parts.next().unwrap_or(name);
    let Some(result) = ctx.stage_results.get(stage_id) else {
        return Value::Str(name.to_string());
    };
    let rest: Vec<&str> = parts.collect();
    stage_attribute(result, &rest)
}

fn stage_attribute(result: &AgentResult, path: &[&str]) -> Value {
    match path {
        [] => match &result.output {
            Some(out) => Value::Str(out.clone()),
            None => Value::Map(result.metadata.clone()),
        },
        ["output"] => optional(result.output.as_ref()),
        ["error"] => optional(result.error.as_ref()),
        ["success"] => Value::Bool(result.success),
        ["metadata"] => Value::Map(result.metadata.clone()),
        ["metadata", key @ ..] => optional(result.metadata.get(&key.join("."))),
        keys => optional(result.metadata.get(&keys.join("."))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coercion_of_strings() {
        assert_eq!(Value::Str("42".into()).coerce(), Value::Number(42.0));
        assert_eq!(Value::Str("TRUE".into()).coerce(), Value::Bool(true));
        assert_eq!(Value::Str("4x".into()).coerce(), Value::Str("4x".into()));
        assert_eq!(Value::Str("".into()).coerce(), Value::Str("".into()));
    }

    #[test]
    fn truthiness_rules() {
        assert!(!Value::Null.is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Number(0.5).is_truthy());
        assert!(!Value::Str(String::new()).is_truthy());
        assert!(!Value::Str("False".into()).is_truthy());
        assert!(!Value::Str("0".into()).is_truthy());
        assert!(Value::Str("anything".into()).is_truthy());
        assert!(Value::Map(BTreeMap::new()).is_truthy());
    }

    #[test]
    fn equality_numeric_then_case_insensitive() {
        assert!(values_equal(&Value::Number(1.0), &Value::Number(1.0)));
        assert!(values_equal(
            &Value::Str("Approved".into()),
            &Value::Str("approved".into())
        ));
        assert!(!values_equal(&Value::Null, &Value::Str("null".into())));
    }

    #[test]
    fn number_rendering() {
        assert_eq!(Value::Number(3.0).render(), "3");
        assert_eq!(Value::Number(0.25).render(), "0.25");
    }
}
