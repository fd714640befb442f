//! Expression evaluation contract.
//!
//! The engine treats the expression grammar as an external edge: executors
//! hand `(expressionText, variableScope)` to an `ExpressionEvaluator` and
//! use the value that comes back. The bundled `SimpleEvaluator` covers what
//! process models actually use — `=name` direct reads, `${name}` template
//! substitution inside strings, literals, and binary comparisons — and can
//! be swapped for a full evaluator without touching the core.

use crate::error::EngineError;
use crate::types::Variables;
use serde_json::{Number, Value};

pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &Variables) -> Result<Value, EngineError>;
}

/// BPMN-style truthiness: false/null/0/"" are falsy, everything else truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

/// Render a correlation key or mapping target out of a JSON value.
pub fn value_to_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Default)]
pub struct SimpleEvaluator;

impl ExpressionEvaluator for SimpleEvaluator {
    fn evaluate(&self, expression: &str, scope: &Variables) -> Result<Value, EngineError> {
        let text = expression.trim();
        let text = text.strip_prefix('=').unwrap_or(text).trim();
        if text.is_empty() {
            return Err(EngineError::ExpressionError {
                expression: expression.to_string(),
                reason: "empty expression".into(),
            });
        }

        // Two-character operators first so `<=` never parses as `<`.
        for op in ["==", "!=", "<=", ">=", "<", ">"] {
            if let Some((lhs, rhs)) = split_operator(text, op) {
                let left = resolve_operand(lhs, scope, expression)?;
                let right = resolve_operand(rhs, scope, expression)?;
                return compare(op, &left, &right, expression).map(Value::Bool);
            }
        }

        resolve_operand(text, scope, expression)
    }
}

/// Resolve `${name}` placeholders inside a template string.
pub fn resolve_template(text: &str, scope: &Variables) -> Result<String, EngineError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| EngineError::ExpressionError {
            expression: text.to_string(),
            reason: "unterminated ${ placeholder".into(),
        })?;
        let name = after[..end].trim();
        let value = scope.get(name).ok_or_else(|| EngineError::ExpressionError {
            expression: text.to_string(),
            reason: format!("unknown variable `{name}`"),
        })?;
        out.push_str(&value_to_key(value));
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolve a source expression the way I/O mappings and correlation keys
/// are written: `=name` evaluates, `${...}` substitutes, anything else is a
/// literal string.
pub fn resolve_source(
    evaluator: &dyn ExpressionEvaluator,
    raw: &str,
    scope: &Variables,
) -> Result<Value, EngineError> {
    if let Some(stripped) = raw.trim().strip_prefix('=') {
        evaluator.evaluate(stripped, scope)
    } else if raw.contains("${") {
        resolve_template(raw, scope).map(Value::String)
    } else {
        Ok(Value::String(raw.to_string()))
    }
}

fn split_operator<'a>(text: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let idx = text.find(op)?;
    // Reject `<` found inside `<=` when scanning single-char ops.
    if op.len() == 1 {
        let bytes = text.as_bytes();
        if bytes.get(idx + 1) == Some(&b'=') {
            return None;
        }
        if idx > 0 && matches!(bytes[idx - 1], b'<' | b'>' | b'=' | b'!') {
            return None;
        }
    }
    let (lhs, rhs) = (&text[..idx], &text[idx + op.len()..]);
    if lhs.trim().is_empty() || rhs.trim().is_empty() {
        return None;
    }
    Some((lhs.trim(), rhs.trim()))
}

fn resolve_operand(text: &str, scope: &Variables, origin: &str) -> Result<Value, EngineError> {
    if let Some(quoted) = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .or_else(|| text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')))
    {
        return Ok(Value::String(quoted.to_string()));
    }
    match text {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" => return Ok(Value::Null),
        _ => {}
    }
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::Number(n.into()));
    }
    if let Ok(f) = text.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Ok(Value::Number(n));
        }
    }
    if text.contains("${") {
        return resolve_template(text, scope).map(Value::String);
    }
    scope
        .get(text)
        .cloned()
        .ok_or_else(|| EngineError::ExpressionError {
            expression: origin.to_string(),
            reason: format!("unknown variable `{text}`"),
        })
}

fn compare(op: &str, left: &Value, right: &Value, origin: &str) -> Result<bool, EngineError> {
    match op {
        "==" => return Ok(values_equal(left, right)),
        "!=" => return Ok(!values_equal(left, right)),
        _ => {}
    }
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    let ordering = ordering.ok_or_else(|| EngineError::ExpressionError {
        expression: origin.to_string(),
        reason: format!("cannot order {left} against {right}"),
    })?;
    Ok(match op {
        "<" => ordering.is_lt(),
        "<=" => ordering.is_le(),
        ">" => ordering.is_gt(),
        ">=" => ordering.is_ge(),
        _ => false,
    })
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().unwrap_or(f64::NAN) == b.as_f64().unwrap_or(f64::NAN)
        }
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Variables {
        json!({"a": 5, "b": -1, "name": "alice", "paid": true, "orderId": "o-1"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn comparisons_against_literals() {
        let eval = SimpleEvaluator;
        let s = scope();
        assert_eq!(eval.evaluate("a > 0", &s).unwrap(), json!(true));
        assert_eq!(eval.evaluate("b > 0", &s).unwrap(), json!(false));
        assert_eq!(eval.evaluate("a >= 5", &s).unwrap(), json!(true));
        assert_eq!(eval.evaluate("a <= 4", &s).unwrap(), json!(false));
        assert_eq!(eval.evaluate("a == 5", &s).unwrap(), json!(true));
        assert_eq!(eval.evaluate("name != 'bob'", &s).unwrap(), json!(true));
        assert_eq!(eval.evaluate("name == \"alice\"", &s).unwrap(), json!(true));
    }

    #[test]
    fn direct_form_reads_a_variable() {
        let eval = SimpleEvaluator;
        assert_eq!(eval.evaluate("=orderId", &scope()).unwrap(), json!("o-1"));
        assert_eq!(eval.evaluate("=paid", &scope()).unwrap(), json!(true));
    }

    #[test]
    fn unknown_variable_is_an_expression_error() {
        let eval = SimpleEvaluator;
        let err = eval.evaluate("ghost > 1", &scope()).unwrap_err();
        assert_eq!(err.code(), "EXPRESSION_ERROR");
    }

    #[test]
    fn template_substitution() {
        let s = scope();
        assert_eq!(
            resolve_template("order ${orderId} for ${name}", &s).unwrap(),
            "order o-1 for alice"
        );
        assert!(resolve_template("${unterminated", &s).is_err());
        assert!(resolve_template("${ghost}", &s).is_err());
    }

    #[test]
    fn source_resolution_covers_all_three_forms() {
        let eval = SimpleEvaluator;
        let s = scope();
        assert_eq!(resolve_source(&eval, "=orderId", &s).unwrap(), json!("o-1"));
        assert_eq!(
            resolve_source(&eval, "id-${orderId}", &s).unwrap(),
            json!("id-o-1")
        );
        assert_eq!(resolve_source(&eval, "plain", &s).unwrap(), json!("plain"));
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&Value::Null));
    }
}
