#![allow(clippy::result_large_err)]

//! Guard expressions (`when:`) over a variable scope.
//!
//! Grammar: `||` binds loosest, then `&&`, then a single comparison,
//! then a bare operand tested for truthiness. Operators inside quoted literals are ignored.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::vars::{as_number, lookup, value_to_string, Vars};
use serde_json::Value;

const COMPARISON_OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

/// Evaluate a guard expression. An empty expression is `true`.
pub fn evaluate(expression: &str, vars: &Vars) -> Result<bool, AppError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Ok(true);
    }
    match trimmed.to_lowercase().as_str() {
        "true" | "yes" => return Ok(true),
        "false" | "no" => return Ok(false),
        _ => {}
    }

    let disjuncts = split_logical(trimmed, "||");
    if disjuncts.len() > 1 {
        for part in disjuncts {
            if evaluate(part, vars)? {
                return Ok(true);
            }
        }
        return Ok(false);
    }

    let conjuncts = split_logical(trimmed, "&&");
    if conjuncts.len() > 1 {
        for part in conjuncts {
            if !evaluate(part, vars)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let (op, idx) = match find_operator(trimmed) {
        Some((op, idx)) if idx > 0 => (op, idx),
        _ => return Ok(truthy(&parse_operand(trimmed, vars))),
    };

    let left = parse_operand(&trimmed[..idx], vars);
    let right = parse_operand(&trimmed[idx + op.len()..], vars);
    match op {
        "==" => Ok(compare_equal(&left, &right)),
        "!=" => Ok(!compare_equal(&left, &right)),
        _ => {
            let (l, r) = match (as_number(&left), as_number(&right)) {
                (Some(l), Some(r)) => (l, r),
                _ => {
                    return Err(AppError::new(
                        ErrorCategory::ResolutionError,
                        format!("when expression expects numeric comparison for \"{}\"", op),
                    )
                    .with_code("FF-WHEN-001"))
                }
            };
            Ok(match op {
                ">" => l > r,
                ">=" => l >= r,
                "<" => l < r,
                _ => l <= r,
            })
        }
    }
}

/// Truthiness of a resolved operand.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !matches!(
            s.trim().to_lowercase().as_str(),
            "" | "false" | "0" | "no"
        ),
        _ => true,
    }
}

/// Split on `token` outside of single- or double-quoted literals.
fn split_logical<'a>(expr: &'a str, token: &str) -> Vec<&'a str> {
    if !expr.contains(token) {
        return vec![expr];
    }
    let bytes = expr.as_bytes();
    let token_bytes = token.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            _ => {}
        }
        if !in_single && !in_double && bytes[i..].starts_with(token_bytes) {
            parts.push(&expr[start..i]);
            i += token_bytes.len();
            start = i;
            continue;
        }
        i += 1;
    }
    parts.push(&expr[start..]);
    parts
}

/// First unquoted comparison operator and its byte offset.
fn find_operator(expr: &str) -> Option<(&'static str, usize)> {
    let bytes = expr.as_bytes();
    let mut in_single = false;
    let mut in_double = false;
    for i in 0..bytes.len() {
        match bytes[i] {
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            _ => {}
        }
        if in_single || in_double {
            continue;
        }
        for op in COMPARISON_OPERATORS {
            if bytes[i..].starts_with(op.as_bytes()) {
                return Some((op, i));
            }
        }
    }
    None
}

fn parse_operand(raw: &str, vars: &Vars) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::String(String::new());
    }
    if is_quoted(trimmed) {
        return Value::String(trimmed[1..trimmed.len() - 1].to_string());
    }
    if let Some(key) = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        return lookup(vars, key.trim())
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));
    }
    if let Some(value) = lookup(vars, trimmed) {
        return value.clone();
    }
    match trimmed.to_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(num) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(num) {
            return Value::Number(n);
        }
    }
    Value::String(trimmed.to_string())
}

fn is_quoted(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
}

fn compare_equal(left: &Value, right: &Value) -> bool {
    if let (Some(l), Some(r)) = (as_number(left), as_number(right)) {
        return l == r;
    }
    if let (Value::Bool(l), Value::Bool(r)) = (left, right) {
        return l == r;
    }
    value_to_string(left) == value_to_string(right)
}
