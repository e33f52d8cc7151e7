//! Variable scopes built on `serde_json::Value`, the one dynamic value type used by the engine.

use serde_json::{Map, Value};

/// A string-keyed variable scope.
pub type Vars = Map<String, Value>;

/// Right-biased shallow overlay: keys in `overlay` replace keys in `base`.
pub fn merge_vars(base: &Vars, overlay: &Vars) -> Vars {
    let mut out = base.clone();
    for (key, value) in overlay {
        out.insert(key.clone(), value.clone());
    }
    out
}

/// Normalise an arbitrary value into a variable map when it is an object.
pub fn as_vars(value: &Value) -> Option<Vars> {
    match value {
        Value::Object(map) => Some(map.clone()),
        _ => None,
    }
}

/// Dotted lookup (`a.b.c`) through nested objects.
pub fn lookup<'a>(vars: &'a Vars, key: &str) -> Option<&'a Value> {
    if key.is_empty() {
        return None;
    }
    let mut parts = key.split('.');
    let mut current = vars.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Render a value the way a person would print it: strings unquoted, integral numbers without
/// a fractional part, compound values as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                let f = n.as_f64().unwrap_or_default();
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", f as i64)
                } else {
                    f.to_string()
                }
            }
        }
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric view of a value: numbers as-is, strings when they parse as floats.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                trimmed.parse::<f64>().ok()
            }
        }
        _ => None,
    }
}

/// Flatten a map-valued argument into string pairs (`env` maps and the like).
pub fn string_pairs(value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect(),
        _ => Vec::new(),
    }
}
