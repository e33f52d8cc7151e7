use crate::core::workflow::vars::{lookup, value_to_string, Vars};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern is valid"))
}

/// Replace `${dotted.key}` placeholders; unknown keys are left as written.
pub fn render_string(input: &str, vars: &Vars) -> String {
    if !input.contains("${") {
        return input.to_string();
    }
    placeholder()
        .replace_all(input, |caps: &Captures| match lookup(vars, &caps[1]) {
            Some(value) => value_to_string(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn render_value(value: &Value, vars: &Vars) -> Value {
    match value {
        Value::String(s) => Value::String(render_string(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(render_vars(map, vars)),
        other => other.clone(),
    }
}

pub fn render_vars(args: &Vars, vars: &Vars) -> Vars {
    args.iter()
        .map(|(k, v)| (k.clone(), render_value(v, vars)))
        .collect()
}
