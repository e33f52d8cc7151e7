use crate::core::workflow::model::Step;
use crate::core::workflow::vars::Vars;
use serde_json::Value;

/// Line prefix a command prints to export a variable to later steps.
pub const EXPORT_PREFIX: &str = "FLEETFLOW_EXPORT:";

/// `args.export_vars` accepts a bool or the usual truthy strings.
pub fn export_vars_enabled(step: &Step) -> bool {
    match step.args.get("export_vars") {
        Some(Value::Bool(enabled)) => *enabled,
        Some(Value::String(raw)) => matches!(
            raw.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        _ => false,
    }
}

/// Collect `FLEETFLOW_EXPORT: KEY=value` (or `KEY: value`, optionally wrapped in braces) lines.
pub fn parse_export_vars(output: &str) -> Option<Vars> {
    let mut exports = Vars::new();
    for line in output.lines() {
        let Some(payload) = line.trim().strip_prefix(EXPORT_PREFIX) else {
            continue;
        };
        let mut payload = payload.trim();
        if payload.len() >= 2 && payload.starts_with('{') && payload.ends_with('}') {
            payload = payload[1..payload.len() - 1].trim();
        }
        if let Some((key, value)) = split_key_value(payload) {
            exports.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
    (!exports.is_empty()).then_some(exports)
}

fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=').or_else(|| line.split_once(':'))?;
    let key = key.trim();
    (!key.is_empty()).then(|| (key, value.trim()))
}
