//! Placeholder substitution over JSON documents.
//!
//! A placeholder is `{name}` where `name` is made of ASCII letters, digits
//! and underscores. Only string leaves are rewritten; map keys, numbers and
//! other scalars pass through untouched.

use serde_json::{Map, Value};

/// Variables available to templates.
pub type TemplateVars = Map<String, Value>;

/// Substitute placeholders in every string leaf of `template`.
///
/// A string that is exactly one known placeholder becomes the variable's
/// value with its JSON type preserved. Anywhere else a known placeholder is
/// replaced by the variable's display form. Unknown placeholders stay
/// verbatim.
pub fn substitute(template: &Value, vars: &TemplateVars) -> Value {
    match template {
        Value::String(s) => substitute_str(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Display form of a variable inside a larger string: strings raw, anything
/// else as compact JSON.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn substitute_str(s: &str, vars: &TemplateVars) -> Value {
    if let Some(name) = whole_placeholder(s) {
        if let Some(value) = vars.get(name) {
            return value.clone();
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_placeholder_name(&after[..close]) => {
                let name = &after[..close];
                match vars.get(name) {
                    Some(value) => out.push_str(&display_value(value)),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

fn whole_placeholder(s: &str) -> Option<&str> {
    let name = s.strip_prefix('{')?.strip_suffix('}')?;
    is_placeholder_name(name).then_some(name)
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
