use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("token pattern"))
}

/// Walk a dotted path through `root`: objects by key, arrays by index.
///
/// Returns `None` as soon as a segment is missing.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        let segment = segment.trim();
        if segment.is_empty() {
            return None;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{{ path }}` token in `template` with the value found in
/// `context`.
///
/// Strings are inserted raw, other scalars are stringified, objects and
/// arrays are inserted as JSON. A token whose path does not resolve is kept
/// verbatim.
pub fn resolve(template: &str, context: &Value) -> String {
    token_pattern()
        .replace_all(template, |caps: &Captures<'_>| {
            match lookup_path(context, &caps[1]) {
                Some(value) => render(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolve every string inside `value`, recursing through arrays and objects.
/// Non-string leaves are returned unchanged.
pub fn resolve_deep(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(resolve(s, context)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_deep(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_deep(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}
