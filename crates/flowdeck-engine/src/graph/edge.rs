use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::template::resolve;

/// One branch of a `scenario-decision` node. Its index in the branch list is
/// the `branchIndex` carried by the edges it selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub condition: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl Branch {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

fn comparison_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(.+?)\s*(==|!=|>=|<=|>|<)\s*(.+?)\s*$").expect("comparison pattern")
    })
}

/// Strip one pair of matching surrounding quotes.
fn unquote(s: &str) -> &str {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Evaluate a branch condition against the context.
///
/// Supported forms:
/// - `default`: always true
/// - `LEFT OP RIGHT` with `OP` one of `== != > < >= <=`, after resolving
///   `{{ path }}` tokens. Ordering operators compare numerically; equality
///   compares strings. Surrounding quotes on either side are ignored.
///
/// Returns `false` for anything unparseable.
pub fn evaluate_condition(condition: &str, context: &Value) -> bool {
    let condition = condition.trim();
    if condition == "default" {
        return true;
    }

    let resolved = resolve(condition, context);
    let Some(caps) = comparison_pattern().captures(&resolved) else {
        return false;
    };
    let left = unquote(&caps[1]);
    let op = &caps[2];
    let right = unquote(&caps[3]);

    match op {
        "==" => left == right,
        "!=" => left != right,
        _ => {
            let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>()) else {
                return false;
            };
            match op {
                ">" => l > r,
                "<" => l < r,
                ">=" => l >= r,
                "<=" => l <= r,
                _ => false,
            }
        }
    }
}

/// First branch whose condition holds, with its index.
pub fn select_branch<'a>(branches: &'a [Branch], context: &Value) -> Option<(usize, &'a Branch)> {
    branches
        .iter()
        .enumerate()
        .find(|(_, branch)| evaluate_condition(&branch.condition, context))
}
