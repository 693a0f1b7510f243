//! `{{...}}` template substitution.
//!
//! The grammar is closed: `{{input.<name>}}` and `{{lastOutput}}`. Anything
//! else between braces is left in the text untouched. Substituted values are
//! never rescanned.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::warn;

use stepwise_core::types::value_to_text;

use crate::context::ExecutionContext;

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").unwrap())
}

/// Result of resolving a template.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub text: String,
    /// One entry per reference that resolved to nothing.
    pub warnings: Vec<String>,
}

enum Reference<'a> {
    Input(&'a str),
    LastOutput,
}

fn parse_reference(expr: &str) -> Option<Reference<'_>> {
    if expr == "lastOutput" {
        return Some(Reference::LastOutput);
    }
    let name = expr.strip_prefix("input.")?;
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    valid.then_some(Reference::Input(name))
}

/// Substitute every supported reference, collecting warnings for missing ones.
pub fn resolve_with_warnings(template: &str, ctx: &ExecutionContext) -> Resolved {
    let mut warnings = Vec::new();
    let text = template_pattern().replace_all(template, |caps: &Captures<'_>| {
        match parse_reference(&caps[1]) {
            Some(Reference::Input(name)) => match ctx.input(name) {
                Some(value) => value_to_text(value),
                None => {
                    warnings.push(format!("unresolved reference 'input.{}'", name));
                    String::new()
                }
            },
            Some(Reference::LastOutput) => {
                ctx.last_output.as_ref().map(value_to_text).unwrap_or_default()
            }
            None => caps[0].to_string(),
        }
    });
    Resolved {
        text: text.into_owned(),
        warnings,
    }
}

/// Substitute references in `template`. Missing inputs become empty text and
/// are logged.
pub fn resolve(template: &str, ctx: &ExecutionContext) -> String {
    let resolved = resolve_with_warnings(template, ctx);
    for warning in &resolved.warnings {
        warn!(template = %template, "{}", warning);
    }
    resolved.text
}

/// Resolve every string leaf of a JSON value. Keys are left as they are.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> Value {
    match value {
        Value::String(s) => Value::String(resolve(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn ctx(inputs: Value) -> ExecutionContext {
        let inputs: Map<String, Value> = serde_json::from_value(inputs).unwrap();
        ExecutionContext::new(inputs)
    }

    #[test]
    fn test_input_reference() {
        assert_eq!(resolve("{{input.q}}", &ctx(json!({"q": "x"}))), "x");
    }

    #[test]
    fn test_missing_input_is_empty_with_warning() {
        let out = resolve_with_warnings("[{{input.missing}}]", &ctx(json!({})));
        assert_eq!(out.text, "[]");
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].contains("input.missing"));
    }

    #[test]
    fn test_last_output() {
        let mut c = ctx(json!({}));
        assert_eq!(resolve("<{{lastOutput}}>", &c), "<>");
        c.record_output("a", json!({"n": 1}));
        assert_eq!(resolve("<{{ lastOutput }}>", &c), r#"<{"n":1}>"#);
    }

    #[test]
    fn test_non_string_inputs_render_as_json() {
        let c = ctx(json!({"n": 4, "ok": true}));
        assert_eq!(resolve("{{input.n}}/{{input.ok}}", &c), "4/true");
    }

    #[test]
    fn test_unknown_expressions_left_verbatim() {
        let c = ctx(json!({"q": "x"}));
        let template = "{{ env.HOME }} {{input.q.len()}} {{1+1}} {{outputs.a}}";
        assert_eq!(resolve(template, &c), template);
    }

    #[test]
    fn test_substitution_is_not_recursive() {
        let c = ctx(json!({"q": "{{input.secret}}", "secret": "s3cr3t"}));
        assert_eq!(resolve("{{input.q}}", &c), "{{input.secret}}");
    }

    #[test]
    fn test_idempotent_on_resolved_text() {
        let c = ctx(json!({"q": "what is 2+2", "n": 3}));
        let once = resolve("Q: {{input.q}} n={{input.n}} {{lastOutput}} {{input.none}}", &c);
        assert_eq!(resolve(&once, &c), once);
    }

    #[test]
    fn test_resolve_value_leaves() {
        let c = ctx(json!({"q": "rust"}));
        let args = json!({"query": "{{input.q}}", "limit": 5, "tags": ["{{input.q}}", "x"]});
        assert_eq!(
            resolve_value(&args, &c),
            json!({"query": "rust", "limit": 5, "tags": ["rust", "x"]})
        );
    }
}
