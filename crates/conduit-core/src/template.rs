use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

/// The three roots a placeholder may reference.
pub struct TemplateContext<'a> {
    /// Flow input (`{{input.x}}`).
    pub input: &'a Value,
    /// Prior node outputs keyed by node id (`{{node.fetch.body}}`).
    pub nodes: &'a HashMap<String, Value>,
    /// Flow variables (`{{var.count}}`).
    pub variables: &'a HashMap<String, Value>,
}

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("static pattern"))
}

/// Substitute `{{scope.path}}` placeholders in a value tree.
///
/// Objects and arrays are traversed; non-string scalars pass through. A string
/// that is exactly one placeholder becomes the referenced value itself, so
/// arrays and objects survive. Placeholders embedded in longer text are
/// rendered as text. Unresolvable references become the empty string.
/// Substituted values are not re-scanned.
pub fn resolve_template(value: &Value, ctx: &TemplateContext<'_>) -> Value {
    match value {
        Value::String(s) => resolve_str(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_template(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_template(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a single string, always producing text.
pub fn render_string(template: &str, ctx: &TemplateContext<'_>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures<'_>| {
            lookup(&caps[1], ctx).map(|v| stringify(&v)).unwrap_or_default()
        })
        .into_owned()
}

fn resolve_str(s: &str, ctx: &TemplateContext<'_>) -> Value {
    if !s.contains("{{") {
        return Value::String(s.to_string());
    }
    if let Some(caps) = placeholder().captures(s) {
        if let Some(whole) = caps.get(0) {
            if whole.start() == 0 && whole.end() == s.len() {
                return lookup(&caps[1], ctx).unwrap_or_else(|| Value::String(String::new()));
            }
        }
    }
    Value::String(render_string(s, ctx))
}

fn lookup(expr: &str, ctx: &TemplateContext<'_>) -> Option<Value> {
    let mut segments = expr.trim().split('.');
    let scope = segments.next()?;
    let rest: Vec<&str> = segments.collect();

    match scope {
        "input" => walk(ctx.input, &rest),
        "node" => {
            let (id, path) = rest.split_first()?;
            walk(ctx.nodes.get(*id)?, path)
        }
        "var" => {
            let (name, path) = rest.split_first()?;
            walk(ctx.variables.get(*name)?, path)
        }
        _ => None,
    }
}

/// Follow a dotted path; numeric segments index arrays.
pub fn walk(root: &Value, path: &[&str]) -> Option<Value> {
    let mut current = root;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Text form of a value: strings verbatim, null empty, others as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> (Value, HashMap<String, Value>, HashMap<String, Value>) {
        let input = json!({"user": {"name": "Ada", "tags": ["a", "b"]}});
        let mut nodes = HashMap::new();
        nodes.insert("fetch".to_string(), json!({"items": [1, 2, 3], "status": 200}));
        let mut vars = HashMap::new();
        vars.insert("count".to_string(), json!(4));
        (input, nodes, vars)
    }

    #[test]
    fn embedded_placeholders_render_as_text() {
        let (input, nodes, variables) = fixture();
        let ctx = TemplateContext { input: &input, nodes: &nodes, variables: &variables };
        let out = resolve_template(
            &json!("Hi {{ input.user.name }}, status {{node.fetch.status}} x{{var.count}}"),
            &ctx,
        );
        assert_eq!(out, json!("Hi Ada, status 200 x4"));
    }

    #[test]
    fn whole_placeholder_keeps_value_type() {
        let (input, nodes, variables) = fixture();
        let ctx = TemplateContext { input: &input, nodes: &nodes, variables: &variables };
        assert_eq!(resolve_template(&json!("{{node.fetch.items}}"), &ctx), json!([1, 2, 3]));
        assert_eq!(resolve_template(&json!("{{input.user.tags.1}}"), &ctx), json!("b"));
    }

    #[test]
    fn missing_references_become_empty() {
        let (input, nodes, variables) = fixture();
        let ctx = TemplateContext { input: &input, nodes: &nodes, variables: &variables };
        assert_eq!(resolve_template(&json!("{{node.ghost.x}}"), &ctx), json!(""));
        assert_eq!(resolve_template(&json!("[{{env.HOME}}]"), &ctx), json!("[]"));
    }

    #[test]
    fn deep_traversal_leaves_scalars() {
        let (input, nodes, variables) = fixture();
        let ctx = TemplateContext { input: &input, nodes: &nodes, variables: &variables };
        let out = resolve_template(
            &json!({"a": ["{{var.count}}", 7, true], "b": {"c": "plain"}}),
            &ctx,
        );
        assert_eq!(out, json!({"a": [4, 7, true], "b": {"c": "plain"}}));
    }

    #[test]
    fn single_pass() {
        let input = json!({"evil": "{{var.secret}}"});
        let nodes = HashMap::new();
        let mut variables = HashMap::new();
        variables.insert("secret".to_string(), json!("leaked"));
        let ctx = TemplateContext { input: &input, nodes: &nodes, variables: &variables };
        assert_eq!(
            resolve_template(&json!("got {{input.evil}}"), &ctx),
            json!("got {{var.secret}}")
        );
    }
}
