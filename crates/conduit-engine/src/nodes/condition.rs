use futures::future::BoxFuture;
use regex::Regex;
use serde_json::{json, Value};

use conduit_core::result::{NodeFailure, NodeResult};
use conduit_core::template::stringify;

use crate::context::ExecutionContext;
use crate::executor::NodeExecutor;

const OPERATORS: &[&str] = &[
    "==", "!=", ">", "<", ">=", "<=", "equals", "notEquals", "greaterThan", "lessThan",
    "greaterThanOrEqual", "lessThanOrEqual", "contains", "notContains", "startsWith",
    "endsWith", "isEmpty", "isNotEmpty", "matches",
];

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l == r,
        _ => stringify(left) == stringify(right),
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
        Value::Object(map) => map.contains_key(&stringify(right)),
        other => stringify(other).contains(&stringify(right)),
    }
}

fn ordering(left: &Value, right: &Value) -> std::cmp::Ordering {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(std::cmp::Ordering::Equal),
        _ => stringify(left).cmp(&stringify(right)),
    }
}

/// Evaluate `left <operator> right`. Numeric strings compare as numbers.
pub fn evaluate(left: &Value, operator: &str, right: &Value) -> Result<bool, String> {
    use std::cmp::Ordering::*;

    let result = match operator {
        "==" | "equals" => loose_eq(left, right),
        "!=" | "notEquals" => !loose_eq(left, right),
        ">" | "greaterThan" => ordering(left, right) == Greater,
        "<" | "lessThan" => ordering(left, right) == Less,
        ">=" | "greaterThanOrEqual" => ordering(left, right) != Less,
        "<=" | "lessThanOrEqual" => ordering(left, right) != Greater,
        "contains" => contains(left, right),
        "notContains" => !contains(left, right),
        "startsWith" => stringify(left).starts_with(&stringify(right)),
        "endsWith" => stringify(left).ends_with(&stringify(right)),
        "isEmpty" => is_empty(left),
        "isNotEmpty" => !is_empty(left),
        "matches" => {
            let pattern = stringify(right);
            let re = Regex::new(&pattern)
                .map_err(|e| format!("invalid pattern '{}': {}", pattern, e))?;
            re.is_match(&stringify(left))
        }
        other => return Err(format!("unknown operator '{}'", other)),
    };
    Ok(result)
}

/// Evaluate a `{leftValue, operator, rightValue}` object.
pub fn evaluate_clause(clause: &Value) -> Result<bool, String> {
    let operator = clause
        .get("operator")
        .and_then(|v| v.as_str())
        .unwrap_or("==");
    let left = clause.get("leftValue").unwrap_or(&Value::Null);
    let right = clause.get("rightValue").unwrap_or(&Value::Null);
    evaluate(left, operator, right)
}

fn validate_clause(clause: &Value, label: &str, errors: &mut Vec<String>) {
    match clause.get("operator").and_then(|v| v.as_str()) {
        None => errors.push(format!("{}: operator is required", label)),
        Some(op) if !OPERATORS.contains(&op) => {
            errors.push(format!("{}: unknown operator '{}'", label, op))
        }
        Some("matches") => {
            if let Some(pattern) = clause.get("rightValue").and_then(|v| v.as_str()) {
                if !pattern.contains("{{") {
                    if let Err(e) = Regex::new(pattern) {
                        errors.push(format!("{}: invalid pattern: {}", label, e));
                    }
                }
            }
        }
        Some(_) => {}
    }
}

/// Boolean branch on one condition or a combined list of conditions.
pub struct ConditionExecutor;

impl NodeExecutor for ConditionExecutor {
    fn node_type(&self) -> &str {
        "logic:condition"
    }

    fn description(&self) -> &str {
        "Routes to the 'true' or 'false' handle"
    }

    fn validate(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        match config.get("conditions").and_then(|v| v.as_array()) {
            Some(clauses) => {
                if clauses.is_empty() {
                    errors.push("conditions must not be empty".to_string());
                }
                for (i, clause) in clauses.iter().enumerate() {
                    validate_clause(clause, &format!("conditions[{}]", i), &mut errors);
                }
                if let Some(c) = config.get("combinator").and_then(|v| v.as_str()) {
                    if c != "and" && c != "or" {
                        errors.push(format!("unknown combinator '{}'", c));
                    }
                }
            }
            None => validate_clause(config, "condition", &mut errors),
        }
        errors
    }

    fn execute(&self, ctx: ExecutionContext) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let outcome = match ctx.config.get("conditions").and_then(|v| v.as_array()) {
                Some(clauses) => {
                    let any = ctx.param_str("combinator") == Some("or");
                    let mut results = Vec::with_capacity(clauses.len());
                    for clause in clauses {
                        match evaluate_clause(clause) {
                            Ok(r) => results.push(r),
                            Err(e) => return NodeResult::failure(NodeFailure::config(e)),
                        }
                    }
                    Ok(if any {
                        results.iter().any(|r| *r)
                    } else {
                        results.iter().all(|r| *r)
                    })
                }
                None => evaluate_clause(&ctx.config),
            };

            match outcome {
                Ok(result) => {
                    let branch = if result { "true" } else { "false" };
                    NodeResult::handle(json!({"result": result, "branch": branch}), branch)
                }
                Err(e) => NodeResult::failure(NodeFailure::config(e)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_and_string_comparisons() {
        assert!(evaluate(&json!(5), ">", &json!(3)).unwrap());
        assert!(evaluate(&json!("10"), ">", &json!(9)).unwrap());
        assert!(evaluate(&json!("5"), "==", &json!(5)).unwrap());
        assert!(evaluate(&json!("abc"), "<", &json!("abd")).unwrap());
        assert!(!evaluate(&json!(3), ">=", &json!(4)).unwrap());
    }

    #[test]
    fn collection_operators() {
        assert!(evaluate(&json!(["a", "b"]), "contains", &json!("b")).unwrap());
        assert!(evaluate(&json!("hello world"), "notContains", &json!("bye")).unwrap());
        assert!(evaluate(&json!({"k": 1}), "contains", &json!("k")).unwrap());
        assert!(evaluate(&json!([]), "isEmpty", &Value::Null).unwrap());
        assert!(evaluate(&json!("x"), "isNotEmpty", &Value::Null).unwrap());
        assert!(evaluate(&json!("order-42"), "matches", &json!(r"^order-\d+$")).unwrap());
        assert!(evaluate(&json!("report.pdf"), "endsWith", &json!(".pdf")).unwrap());
    }

    #[test]
    fn unknown_operator_and_bad_pattern_error() {
        assert!(evaluate(&json!(1), "~=", &json!(1)).is_err());
        assert!(evaluate(&json!("x"), "matches", &json!("(")).is_err());
    }

    #[test]
    fn validation() {
        let exec = ConditionExecutor;
        assert!(exec.validate(&json!({"operator": ">", "leftValue": 1})).is_empty());
        assert_eq!(exec.validate(&json!({})).len(), 1);
        assert_eq!(exec.validate(&json!({"operator": "matches", "rightValue": "("})).len(), 1);
        assert!(exec
            .validate(&json!({"operator": "matches", "rightValue": "{{var.re}}"}))
            .is_empty());
        assert_eq!(
            exec.validate(&json!({"conditions": [{"operator": "nope"}], "combinator": "xor"}))
                .len(),
            2
        );
    }
}
