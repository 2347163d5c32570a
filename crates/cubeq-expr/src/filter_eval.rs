//! In-memory evaluation of the filter AST

use cubeq_ir::{is_truthy, Filter, RangeBounds};
use serde_json::Value;
use std::cmp::Ordering;

use crate::ast::Expr;
use crate::eval::{lookup_path, loose_cmp, loose_eq};
use crate::parser::{parse, ParseError};

/// A filter prepared for per-record matching; script nodes are parsed once
/// as value expressions
#[derive(Debug, Clone)]
pub struct FilterEvaluator {
    root: Node,
}

#[derive(Debug, Clone)]
enum Node {
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Term(String, Value),
    Terms(String, Vec<Value>),
    Range(String, RangeBounds),
    Exists(String),
    Missing(String),
    Prefix(String, String),
    MatchAll,
    Script(Expr),
}

impl FilterEvaluator {
    pub fn new(filter: &Filter) -> Result<Self, ParseError> {
        Ok(Self {
            root: prepare(filter)?,
        })
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.root.matches(record)
    }
}

fn prepare(filter: &Filter) -> Result<Node, ParseError> {
    Ok(match filter {
        Filter::And(children) => Node::And(children.iter().map(prepare).collect::<Result<_, _>>()?),
        Filter::Or(children) => Node::Or(children.iter().map(prepare).collect::<Result<_, _>>()?),
        Filter::Not(inner) => Node::Not(Box::new(prepare(inner)?)),
        Filter::Term { field, value } => Node::Term(field.clone(), value.clone()),
        Filter::Terms { field, values } => Node::Terms(field.clone(), values.clone()),
        Filter::Range { field, bounds } => Node::Range(field.clone(), bounds.clone()),
        Filter::Exists { field } => Node::Exists(field.clone()),
        Filter::Missing { field } => Node::Missing(field.clone()),
        Filter::Prefix { field, prefix } => Node::Prefix(field.clone(), prefix.clone()),
        Filter::MatchAll => Node::MatchAll,
        Filter::Script { script } => Node::Script(parse(script)?),
    })
}

/// True when `test` holds for the value, or for any element of an array
fn any_value(value: &Value, test: impl Fn(&Value) -> bool) -> bool {
    match value {
        Value::Array(items) => items.iter().any(test),
        other => test(other),
    }
}

fn within(value: &Value, bounds: &RangeBounds) -> bool {
    let check = |bound: &Option<Value>, ok: fn(Ordering) -> bool| match bound {
        None => true,
        Some(b) => loose_cmp(value, b).map(ok).unwrap_or(false),
    };
    !value.is_null()
        && check(&bounds.gt, |o| o == Ordering::Greater)
        && check(&bounds.gte, |o| o != Ordering::Less)
        && check(&bounds.lt, |o| o == Ordering::Less)
        && check(&bounds.lte, |o| o != Ordering::Greater)
}

fn present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => items.iter().any(|v| !v.is_null()),
        _ => true,
    }
}

impl Node {
    fn matches(&self, record: &Value) -> bool {
        match self {
            Node::And(children) => children.iter().all(|c| c.matches(record)),
            Node::Or(children) => children.iter().any(|c| c.matches(record)),
            Node::Not(inner) => !inner.matches(record),
            Node::Term(field, expected) => {
                any_value(&lookup_path(record, field), |v| loose_eq(v, expected))
            }
            Node::Terms(field, expected) => any_value(&lookup_path(record, field), |v| {
                expected.iter().any(|e| loose_eq(v, e))
            }),
            Node::Range(field, bounds) => {
                any_value(&lookup_path(record, field), |v| within(v, bounds))
            }
            Node::Exists(field) => present(&lookup_path(record, field)),
            Node::Missing(field) => !present(&lookup_path(record, field)),
            Node::Prefix(field, prefix) => any_value(&lookup_path(record, field), |v| {
                v.as_str().map(|s| s.starts_with(prefix.as_str())).unwrap_or(false)
            }),
            Node::MatchAll => true,
            Node::Script(expr) => expr.eval(record).map(|v| is_truthy(&v)).unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluator(filter: Value) -> FilterEvaluator {
        FilterEvaluator::new(&Filter::from_json(&filter).unwrap()).unwrap()
    }

    #[test]
    fn test_boolean_nodes() {
        let f = evaluator(json!({"and": [
            {"term": {"c": "a"}},
            {"not": {"range": {"n": {"gte": 3}}}}
        ]}));
        assert!(f.matches(&json!({"c": "a", "n": 1})));
        assert!(!f.matches(&json!({"c": "a", "n": 3})));
        assert!(!f.matches(&json!({"c": "b", "n": 1})));
    }

    #[test]
    fn test_arrays_match_any_element() {
        let f = evaluator(json!({"term": {"comments.author": "b"}}));
        assert!(f.matches(&json!({"comments": [{"author": "a"}, {"author": "b"}]})));
        assert!(!f.matches(&json!({"comments": []})));
    }

    #[test]
    fn test_time_range() {
        let f = evaluator(json!({"range": {"opened": {"gte": "2024-01-01", "lt": "2024-02-01"}}}));
        assert!(f.matches(&json!({"opened": "2024-01-15T08:00:00Z"})));
        assert!(!f.matches(&json!({"opened": "2024-02-01T00:00:00Z"})));
        assert!(!f.matches(&json!({})));
    }

    #[test]
    fn test_exists_missing_prefix_script() {
        let exists = evaluator(json!({"exists": {"field": "n"}}));
        let missing = evaluator(json!({"missing": {"field": "n"}}));
        assert!(exists.matches(&json!({"n": 0})));
        assert!(missing.matches(&json!({"n": null})));

        let prefix = evaluator(json!({"prefix": {"name": "core"}}));
        assert!(prefix.matches(&json!({"name": "core::js"})));

        let script = evaluator(json!({"script": "n * 2 > 5"}));
        assert!(script.matches(&json!({"n": 3})));
        assert!(!script.matches(&json!({"n": 2})));
    }
}
