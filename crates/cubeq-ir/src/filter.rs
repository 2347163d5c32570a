//! Filter AST shared by the in-memory and backend execution paths
//!
//! The JSON form follows the search backend's filter DSL, e.g.
//! `{"and": [{"term": {"status": "open"}}, {"range": {"size": {"gte": 3}}}]}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("Unknown filter operator: {0}")]
    UnknownOperator(String),

    #[error("Malformed `{op}` filter: {reason}")]
    Malformed { op: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeBounds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<Value>,
}

impl RangeBounds {
    /// Half-open interval `[min, max)`
    pub fn half_open(min: Value, max: Value) -> Self {
        Self {
            gte: Some(min),
            lt: Some(max),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Term { field: String, value: Value },
    Terms { field: String, values: Vec<Value> },
    Range { field: String, bounds: RangeBounds },
    Exists { field: String },
    Missing { field: String },
    Prefix { field: String, prefix: String },
    MatchAll,
    /// Backend script, passed through verbatim
    Script { script: String },
}

impl Filter {
    pub fn term(field: impl Into<String>, value: Value) -> Self {
        Filter::Term {
            field: field.into(),
            value,
        }
    }

    pub fn range(field: impl Into<String>, bounds: RangeBounds) -> Self {
        Filter::Range {
            field: field.into(),
            bounds,
        }
    }

    /// Conjunction, flattened; `match_all` children are dropped
    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut flat = Vec::new();
        for filter in filters {
            match filter {
                Filter::MatchAll => {}
                Filter::And(children) => flat.extend(children),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Filter::MatchAll,
            1 => flat.pop().unwrap_or(Filter::MatchAll),
            _ => Filter::And(flat),
        }
    }

    /// Disjunction, flattened; an empty disjunction matches nothing
    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut flat = Vec::new();
        for filter in filters {
            match filter {
                Filter::MatchAll => return Filter::MatchAll,
                Filter::Or(children) => flat.extend(children),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            return flat.pop().unwrap_or(Filter::MatchAll);
        }
        Filter::Or(flat)
    }

    pub fn negate(filter: Filter) -> Self {
        match filter {
            Filter::Not(inner) => *inner,
            other => Filter::Not(Box::new(other)),
        }
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, Filter::MatchAll)
    }

    /// Fields referenced by this filter (scripts are opaque)
    pub fn fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields(&self, out: &mut Vec<String>) {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                children.iter().for_each(|c| c.collect_fields(out))
            }
            Filter::Not(inner) => inner.collect_fields(out),
            Filter::Term { field, .. }
            | Filter::Terms { field, .. }
            | Filter::Range { field, .. }
            | Filter::Exists { field }
            | Filter::Missing { field }
            | Filter::Prefix { field, .. } => {
                if !out.contains(field) {
                    out.push(field.clone());
                }
            }
            Filter::MatchAll | Filter::Script { .. } => {}
        }
    }

    /// Parse the backend JSON form
    pub fn from_json(value: &Value) -> Result<Self, FilterError> {
        let obj = value.as_object().ok_or_else(|| FilterError::Malformed {
            op: "filter".to_string(),
            reason: format!("expected an object, got {value}"),
        })?;
        if obj.len() != 1 {
            return Err(FilterError::Malformed {
                op: "filter".to_string(),
                reason: format!("expected exactly one operator, got {}", obj.len()),
            });
        }
        let (op, body) = obj.iter().next().ok_or_else(|| FilterError::Malformed {
            op: "filter".to_string(),
            reason: "empty object".to_string(),
        })?;

        match op.as_str() {
            "and" | "or" => {
                let list = body
                    .as_array()
                    .or_else(|| body.get("filters").and_then(Value::as_array))
                    .ok_or_else(|| malformed(op, "expected a list of filters"))?;
                let children = list
                    .iter()
                    .map(Filter::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if op == "and" {
                    Filter::And(children)
                } else {
                    Filter::Or(children)
                })
            }
            "not" => {
                let inner = body.get("filter").unwrap_or(body);
                Ok(Filter::Not(Box::new(Filter::from_json(inner)?)))
            }
            "term" => {
                let (field, value) = single_entry(op, body)?;
                Ok(Filter::Term {
                    field,
                    value: value.clone(),
                })
            }
            "terms" => {
                let (field, value) = single_entry(op, body)?;
                let values = value
                    .as_array()
                    .ok_or_else(|| malformed(op, "expected a list of values"))?
                    .clone();
                Ok(Filter::Terms { field, values })
            }
            "range" => {
                let (field, value) = single_entry(op, body)?;
                let bounds: RangeBounds = serde_json::from_value(value.clone())
                    .map_err(|e| malformed(op, &e.to_string()))?;
                Ok(Filter::Range { field, bounds })
            }
            "exists" | "missing" => {
                let field = body
                    .get("field")
                    .and_then(Value::as_str)
                    .ok_or_else(|| malformed(op, "expected {\"field\": name}"))?
                    .to_string();
                Ok(if op == "exists" {
                    Filter::Exists { field }
                } else {
                    Filter::Missing { field }
                })
            }
            "prefix" => {
                let (field, value) = single_entry(op, body)?;
                let prefix = value
                    .as_str()
                    .ok_or_else(|| malformed(op, "prefix must be a string"))?
                    .to_string();
                Ok(Filter::Prefix { field, prefix })
            }
            "match_all" => Ok(Filter::MatchAll),
            "script" => {
                let script = body
                    .as_str()
                    .or_else(|| body.get("script").and_then(Value::as_str))
                    .ok_or_else(|| malformed(op, "expected script source"))?
                    .to_string();
                Ok(Filter::Script { script })
            }
            other => Err(FilterError::UnknownOperator(other.to_string())),
        }
    }

    /// Render the backend JSON form
    pub fn to_json(&self) -> Value {
        match self {
            Filter::And(children) => {
                json!({"and": children.iter().map(Filter::to_json).collect::<Vec<_>>()})
            }
            Filter::Or(children) => {
                json!({"or": children.iter().map(Filter::to_json).collect::<Vec<_>>()})
            }
            Filter::Not(inner) => json!({"not": inner.to_json()}),
            Filter::Term { field, value } => json!({"term": {field.as_str(): value}}),
            Filter::Terms { field, values } => json!({"terms": {field.as_str(): values}}),
            Filter::Range { field, bounds } => json!({"range": {field.as_str(): bounds}}),
            Filter::Exists { field } => json!({"exists": {"field": field}}),
            Filter::Missing { field } => json!({"missing": {"field": field}}),
            Filter::Prefix { field, prefix } => json!({"prefix": {field.as_str(): prefix}}),
            Filter::MatchAll => json!({"match_all": {}}),
            Filter::Script { script } => json!({"script": {"script": script}}),
        }
    }
}

fn malformed(op: &str, reason: &str) -> FilterError {
    FilterError::Malformed {
        op: op.to_string(),
        reason: reason.to_string(),
    }
}

fn single_entry<'v>(op: &str, body: &'v Value) -> Result<(String, &'v Value), FilterError> {
    let obj: &Map<String, Value> = body
        .as_object()
        .ok_or_else(|| malformed(op, "expected {field: value}"))?;
    let mut entries = obj.iter();
    match (entries.next(), entries.next()) {
        (Some((field, value)), None) => Ok((field.clone(), value)),
        _ => Err(malformed(op, "expected exactly one field")),
    }
}

impl TryFrom<Value> for Filter {
    type Error = FilterError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Filter::from_json(&value)
    }
}

impl From<Filter> for Value {
    fn from(filter: Filter) -> Self {
        filter.to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested() {
        let filter = Filter::from_json(&json!({
            "and": [
                {"term": {"status": "open"}},
                {"not": {"terms": {"product": ["a", "b"]}}},
                {"range": {"size": {"gte": 1, "lt": 5}}}
            ]
        }))
        .unwrap();

        match &filter {
            Filter::And(children) => assert_eq!(children.len(), 3),
            other => panic!("expected and, got {other:?}"),
        }
        assert_eq!(filter.fields(), vec!["status", "product", "size"]);
        assert_eq!(Filter::from_json(&filter.to_json()).unwrap(), filter);
    }

    #[test]
    fn test_unknown_operator_is_named() {
        let err = Filter::from_json(&json!({"fuzzy": {"name": "x"}})).unwrap_err();
        assert_eq!(err, FilterError::UnknownOperator("fuzzy".to_string()));
    }

    #[test]
    fn test_and_simplification() {
        let term = Filter::term("a", json!(1));
        assert_eq!(Filter::and(vec![Filter::MatchAll, term.clone()]), term);
        assert_eq!(Filter::and(Vec::new()), Filter::MatchAll);
        assert_eq!(Filter::or(vec![term.clone(), Filter::MatchAll]), Filter::MatchAll);
        assert_eq!(Filter::negate(Filter::negate(term.clone())), term);
    }

    #[test]
    fn test_script_forms() {
        let short = Filter::from_json(&json!({"script": "doc.x > 1"})).unwrap();
        let long = Filter::from_json(&json!({"script": {"script": "doc.x > 1"}})).unwrap();
        assert_eq!(short, long);
    }
}
