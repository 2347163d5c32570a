//! Partitions and the flattening of declared partition hierarchies

use cubeq_ir::{canonical_key, Filter};
use serde::Serialize;
use serde_json::Value;

use crate::DomainError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Partition {
    pub name: String,
    pub value: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,

    /// Backend condition selecting this partition, ANDed with every ancestor's
    #[serde(skip_serializing_if = "Option::is_none")]
    pub esfilter: Option<Filter>,

    /// Cube address; assigned when the domain is frozen
    #[serde(rename = "dataIndex", skip_serializing_if = "Option::is_none")]
    pub data_index: Option<usize>,

    /// Name of the enclosing declared partition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Partition {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            min: None,
            max: None,
            esfilter: None,
            data_index: None,
            parent: None,
        }
    }

    pub fn null() -> Self {
        Self::new("null", Value::Null)
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null() && self.esfilter.is_none() && self.min.is_none()
    }
}

/// Flatten declared partitions into leaves.
///
/// Scalars declare a partition whose name and value are the scalar. Objects
/// may carry `name`, `value`, `esfilter` (or `where`) and child
/// `partitions`; an object without `value` is its own value, which is how
/// composite-key partitions are declared. A leaf's filter is the AND of its
/// own and all of its ancestors' filters.
pub fn flatten(decls: &[Value]) -> Result<Vec<Partition>, DomainError> {
    let mut out = Vec::new();
    for decl in decls {
        visit(decl, None, &[], &mut out)?;
    }
    Ok(out)
}

fn visit(
    decl: &Value,
    parent: Option<&str>,
    ancestors: &[Filter],
    out: &mut Vec<Partition>,
) -> Result<(), DomainError> {
    let Value::Object(obj) = decl else {
        let mut part = Partition::new(canonical_key(decl), decl.clone());
        part.parent = parent.map(str::to_string);
        part.esfilter = (!ancestors.is_empty()).then(|| Filter::and(ancestors.to_vec()));
        out.push(part);
        return Ok(());
    };

    let own = obj
        .get("esfilter")
        .or_else(|| obj.get("where"))
        .map(Filter::from_json)
        .transpose()?;

    let mut filters = ancestors.to_vec();
    filters.extend(own);

    let value = match obj.get("value") {
        Some(v) => v.clone(),
        None => {
            let mut bare = obj.clone();
            for meta in ["name", "esfilter", "where", "partitions", "dataIndex"] {
                bare.remove(meta);
            }
            if bare.is_empty() {
                Value::Null
            } else {
                Value::Object(bare)
            }
        }
    };
    let name = obj
        .get("name")
        .map(canonical_key)
        .unwrap_or_else(|| canonical_key(&value));

    match obj.get("partitions").and_then(Value::as_array) {
        Some(children) if !children.is_empty() => {
            for child in children {
                visit(child, Some(&name), &filters, out)?;
            }
        }
        _ => {
            let mut part = Partition::new(name, value);
            part.parent = parent.map(str::to_string);
            part.esfilter = (!filters.is_empty()).then(|| Filter::and(filters));
            out.push(part);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_and_objects() {
        let parts = flatten(&[json!("a"), json!({"name": "B", "value": "b"}), json!(3)]).unwrap();
        let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "B", "3"]);
        assert_eq!(parts[1].value, json!("b"));
        assert!(parts.iter().all(|p| p.esfilter.is_none()));
    }

    #[test]
    fn test_nested_filters_are_anded() {
        let parts = flatten(&[json!({
            "name": "core",
            "esfilter": {"term": {"product": "core"}},
            "partitions": [
                {"name": "js", "esfilter": {"term": {"component": "js"}}},
                {"name": "dom", "esfilter": {"term": {"component": "dom"}}}
            ]
        })])
        .unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].parent.as_deref(), Some("core"));
        assert_eq!(
            parts[0].esfilter,
            Some(Filter::And(vec![
                Filter::term("product", json!("core")),
                Filter::term("component", json!("js")),
            ]))
        );
    }

    #[test]
    fn test_composite_object_is_its_own_value() {
        let parts = flatten(&[json!({"product": "core", "component": "js"})]).unwrap();
        assert_eq!(parts[0].value, json!({"product": "core", "component": "js"}));
    }

    #[test]
    fn test_bad_filter_is_rejected() {
        let err = flatten(&[json!({"name": "x", "esfilter": {"fuzzy": {}}})]).unwrap_err();
        assert!(matches!(err, DomainError::Filter(_)));
    }
}
