//! Partition key extraction for set domains

use cubeq_ir::{canonical_key, KeyDecl};
use serde_json::Value;

/// Key function specialised for the value shape seen first
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFn {
    /// Values are scalars; the key is the canonical text
    Scalar,
    /// Values are objects keyed by one field
    Field(String),
    /// Values are objects keyed by several fields
    Composite(Vec<String>),
}

impl KeyFn {
    /// Pick the fast path for `sample`, given the declared key
    pub fn specialize(decl: Option<&KeyDecl>, sample: &Value) -> Self {
        match (sample, decl) {
            (Value::Object(_), Some(KeyDecl::Field(field))) => KeyFn::Field(field.clone()),
            (Value::Object(_), Some(KeyDecl::Composite(fields))) if fields.len() == 1 => {
                KeyFn::Field(fields[0].clone())
            }
            (Value::Object(_), Some(KeyDecl::Composite(fields))) => KeyFn::Composite(fields.clone()),
            (Value::Object(_), None) => KeyFn::Field("value".to_string()),
            _ => KeyFn::Scalar,
        }
    }

    /// Key of `value`; falls back to the generic interpreter when the value
    /// does not have the specialised shape
    pub fn apply(&self, decl: Option<&KeyDecl>, value: &Value) -> Option<String> {
        match (self, value) {
            (KeyFn::Scalar, v) if !v.is_object() => scalar(v),
            (KeyFn::Field(field), Value::Object(obj)) => obj.get(field).and_then(scalar),
            (KeyFn::Composite(fields), Value::Object(_)) => composite(fields, value),
            _ => generic_key(decl, value),
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    (!value.is_null()).then(|| canonical_key(value))
}

fn composite<S: AsRef<str>>(fields: &[S], value: &Value) -> Option<String> {
    let parts: Vec<String> = fields
        .iter()
        .map(|f| cubeq_expr::lookup_path(value, f.as_ref()))
        .map(|v| canonical_key(&v))
        .collect();
    if parts.iter().all(String::is_empty) {
        return None;
    }
    serde_json::to_string(&parts).ok()
}

/// Key of any value, interpreted against the declared key each time
pub fn generic_key(decl: Option<&KeyDecl>, value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Object(_) => match decl {
            Some(KeyDecl::Field(field)) => scalar(&cubeq_expr::lookup_path(value, field)),
            Some(KeyDecl::Composite(fields)) if fields.len() == 1 => {
                scalar(&cubeq_expr::lookup_path(value, &fields[0]))
            }
            Some(KeyDecl::Composite(fields)) => composite(fields, value),
            None => value.get("value").and_then(scalar),
        },
        other => scalar(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_specialised_matches_generic() {
        let decl = KeyDecl::Composite(vec!["product".to_string(), "component".to_string()]);
        let first = json!({"product": "core", "component": "js", "count": 3});
        let key_fn = KeyFn::specialize(Some(&decl), &first);
        assert_eq!(key_fn, KeyFn::Composite(vec!["product".to_string(), "component".to_string()]));

        for value in [first, json!({"product": "core"}), json!("loose")] {
            assert_eq!(key_fn.apply(Some(&decl), &value), generic_key(Some(&decl), &value));
        }
    }

    #[test]
    fn test_scalar_and_field_keys() {
        assert_eq!(KeyFn::specialize(None, &json!(3)).apply(None, &json!(3.0)), Some("3".to_string()));

        let decl = KeyDecl::Field("id".to_string());
        let key_fn = KeyFn::specialize(Some(&decl), &json!({"id": 7}));
        assert_eq!(key_fn.apply(Some(&decl), &json!({"id": 7, "name": "x"})), Some("7".to_string()));
        // raw edge values are scalars even when partitions are objects
        assert_eq!(key_fn.apply(Some(&decl), &json!(7)), Some("7".to_string()));
        assert_eq!(key_fn.apply(Some(&decl), &Value::Null), None);
    }
}
