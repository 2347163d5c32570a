//! Column model of a data source

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::value::parse_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Time,
    Object,
    /// Array of sub-documents, iterated element by element in scripts
    Nested,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Dotted path from the document root
    pub name: String,

    #[serde(rename = "type")]
    pub column_type: ColumnType,

    /// Innermost nested document path containing this column
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested_path: Option<String>,

    /// Read from the stored document instead of indexed values
    #[serde(default)]
    pub use_source: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nested_path: None,
            use_source: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_type(&self, name: &str) -> ColumnType {
        self.find_column(name)
            .map(|c| c.column_type)
            .unwrap_or(ColumnType::Unknown)
    }

    /// Longest nested path that `field` lives under, if any
    pub fn nested_path_of(&self, field: &str) -> Option<&str> {
        self.columns
            .iter()
            .filter(|c| c.column_type == ColumnType::Nested)
            .map(|c| c.name.as_str())
            .filter(|path| field.len() > path.len() && field.starts_with(path) && field[path.len()..].starts_with('.'))
            .max_by_key(|path| path.len())
    }

    /// Infer columns from the keys of in-memory records
    ///
    /// Objects flatten into dotted names, arrays of objects become nested
    /// columns, and strings that parse as timestamps are typed as time.
    pub fn infer(name: impl Into<String>, records: &[Value]) -> Self {
        let mut schema = Schema::new(name, Vec::new());
        for record in records {
            if let Value::Object(obj) = record {
                schema.infer_object(obj, "", None);
            }
        }
        schema
    }

    fn infer_object(&mut self, obj: &Map<String, Value>, prefix: &str, nested: Option<&str>) {
        for (key, value) in obj {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            match value {
                Value::Object(child) => {
                    self.observe(&path, ColumnType::Object, nested);
                    self.infer_object(child, &path, nested);
                }
                Value::Array(items) if items.iter().any(Value::is_object) => {
                    self.observe(&path, ColumnType::Nested, nested);
                    for item in items {
                        if let Value::Object(child) = item {
                            self.infer_object(child, &path, Some(&path));
                        }
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        self.observe(&path, scalar_type(item), nested);
                    }
                }
                scalar => self.observe(&path, scalar_type(scalar), nested),
            }
        }
    }

    fn observe(&mut self, path: &str, column_type: ColumnType, nested: Option<&str>) {
        match self.columns.iter_mut().find(|c| c.name == path) {
            Some(existing) if existing.column_type == ColumnType::Unknown => {
                existing.column_type = column_type;
            }
            Some(_) => {}
            None => self.columns.push(Column {
                name: path.to_string(),
                column_type,
                nested_path: nested.map(str::to_string),
                use_source: false,
            }),
        }
    }
}

fn scalar_type(value: &Value) -> ColumnType {
    match value {
        Value::Number(_) => ColumnType::Number,
        Value::Bool(_) => ColumnType::Boolean,
        Value::String(s) if parse_time(s).is_some() => ColumnType::Time,
        Value::String(_) => ColumnType::String,
        _ => ColumnType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_from_records() {
        let records = vec![
            json!({"c": "a", "n": null, "opened": "2024-01-02", "owner": {"email": "x@y"}}),
            json!({"c": "b", "n": 5, "comments": [{"author": "k", "size": 3}]}),
        ];
        let schema = Schema::infer("rows", &records);

        assert_eq!(schema.column_type("c"), ColumnType::String);
        assert_eq!(schema.column_type("n"), ColumnType::Number);
        assert_eq!(schema.column_type("opened"), ColumnType::Time);
        assert_eq!(schema.column_type("owner.email"), ColumnType::String);
        assert_eq!(schema.column_type("comments"), ColumnType::Nested);
        assert_eq!(
            schema.find_column("comments.author").unwrap().nested_path.as_deref(),
            Some("comments")
        );
        assert_eq!(schema.nested_path_of("comments.author"), Some("comments"));
        assert_eq!(schema.nested_path_of("commentsx"), None);
    }
}
