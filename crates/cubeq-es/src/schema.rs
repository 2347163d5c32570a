//! Index mappings as query schemas

use cubeq_ir::{Column, ColumnType, Schema};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::EsError;

/// Columns of `index` from a `_mapping` response
///
/// Accepts both the typed layout (`{index: {type: {properties}}}`) and the
/// `mappings` wrapper of later versions. Object fields flatten into dotted
/// names, nested fields become `Nested` columns whose children carry their
/// nested path, and multi-fields contribute one column per sub-field.
pub fn from_mapping(index: &str, mapping: &Value) -> Result<Schema, EsError> {
    let root = mapping
        .get(index)
        .or_else(|| mapping.as_object().and_then(|m| m.values().next()))
        .ok_or_else(|| EsError::Decode(format!("mapping has no entry for {index}")))?;
    let root = root.get("mappings").unwrap_or(root);

    let mut schema = Schema::new(index, Vec::new());
    match root.get("properties").and_then(Value::as_object) {
        Some(props) => flatten(props, "", None, &mut schema),
        None => {
            if let Some(types) = root.as_object() {
                for ty in types.values() {
                    if let Some(props) = ty.get("properties").and_then(Value::as_object) {
                        flatten(props, "", None, &mut schema);
                    }
                }
            }
        }
    }
    debug!(index, columns = schema.columns.len(), "Schema from mapping");
    Ok(schema)
}

fn flatten(props: &Map<String, Value>, prefix: &str, nested: Option<&str>, schema: &mut Schema) {
    for (name, def) in props {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        let ty = def.get("type").and_then(Value::as_str).unwrap_or_else(|| {
            if def.get("properties").is_some() {
                "object"
            } else {
                ""
            }
        });
        let children = def.get("properties").and_then(Value::as_object);

        match ty {
            "nested" => {
                push(schema, &path, ColumnType::Nested, nested, false);
                if let Some(children) = children {
                    flatten(children, &path, Some(&path), schema);
                }
            }
            "object" => {
                push(schema, &path, ColumnType::Object, nested, false);
                if let Some(children) = children {
                    flatten(children, &path, nested, schema);
                }
            }
            "multi_field" => {
                let Some(fields) = def.get("fields").and_then(Value::as_object) else {
                    continue;
                };
                for (sub, sub_def) in fields {
                    let sub_path = if sub == name { path.clone() } else { format!("{path}.{sub}") };
                    let sub_ty = sub_def.get("type").and_then(Value::as_str).unwrap_or("");
                    push(schema, &sub_path, column_type(sub_ty), nested, not_indexed(sub_def));
                }
            }
            scalar => {
                push(schema, &path, column_type(scalar), nested, not_indexed(def));
                if let Some(fields) = def.get("fields").and_then(Value::as_object) {
                    for (sub, sub_def) in fields {
                        let sub_ty = sub_def.get("type").and_then(Value::as_str).unwrap_or("");
                        push(schema, &format!("{path}.{sub}"), column_type(sub_ty), nested, not_indexed(sub_def));
                    }
                }
            }
        }
    }
}

fn push(schema: &mut Schema, path: &str, column_type: ColumnType, nested: Option<&str>, use_source: bool) {
    if schema.find_column(path).is_some() {
        return;
    }
    schema.columns.push(Column {
        name: path.to_string(),
        column_type,
        nested_path: nested.map(str::to_string),
        use_source,
    });
}

fn column_type(ty: &str) -> ColumnType {
    match ty {
        "string" | "text" | "keyword" | "ip" => ColumnType::String,
        "long" | "integer" | "short" | "byte" | "double" | "float" => ColumnType::Number,
        "boolean" => ColumnType::Boolean,
        "date" => ColumnType::Time,
        _ => ColumnType::Unknown,
    }
}

/// Fields mapped `"index": "no"` have no indexed values to read
fn not_indexed(def: &Value) -> bool {
    matches!(def.get("index"), Some(Value::String(s)) if s == "no")
        || matches!(def.get("index"), Some(Value::Bool(false)))
}

/// Schemas by index name, fetched at most once per index even under
/// concurrent first use. A failed fetch leaves the entry empty so the next
/// caller tries again.
#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<Schema>>>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch<F, Fut>(&self, index: &str, fetch: F) -> Result<Arc<Schema>, EsError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Schema, EsError>>,
    {
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            entries.entry(index.to_string()).or_default().clone()
        };
        let schema = cell
            .get_or_try_init(|| async {
                debug!(index, "Fetching schema");
                fetch().await.map(Arc::new)
            })
            .await?;
        Ok(schema.clone())
    }

    /// Forget a cached schema, e.g. after the index mapping changed
    pub fn invalidate(&self, index: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(index);
    }

    /// Schemas fetched so far
    pub fn cached(&self) -> Vec<Arc<Schema>> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.values().filter_map(|cell| cell.get().cloned()).collect()
    }
}
