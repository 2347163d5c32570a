//! cubeq Intermediate Representation (IR)
//!
//! Canonical JSON representation of an analytical query: named select
//! columns, grouping edges bound to domains, a filter, a sort and a limit.
//! All types are deterministically serializable for caching and provenance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

mod filter;
mod schema;
mod value;

pub use filter::*;
pub use schema::*;
pub use value::*;

/// Top-level query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    /// Source name: a backend index, or a label for in-memory data
    #[serde(default)]
    pub from: String,

    #[serde(default)]
    pub select: Selection,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,

    /// Structured filter, understood by both execution paths
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,

    /// Expression filter, evaluated per record
    #[serde(default, rename = "where", skip_serializing_if = "Option::is_none")]
    pub where_: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,

    /// Named constants folded into expressions before compilation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub constants: BTreeMap<String, Value>,
}

impl Query {
    /// Calculate fingerprint (SHA-256) for deterministic caching
    pub fn fingerprint(&self) -> String {
        // Maps are BTreeMaps and filters serialize through serde_json::Map,
        // so the JSON text is stable for equal queries.
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Parse a query from its JSON form
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Names of every select column followed by every edge
    pub fn column_names(&self) -> impl Iterator<Item = String> + '_ {
        self.select
            .columns()
            .iter()
            .map(Select::name)
            .chain(self.edges.iter().map(|e| e.name.clone()))
    }
}

/// Output shape requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Cube,
    List,
}

/// One select column, or several
///
/// A single select produces scalar cube cells; a list produces cells that
/// map select names to values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selection {
    One(Select),
    Many(Vec<Select>),
}

impl Default for Selection {
    fn default() -> Self {
        Selection::Many(Vec::new())
    }
}

impl Selection {
    pub fn columns(&self) -> &[Select] {
        match self {
            Selection::One(select) => std::slice::from_ref(select),
            Selection::Many(selects) => selects,
        }
    }

    pub fn is_single(&self) -> bool {
        matches!(self, Selection::One(_))
    }
}

/// Aggregated value expression
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Select {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Field path or value expression; absent means "the row itself"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<String>,

    /// Result of an aggregate over an empty group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Order statistic for `percentile`, in `[0, 1]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentile: Option<f64>,

    /// Sort collected values (`array`, `union`, `join`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
}

impl Select {
    pub fn name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.value.clone())
            .or_else(|| self.aggregate.clone())
            .unwrap_or_else(|| "value".to_string())
    }

    pub fn aggregate_name(&self) -> &str {
        self.aggregate.as_deref().unwrap_or("none")
    }
}

/// Grouping dimension
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Edge {
    pub name: String,

    /// Value expression mapped into the domain; defaults to the edge name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainDecl>,

    #[serde(default, rename = "allowNulls", alias = "allow_nulls")]
    pub allow_nulls: bool,

    /// Makes the edge multi-valued: a record belongs to every partition
    /// overlapping `[min, max)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<RangeDecl>,
}

impl Edge {
    /// Expression producing the edge value, if the edge is not ranged
    pub fn value_expr(&self) -> Option<&str> {
        match (&self.value, &self.range) {
            (Some(value), _) => Some(value),
            (None, Some(_)) => None,
            (None, None) => Some(&self.name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeDecl {
    pub min: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

/// Declared partition space of an edge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainDecl {
    #[serde(rename = "type", default = "default_domain_type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Field (or ordered fields, for composite keys) identifying a partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyDecl>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,

    /// Bucket width: a number, or a duration such as `"day"` or `"2hour"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<Value>,

    /// Label format for time partitions (chrono strftime syntax)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

fn default_domain_type() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyDecl {
    Field(String),
    Composite(Vec<String>),
}

impl KeyDecl {
    pub fn fields(&self) -> Vec<&str> {
        match self {
            KeyDecl::Field(field) => vec![field.as_str()],
            KeyDecl::Composite(fields) => fields.iter().map(String::as_str).collect(),
        }
    }
}

/// Sort specification: a bare column name, or `{value, sort}` where
/// `sort` is `1` (ascending) or `-1` (descending)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortSpec {
    Field(String),
    Keyed {
        value: String,
        #[serde(default = "ascending")]
        sort: i8,
    },
}

fn ascending() -> i8 {
    1
}

impl SortSpec {
    pub fn field(&self) -> &str {
        match self {
            SortSpec::Field(field) => field,
            SortSpec::Keyed { value, .. } => value,
        }
    }

    pub fn descending(&self) -> bool {
        matches!(self, SortSpec::Keyed { sort, .. } if *sort < 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_deterministic() {
        let query = Query {
            from: "bugs".to_string(),
            ..Default::default()
        };

        assert_eq!(query.fingerprint(), query.clone().fingerprint());
    }

    #[test]
    fn test_parse_single_select() {
        let query = Query::from_json(json!({
            "from": "bugs",
            "select": {"value": "n", "aggregate": "sum"},
            "edges": [{"name": "c", "allowNulls": true}]
        }))
        .unwrap();

        assert!(query.select.is_single());
        assert_eq!(query.select.columns()[0].name(), "n");
        assert_eq!(query.edges[0].value_expr(), Some("c"));
        assert!(query.edges[0].allow_nulls);
    }

    #[test]
    fn test_parse_domain_and_sort() {
        let query = Query::from_json(json!({
            "from": "bugs",
            "select": [{"name": "count", "aggregate": "count"}],
            "edges": [{
                "name": "opened",
                "domain": {"type": "time", "interval": "day", "key": ["a", "b"]}
            }],
            "sort": ["opened", {"value": "count", "sort": -1}]
        }))
        .unwrap();

        let domain = query.edges[0].domain.as_ref().unwrap();
        assert_eq!(domain.kind, "time");
        assert_eq!(domain.key.as_ref().unwrap().fields(), vec!["a", "b"]);
        assert!(!query.sort[0].descending());
        assert!(query.sort[1].descending());
        assert_eq!(query.sort[1].field(), "count");
    }

    #[test]
    fn test_json_round_trip() {
        let query = Query::from_json(json!({
            "from": "bugs",
            "select": {"value": "n", "aggregate": "sum"},
            "filter": {"and": [{"term": {"c": "a"}}, {"exists": {"field": "n"}}]},
            "where": "n > 1"
        }))
        .unwrap();

        let json = serde_json::to_value(&query).unwrap();
        let parsed = Query::from_json(json).unwrap();

        assert_eq!(query.fingerprint(), parsed.fingerprint());
        assert_eq!(parsed.where_.as_deref(), Some("n > 1"));
    }
}
