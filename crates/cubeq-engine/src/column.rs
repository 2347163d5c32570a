//! Column compilation: select expressions bound to aggregates, edges bound
//! to fresh domains

use cubeq_domain::Domain;
use cubeq_expr::{parse_with_constants, Expr, FilterEvaluator};
use cubeq_ir::{ColumnType, Format, Query, Schema};
use cubeq_registry::{AggregateKind, AggregateRegistry, AggregateSpec, Temporal};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::sort::{compile_sort, SortKey};
use crate::QbError;

#[derive(Debug, Clone)]
pub struct CompiledSelect {
    pub name: String,
    /// Expression text as written; `None` selects the row itself
    pub source: Option<String>,
    pub value: Option<Expr>,
    pub spec: AggregateSpec,
}

impl CompiledSelect {
    /// Plain field the select reads, when it is not a computed expression
    pub fn field(&self) -> Option<&str> {
        self.value.as_ref().and_then(Expr::as_field)
    }

    pub fn eval(&self, record: &Value) -> Result<Value, QbError> {
        match &self.value {
            Some(expr) => Ok(expr.eval(record)?),
            // a bare count counts rows
            None if self.spec.kind == AggregateKind::Count => Ok(Value::Bool(true)),
            None => Ok(record.clone()),
        }
    }
}

/// How an edge finds the partitions of a row
#[derive(Debug, Clone)]
pub enum EdgeValue {
    /// One value per row, mapped through the domain
    Expr(Expr),
    /// The row itself, keyed by the domain's declared key
    Record,
    /// Every partition overlapping `[min, max)`
    Range { min: Expr, max: Option<Expr> },
    /// Every partition whose own filter accepts the row
    PartitionFilters,
}

#[derive(Debug, Clone)]
pub struct CompiledEdge {
    pub name: String,
    pub source: Option<String>,
    pub value: EdgeValue,
    pub domain: Domain,
    pub allow_nulls: bool,
}

impl CompiledEdge {
    /// Ranged edges can place one row in several partitions
    pub fn is_ranged(&self) -> bool {
        matches!(self.value, EdgeValue::Range { .. } | EdgeValue::PartitionFilters)
    }

    pub fn field(&self) -> Option<&str> {
        match &self.value {
            EdgeValue::Expr(expr) => expr.as_field(),
            _ => None,
        }
    }
}

/// Execution shape chosen from the compiled columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QbMode {
    /// No edges, no aggregates: filtered and projected rows
    SetOp,
    /// No edges: a single aggregated cell
    AggOp,
    Cube,
    List,
}

impl QbMode {
    pub fn name(self) -> &'static str {
        match self {
            QbMode::SetOp => "setop",
            QbMode::AggOp => "aggop",
            QbMode::Cube => "cube",
            QbMode::List => "list",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub from: String,
    pub fingerprint: String,
    pub mode: QbMode,
    pub selects: Vec<CompiledSelect>,
    pub edges: Vec<CompiledEdge>,
    /// Cells hold a bare value rather than a map of select names
    pub single: bool,
    pub filter: Option<FilterEvaluator>,
    pub where_: Option<Expr>,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
    pub query: Query,
}

impl CompiledQuery {
    pub fn specs(&self) -> Vec<AggregateSpec> {
        self.selects.iter().map(|s| s.spec.clone()).collect()
    }

    /// Filter and `where` both accept the row
    pub fn accepts(&self, record: &Value) -> Result<bool, QbError> {
        if let Some(filter) = &self.filter {
            if !filter.matches(record) {
                return Ok(false);
            }
        }
        match &self.where_ {
            Some(expr) => Ok(cubeq_ir::is_truthy(&expr.eval(record)?)),
            None => Ok(true),
        }
    }
}

fn expression(column: &str, source: &str, constants: &BTreeMap<String, Value>) -> Result<Expr, QbError> {
    parse_with_constants(source, constants).map_err(|source| QbError::Expression {
        column: column.to_string(),
        source,
    })
}

fn temporal(expr: Option<&Expr>, schema: &Schema) -> Temporal {
    match expr.and_then(Expr::as_field).map(|f| schema.column_type(f)) {
        Some(ColumnType::Time) => Temporal::Time,
        _ => Temporal::None,
    }
}

/// Compile a query against a schema. Every edge gets its own domain, so
/// domains that grow while scanning are never shared between queries.
pub fn compile(query: &Query, schema: &Schema, registry: &AggregateRegistry) -> Result<CompiledQuery, QbError> {
    let mut seen = HashSet::new();
    for name in query.column_names() {
        if !seen.insert(name.clone()) {
            return Err(QbError::DuplicateColumn(name));
        }
    }

    let mut selects = Vec::new();
    for select in query.select.columns() {
        let name = select.name();
        let value = select
            .value
            .as_deref()
            .map(|src| expression(&name, src, &query.constants))
            .transpose()?;
        let spec = registry.compile(select, temporal(value.as_ref(), schema))?;
        selects.push(CompiledSelect {
            name,
            source: select.value.clone(),
            value,
            spec,
        });
    }

    let mut edges = Vec::new();
    for edge in &query.edges {
        let domain = Domain::from_decl(&edge.name, edge.domain.as_ref(), edge.allow_nulls)?;
        let value = match (&edge.range, &edge.value) {
            (Some(range), _) => EdgeValue::Range {
                min: expression(&edge.name, &range.min, &query.constants)?,
                max: range
                    .max
                    .as_deref()
                    .map(|src| expression(&edge.name, src, &query.constants))
                    .transpose()?,
            },
            (None, None) if domain.has_partition_filters() => EdgeValue::PartitionFilters,
            (None, None) if domain.key().is_some() => EdgeValue::Record,
            (None, _) => {
                let source = edge.value_expr().unwrap_or(&edge.name);
                EdgeValue::Expr(expression(&edge.name, source, &query.constants)?)
            }
        };
        edges.push(CompiledEdge {
            name: edge.name.clone(),
            source: edge.value.clone(),
            value,
            domain,
            allow_nulls: edge.allow_nulls,
        });
    }

    let ungrouped = selects
        .iter()
        .filter(|s| s.spec.kind == AggregateKind::None)
        .map(|s| s.name.clone())
        .next();
    let all_ungrouped = !selects.is_empty() && selects.iter().all(|s| s.spec.kind == AggregateKind::None);
    let mode = match (edges.is_empty(), ungrouped, query.format) {
        (true, None, _) => QbMode::AggOp,
        (true, Some(_), _) if all_ungrouped => QbMode::SetOp,
        (_, Some(name), _) => return Err(QbError::NoneInGroupedQuery(name)),
        (false, None, Some(Format::List)) => QbMode::List,
        (false, None, _) => QbMode::Cube,
    };

    let filter = query
        .filter
        .as_ref()
        .map(FilterEvaluator::new)
        .transpose()
        .map_err(|source| QbError::Expression {
            column: "filter".to_string(),
            source,
        })?;
    let where_ = query
        .where_
        .as_deref()
        .map(|src| expression("where", src, &query.constants))
        .transpose()?;

    debug!(
        from = %query.from,
        mode = mode.name(),
        selects = selects.len(),
        edges = edges.len(),
        "Compiled query"
    );

    Ok(CompiledQuery {
        from: query.from.clone(),
        fingerprint: query.fingerprint(),
        mode,
        single: query.select.is_single(),
        selects,
        edges,
        filter,
        where_,
        sort: compile_sort(&query.sort),
        limit: query.limit,
        query: query.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile_json(query: Value) -> Result<CompiledQuery, QbError> {
        let query = Query::from_json(query).unwrap();
        compile(&query, &Schema::default(), &AggregateRegistry::default())
    }

    #[test]
    fn test_modes() {
        let setop = compile_json(json!({"select": [{"value": "a"}, {"value": "b"}]})).unwrap();
        assert_eq!(setop.mode, QbMode::SetOp);

        let aggop = compile_json(json!({"select": {"value": "n", "aggregate": "sum"}})).unwrap();
        assert_eq!(aggop.mode, QbMode::AggOp);
        assert!(aggop.single);

        let cube = compile_json(json!({"select": {"aggregate": "count"}, "edges": [{"name": "c"}]})).unwrap();
        assert_eq!(cube.mode, QbMode::Cube);
        assert_eq!(cube.selects[0].name, "count");

        let list = compile_json(json!({
            "select": {"aggregate": "count"},
            "edges": [{"name": "c"}],
            "format": "list"
        }))
        .unwrap();
        assert_eq!(list.mode, QbMode::List);
    }

    #[test]
    fn test_configuration_errors() {
        let dup = compile_json(json!({"select": [{"value": "c"}], "edges": [{"name": "c"}]}));
        assert!(matches!(dup, Err(QbError::DuplicateColumn(name)) if name == "c"));

        let unknown = compile_json(json!({"select": {"value": "n", "aggregate": "mode"}}));
        assert!(matches!(unknown, Err(QbError::Registry(_))));

        let grouped = compile_json(json!({"select": {"value": "n"}, "edges": [{"name": "c"}]}));
        assert!(matches!(grouped, Err(QbError::NoneInGroupedQuery(name)) if name == "n"));

        let bad_fn = compile_json(json!({"select": {"value": "nope(n)", "aggregate": "sum"}}));
        assert!(matches!(bad_fn, Err(QbError::Expression { column, .. }) if column == "nope(n)"));

        let bad_domain = compile_json(json!({"select": {"aggregate": "count"}, "edges": [{"name": "c", "domain": {"type": "set"}}]}));
        assert!(matches!(bad_domain, Err(QbError::Domain(_))));
    }

    #[test]
    fn test_edge_values() {
        let cq = compile_json(json!({
            "select": {"aggregate": "count"},
            "edges": [
                {"name": "open", "range": {"min": "opened", "max": "closed"}, "domain": {"type": "time", "interval": "day"}},
                {"name": "team", "domain": {"type": "set", "partitions": [
                    {"name": "core", "esfilter": {"term": {"product": "core"}}},
                    {"name": "other", "esfilter": {"not": {"term": {"product": "core"}}}}
                ]}},
                {"name": "pc", "domain": {"type": "set", "key": ["product", "component"], "partitions": [
                    {"product": "core", "component": "js"}
                ]}},
                {"name": "c"}
            ]
        }))
        .unwrap();

        assert!(matches!(cq.edges[0].value, EdgeValue::Range { max: Some(_), .. }));
        assert!(matches!(cq.edges[1].value, EdgeValue::PartitionFilters));
        assert!(matches!(cq.edges[2].value, EdgeValue::Record));
        assert_eq!(cq.edges[3].field(), Some("c"));
        assert!(cq.edges[0].is_ranged() && cq.edges[1].is_ranged() && !cq.edges[3].is_ranged());
    }

    #[test]
    fn test_time_select_is_temporal() {
        let query = Query::from_json(json!({"select": {"value": "opened", "aggregate": "max"}})).unwrap();
        let schema = Schema::infer("bugs", &[json!({"opened": "2024-01-01T00:00:00Z"})]);
        let cq = compile(&query, &schema, &AggregateRegistry::default()).unwrap();
        assert_eq!(cq.selects[0].spec.temporal, Temporal::Time);
    }

    #[test]
    fn test_constants_are_folded() {
        let cq = compile_json(json!({
            "select": {"value": "n", "aggregate": "sum"},
            "where": "n > LIMIT",
            "constants": {"LIMIT": 2}
        }))
        .unwrap();
        assert!(!cq.accepts(&json!({"n": 1})).unwrap());
        assert!(cq.accepts(&json!({"n": 3})).unwrap());
    }
}
