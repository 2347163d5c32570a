//! Choosing how a compiled query runs against the backend

use cubeq_domain::DomainKind;
use cubeq_engine::{CompiledEdge, CompiledQuery, CompiledSelect, EdgeValue, QbMode};
use cubeq_ir::{ColumnType, Schema};
use cubeq_registry::AggregateKind;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EsMode {
    /// Projected hits, no aggregation
    #[serde(rename = "setop")]
    SetOp,
    /// One statistical facet per select, no edges
    #[serde(rename = "aggop")]
    AggOp,
    /// Counts per packed edge tuple from one terms facet
    Terms,
    /// Per-term statistics from one terms_stats facet per select
    TermsStats,
    /// One statistical facet per cell, each filtered to its partitions
    Statistical,
    /// Count over two discovered edges: a terms facet on the first edge,
    /// then a terms facet on the second per first-edge partition
    TwoStepCount,
    /// Fetch documents and aggregate in memory
    Scan,
}

impl EsMode {
    pub fn name(self) -> &'static str {
        match self {
            EsMode::SetOp => "setop",
            EsMode::AggOp => "aggop",
            EsMode::Terms => "terms",
            EsMode::TermsStats => "terms_stats",
            EsMode::Statistical => "statistical",
            EsMode::TwoStepCount => "two_step_count",
            EsMode::Scan => "scan",
        }
    }
}

/// Backend reads the field from indexed values, outside nested documents
pub(crate) fn plain_field(schema: &Schema, field: &str) -> bool {
    let use_source = schema.find_column(field).map(|c| c.use_source).unwrap_or(false);
    !use_source && schema.nested_path_of(field).is_none()
}

fn is_bare_count(select: &CompiledSelect) -> bool {
    select.spec.kind == AggregateKind::Count && select.value.is_none()
}

/// Field whose present values a `count` select counts; the backend
/// answers it with an `exists` filter rather than field statistics
pub(crate) fn counted_field(select: &CompiledSelect) -> Option<&str> {
    (select.spec.kind == AggregateKind::Count && select.value.is_some())
        .then(|| select.field())
        .flatten()
}

/// Statistical facets compute the aggregate from numeric field values.
/// A count of a field's values works for any plain field; a count of a
/// computed value has no facet form.
fn statistical_select(select: &CompiledSelect, schema: &Schema) -> bool {
    if select.spec.kind.facet_field().is_none() {
        return false;
    }
    let counting = select.spec.kind == AggregateKind::Count;
    match (&select.value, select.field()) {
        (None, _) => counting,
        (Some(_), Some(field)) if counting => plain_field(schema, field),
        (Some(_), Some(field)) => {
            plain_field(schema, field) && matches!(schema.column_type(field), ColumnType::Number | ColumnType::Time)
        }
        (Some(_), None) => !counting,
    }
}

/// No plain count reports each group's documents, so a facet plan asks
/// for them with a facet of its own
pub(crate) fn needs_doc_facet(cq: &CompiledQuery) -> bool {
    !cq.selects.iter().any(is_bare_count)
}

fn packable(edge: &CompiledEdge) -> bool {
    matches!(edge.value, EdgeValue::Expr(_))
}

fn discovered_field(edge: &CompiledEdge, schema: &Schema) -> bool {
    edge.domain.kind() == DomainKind::Default
        && edge.domain.is_empty()
        && edge.field().map(|f| plain_field(schema, f)).unwrap_or(false)
}

/// Facets a statistical plan would need, before any domain has grown
fn statistical_facets(cq: &CompiledQuery) -> usize {
    let per_cell = cq.selects.len() + usize::from(cq.mode == QbMode::List && needs_doc_facet(cq));
    let cells: usize = cq
        .edges
        .iter()
        .map(|e| {
            let mut domain = e.domain.clone();
            match domain.freeze() {
                Ok(()) => domain.cube_size(),
                Err(_) => usize::MAX,
            }
        })
        .fold(1usize, |acc, n| acc.saturating_mul(n));
    cells.saturating_mul(per_cell)
}

/// Cheapest backend execution able to answer `cq` exactly
///
/// The choice only looks at the shape of the query; a plan that later turns
/// out to be inexpressible (an edge with no partition filter, an expression
/// with no script form) falls back to [`EsMode::Scan`] when it is built.
pub fn select_mode(cq: &CompiledQuery, schema: &Schema, max_facets: usize) -> EsMode {
    let statistical = cq.selects.iter().all(|s| statistical_select(s, schema));
    match cq.mode {
        QbMode::SetOp => return EsMode::SetOp,
        QbMode::AggOp if statistical && cq.selects.len() <= max_facets => return EsMode::AggOp,
        QbMode::AggOp => return EsMode::Scan,
        QbMode::Cube | QbMode::List => {}
    }

    let count_only = cq.selects.iter().all(is_bare_count);
    let all_packable = cq.edges.iter().all(packable);
    if count_only && cq.edges.len() == 2 && cq.edges.iter().all(|e| discovered_field(e, schema)) {
        return EsMode::TwoStepCount;
    }
    if count_only && all_packable {
        return EsMode::Terms;
    }
    if statistical
        && cq.edges.iter().all(|e| e.domain.is_faceted())
        && statistical_facets(cq) <= max_facets
    {
        return EsMode::Statistical;
    }
    if statistical && all_packable && cq.selects.iter().all(|s| s.spec.kind.in_terms_stats()) {
        return EsMode::TermsStats;
    }
    EsMode::Scan
}
