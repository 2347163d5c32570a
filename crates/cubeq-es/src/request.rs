//! Faceted search requests for a compiled query

use cubeq_domain::PartKey;
use cubeq_engine::{freeze_domains, CompiledEdge, CompiledQuery, CompiledSelect, EdgeValue, QbMode};
use cubeq_expr::{filter_script, ScriptCompiler};
use cubeq_ir::{Filter, RangeBounds, Schema};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::mode::{counted_field, needs_doc_facet, plain_field, EsMode};
use crate::pack::packed_script;
use crate::query::EsSettings;
use crate::EsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacetKind {
    /// Document count per term
    Terms,
    /// Count, total, min and max of a value per term
    TermsStats,
    /// Statistics of a value over the documents a filter selects
    Statistical,
    /// Document count of a filter
    Filter,
}

#[derive(Debug, Clone)]
pub struct FacetPlan {
    pub name: String,
    pub kind: FacetKind,
    /// Selects this facet answers; none for a facet that only reports
    /// which groups hold documents
    pub selects: Vec<usize>,
    /// Cell of a per-cell facet; empty for term facets
    pub coords: Vec<PartKey>,
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub mode: EsMode,
    pub body: Value,
    pub facets: Vec<FacetPlan>,
    /// Term facets group by the packed script rather than a single field
    pub packed: bool,
}

/// `filtered` query body around `filter`, with no hits
pub(crate) fn facet_body(filter: Value, facets: Map<String, Value>) -> Value {
    json!({
        "query": {"filtered": {"query": {"match_all": {}}, "filter": filter}},
        "size": 0,
        "facets": facets
    })
}

/// Backend filter for the query's `filter` and `where`. Filters touching
/// nested documents, and every `where`, become script filters.
pub fn query_filter(cq: &CompiledQuery, schema: &Schema) -> Result<Value, EsError> {
    let mut parts = Vec::new();
    if let Some(filter) = &cq.query.filter {
        parts.push(filter_json(filter, schema)?);
    }
    if let Some(expr) = &cq.where_ {
        let mut compiler = ScriptCompiler::new(schema);
        let body = compiler.compile_expr(expr)?;
        parts.push(json!({"script": {"script": compiler.finish(body)}}));
    }
    Ok(match parts.len() {
        0 => json!({"match_all": {}}),
        1 => parts.remove(0),
        _ => json!({"and": parts}),
    })
}

/// The part of the query filter the backend can always apply; rows it lets
/// through are filtered again in memory
pub(crate) fn scan_filter(cq: &CompiledQuery, schema: &Schema) -> Value {
    match &cq.query.filter {
        Some(filter) => filter_json(filter, schema).unwrap_or_else(|_| json!({"match_all": {}})),
        None => json!({"match_all": {}}),
    }
}

fn filter_json(filter: &Filter, schema: &Schema) -> Result<Value, EsError> {
    let nested = filter.fields().iter().any(|f| schema.nested_path_of(f).is_some());
    if nested {
        return Ok(json!({"script": {"script": filter_script(filter, schema)?}}));
    }
    Ok(filter.to_json())
}

/// Condition selecting the rows an edge puts in partition `key`
fn edge_filter(edge: &CompiledEdge, key: &PartKey) -> Result<Filter, EsError> {
    if *key == PartKey::Null {
        let parts = edge
            .domain
            .part_keys()
            .iter()
            .map(|k| part_filter(edge, k))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Filter::negate(Filter::or(parts)));
    }
    part_filter(edge, key)
}

fn part_filter(edge: &CompiledEdge, key: &PartKey) -> Result<Filter, EsError> {
    let part = edge.domain.partition(key);
    if let Some(filter) = &part.esfilter {
        return Ok(filter.clone());
    }
    let unsupported = || EsError::Unsupported(format!("edge {} has no partition filter", edge.name));
    match &edge.value {
        EdgeValue::Expr(expr) => {
            let field = expr.as_field().ok_or_else(unsupported)?;
            edge.domain.esfilter(&part, Some(field)).ok_or_else(unsupported)
        }
        EdgeValue::Record => {
            let key = edge.domain.key().ok_or_else(unsupported)?;
            match (&part.value, key.fields().as_slice()) {
                (Value::Object(_), _) => edge.domain.esfilter(&part, Some(&edge.name)).ok_or_else(unsupported),
                (value, [field]) if !value.is_null() => Ok(Filter::term(*field, value.clone())),
                _ => Err(unsupported()),
            }
        }
        EdgeValue::Range { min, max } => {
            let (Some(lo), Some(part_min), Some(part_max)) = (min.as_field(), part.min.clone(), part.max.clone())
            else {
                return Err(unsupported());
            };
            let starts_before = Filter::range(
                lo,
                RangeBounds {
                    lt: Some(part_max),
                    ..Default::default()
                },
            );
            let ends_after = match max {
                Some(max) => {
                    let hi = max.as_field().ok_or_else(unsupported)?;
                    Filter::or([
                        Filter::Missing { field: hi.to_string() },
                        Filter::range(
                            hi,
                            RangeBounds {
                                gt: Some(part_min),
                                ..Default::default()
                            },
                        ),
                    ])
                }
                None => Filter::MatchAll,
            };
            Ok(Filter::and([starts_before, ends_after]))
        }
        EdgeValue::PartitionFilters => Err(unsupported()),
    }
}

/// Grouping key of a term facet: a field for one plain discrete edge,
/// otherwise the packed script over all edges
fn term_key(cq: &CompiledQuery, schema: &Schema, prefix: &str) -> Result<(Map<String, Value>, bool), EsError> {
    let mut key = Map::new();
    if let [edge] = cq.edges.as_slice() {
        if let Some(field) = edge.field() {
            if plain_field(schema, field) && !edge.domain.kind().is_bucketed() && !edge.allow_nulls {
                key.insert(format!("{prefix}field"), json!(field));
                return Ok((key, false));
            }
        }
    }
    key.insert(format!("{prefix}script"), json!(packed_script(cq, schema)?));
    Ok((key, true))
}

/// Where a value facet reads its numbers: a field or a script
fn value_source(select: &CompiledSelect, schema: &Schema, prefix: &str) -> Result<Map<String, Value>, EsError> {
    let mut out = Map::new();
    match (select.field(), &select.value) {
        (Some(field), _) if plain_field(schema, field) => {
            out.insert(format!("{prefix}field"), json!(field));
        }
        (_, Some(expr)) => {
            let mut compiler = ScriptCompiler::new(schema);
            let body = compiler.compile_expr(expr)?;
            out.insert(format!("{prefix}script"), json!(compiler.finish(body)));
        }
        (_, None) => return Err(EsError::Unsupported(format!("select {} has no value", select.name))),
    }
    Ok(out)
}

/// Every combination of one key per edge, nulls last where allowed
fn cells(cq: &CompiledQuery) -> Vec<Vec<PartKey>> {
    cq.edges.iter().fold(vec![Vec::new()], |acc, edge| {
        let mut keys = edge.domain.part_keys();
        if edge.allow_nulls {
            keys.push(PartKey::Null);
        }
        acc.iter()
            .flat_map(|prefix| {
                keys.iter().map(move |k| {
                    let mut cell = prefix.clone();
                    cell.push(*k);
                    cell
                })
            })
            .collect()
    })
}

fn cell_name(cq: &CompiledQuery, prefix: &str, coords: &[PartKey]) -> Result<String, EsError> {
    let mut name = prefix.to_string();
    for (edge, key) in cq.edges.iter().zip(coords) {
        let index = edge.domain.data_index(key).map_err(cubeq_engine::QbError::from)?;
        match index {
            Some(i) => name.push_str(&format!("_{i}")),
            None => name.push_str("_null"),
        }
    }
    Ok(name)
}

/// Build the facet request for a facet mode. Statistical and aggop plans
/// freeze the query's domains, since their cells are enumerated up front.
pub fn build_plan(
    mode: EsMode,
    cq: &mut CompiledQuery,
    schema: &Schema,
    filter: Value,
    settings: &EsSettings,
) -> Result<Plan, EsError> {
    let mut facets = Map::new();
    let mut plans = Vec::new();
    let mut packed = false;

    match mode {
        EsMode::Terms => {
            let (mut key, is_packed) = term_key(cq, schema, "")?;
            packed = is_packed;
            key.insert("size".to_string(), json!(settings.term_size));
            facets.insert("terms".to_string(), json!({"terms": key}));
            plans.push(FacetPlan {
                name: "terms".to_string(),
                kind: FacetKind::Terms,
                selects: (0..cq.selects.len()).collect(),
                coords: Vec::new(),
            });
        }
        EsMode::TermsStats => {
            // A terms facet on the key reports every group, and its `other`
            // total shows whether the key had more terms than `term_size`
            let docs = needs_doc_facet(cq);
            let named = cq.selects.iter().enumerate().map(|(i, s)| (format!("s{i}"), Some((i, s))));
            let extra = docs.then(|| ("docs".to_string(), None));
            for (name, select) in named.chain(extra) {
                let (facet, kind) = match select {
                    Some((_, select)) if select.value.is_some() && counted_field(select).is_none() => {
                        let (mut key, is_packed) = term_key(cq, schema, "key_")?;
                        packed = is_packed;
                        key.extend(value_source(select, schema, "value_")?);
                        key.insert("size".to_string(), json!(settings.term_size));
                        (json!({"terms_stats": key}), FacetKind::TermsStats)
                    }
                    _ => {
                        let (mut key, is_packed) = term_key(cq, schema, "")?;
                        packed = is_packed;
                        key.insert("size".to_string(), json!(settings.term_size));
                        let mut facet = Map::new();
                        facet.insert("terms".to_string(), Value::Object(key));
                        if let Some(field) = select.and_then(|(_, s)| counted_field(s)) {
                            let present = Filter::Exists { field: field.to_string() };
                            facet.insert("facet_filter".to_string(), present.to_json());
                        }
                        (Value::Object(facet), FacetKind::Terms)
                    }
                };
                facets.insert(name.clone(), facet);
                plans.push(FacetPlan {
                    name,
                    kind,
                    selects: select.map(|(i, _)| vec![i]).unwrap_or_default(),
                    coords: Vec::new(),
                });
            }
        }
        EsMode::Statistical | EsMode::AggOp => {
            freeze_domains(cq)?;
            let cells = cells(cq);
            let docs = cq.mode == QbMode::List && needs_doc_facet(cq);
            let needed = cells.len() * (cq.selects.len() + usize::from(docs));
            if needed > settings.max_facets {
                return Err(EsError::TooManyFacets {
                    needed,
                    limit: settings.max_facets,
                });
            }
            for coords in cells {
                let filter = Filter::and(
                    cq.edges
                        .iter()
                        .zip(&coords)
                        .map(|(edge, key)| edge_filter(edge, key))
                        .collect::<Result<Vec<_>, _>>()?,
                );
                for (i, select) in cq.selects.iter().enumerate() {
                    let name = cell_name(cq, &format!("s{i}"), &coords)?;
                    let (facet, kind) = match (&select.value, counted_field(select)) {
                        (None, _) => (json!({"filter": filter.to_json()}), FacetKind::Filter),
                        (Some(_), Some(field)) => {
                            let present = Filter::and([filter.clone(), Filter::Exists { field: field.to_string() }]);
                            (json!({"filter": present.to_json()}), FacetKind::Filter)
                        }
                        (Some(_), None) => {
                            let mut facet = Map::new();
                            facet.insert(
                                "statistical".to_string(),
                                Value::Object(value_source(select, schema, "")?),
                            );
                            if !filter.is_match_all() {
                                facet.insert("facet_filter".to_string(), filter.to_json());
                            }
                            (Value::Object(facet), FacetKind::Statistical)
                        }
                    };
                    facets.insert(name.clone(), facet);
                    plans.push(FacetPlan {
                        name,
                        kind,
                        selects: vec![i],
                        coords: coords.clone(),
                    });
                }
                if docs {
                    let name = cell_name(cq, "docs", &coords)?;
                    facets.insert(name.clone(), json!({"filter": filter.to_json()}));
                    plans.push(FacetPlan {
                        name,
                        kind: FacetKind::Filter,
                        selects: Vec::new(),
                        coords: coords.clone(),
                    });
                }
            }
        }
        other => return Err(EsError::Unsupported(format!("{} is not a facet mode", other.name()))),
    }

    if plans.is_empty() {
        return Err(EsError::NoFacets);
    }
    debug!(mode = mode.name(), facets = plans.len(), packed, "Facet plan built");
    Ok(Plan {
        mode,
        body: facet_body(filter, facets),
        facets: plans,
        packed,
    })
}
