//! Facet responses back into engine leaves

use cubeq_domain::PartKey;
use cubeq_engine::{flatten, freeze_domains, CompiledQuery, Leaves, QueryResult};
use cubeq_ir::{as_f64, canonical_key, Schema};
use cubeq_registry::{AggregateKind, AggregateSpec};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::pack::{token_value, unpack_n};
use crate::request::{FacetKind, Plan};
use crate::EsError;

/// What a backend reported for one select in one cell
#[derive(Debug, Clone, PartialEq)]
enum Partial {
    Count(u64),
    Stats {
        count: u64,
        total: f64,
        min: f64,
        max: f64,
    },
    /// A statistical facet's value for the select's aggregate
    Value { count: u64, value: Value },
}

impl Partial {
    /// Several terms can land in one cell when values are bucketed here
    /// rather than in the script
    fn merge(self, other: Partial) -> Result<Partial, EsError> {
        Ok(match (self, other) {
            (Partial::Count(a), Partial::Count(b)) => Partial::Count(a + b),
            (
                Partial::Stats {
                    count: c1,
                    total: t1,
                    min: lo1,
                    max: hi1,
                },
                Partial::Stats {
                    count: c2,
                    total: t2,
                    min: lo2,
                    max: hi2,
                },
            ) => Partial::Stats {
                count: c1 + c2,
                total: t1 + t2,
                min: lo1.min(lo2),
                max: hi1.max(hi2),
            },
            (a, b) => return Err(EsError::Decode(format!("cannot merge {a:?} with {b:?}"))),
        })
    }

    fn finish(self, spec: &AggregateSpec) -> Value {
        let raw = match self {
            Partial::Count(n) if spec.kind == AggregateKind::Count => Value::from(n),
            Partial::Count(_) => return spec.finalize_empty(),
            Partial::Stats { count: 0, .. } | Partial::Value { count: 0, .. } => return spec.finalize_empty(),
            Partial::Stats { count, total, min, max } => match spec.kind {
                AggregateKind::Count => Value::from(count),
                AggregateKind::Sum => cubeq_ir::number(total),
                AggregateKind::Average => cubeq_ir::number(total / count as f64),
                AggregateKind::Min => cubeq_ir::number(min),
                AggregateKind::Max => cubeq_ir::number(max),
                _ => return spec.finalize_empty(),
            },
            Partial::Value { value, .. } => value,
        };
        spec.from_backend(&raw)
    }
}

pub(crate) fn count_of(entry: &Value, field: &str) -> u64 {
    entry[field].as_u64().or_else(|| as_f64(&entry[field]).map(|n| n as u64)).unwrap_or(0)
}

/// Fail when a terms facet left terms out: `other` counts the documents
/// under terms beyond the requested size
pub(crate) fn check_complete(facet: &str, body: &Value) -> Result<(), EsError> {
    let other = count_of(body, "other");
    if other > 0 {
        return Err(EsError::TermsTruncated {
            facet: facet.to_string(),
            other,
        });
    }
    Ok(())
}

pub(crate) fn term_text(term: &Value) -> Option<String> {
    match term {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(canonical_key(other)),
    }
}

/// Accumulates facet answers per cell until every facet has been read
pub struct Decoder<'a> {
    cq: &'a mut CompiledQuery,
    schema: &'a Schema,
    packed: bool,
    cells: BTreeMap<Vec<PartKey>, Vec<Option<Partial>>>,
}

impl<'a> Decoder<'a> {
    pub fn new(cq: &'a mut CompiledQuery, schema: &'a Schema, packed: bool) -> Self {
        Self {
            cq,
            schema,
            packed,
            cells: BTreeMap::new(),
        }
    }

    /// Cell of a term; `None` when an edge rejects its value
    fn edge_key(&mut self, term: &str, prefix: &[PartKey]) -> Result<Option<Vec<PartKey>>, EsError> {
        let remaining = self.cq.edges.len() - prefix.len();
        let tokens = if self.packed {
            unpack_n(term, remaining)?
        } else {
            vec![Some(term.to_string())]
        };
        let mut coords = prefix.to_vec();
        for (edge, token) in (prefix.len()..).zip(tokens) {
            match self.edge_part(edge, token) {
                Some(key) => coords.push(key),
                None => return Ok(None),
            }
        }
        Ok(Some(coords))
    }

    /// Partition of edge `edge` holding a term token, growing discovered
    /// domains; `None` when the edge rejects it
    pub fn edge_part(&mut self, edge: usize, token: Option<String>) -> Option<PartKey> {
        let edge = &mut self.cq.edges[edge];
        let value = token_value(edge, self.schema, token);
        let key = edge.domain.get_part_by_key(&value);
        (key != PartKey::Null || edge.allow_nulls).then_some(key)
    }

    /// Leaf of a cell holding documents, created empty on first use
    fn leaf(&mut self, coords: Vec<PartKey>) -> &mut Vec<Option<Partial>> {
        let width = self.cq.selects.len();
        self.cells.entry(coords).or_insert_with(|| vec![None; width])
    }

    fn add(&mut self, coords: Vec<PartKey>, select: usize, partial: Partial) -> Result<(), EsError> {
        let slot = &mut self.leaf(coords)[select];
        *slot = Some(match slot.take() {
            Some(existing) => existing.merge(partial)?,
            None => partial,
        });
        Ok(())
    }

    /// Read a `terms` or `terms_stats` facet answering `selects`. Terms
    /// are keyed by the edges after `prefix`, whose keys are already known.
    /// Every term with documents gets a leaf, even with no selects.
    pub fn add_terms(
        &mut self,
        facet: &str,
        kind: FacetKind,
        selects: &[usize],
        prefix: &[PartKey],
        body: &Value,
    ) -> Result<(), EsError> {
        check_complete(facet, body)?;
        let mut seen = HashSet::new();
        for entry in body["terms"].as_array().map(Vec::as_slice).unwrap_or_default() {
            let Some(term) = term_text(&entry["term"]) else {
                continue;
            };
            if !seen.insert(term.clone()) {
                return Err(EsError::DuplicateTerm {
                    facet: facet.to_string(),
                    term,
                });
            }
            let Some(coords) = self.edge_key(&term, prefix)? else {
                continue;
            };
            self.leaf(coords.clone());
            let partial = match kind {
                FacetKind::TermsStats => Partial::Stats {
                    count: entry
                        .get("total_count")
                        .map(|_| count_of(entry, "total_count"))
                        .unwrap_or_else(|| count_of(entry, "count")),
                    total: as_f64(&entry["total"]).unwrap_or(0.0),
                    min: as_f64(&entry["min"]).unwrap_or(f64::INFINITY),
                    max: as_f64(&entry["max"]).unwrap_or(f64::NEG_INFINITY),
                },
                _ => Partial::Count(count_of(entry, "count")),
            };
            for &select in selects {
                self.add(coords.clone(), select, partial.clone())?;
            }
        }
        Ok(())
    }

    /// Read a per-cell `filter` or `statistical` facet; a cell with nothing
    /// counted adds no leaf of its own
    pub fn add_cell(&mut self, kind: FacetKind, select: usize, coords: &[PartKey], body: &Value) -> Result<(), EsError> {
        let count = count_of(body, "count");
        if count == 0 {
            return Ok(());
        }
        let partial = match kind {
            FacetKind::Filter => Partial::Count(count),
            _ => {
                let spec = &self.cq.selects[select].spec;
                let field = spec.kind.facet_field().ok_or_else(|| {
                    EsError::Decode(format!("{} has no statistical value", self.cq.selects[select].name))
                })?;
                Partial::Value {
                    count,
                    value: body[field].clone(),
                }
            }
        };
        self.add(coords.to_vec(), select, partial)
    }

    /// Read a per-cell `filter` facet counting the cell's documents
    pub fn add_docs(&mut self, coords: &[PartKey], body: &Value) {
        if count_of(body, "count") > 0 {
            self.leaf(coords.to_vec());
        }
    }

    /// Read every facet a plan asked for
    pub fn add_plan(&mut self, plan: &Plan, response: &Value) -> Result<(), EsError> {
        let facets = &response["facets"];
        for facet in &plan.facets {
            let body = facets
                .get(&facet.name)
                .ok_or_else(|| EsError::Decode(format!("response lacks facet {}", facet.name)))?;
            match facet.kind {
                FacetKind::Terms | FacetKind::TermsStats => {
                    self.add_terms(&facet.name, facet.kind, &facet.selects, &[], body)?
                }
                FacetKind::Filter if facet.selects.is_empty() => self.add_docs(&facet.coords, body),
                FacetKind::Filter | FacetKind::Statistical => {
                    for &select in &facet.selects {
                        self.add_cell(facet.kind, select, &facet.coords, body)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Freeze the domains and shape the cells like an in-memory run would
    pub fn finish(self) -> Result<QueryResult, EsError> {
        freeze_domains(self.cq)?;
        let selects = &self.cq.selects;
        let leaves: Leaves = self
            .cells
            .into_iter()
            .map(|(coords, partials)| {
                let values = partials
                    .into_iter()
                    .zip(selects)
                    .map(|(partial, select)| match partial {
                        Some(p) => p.finish(&select.spec),
                        None => select.spec.finalize_empty(),
                    })
                    .collect();
                (coords, values)
            })
            .collect();
        debug!(cells = leaves.len(), "Decoded facets");
        Ok(flatten(self.cq, leaves)?)
    }
}

/// Result of a facet plan's response
pub fn decode(plan: &Plan, cq: &mut CompiledQuery, schema: &Schema, response: &Value) -> Result<QueryResult, EsError> {
    let mut decoder = Decoder::new(cq, schema, plan.packed);
    decoder.add_plan(plan, response)?;
    decoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::EsSettings;
    use crate::request::{build_plan, query_filter};
    use crate::EsMode;
    use cubeq_engine::Qb;
    use cubeq_ir::{Column, ColumnType, Query};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(
            "bugs",
            vec![
                Column::new("c", ColumnType::String),
                Column::new("d", ColumnType::String),
                Column::new("n", ColumnType::Number),
            ],
        )
    }

    fn run(query: Value, mode: EsMode, response: Value) -> Result<QueryResult, EsError> {
        let query = Query::from_json(query).unwrap();
        let schema = schema();
        let mut cq = Qb::new(Default::default()).compile(&query, &schema).unwrap();
        let filter = query_filter(&cq, &schema)?;
        let plan = build_plan(mode, &mut cq, &schema, filter, &EsSettings::default())?;
        decode(&plan, &mut cq, &schema, &response)
    }

    #[test]
    fn test_packed_terms_to_list() {
        let result = run(
            json!({"from": "bugs", "select": {"name": "count", "aggregate": "count"}, "format": "list",
                   "edges": [{"name": "c", "allowNulls": true}, {"name": "d"}]}),
            EsMode::Terms,
            json!({"facets": {"terms": {"terms": [
                {"term": "b|y", "count": 2},
                {"term": "\\0|x", "count": 1},
                {"term": "a|x", "count": 4}
            ]}}}),
        )
        .unwrap();
        assert_eq!(
            result.as_list().unwrap(),
            &[
                json!({"c": "a", "d": "x", "count": 4}),
                json!({"c": "b", "d": "y", "count": 2}),
                json!({"c": null, "d": "x", "count": 1}),
            ]
        );
    }

    #[test]
    fn test_duplicate_term_rejected() {
        let result = run(
            json!({"from": "bugs", "select": {"aggregate": "count"}, "edges": [{"name": "c"}]}),
            EsMode::Terms,
            json!({"facets": {"terms": {"terms": [{"term": "a", "count": 1}, {"term": "a", "count": 2}]}}}),
        );
        assert!(matches!(result, Err(EsError::DuplicateTerm { .. })));
    }

    #[test]
    fn test_terms_stats_average() {
        let result = run(
            json!({"from": "bugs", "select": {"name": "avg", "value": "n", "aggregate": "average"}, "format": "list",
                   "edges": [{"name": "c"}]}),
            EsMode::TermsStats,
            json!({"facets": {
                "s0": {"terms": [{"term": "a", "count": 2, "total_count": 2, "total": 7.0, "min": 3.0, "max": 4.0}]},
                "docs": {"terms": [{"term": "a", "count": 2}, {"term": "b", "count": 1}], "other": 0}
            }}),
        )
        .unwrap();
        assert_eq!(
            result.as_list().unwrap(),
            &[json!({"c": "a", "avg": 3.5}), json!({"c": "b", "avg": null})]
        );
    }

    #[test]
    fn test_truncated_terms_rejected() {
        let result = run(
            json!({"from": "bugs", "select": {"aggregate": "count"}, "edges": [{"name": "c"}]}),
            EsMode::Terms,
            json!({"facets": {"terms": {"terms": [{"term": "a", "count": 4}], "missing": 2, "other": 3}}}),
        );
        assert!(matches!(result, Err(EsError::TermsTruncated { other: 3, .. })));

        let missing_only = run(
            json!({"from": "bugs", "select": {"aggregate": "count"}, "edges": [{"name": "c"}]}),
            EsMode::Terms,
            json!({"facets": {"terms": {"terms": [{"term": "a", "count": 4}], "missing": 2, "other": 0}}}),
        );
        assert!(missing_only.is_ok());
    }

    #[test]
    fn test_document_facets_keep_valueless_cells() {
        let result = run(
            json!({"from": "bugs", "select": {"name": "total", "value": "n", "aggregate": "sum"}, "format": "list",
                   "edges": [{"name": "c", "domain": {"type": "set", "partitions": ["a", "b", "z"]}}]}),
            EsMode::Statistical,
            json!({"facets": {
                "s0_0": {"_type": "statistical", "count": 2, "total": 5.0},
                "s0_1": {"_type": "statistical", "count": 0, "total": 0.0},
                "s0_2": {"_type": "statistical", "count": 0, "total": 0.0},
                "docs_0": {"_type": "filter", "count": 2},
                "docs_1": {"_type": "filter", "count": 1},
                "docs_2": {"_type": "filter", "count": 0}
            }}),
        )
        .unwrap();
        assert_eq!(
            result.as_list().unwrap(),
            &[json!({"c": "a", "total": 5}), json!({"c": "b", "total": null})]
        );
    }

    #[test]
    fn test_statistical_cells_fill_cube() {
        let result = run(
            json!({"from": "bugs", "select": {"name": "total", "value": "n", "aggregate": "sum"},
                   "edges": [{"name": "c", "domain": {"type": "set", "partitions": ["a", "b"]}}]}),
            EsMode::Statistical,
            json!({"facets": {
                "s0_0": {"_type": "statistical", "count": 2, "total": 5.0},
                "s0_1": {"_type": "statistical", "count": 0, "total": 0.0}
            }}),
        )
        .unwrap();
        let cube = result.as_cube().unwrap();
        assert_eq!(cube.get(&[0], 0), Some(&json!(5)));
        assert_eq!(cube.get(&[1], 0), Some(&Value::Null));
    }

    #[test]
    fn test_missing_facet() {
        let result = run(
            json!({"from": "bugs", "select": {"aggregate": "count"}, "edges": [{"name": "c"}]}),
            EsMode::Terms,
            json!({"facets": {}}),
        );
        assert!(matches!(result, Err(EsError::Decode(_))));
    }

    #[test]
    fn test_partials_merge() {
        let a = Partial::Stats {
            count: 1,
            total: 2.0,
            min: 2.0,
            max: 2.0,
        };
        let b = Partial::Stats {
            count: 2,
            total: 9.0,
            min: 4.0,
            max: 5.0,
        };
        let merged = a.merge(b).unwrap();
        assert_eq!(
            merged,
            Partial::Stats {
                count: 3,
                total: 11.0,
                min: 2.0,
                max: 5.0
            }
        );
        assert!(Partial::Count(1).merge(merged).is_err());
    }
}
