//! Accumulation tree keyed by provisional partition tuples

use cubeq_domain::PartKey;
use cubeq_registry::Accumulator;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

use crate::column::{CompiledQuery, EdgeValue};
use crate::cube::{Cube, CubeEdge};
use crate::sort::compare_records;
use crate::QbError;

/// Aggregate state per partition tuple. Keys stay provisional until every
/// domain is frozen, since growing domains have no final `dataIndex` yet.
#[derive(Debug, Default)]
pub struct Tree {
    leaves: BTreeMap<Vec<PartKey>, Vec<Accumulator>>,
    rows: u64,
    /// Rows dropped for landing in NULL on an edge without `allowNulls`
    excluded: u64,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn excluded(&self) -> u64 {
        self.excluded
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Fold one record into every partition tuple it belongs to. Records the
    /// query filters out contribute nothing.
    pub fn add(&mut self, cq: &mut CompiledQuery, record: &Value) -> Result<(), QbError> {
        if !cq.accepts(record)? {
            return Ok(());
        }
        self.rows += 1;

        let mut candidates: Vec<Vec<PartKey>> = Vec::with_capacity(cq.edges.len());
        for edge in cq.edges.iter_mut() {
            let keys = match &edge.value {
                EdgeValue::Expr(expr) => vec![edge.domain.get_part_by_key(&expr.eval(record)?)],
                EdgeValue::Record => vec![edge.domain.get_part_by_key(record)],
                EdgeValue::Range { min, max } => {
                    let lo = min.eval(record)?;
                    let hi = match max {
                        Some(max) => max.eval(record)?,
                        None => Value::Null,
                    };
                    edge.domain.parts_in_range(&lo, &hi)?
                }
                EdgeValue::PartitionFilters => edge.domain.matching_parts(record),
            };
            let keys: Vec<PartKey> = keys
                .into_iter()
                .filter(|k| edge.allow_nulls || *k != PartKey::Null)
                .collect();
            match (keys.is_empty(), edge.allow_nulls) {
                (false, _) => candidates.push(keys),
                (true, true) => candidates.push(vec![PartKey::Null]),
                (true, false) => {
                    self.excluded += 1;
                    return Ok(());
                }
            }
        }

        let values = cq
            .selects
            .iter()
            .map(|s| s.eval(record))
            .collect::<Result<Vec<_>, _>>()?;

        for coords in cartesian(&candidates) {
            let leaf = self
                .leaves
                .entry(coords)
                .or_insert_with(|| cq.selects.iter().map(|s| s.spec.default_value()).collect());
            for ((select, acc), value) in cq.selects.iter().zip(leaf.iter_mut()).zip(&values) {
                select.spec.add(acc, value)?;
            }
        }
        Ok(())
    }

    /// Freeze every domain and report rows lost to overflow or NULL
    pub fn freeze(&self, cq: &mut CompiledQuery) -> Result<(), QbError> {
        freeze_domains(cq)?;
        if self.excluded > 0 {
            warn!(excluded = self.excluded, "Rows excluded for NULL edge values");
        }
        Ok(())
    }

    /// Finalize every leaf's accumulators
    pub fn into_leaves(self, cq: &CompiledQuery) -> Leaves {
        self.leaves
            .into_iter()
            .map(|(keys, accs)| {
                let values = cq.selects.iter().zip(accs).map(|(s, acc)| s.spec.end(acc)).collect();
                (keys, values)
            })
            .collect()
    }
}

/// Finalized select values keyed by provisional partition tuples
pub type Leaves = Vec<(Vec<PartKey>, Vec<Value>)>;

/// Freeze each edge's domain, warning about values that fell outside it
pub fn freeze_domains(cq: &mut CompiledQuery) -> Result<(), QbError> {
    for edge in cq.edges.iter_mut() {
        if !edge.domain.is_frozen() {
            edge.domain.freeze()?;
        }
        if edge.domain.overflow() > 0 {
            warn!(
                edge = %edge.name,
                overflow = edge.domain.overflow(),
                "Values fell outside the edge domain"
            );
        }
    }
    Ok(())
}

/// Write leaves into a cube addressed by `dataIndex`; cells no leaf reached
/// get the aggregate's empty value
pub fn cube_from_leaves(cq: &CompiledQuery, leaves: Leaves) -> Result<Cube, QbError> {
    let edges = cq
        .edges
        .iter()
        .map(|e| CubeEdge {
            name: e.name.clone(),
            domain: e.domain.clone(),
        })
        .collect();
    let names = cq.selects.iter().map(|s| s.name.clone()).collect();
    let mut cube = Cube::new(edges, names, cq.single);

    for (keys, values) in leaves {
        let Some(coords) = data_indices(cq, &keys)? else {
            continue;
        };
        for (s, value) in values.into_iter().enumerate() {
            cube.set(&coords, s, value)?;
        }
    }
    cube.fill_empty(&cq.specs());
    Ok(cube)
}

/// One record per leaf with partitions resolved to their values, in cube
/// order, then sorted by the query's comparator chain and limited
pub fn list_from_leaves(cq: &CompiledQuery, leaves: Leaves) -> Result<Vec<Value>, QbError> {
    let mut rows = Vec::with_capacity(leaves.len());
    for (keys, values) in leaves {
        let Some(coords) = data_indices(cq, &keys)? else {
            continue;
        };
        let mut record = serde_json::Map::new();
        for (edge, key) in cq.edges.iter().zip(&keys) {
            let part = edge.domain.partition(key);
            record.insert(edge.name.clone(), edge.domain.end(&part));
        }
        for (select, value) in cq.selects.iter().zip(values) {
            record.insert(select.name.clone(), value);
        }
        rows.push((coords, Value::Object(record)));
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    let mut rows: Vec<Value> = rows.into_iter().map(|(_, row)| row).collect();
    rows.sort_by(|a, b| compare_records(&cq.sort, a, b));
    if let Some(limit) = cq.limit {
        rows.truncate(limit);
    }
    Ok(rows)
}

fn data_indices(cq: &CompiledQuery, keys: &[PartKey]) -> Result<Option<Vec<usize>>, QbError> {
    let mut coords = Vec::with_capacity(keys.len());
    for (edge, key) in cq.edges.iter().zip(keys) {
        match edge.domain.data_index(key)? {
            Some(i) => coords.push(i),
            None => return Ok(None),
        }
    }
    Ok(Some(coords))
}

/// Every tuple taking one key from each candidate list
fn cartesian(candidates: &[Vec<PartKey>]) -> Vec<Vec<PartKey>> {
    candidates.iter().fold(vec![Vec::new()], |acc, keys| {
        acc.iter()
            .flat_map(|prefix| {
                keys.iter().map(move |k| {
                    let mut tuple = prefix.clone();
                    tuple.push(*k);
                    tuple
                })
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cartesian() {
        let a = vec![PartKey::Index(0), PartKey::Index(1)];
        let b = vec![PartKey::Bucket(5)];
        let c = vec![PartKey::Null, PartKey::Index(2)];
        let tuples = cartesian(&[a, b, c]);
        assert_eq!(tuples.len(), 4);
        assert_eq!(tuples[0], vec![PartKey::Index(0), PartKey::Bucket(5), PartKey::Null]);
        assert_eq!(tuples[3], vec![PartKey::Index(1), PartKey::Bucket(5), PartKey::Index(2)]);
        assert_eq!(cartesian(&[]), vec![Vec::<PartKey>::new()]);
    }
}
