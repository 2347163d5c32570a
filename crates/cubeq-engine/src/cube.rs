//! Dense N-dimensional result storage

use cubeq_domain::Domain;
use cubeq_registry::AggregateSpec;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

use crate::QbError;

#[derive(Debug, Clone)]
pub struct CubeEdge {
    pub name: String,
    /// Frozen domain addressing this dimension
    pub domain: Domain,
}

/// Row-major cells, one slot per (cell, select); each slot is written once
#[derive(Debug, Clone)]
pub struct Cube {
    edges: Vec<CubeEdge>,
    selects: Vec<String>,
    single: bool,
    dims: Vec<usize>,
    cells: Vec<Option<Value>>,
}

impl Cube {
    pub fn new(edges: Vec<CubeEdge>, selects: Vec<String>, single: bool) -> Self {
        let dims: Vec<usize> = edges.iter().map(|e| e.domain.cube_size()).collect();
        let size = dims.iter().product::<usize>() * selects.len();
        Self {
            edges,
            selects,
            single,
            dims,
            cells: vec![None; size],
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn edges(&self) -> &[CubeEdge] {
        &self.edges
    }

    pub fn selects(&self) -> &[String] {
        &self.selects
    }

    pub fn is_single(&self) -> bool {
        self.single
    }

    fn offset(&self, coords: &[usize], select: usize) -> Option<usize> {
        if coords.len() != self.dims.len() || select >= self.selects.len() {
            return None;
        }
        let mut cell = 0;
        for (&c, &d) in coords.iter().zip(&self.dims) {
            if c >= d {
                return None;
            }
            cell = cell * d + c;
        }
        Some(cell * self.selects.len() + select)
    }

    /// Write a cell; a second write to the same slot is a logic error
    pub fn set(&mut self, coords: &[usize], select: usize, value: Value) -> Result<(), QbError> {
        let Some(offset) = self.offset(coords, select) else {
            return Err(QbError::NoSuchCell(self.describe(coords, select)));
        };
        if self.cells[offset].is_some() {
            return Err(QbError::CellWritten(self.describe(coords, select)));
        }
        self.cells[offset] = Some(value);
        Ok(())
    }

    fn describe(&self, coords: &[usize], select: usize) -> String {
        format!("{coords:?}/{}", self.selects.get(select).map_or("?", String::as_str))
    }

    pub fn get(&self, coords: &[usize], select: usize) -> Option<&Value> {
        self.offset(coords, select).and_then(|o| self.cells[o].as_ref())
    }

    /// Give every unwritten slot its aggregate's empty-group value
    pub fn fill_empty(&mut self, specs: &[AggregateSpec]) {
        let width = self.selects.len();
        for (offset, slot) in self.cells.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(specs.get(offset % width).map_or(Value::Null, AggregateSpec::finalize_empty));
            }
        }
    }

    fn leaf(&self, cell: usize) -> Value {
        let width = self.selects.len();
        let slot = |s: usize| self.cells[cell * width + s].clone().unwrap_or(Value::Null);
        if self.single && width == 1 {
            return slot(0);
        }
        let mut obj = Map::new();
        for (s, name) in self.selects.iter().enumerate() {
            obj.insert(name.clone(), slot(s));
        }
        Value::Object(obj)
    }

    /// Nested arrays, one level per edge; leaves are scalars for a single
    /// select and objects otherwise
    pub fn to_json(&self) -> Value {
        self.nest(0, 0)
    }

    fn nest(&self, depth: usize, prefix: usize) -> Value {
        match self.dims.get(depth) {
            None => self.leaf(prefix),
            Some(&d) => Value::Array((0..d).map(|i| self.nest(depth + 1, prefix * d + i)).collect()),
        }
    }

    /// Edge descriptions with their partitions in cube order
    pub fn edges_json(&self) -> Value {
        Value::Array(
            self.edges
                .iter()
                .map(|edge| {
                    let domain = &edge.domain;
                    let mut partitions: Vec<Value> = domain
                        .partitions()
                        .into_iter()
                        .map(|p| json!({"name": domain.label(p), "value": domain.end(p), "dataIndex": p.data_index}))
                        .collect();
                    if domain.allow_nulls() {
                        let null_part = domain.null_partition();
                        partitions.push(json!({"name": null_part.name, "value": Value::Null, "dataIndex": null_part.data_index}));
                    }
                    json!({
                        "name": edge.name,
                        "domain": {"type": domain.kind().name(), "partitions": partitions}
                    })
                })
                .collect(),
        )
    }

    /// Combine cubes over equal domains into one multi-select cube
    pub fn merge(cubes: Vec<Cube>) -> Result<Cube, QbError> {
        let mut iter = cubes.into_iter();
        let Some(first) = iter.next() else {
            return Ok(Cube::new(Vec::new(), Vec::new(), false));
        };
        let rest: Vec<Cube> = iter.collect();
        if rest.is_empty() {
            return Ok(first);
        }

        let mut names = HashSet::new();
        for cube in std::iter::once(&first).chain(&rest) {
            if cube.edges.len() != first.edges.len() {
                return Err(QbError::Domain(cubeq_domain::DomainError::Mismatch {
                    edge: "*".to_string(),
                    reason: format!("{} vs {} edges", first.edges.len(), cube.edges.len()),
                }));
            }
            for (a, b) in first.edges.iter().zip(&cube.edges) {
                a.domain.equals(&b.domain)?;
            }
            for name in &cube.selects {
                if !names.insert(name.clone()) {
                    return Err(QbError::DuplicateColumn(name.clone()));
                }
            }
        }

        let selects: Vec<String> = std::iter::once(&first)
            .chain(&rest)
            .flat_map(|c| c.selects.iter().cloned())
            .collect();
        let mut merged = Cube::new(first.edges.clone(), selects, false);
        let cells = first.dims.iter().product::<usize>();
        let width = merged.selects.len();
        for cell in 0..cells {
            let mut s = 0;
            for cube in std::iter::once(&first).chain(&rest) {
                let w = cube.selects.len();
                for k in 0..w {
                    merged.cells[cell * width + s] = cube.cells[cell * w + k].clone();
                    s += 1;
                }
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubeq_ir::DomainDecl;

    fn edge(name: &str, parts: Value, allow_nulls: bool) -> CubeEdge {
        let decl: DomainDecl = serde_json::from_value(json!({"type": "set", "partitions": parts})).unwrap();
        let mut domain = Domain::from_decl(name, Some(&decl), allow_nulls).unwrap();
        domain.freeze().unwrap();
        CubeEdge {
            name: name.to_string(),
            domain,
        }
    }

    #[test]
    fn test_cells_are_write_once() {
        let mut cube = Cube::new(vec![edge("c", json!(["a", "b"]), true)], vec!["n".to_string()], true);
        assert_eq!(cube.dims(), &[3]);
        cube.set(&[1], 0, json!(5)).unwrap();
        assert!(matches!(cube.set(&[1], 0, json!(6)), Err(QbError::CellWritten(_))));
        assert!(matches!(cube.set(&[3], 0, json!(1)), Err(QbError::NoSuchCell(_))));
        assert_eq!(cube.get(&[1], 0), Some(&json!(5)));
    }

    #[test]
    fn test_edges_json_lists_null_partition_last() {
        let cube = Cube::new(vec![edge("c", json!(["a", "b"]), true)], vec!["n".to_string()], true);
        let edges = cube.edges_json();
        let parts = edges[0]["domain"]["partitions"].as_array().unwrap();
        assert_eq!(edges[0]["name"], "c");
        assert_eq!(edges[0]["domain"]["type"], "set");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0]["name"], "a");
        assert_eq!(parts[2]["value"], Value::Null);
        assert_eq!(parts[2]["dataIndex"], json!(2));

        let closed = Cube::new(vec![edge("c", json!(["a", "b"]), false)], vec!["n".to_string()], true);
        assert_eq!(closed.edges_json()[0]["domain"]["partitions"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_nested_json() {
        let mut cube = Cube::new(
            vec![edge("x", json!(["a", "b"]), false), edge("y", json!([1, 2, 3]), false)],
            vec!["n".to_string(), "m".to_string()],
            false,
        );
        cube.set(&[1, 2], 0, json!(7)).unwrap();
        cube.fill_empty(&[
            AggregateSpec::new(cubeq_registry::AggregateKind::Count),
            AggregateSpec::new(cubeq_registry::AggregateKind::Sum),
        ]);

        let out = cube.to_json();
        assert_eq!(out[1][2], json!({"n": 7, "m": null}));
        assert_eq!(out[0][0], json!({"n": 0, "m": null}));
        assert_eq!(out.as_array().unwrap().len(), 2);
        assert_eq!(out[0].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_merge() {
        let mut counts = Cube::new(vec![edge("c", json!(["a", "b"]), false)], vec!["count".to_string()], true);
        counts.set(&[0], 0, json!(2)).unwrap();
        counts.set(&[1], 0, json!(1)).unwrap();
        let mut sums = Cube::new(vec![edge("c", json!(["a", "b"]), false)], vec!["sum".to_string()], true);
        sums.set(&[0], 0, json!(4)).unwrap();
        sums.set(&[1], 0, json!(5)).unwrap();

        let merged = Cube::merge(vec![counts.clone(), sums]).unwrap();
        assert_eq!(merged.to_json(), json!([{"count": 2, "sum": 4}, {"count": 1, "sum": 5}]));

        let other = Cube::new(vec![edge("c", json!(["a", "z"]), false)], vec!["x".to_string()], true);
        assert!(matches!(Cube::merge(vec![counts.clone(), other]), Err(QbError::Domain(_))));
        assert!(matches!(Cube::merge(vec![counts.clone(), counts]), Err(QbError::DuplicateColumn(_))));
    }
}
