//! In-memory query execution

use cubeq_ir::{Query, Schema};
use cubeq_registry::AggregateRegistry;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::column::{compile, CompiledQuery, QbMode};
use crate::cube::Cube;
use crate::task::checkpoint;
use crate::tree::{cube_from_leaves, list_from_leaves, Leaves, Tree};
use crate::QbError;

/// Rows processed between cooperative yields
pub const DEFAULT_YIELD_EVERY: usize = 1_000;

#[derive(Debug, Clone)]
pub enum QueryResult {
    Cube(Cube),
    List(Vec<Value>),
}

impl QueryResult {
    pub fn as_cube(&self) -> Option<&Cube> {
        match self {
            QueryResult::Cube(cube) => Some(cube),
            QueryResult::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            QueryResult::Cube(_) => None,
            QueryResult::List(rows) => Some(rows),
        }
    }

    /// `{"edges", "cube"}` or `{"list"}`
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        match self {
            QueryResult::Cube(cube) => {
                out.insert("edges".to_string(), cube.edges_json());
                out.insert("cube".to_string(), cube.to_json());
            }
            QueryResult::List(rows) => {
                out.insert("list".to_string(), Value::Array(rows.clone()));
            }
        }
        Value::Object(out)
    }
}

/// Query compiler and in-memory executor
#[derive(Clone)]
pub struct Qb {
    registry: Arc<AggregateRegistry>,
    yield_every: usize,
}

impl Qb {
    pub fn new(registry: Arc<AggregateRegistry>) -> Self {
        Self {
            registry,
            yield_every: DEFAULT_YIELD_EVERY,
        }
    }

    pub fn with_yield_every(mut self, rows: usize) -> Self {
        self.yield_every = rows.max(1);
        self
    }

    pub fn registry(&self) -> &AggregateRegistry {
        &self.registry
    }

    pub fn compile(&self, query: &Query, schema: &Schema) -> Result<CompiledQuery, QbError> {
        compile(query, schema, &self.registry)
    }

    /// Compile against columns inferred from the records and run to completion
    pub fn run(&self, query: &Query, records: &[Value]) -> Result<QueryResult, QbError> {
        let schema = Schema::infer(&query.from, records);
        let cq = self.compile(query, &schema)?;
        self.run_compiled(cq, records)
    }

    pub fn run_compiled(&self, cq: CompiledQuery, records: &[Value]) -> Result<QueryResult, QbError> {
        let started = Instant::now();
        let mut scan = Scan::new(cq);
        for record in records {
            scan.feed(record)?;
        }
        scan.finish(started)
    }

    /// As [`Qb::run`], yielding to the runtime every `yield_every` rows and
    /// stopping with `Cancelled` once the token fires
    pub async fn run_task(
        &self,
        query: &Query,
        records: &[Value],
        token: &CancellationToken,
    ) -> Result<QueryResult, QbError> {
        let schema = Schema::infer(&query.from, records);
        let cq = self.compile(query, &schema)?;
        self.scan(cq, records, token).await
    }

    /// Run an already compiled query over records, cooperatively
    pub async fn scan(
        &self,
        cq: CompiledQuery,
        records: &[Value],
        token: &CancellationToken,
    ) -> Result<QueryResult, QbError> {
        let started = Instant::now();
        let mut scan = Scan::new(cq);
        for (i, record) in records.iter().enumerate() {
            if i > 0 && i % self.yield_every == 0 {
                tokio::task::yield_now().await;
                checkpoint(token)?;
            }
            scan.feed(record)?;
        }
        checkpoint(token)?;
        scan.finish(started)
    }

    /// Run a query over records and return its cube; set operations yield
    /// a zero-edge cube holding the projected rows
    pub fn cube(&self, query: &Query, records: &[Value]) -> Result<Cube, QbError> {
        let mut query = query.clone();
        query.format = Some(cubeq_ir::Format::Cube);
        match self.run(&query, records)? {
            QueryResult::Cube(cube) => Ok(cube),
            QueryResult::List(rows) => {
                let mut cube = Cube::new(Vec::new(), vec!["list".to_string()], true);
                cube.set(&[], 0, Value::Array(rows))?;
                Ok(cube)
            }
        }
    }

    /// Run a query over records and flatten it to sorted rows
    pub fn list(&self, query: &Query, records: &[Value]) -> Result<Vec<Value>, QbError> {
        let mut query = query.clone();
        query.format = Some(cubeq_ir::Format::List);
        match self.run(&query, records)? {
            QueryResult::List(rows) => Ok(rows),
            QueryResult::Cube(cube) => {
                let mut row = Map::new();
                for (s, name) in cube.selects().iter().enumerate() {
                    row.insert(name.clone(), cube.get(&[], s).cloned().unwrap_or(Value::Null));
                }
                Ok(vec![Value::Object(row)])
            }
        }
    }
}

/// Cube or list from finalized leaves, per the compiled mode; every
/// domain must already be frozen
pub fn flatten(cq: &CompiledQuery, leaves: Leaves) -> Result<QueryResult, QbError> {
    Ok(match cq.mode {
        QbMode::List => QueryResult::List(list_from_leaves(cq, leaves)?),
        _ => QueryResult::Cube(cube_from_leaves(cq, leaves)?),
    })
}

/// One pass over the rows of a compiled query
struct Scan {
    cq: CompiledQuery,
    tree: Tree,
    /// Projected rows of a set operation, with the source record
    matched: Vec<(Value, Value)>,
}

impl Scan {
    fn new(cq: CompiledQuery) -> Self {
        Self {
            cq,
            tree: Tree::new(),
            matched: Vec::new(),
        }
    }

    fn feed(&mut self, record: &Value) -> Result<(), QbError> {
        if self.cq.mode != QbMode::SetOp {
            return self.tree.add(&mut self.cq, record);
        }
        if !self.cq.accepts(record)? {
            return Ok(());
        }
        let mut row = Map::new();
        for select in &self.cq.selects {
            row.insert(select.name.clone(), select.eval(record)?);
        }
        self.matched.push((Value::Object(row), record.clone()));
        Ok(())
    }

    fn finish(mut self, started: Instant) -> Result<QueryResult, QbError> {
        let mode = self.cq.mode;
        let result = match mode {
            QbMode::SetOp => QueryResult::List(self.project()),
            _ => {
                self.tree.freeze(&mut self.cq)?;
                let leaves = self.tree.into_leaves(&self.cq);
                flatten(&self.cq, leaves)?
            }
        };
        info!(
            fingerprint = %self.cq.fingerprint,
            mode = mode.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Query complete"
        );
        Ok(result)
    }

    fn project(&mut self) -> Vec<Value> {
        project_rows(&self.cq, std::mem::take(&mut self.matched))
    }
}

/// Sort, limit and shape set-operation rows, given as (projected row,
/// source record) pairs. Sort columns not selected are read from the source
/// record; a single unnamed select yields bare values.
pub fn project_rows(cq: &CompiledQuery, mut matched: Vec<(Value, Value)>) -> Vec<Value> {
    let keys = &cq.sort;
    matched.sort_by(|(a, ra), (b, rb)| {
        keys.iter()
            .map(|key| {
                let pick = |row: &Value, record: &Value| match row.get(&key.column) {
                    Some(v) => v.clone(),
                    None => cubeq_expr::lookup_path(record, &key.column),
                };
                crate::sort::compare_column(&pick(a, ra), &pick(b, rb), key.descending)
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some(limit) = cq.limit {
        matched.truncate(limit);
    }
    debug!(rows = matched.len(), "Projected set operation");
    matched
        .into_iter()
        .map(|(row, _)| match (cq.single, row) {
            (true, Value::Object(mut obj)) if obj.len() == 1 => {
                obj.values_mut().next().map(std::mem::take).unwrap_or(Value::Null)
            }
            (_, row) => row,
        })
        .collect()
}
