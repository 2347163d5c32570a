//! cubeq query engine
//!
//! Compiles a [`cubeq_ir::Query`] into selects bound to aggregates and edges
//! bound to fresh domains, then folds records into a tree keyed by
//! provisional partition tuples. Once every domain is frozen the tree is
//! flattened into a dense [`Cube`] or a sorted list.

mod column;
mod cube;
mod error;
mod qb;
mod sort;
mod task;
mod tree;

pub use column::{compile, CompiledEdge, CompiledQuery, CompiledSelect, EdgeValue, QbMode};
pub use cube::{Cube, CubeEdge};
pub use error::{ErrorKind, QbError};
pub use qb::{flatten, project_rows, Qb, QueryResult, DEFAULT_YIELD_EVERY};
pub use sort::{compare_column, compare_records, compile_sort, SortKey};
pub use task::{checkpoint, sleep, TaskScope};
pub use tree::{cube_from_leaves, freeze_domains, list_from_leaves, Leaves, Tree};
