//! Comparator chains for list output

use cubeq_expr::lookup_path;
use cubeq_ir::{as_f64, compare_values, to_millis, SortSpec};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

pub fn compile_sort(specs: &[SortSpec]) -> Vec<SortKey> {
    specs
        .iter()
        .map(|spec| SortKey {
            column: spec.field().to_string(),
            descending: spec.descending(),
        })
        .collect()
}

/// Order of two column values; nulls sort last in either direction
pub fn compare_column(a: &Value, b: &Value, descending: bool) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    let ord = match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => match (a, b, to_millis(a), to_millis(b)) {
            (Value::String(_), Value::String(_), Some(x), Some(y)) => x.cmp(&y),
            _ => compare_values(a, b),
        },
    };
    if descending {
        ord.reverse()
    } else {
        ord
    }
}

/// Compare two records by the chain, leftmost key first
pub fn compare_records(keys: &[SortKey], a: &Value, b: &Value) -> Ordering {
    keys.iter()
        .map(|key| {
            compare_column(
                &lookup_path(a, &key.column),
                &lookup_path(b, &key.column),
                key.descending,
            )
        })
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}
