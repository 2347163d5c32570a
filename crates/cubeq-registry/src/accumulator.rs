//! Fold state of one aggregate over one group

use cubeq_ir::{as_f64, canonical_key, compare_values, millis_to_value, number, to_millis};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

use crate::{AggregateKind, AggregateSpec, Temporal};

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("Aggregate `one` expected a single value but saw {first} and {second}")]
    Conflict { first: Value, second: Value },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Count(u64),
    Sum(Option<f64>),
    Average { total: f64, count: u64 },
    /// Running min/max, or the kept value of `one`/`any`/`last`
    Value(Option<Value>),
    /// Buffered numbers for order statistics
    Numbers(Vec<f64>),
    /// Collected values for array/union/join/count_distinct
    Values(Vec<Value>),
    /// Running moments for variance
    Moments { count: u64, sum: f64, sum_sq: f64 },
}

impl AggregateSpec {
    /// Fresh accumulator for an empty group
    pub fn default_value(&self) -> Accumulator {
        match self.kind {
            AggregateKind::Count => Accumulator::Count(0),
            AggregateKind::Sum => Accumulator::Sum(None),
            AggregateKind::Average => Accumulator::Average { total: 0.0, count: 0 },
            AggregateKind::Percentile => Accumulator::Numbers(Vec::new()),
            AggregateKind::Array
            | AggregateKind::Union
            | AggregateKind::Join
            | AggregateKind::CountDistinct => Accumulator::Values(Vec::new()),
            AggregateKind::Variance | AggregateKind::Stddev => Accumulator::Moments {
                count: 0,
                sum: 0.0,
                sum_sq: 0.0,
            },
            AggregateKind::None
            | AggregateKind::Min
            | AggregateKind::Max
            | AggregateKind::One
            | AggregateKind::Any
            | AggregateKind::Last => Accumulator::Value(None),
        }
    }

    fn numeric(&self, value: &Value) -> Option<f64> {
        match self.temporal {
            Temporal::Time => to_millis(value).map(|ms| ms as f64),
            _ => as_f64(value),
        }
    }

    fn order(&self, a: &Value, b: &Value) -> Ordering {
        match (self.numeric(a), self.numeric(b)) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => compare_values(a, b),
        }
    }

    /// Fold one value into the accumulator; nulls are ignored by every
    /// aggregate
    pub fn add(&self, acc: &mut Accumulator, value: &Value) -> Result<(), AggregateError> {
        if value.is_null() {
            return Ok(());
        }
        match acc {
            Accumulator::Count(n) => *n += 1,
            Accumulator::Sum(total) => {
                if let Some(x) = self.numeric(value) {
                    *total = Some(total.unwrap_or(0.0) + x);
                }
            }
            Accumulator::Average { total, count } => {
                if let Some(x) = self.numeric(value) {
                    *total += x;
                    *count += 1;
                }
            }
            Accumulator::Numbers(buffer) => buffer.extend(self.numeric(value)),
            Accumulator::Values(values) => match value {
                Value::Array(items) => values.extend(items.iter().filter(|v| !v.is_null()).cloned()),
                other => values.push(other.clone()),
            },
            Accumulator::Moments { count, sum, sum_sq } => {
                if let Some(x) = self.numeric(value) {
                    *count += 1;
                    *sum += x;
                    *sum_sq += x * x;
                }
            }
            Accumulator::Value(kept) => match (self.kind, kept.as_ref()) {
                (_, None) => *kept = Some(value.clone()),
                (AggregateKind::Min, Some(current)) => {
                    if self.order(value, current) == Ordering::Less {
                        *kept = Some(value.clone());
                    }
                }
                (AggregateKind::Max, Some(current)) => {
                    if self.order(value, current) == Ordering::Greater {
                        *kept = Some(value.clone());
                    }
                }
                (AggregateKind::One, Some(current)) => {
                    if canonical_key(current) != canonical_key(value) {
                        return Err(AggregateError::Conflict {
                            first: current.clone(),
                            second: value.clone(),
                        });
                    }
                }
                (AggregateKind::Last | AggregateKind::None, Some(_)) => *kept = Some(value.clone()),
                (_, Some(_)) => {}
            },
        }
        Ok(())
    }

    /// Final value of the group; an empty group yields the declared default
    pub fn end(&self, acc: Accumulator) -> Value {
        let out = match acc {
            Accumulator::Count(n) => return Value::from(n),
            Accumulator::Sum(total) => total.map(|t| self.render(t)),
            Accumulator::Average { total, count } => {
                (count > 0).then(|| self.render(total / count as f64))
            }
            Accumulator::Value(kept) => kept,
            Accumulator::Numbers(mut buffer) => {
                buffer.sort_by(f64::total_cmp);
                percentile(&buffer, self.percentile).map(|p| self.render(p))
            }
            Accumulator::Values(values) => self.collect(values),
            Accumulator::Moments { count, sum, sum_sq } => (count > 0).then(|| {
                // population variance, as the backend's statistical facet reports it
                let n = count as f64;
                let variance = (sum_sq / n - (sum / n).powi(2)).max(0.0);
                match self.kind {
                    AggregateKind::Stddev => number(variance.sqrt()),
                    _ => number(variance),
                }
            }),
        };
        match out {
            Some(value) if !value.is_null() => value,
            _ => self.default.clone().unwrap_or(Value::Null),
        }
    }

    fn render(&self, n: f64) -> Value {
        match self.temporal {
            Temporal::Time => millis_to_value(n.round() as i64),
            _ => number(n),
        }
    }

    fn collect(&self, mut values: Vec<Value>) -> Option<Value> {
        if self.kind == AggregateKind::CountDistinct {
            values.sort_by_key(canonical_key);
            values.dedup_by_key(|v| canonical_key(v));
            return Some(Value::from(values.len()));
        }
        if values.is_empty() {
            return None;
        }
        if matches!(self.kind, AggregateKind::Union) {
            let mut seen = std::collections::HashSet::new();
            values.retain(|v| seen.insert(canonical_key(v)));
        }
        if self.sort {
            values.sort_by(|a, b| self.order(a, b));
        }
        Some(match self.kind {
            AggregateKind::Join => Value::String(
                values
                    .iter()
                    .map(canonical_key)
                    .collect::<Vec<_>>()
                    .join(&self.separator),
            ),
            _ => Value::Array(values),
        })
    }
}

/// Linear interpolation between closest ranks of a sorted buffer
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let rank = p * last as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
}
