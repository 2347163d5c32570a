//! Aggregate registry
//!
//! Every aggregate a select may name is registered here with the behaviour
//! it binds to. Unknown names are rejected when the query is compiled, long
//! before any row is seen.

use cubeq_ir::Select;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

mod accumulator;

pub use accumulator::{Accumulator, AggregateError};

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Unknown aggregate: {0}")]
    UnknownAggregate(String),

    #[error("Percentile for {select} must be within [0, 1], got {value}")]
    BadPercentile { select: String, value: f64 },
}

/// Fold behaviour an aggregate name binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    /// Projection only; no folding
    None,
    Count,
    Sum,
    Average,
    Min,
    Max,
    /// Exactly one distinct non-null value is expected
    One,
    /// First non-null value, conflicts tolerated
    Any,
    Last,
    Percentile,
    Array,
    Union,
    Join,
    CountDistinct,
    Variance,
    Stddev,
}

impl AggregateKind {
    /// Field of a backend statistical facet holding this aggregate, when
    /// the backend can compute it
    pub fn facet_field(self) -> Option<&'static str> {
        match self {
            AggregateKind::Count => Some("count"),
            AggregateKind::Sum => Some("total"),
            AggregateKind::Average => Some("mean"),
            AggregateKind::Min => Some("min"),
            AggregateKind::Max => Some("max"),
            AggregateKind::Variance => Some("variance"),
            AggregateKind::Stddev => Some("std_deviation"),
            _ => None,
        }
    }

    /// Whether the terms-stats facet reports this aggregate per term
    pub fn in_terms_stats(self) -> bool {
        matches!(
            self,
            AggregateKind::Count
                | AggregateKind::Sum
                | AggregateKind::Average
                | AggregateKind::Min
                | AggregateKind::Max
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateSignature {
    pub name: String,
    pub kind: AggregateKind,
    /// Order statistic implied by the name (`median` is 0.5)
    pub percentile: Option<f64>,
}

/// How values of a select column are represented before folding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temporal {
    #[default]
    None,
    /// Timestamps, folded as epoch milliseconds and rendered back as text
    Time,
    /// Durations in milliseconds
    Duration,
}

pub struct AggregateRegistry {
    aggregates: HashMap<String, AggregateSignature>,
    version: String,
}

impl AggregateRegistry {
    pub fn new(version: impl Into<String>) -> Self {
        let mut registry = Self {
            aggregates: HashMap::new(),
            version: version.into(),
        };
        registry.register_builtins();
        registry
    }

    fn register_builtins(&mut self) {
        for (name, kind) in [
            ("none", AggregateKind::None),
            ("count", AggregateKind::Count),
            ("sum", AggregateKind::Sum),
            ("add", AggregateKind::Sum),
            ("average", AggregateKind::Average),
            ("avg", AggregateKind::Average),
            ("mean", AggregateKind::Average),
            ("min", AggregateKind::Min),
            ("minimum", AggregateKind::Min),
            ("max", AggregateKind::Max),
            ("maximum", AggregateKind::Max),
            ("one", AggregateKind::One),
            ("any", AggregateKind::Any),
            ("first", AggregateKind::Any),
            ("last", AggregateKind::Last),
            ("percentile", AggregateKind::Percentile),
            ("array", AggregateKind::Array),
            ("union", AggregateKind::Union),
            ("join", AggregateKind::Join),
            ("count_distinct", AggregateKind::CountDistinct),
            ("variance", AggregateKind::Variance),
            ("stddev", AggregateKind::Stddev),
        ] {
            self.register(AggregateSignature {
                name: name.to_string(),
                kind,
                percentile: None,
            });
        }

        // Order statistics with a fixed rank
        for name in ["median", "middle"] {
            self.register(AggregateSignature {
                name: name.to_string(),
                kind: AggregateKind::Percentile,
                percentile: Some(0.5),
            });
        }
    }

    pub fn register(&mut self, sig: AggregateSignature) {
        self.aggregates.insert(sig.name.clone(), sig);
    }

    pub fn lookup(&self, name: &str) -> Result<&AggregateSignature, RegistryError> {
        self.aggregates
            .get(name)
            .ok_or_else(|| RegistryError::UnknownAggregate(name.to_string()))
    }

    /// Bind a select column to its aggregate behaviour
    pub fn compile(&self, select: &Select, temporal: Temporal) -> Result<AggregateSpec, RegistryError> {
        let sig = self.lookup(select.aggregate_name())?;
        let percentile = select.percentile.or(sig.percentile).unwrap_or(0.5);
        if !(0.0..=1.0).contains(&percentile) {
            return Err(RegistryError::BadPercentile {
                select: select.name(),
                value: percentile,
            });
        }
        Ok(AggregateSpec {
            kind: sig.kind,
            default: select.default.clone(),
            percentile,
            sort: select.sort.unwrap_or(false),
            separator: select.separator.clone().unwrap_or_else(|| ", ".to_string()),
            temporal,
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.aggregates.keys().map(String::as_str)
    }

    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Default for AggregateRegistry {
    fn default() -> Self {
        Self::new("0.1.0")
    }
}

/// A select column's aggregate, with its declared options
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSpec {
    pub kind: AggregateKind,
    /// Replaces the result of an empty group
    pub default: Option<Value>,
    pub percentile: f64,
    pub sort: bool,
    pub separator: String,
    pub temporal: Temporal,
}

impl AggregateSpec {
    pub fn new(kind: AggregateKind) -> Self {
        Self {
            kind,
            default: None,
            percentile: 0.5,
            sort: false,
            separator: ", ".to_string(),
            temporal: Temporal::None,
        }
    }

    /// Value of a group that saw no rows
    pub fn finalize_empty(&self) -> Value {
        self.end(self.default_value())
    }

    /// Value reported by a backend facet, in the same representation the
    /// in-memory fold produces
    pub fn from_backend(&self, raw: &Value) -> Value {
        match (self.kind, self.temporal) {
            (AggregateKind::Count, _) => raw.clone(),
            (AggregateKind::Sum, _) if raw.is_null() => self.finalize_empty(),
            (AggregateKind::Average | AggregateKind::Min | AggregateKind::Max, Temporal::Time) => {
                cubeq_ir::as_f64(raw)
                    .map(|ms| cubeq_ir::millis_to_value(ms.round() as i64))
                    .unwrap_or_else(|| self.finalize_empty())
            }
            _ => match cubeq_ir::as_f64(raw) {
                Some(n) => cubeq_ir::number(n),
                None => self.finalize_empty(),
            },
        }
    }
}
