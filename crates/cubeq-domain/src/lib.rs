//! Domain algebra
//!
//! A domain is the partition space an edge's values map into. Domains have
//! two phases. While rows are scanned, `get_part_by_key` hands out
//! provisional [`PartKey`]s and open-ended domains grow. `freeze` then sorts
//! the partitions and assigns the dense `dataIndex` used to address cube
//! cells; `data_index` refuses to answer before that.

use cubeq_expr::{FilterEvaluator, Interval, ParseError};
use cubeq_ir::{
    as_f64, canonical_key, compare_values, format_number, from_millis, to_millis, DomainDecl,
    Filter, FilterError, KeyDecl, RangeBounds,
};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

mod bucket;
mod key;
mod partition;

pub use bucket::Bucketing;
pub use key::{generic_key, KeyFn};
pub use partition::{flatten, Partition};

/// Upper bound on materialised buckets, against runaway growth
pub const MAX_PARTITIONS: i64 = 100_000;

const DAY_MILLIS: i64 = 86_400_000;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Unknown domain type: {0}")]
    UnknownDomainType(String),

    #[error("Domain of {0} needs declared partitions")]
    MissingPartitions(String),

    #[error("Domain of {0} needs an interval")]
    MissingInterval(String),

    #[error("Invalid interval for {domain}: {interval}")]
    BadInterval { domain: String, interval: Value },

    #[error("Invalid bound for {domain}: {value}")]
    BadBound { domain: String, value: Value },

    #[error("Domains of {edge} do not match: {reason}")]
    Mismatch { edge: String, reason: String },

    #[error("Domain of {0} is still growing; freeze it before reading cube indices")]
    NotFrozen(String),

    #[error("Range on {0} has no upper end and the domain declares no max")]
    RangeNeedsBoundedDomain(String),

    #[error("Domain of {domain} would need {count} partitions")]
    TooManyPartitions { domain: String, count: i64 },

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Script(#[from] ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainKind {
    /// Values used as-is, discovered from data
    Value,
    /// Discrete values discovered from data
    Default,
    /// Declared discrete partitions
    Set,
    Time,
    Duration,
    Numeric,
    /// Numeric with `min = 0`, `interval = 1`
    Count,
}

impl FromStr for DomainKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "value" => DomainKind::Value,
            "default" => DomainKind::Default,
            "set" => DomainKind::Set,
            "time" => DomainKind::Time,
            "duration" => DomainKind::Duration,
            "numeric" => DomainKind::Numeric,
            "count" => DomainKind::Count,
            other => return Err(DomainError::UnknownDomainType(other.to_string())),
        })
    }
}

impl DomainKind {
    pub fn name(self) -> &'static str {
        match self {
            DomainKind::Value => "value",
            DomainKind::Default => "default",
            DomainKind::Set => "set",
            DomainKind::Time => "time",
            DomainKind::Duration => "duration",
            DomainKind::Numeric => "numeric",
            DomainKind::Count => "count",
        }
    }

    pub fn is_bucketed(self) -> bool {
        matches!(
            self,
            DomainKind::Time | DomainKind::Duration | DomainKind::Numeric | DomainKind::Count
        )
    }
}

/// Provisional partition key handed out while a domain may still grow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartKey {
    /// Position in the partition list (set and discovered domains)
    Index(usize),
    /// Bucket number relative to the domain origin
    Bucket(i64),
    Null,
}

#[derive(Debug, Clone)]
pub struct Domain {
    kind: DomainKind,
    /// Edge the domain belongs to
    name: String,
    key: Option<KeyDecl>,
    key_fn: OnceLock<KeyFn>,
    partitions: Vec<Partition>,
    lookup: HashMap<String, usize>,
    matchers: Vec<Option<FilterEvaluator>>,
    /// Partition positions in `dataIndex` order
    order: Vec<usize>,
    bucketing: Option<Bucketing>,
    min: Option<f64>,
    max: Option<f64>,
    low: Option<i64>,
    high: Option<i64>,
    format: Option<String>,
    allow_nulls: bool,
    null: Partition,
    frozen: bool,
    overflow: u64,
}

impl Domain {
    fn empty(kind: DomainKind, name: &str, allow_nulls: bool) -> Self {
        Self {
            kind,
            name: name.to_string(),
            key: None,
            key_fn: OnceLock::new(),
            partitions: Vec::new(),
            lookup: HashMap::new(),
            matchers: Vec::new(),
            order: Vec::new(),
            bucketing: None,
            min: None,
            max: None,
            low: None,
            high: None,
            format: None,
            allow_nulls,
            null: Partition::null(),
            frozen: false,
            overflow: 0,
        }
    }

    /// Domain for edge `name`; an undeclared domain is `default`
    pub fn from_decl(name: &str, decl: Option<&DomainDecl>, allow_nulls: bool) -> Result<Self, DomainError> {
        let Some(decl) = decl else {
            return Ok(Self::default_for(name, allow_nulls));
        };
        let kind: DomainKind = decl.kind.parse()?;
        let mut domain = Self::empty(kind, name, allow_nulls);
        domain.key = decl.key.clone();
        domain.format = decl.format.clone();

        match kind {
            DomainKind::Set | DomainKind::Default | DomainKind::Value => {
                let declared = match (&decl.partitions, kind) {
                    (Some(parts), _) => flatten(parts)?,
                    (None, DomainKind::Set) => return Err(DomainError::MissingPartitions(name.to_string())),
                    (None, _) => Vec::new(),
                };
                for part in declared {
                    domain.insert_declared(part)?;
                }
            }
            DomainKind::Time => {
                let interval = decl
                    .interval
                    .as_ref()
                    .ok_or_else(|| DomainError::MissingInterval(name.to_string()))?;
                let interval = Interval::parse(interval).ok_or_else(|| DomainError::BadInterval {
                    domain: name.to_string(),
                    interval: interval.clone(),
                })?;
                domain.min = domain.bound(decl.min.as_ref())?;
                domain.max = domain.bound(decl.max.as_ref())?;
                let origin = domain.min.map(|m| interval.floor(m as i64)).unwrap_or(0);
                domain.bucketing = Some(Bucketing::Calendar { origin, interval });
            }
            DomainKind::Duration => {
                let interval = decl
                    .interval
                    .as_ref()
                    .ok_or_else(|| DomainError::MissingInterval(name.to_string()))?;
                let interval = match Interval::parse(interval) {
                    Some(fixed @ Interval::Millis(_)) => fixed,
                    _ => {
                        return Err(DomainError::BadInterval {
                            domain: name.to_string(),
                            interval: interval.clone(),
                        })
                    }
                };
                domain.min = domain.bound(decl.min.as_ref())?;
                domain.max = domain.bound(decl.max.as_ref())?;
                let origin = domain.min.map(|m| m as i64).unwrap_or(0);
                domain.bucketing = Some(Bucketing::Calendar { origin, interval });
            }
            DomainKind::Numeric | DomainKind::Count => {
                let width = match (&decl.interval, kind) {
                    (Some(interval), _) => as_f64(interval).filter(|w| *w > 0.0).ok_or_else(|| {
                        DomainError::BadInterval {
                            domain: name.to_string(),
                            interval: interval.clone(),
                        }
                    })?,
                    (None, DomainKind::Count) => 1.0,
                    (None, _) => return Err(DomainError::MissingInterval(name.to_string())),
                };
                domain.min = domain.bound(decl.min.as_ref())?;
                if kind == DomainKind::Count && domain.min.is_none() {
                    domain.min = Some(0.0);
                }
                domain.max = domain.bound(decl.max.as_ref())?;
                let origin = domain.min.unwrap_or(0.0);
                domain.bucketing = Some(Bucketing::Numeric { origin, width });
            }
        }
        Ok(domain)
    }

    /// Discovered-values domain, for edges without a declaration
    pub fn default_for(name: &str, allow_nulls: bool) -> Self {
        Self::empty(DomainKind::Default, name, allow_nulls)
    }

    /// Set domain over already-discovered values, in the given order
    pub fn from_values(name: &str, values: Vec<Value>, allow_nulls: bool) -> Result<Self, DomainError> {
        let mut domain = Self::empty(DomainKind::Set, name, allow_nulls);
        for value in values {
            domain.insert_declared(Partition::new(canonical_key(&value), value))?;
        }
        Ok(domain)
    }

    fn insert_declared(&mut self, part: Partition) -> Result<(), DomainError> {
        let key = generic_key(self.key.as_ref(), &part.value).unwrap_or_else(|| part.name.clone());
        if self.lookup.contains_key(&key) && part.esfilter.is_none() {
            return Ok(());
        }
        let matcher = part.esfilter.as_ref().map(FilterEvaluator::new).transpose()?;
        self.lookup.entry(key).or_insert(self.partitions.len());
        self.matchers.push(matcher);
        self.partitions.push(part);
        Ok(())
    }

    fn bound(&self, value: Option<&Value>) -> Result<Option<f64>, DomainError> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => self.numeric(v).map(Some).ok_or_else(|| DomainError::BadBound {
                domain: self.name.clone(),
                value: v.clone(),
            }),
        }
    }

    /// Numeric form of a value in a bucketed domain
    fn numeric(&self, value: &Value) -> Option<f64> {
        match self.kind {
            DomainKind::Time => to_millis(value).map(|ms| ms as f64),
            DomainKind::Duration => as_f64(value).or_else(|| match value {
                Value::String(s) => match Interval::parse_str(s) {
                    Some(Interval::Millis(ms)) => Some(ms as f64),
                    _ => None,
                },
                _ => None,
            }),
            _ => as_f64(value),
        }
    }

    pub fn kind(&self) -> DomainKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> Option<&KeyDecl> {
        self.key.as_ref()
    }

    pub fn allow_nulls(&self) -> bool {
        self.allow_nulls
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Values rejected for falling outside the domain
    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    pub fn bucketing(&self) -> Option<Bucketing> {
        self.bucketing
    }

    /// Partition count is known before any data is seen
    pub fn is_faceted(&self) -> bool {
        match self.kind {
            DomainKind::Set => true,
            DomainKind::Value | DomainKind::Default => false,
            _ => self.min.is_some() && self.max.is_some(),
        }
    }

    /// Partitions select rows by their own filters rather than by value
    pub fn has_partition_filters(&self) -> bool {
        self.kind == DomainKind::Set && !self.matchers.is_empty() && self.matchers.iter().all(Option::is_some)
    }

    fn key_of(&self, value: &Value) -> Option<String> {
        let key_fn = self
            .key_fn
            .get_or_init(|| KeyFn::specialize(self.key.as_ref(), value));
        key_fn.apply(self.key.as_ref(), value)
    }

    /// Map a raw value to its provisional partition, growing the domain if
    /// it is open-ended
    pub fn get_part_by_key(&mut self, value: &Value) -> PartKey {
        if value.is_null() {
            return PartKey::Null;
        }
        match self.kind {
            DomainKind::Set => match self.key_of(value).and_then(|k| self.lookup.get(&k).copied()) {
                Some(i) => PartKey::Index(i),
                None => self.reject(),
            },
            DomainKind::Default | DomainKind::Value => {
                let Some(key) = self.key_of(value) else {
                    return PartKey::Null;
                };
                if let Some(&i) = self.lookup.get(&key) {
                    return PartKey::Index(i);
                }
                if self.frozen {
                    return self.reject();
                }
                let i = self.partitions.len();
                self.partitions.push(Partition::new(key.clone(), value.clone()));
                self.matchers.push(None);
                self.lookup.insert(key, i);
                PartKey::Index(i)
            }
            _ => {
                let Some(x) = self.numeric(value) else {
                    return self.reject();
                };
                if self.min.map(|m| x < m).unwrap_or(false) || self.max.map(|m| x >= m).unwrap_or(false) {
                    return self.reject();
                }
                let Some(bucketing) = self.bucketing else {
                    return PartKey::Null;
                };
                let index = bucketing.index(x);
                if self.frozen {
                    return match (self.low, self.high) {
                        (Some(low), Some(high)) if (low..=high).contains(&index) => PartKey::Bucket(index),
                        _ => self.reject(),
                    };
                }
                self.grow(index);
                PartKey::Bucket(index)
            }
        }
    }

    fn reject(&mut self) -> PartKey {
        self.overflow += 1;
        PartKey::Null
    }

    fn grow(&mut self, index: i64) {
        self.low = Some(self.low.map_or(index, |low| low.min(index)));
        self.high = Some(self.high.map_or(index, |high| high.max(index)));
    }

    /// Set partitions whose own filter accepts `record`
    pub fn matching_parts(&self, record: &Value) -> Vec<PartKey> {
        self.matchers
            .iter()
            .enumerate()
            .filter(|(_, m)| m.as_ref().map(|m| m.matches(record)).unwrap_or(false))
            .map(|(i, _)| PartKey::Index(i))
            .collect()
    }

    /// Every partition overlapping `[min, max)`; a null `max` extends to the
    /// domain's declared upper bound
    pub fn parts_in_range(&mut self, min: &Value, max: &Value) -> Result<Vec<PartKey>, DomainError> {
        if !self.kind.is_bucketed() {
            return Ok(self
                .partitions
                .iter()
                .enumerate()
                .filter(|(_, p)| {
                    loose_order(&p.value, min) != Ordering::Less
                        && (max.is_null() || loose_order(&p.value, max) == Ordering::Less)
                })
                .map(|(i, _)| PartKey::Index(i))
                .collect());
        }

        let Some(lo) = self.numeric(min) else {
            return Ok(Vec::new());
        };
        let hi = match self.numeric(max) {
            Some(hi) => hi,
            None => self
                .max
                .ok_or_else(|| DomainError::RangeNeedsBoundedDomain(self.name.clone()))?,
        };
        let lo = self.min.map_or(lo, |m| lo.max(m));
        let hi = self.max.map_or(hi, |m| hi.min(m));
        let Some(bucketing) = self.bucketing else {
            return Ok(Vec::new());
        };
        if hi <= lo {
            return Ok(Vec::new());
        }

        let first = bucketing.index(lo);
        let mut last = bucketing.index(hi);
        if bucketing.min(last) >= hi {
            last -= 1;
        }
        let (first, last) = match (self.frozen, self.low, self.high) {
            (true, Some(low), Some(high)) => (first.max(low), last.min(high)),
            (true, _, _) => return Ok(Vec::new()),
            (false, _, _) => (first, last),
        };
        if last < first {
            return Ok(Vec::new());
        }
        if last - first > MAX_PARTITIONS {
            return Err(DomainError::TooManyPartitions {
                domain: self.name.clone(),
                count: last - first + 1,
            });
        }
        if !self.frozen {
            self.grow(first);
            self.grow(last);
        }
        Ok((first..=last).map(PartKey::Bucket).collect())
    }

    /// Sort partitions and assign dense `dataIndex`; NULL takes the index
    /// after the last partition when nulls are allowed
    pub fn freeze(&mut self) -> Result<(), DomainError> {
        match self.kind {
            DomainKind::Set => {
                self.order = (0..self.partitions.len()).collect();
            }
            DomainKind::Default | DomainKind::Value => {
                let mut order: Vec<usize> = (0..self.partitions.len()).collect();
                order.sort_by(|&a, &b| compare_values(&self.partitions[a].value, &self.partitions[b].value));
                self.order = order;
            }
            _ => self.materialize()?,
        }
        for (data_index, &pos) in self.order.iter().enumerate() {
            self.partitions[pos].data_index = Some(data_index);
        }
        self.null.data_index = self.allow_nulls.then_some(self.partitions.len());
        self.frozen = true;
        debug!(
            edge = %self.name,
            kind = self.kind.name(),
            partitions = self.partitions.len(),
            "Domain frozen"
        );
        Ok(())
    }

    fn materialize(&mut self) -> Result<(), DomainError> {
        let Some(bucketing) = self.bucketing else {
            return Ok(());
        };
        let mut low = self.low;
        let mut high = self.high;
        if let Some(min) = self.min {
            let index = bucketing.index(min);
            low = Some(low.map_or(index, |l| l.min(index)));
            high = Some(high.map_or(index, |h| h.max(index)));
        }
        if let Some(max) = self.max {
            let mut index = bucketing.index(max);
            if bucketing.min(index) >= max {
                index -= 1;
            }
            low = Some(low.map_or(index, |l| l.min(index)));
            high = Some(high.map_or(index, |h| h.max(index)));
        }
        let (Some(low), Some(high)) = (low, high) else {
            self.partitions.clear();
            self.order.clear();
            return Ok(());
        };
        if high - low >= MAX_PARTITIONS {
            return Err(DomainError::TooManyPartitions {
                domain: self.name.clone(),
                count: high - low + 1,
            });
        }

        self.partitions = (low..=high).map(|index| self.bucket(index)).collect();
        self.matchers = vec![None; self.partitions.len()];
        self.order = (0..self.partitions.len()).collect();
        self.low = Some(low);
        self.high = Some(high);
        Ok(())
    }

    fn bucket(&self, index: i64) -> Partition {
        let (min, max) = match self.bucketing {
            Some(b) => (b.min(index), b.max(index)),
            None => (f64::NAN, f64::NAN),
        };
        let mut part = Partition::new("", cubeq_ir::number(min));
        part.min = Some(cubeq_ir::number(min));
        part.max = Some(cubeq_ir::number(max));
        part.name = self.label(&part);
        part
    }

    /// Cube address of a provisional key; `None` when the key has no cell
    pub fn data_index(&self, key: &PartKey) -> Result<Option<usize>, DomainError> {
        if !self.frozen {
            return Err(DomainError::NotFrozen(self.name.clone()));
        }
        Ok(match *key {
            PartKey::Null => self.null.data_index,
            PartKey::Index(i) => self.partitions.get(i).and_then(|p| p.data_index),
            PartKey::Bucket(b) => match self.low {
                Some(low) if self.kind.is_bucketed() => usize::try_from(b - low)
                    .ok()
                    .and_then(|i| self.partitions.get(i))
                    .and_then(|p| p.data_index),
                _ => None,
            },
        })
    }

    /// Partition for a provisional key
    pub fn partition(&self, key: &PartKey) -> Partition {
        match *key {
            PartKey::Null => self.null.clone(),
            PartKey::Index(i) => self.partitions.get(i).cloned().unwrap_or_else(|| self.null.clone()),
            PartKey::Bucket(b) => {
                let stored = self
                    .low
                    .filter(|_| self.frozen)
                    .and_then(|low| usize::try_from(b - low).ok())
                    .and_then(|i| self.partitions.get(i));
                match stored {
                    Some(part) => part.clone(),
                    None => self.bucket(b),
                }
            }
        }
    }

    /// Partitions in `dataIndex` order
    pub fn partitions(&self) -> Vec<&Partition> {
        if self.frozen {
            self.order.iter().map(|&i| &self.partitions[i]).collect()
        } else {
            self.partitions.iter().collect()
        }
    }

    /// Provisional keys of the stored partitions, in `dataIndex` order once
    /// frozen
    pub fn part_keys(&self) -> Vec<PartKey> {
        if self.kind.is_bucketed() {
            return match self.low {
                Some(low) => (0..self.partitions.len() as i64).map(|i| PartKey::Bucket(low + i)).collect(),
                None => Vec::new(),
            };
        }
        if self.frozen {
            self.order.iter().map(|&i| PartKey::Index(i)).collect()
        } else {
            (0..self.partitions.len()).map(PartKey::Index).collect()
        }
    }

    /// Partition at a cube address, NULL included
    pub fn partition_at(&self, data_index: usize) -> Option<&Partition> {
        match self.order.get(data_index) {
            Some(&pos) => self.partitions.get(pos),
            None if self.null.data_index == Some(data_index) => Some(&self.null),
            None => None,
        }
    }

    pub fn null_partition(&self) -> &Partition {
        &self.null
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Size of this edge's cube dimension
    pub fn cube_size(&self) -> usize {
        self.partitions.len() + usize::from(self.allow_nulls)
    }

    /// Canonical key of a partition; feeding it back to `get_part_by_key`
    /// lands on the same partition
    pub fn get_key(&self, part: &Partition) -> Value {
        match self.kind {
            DomainKind::Set | DomainKind::Default | DomainKind::Value => match &part.value {
                // filter-only partitions are known by name
                Value::Null if !part.is_null() => Value::String(part.name.clone()),
                value => value.clone(),
            },
            _ => part.min.clone().unwrap_or(Value::Null),
        }
    }

    /// Value a partition represents in list output
    pub fn end(&self, part: &Partition) -> Value {
        self.get_key(part)
    }

    pub fn compare(&self, a: &Partition, b: &Partition) -> Ordering {
        match (a.is_null(), b.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
        match (a.data_index, b.data_index) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => loose_order(&self.get_key(a), &self.get_key(b)),
        }
    }

    pub fn label(&self, part: &Partition) -> String {
        if part.is_null() {
            return part.name.clone();
        }
        let min = part.min.as_ref().and_then(as_f64);
        match (self.kind, min) {
            (DomainKind::Time, Some(ms)) => {
                let interval = self.bucketing.and_then(|b| b.interval());
                let fine = interval.map(|i| i.approx_millis() < DAY_MILLIS).unwrap_or(false);
                let default_format = if fine { "%Y-%m-%d %H:%M:%S" } else { "%Y-%m-%d" };
                let format = self.format.as_deref().unwrap_or(default_format);
                match from_millis(ms as i64) {
                    Some(t) => t.format(format).to_string(),
                    None => format_number(ms),
                }
            }
            (DomainKind::Duration, Some(ms)) => match self.bucketing.and_then(|b| b.interval()) {
                Some(interval) => interval.describe(ms as i64),
                None => format_number(ms),
            },
            (DomainKind::Numeric | DomainKind::Count, Some(n)) => format_number(n),
            _ => part.name.clone(),
        }
    }

    /// Backend condition selecting `part`, given the field the edge reads
    pub fn esfilter(&self, part: &Partition, field: Option<&str>) -> Option<Filter> {
        if let Some(filter) = &part.esfilter {
            return Some(filter.clone());
        }
        let field = field?;
        if self.kind.is_bucketed() {
            let (min, max) = (part.min.clone()?, part.max.clone()?);
            return Some(Filter::range(field, RangeBounds::half_open(min, max)));
        }
        match (&part.value, &self.key) {
            (Value::Object(obj), Some(key)) => Some(Filter::and(
                key.fields()
                    .into_iter()
                    .map(|f| Filter::term(f, obj.get(f).cloned().unwrap_or(Value::Null))),
            )),
            (Value::Null, _) => None,
            (value, _) => Some(Filter::term(field, value.clone())),
        }
    }

    /// Condition selecting rows that fall in no partition
    pub fn null_esfilter(&self, field: Option<&str>) -> Option<Filter> {
        let parts = self
            .partitions
            .iter()
            .map(|p| self.esfilter(p, field))
            .collect::<Option<Vec<_>>>()?;
        Some(Filter::negate(Filter::or(parts)))
    }

    /// Check two frozen domains address the same cells
    pub fn equals(&self, other: &Domain) -> Result<(), DomainError> {
        let mismatch = |reason: String| DomainError::Mismatch {
            edge: self.name.clone(),
            reason,
        };
        if self.kind != other.kind {
            return Err(mismatch(format!("{} vs {}", self.kind.name(), other.kind.name())));
        }
        if self.cube_size() != other.cube_size() {
            return Err(mismatch(format!(
                "{} vs {} partitions",
                self.cube_size(),
                other.cube_size()
            )));
        }
        for (a, b) in self.partitions().into_iter().zip(other.partitions()) {
            let (ka, kb) = (canonical_key(&self.get_key(a)), canonical_key(&other.get_key(b)));
            if ka != kb {
                return Err(mismatch(format!("partition {ka} vs {kb}")));
            }
        }
        Ok(())
    }
}

fn loose_order(a: &Value, b: &Value) -> Ordering {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.total_cmp(&y);
    }
    if let (Some(x), Some(y)) = (to_millis(a), to_millis(b)) {
        return x.cmp(&y);
    }
    compare_values(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decl(value: Value) -> DomainDecl {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Domain::from_decl("x", Some(&decl(json!({"type": "fuzzy"}))), false).unwrap_err();
        assert!(matches!(err, DomainError::UnknownDomainType(t) if t == "fuzzy"));
    }

    #[test]
    fn test_required_parts() {
        let set = Domain::from_decl("x", Some(&decl(json!({"type": "set"}))), false);
        assert!(matches!(set, Err(DomainError::MissingPartitions(_))));
        let time = Domain::from_decl("x", Some(&decl(json!({"type": "time"}))), false);
        assert!(matches!(time, Err(DomainError::MissingInterval(_))));
        let count = Domain::from_decl("x", Some(&decl(json!({"type": "count"}))), false).unwrap();
        assert_eq!(count.bucketing(), Some(Bucketing::Numeric { origin: 0.0, width: 1.0 }));
    }

    #[test]
    fn test_set_domain_with_nulls() {
        let mut domain = Domain::from_decl("c", Some(&decl(json!({"type": "set", "partitions": ["a"]}))), true).unwrap();
        let a = domain.get_part_by_key(&json!("a"));
        let b = domain.get_part_by_key(&json!("b"));
        assert_eq!(a, PartKey::Index(0));
        assert_eq!(b, PartKey::Null);
        assert_eq!(domain.overflow(), 1);

        assert!(matches!(domain.data_index(&a), Err(DomainError::NotFrozen(_))));
        domain.freeze().unwrap();
        assert_eq!(domain.data_index(&a).unwrap(), Some(0));
        assert_eq!(domain.data_index(&b).unwrap(), Some(1));
        assert_eq!(domain.cube_size(), 2);
    }

    #[test]
    fn test_default_domain_sorted_at_freeze() {
        let mut domain = Domain::default_for("c", false);
        let keys: Vec<PartKey> = ["b", "a", "c", "a"].iter().map(|v| domain.get_part_by_key(&json!(v))).collect();
        assert_eq!(keys[1], keys[3]);
        domain.freeze().unwrap();

        let names: Vec<&str> = domain.partitions().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(domain.data_index(&keys[0]).unwrap(), Some(1));
        assert_eq!(domain.data_index(&PartKey::Null).unwrap(), None);
    }

    #[test]
    fn test_part_keys_follow_data_index() {
        let mut domain = Domain::default_for("c", false);
        for v in ["b", "a"] {
            domain.get_part_by_key(&json!(v));
        }
        domain.freeze().unwrap();
        assert_eq!(domain.part_keys(), vec![PartKey::Index(1), PartKey::Index(0)]);

        let mut numeric = Domain::from_decl(
            "n",
            Some(&decl(json!({"type": "numeric", "min": 10, "max": 40, "interval": 10}))),
            false,
        )
        .unwrap();
        numeric.freeze().unwrap();
        let keys = numeric.part_keys();
        assert_eq!(keys, vec![PartKey::Bucket(0), PartKey::Bucket(1), PartKey::Bucket(2)]);
        assert_eq!(numeric.data_index(&keys[2]).unwrap(), Some(2));
    }

    #[test]
    fn test_numbers_and_numeric_strings_share_a_partition() {
        let mut domain = Domain::default_for("n", false);
        assert_eq!(domain.get_part_by_key(&json!(1)), domain.get_part_by_key(&json!("1")));
    }

    #[test]
    fn test_time_domain_grows_contiguously() {
        let mut domain = Domain::from_decl("t", Some(&decl(json!({"type": "time", "interval": "day"}))), false).unwrap();
        domain.get_part_by_key(&json!("2024-01-05T10:00:00Z"));
        domain.get_part_by_key(&json!("2024-01-02T23:00:00Z"));
        domain.freeze().unwrap();

        let labels: Vec<String> = domain.partitions().iter().map(|p| domain.label(p)).collect();
        assert_eq!(labels, vec!["2024-01-02", "2024-01-03", "2024-01-04", "2024-01-05"]);
    }

    #[test]
    fn test_declared_bounds_overflow() {
        let mut domain = Domain::from_decl(
            "n",
            Some(&decl(json!({"type": "numeric", "min": 0, "max": 30, "interval": 10}))),
            false,
        )
        .unwrap();
        assert!(domain.is_faceted());
        assert_eq!(domain.get_part_by_key(&json!(35)), PartKey::Null);
        assert_eq!(domain.get_part_by_key(&json!(-1)), PartKey::Null);
        assert_eq!(domain.get_part_by_key(&json!(12)), PartKey::Bucket(1));
        assert_eq!(domain.overflow(), 2);

        domain.freeze().unwrap();
        assert_eq!(domain.len(), 3);
        let part = domain.partition(&PartKey::Bucket(1));
        assert_eq!(domain.label(&part), "10");
        assert_eq!(domain.end(&part), json!(10));
        assert_eq!(
            domain.esfilter(&part, Some("n")),
            Some(Filter::range("n", RangeBounds::half_open(json!(10), json!(20))))
        );
    }

    #[test]
    fn test_duration_labels() {
        let mut domain = Domain::from_decl("d", Some(&decl(json!({"type": "duration", "interval": "hour"}))), false).unwrap();
        let key = domain.get_part_by_key(&json!(2 * 3_600_000 + 5));
        domain.freeze().unwrap();
        assert_eq!(domain.label(&domain.partition(&key)), "2 hours");
    }

    #[test]
    fn test_ranged_buckets() {
        let mut domain = Domain::from_decl("t", Some(&decl(json!({"type": "time", "interval": "day"}))), false).unwrap();
        let keys = domain
            .parts_in_range(&json!("2024-01-01T12:00:00Z"), &json!("2024-01-03"))
            .unwrap();
        assert_eq!(keys.len(), 2);
        let err = domain.parts_in_range(&json!("2024-01-01"), &Value::Null).unwrap_err();
        assert!(matches!(err, DomainError::RangeNeedsBoundedDomain(_)));
    }

    #[test]
    fn test_filter_partitions_and_merge_check() {
        let decl = decl(json!({"type": "set", "partitions": [
            {"name": "small", "esfilter": {"range": {"n": {"lt": 3}}}},
            {"name": "odd", "esfilter": {"script": "n % 2 == 1"}}
        ]}));
        let mut domain = Domain::from_decl("kind", Some(&decl), false).unwrap();
        assert!(domain.has_partition_filters());
        assert_eq!(domain.matching_parts(&json!({"n": 1})), vec![PartKey::Index(0), PartKey::Index(1)]);
        assert_eq!(domain.matching_parts(&json!({"n": 4})), Vec::<PartKey>::new());

        domain.freeze().unwrap();
        let mut other = Domain::from_decl("kind", Some(&decl), false).unwrap();
        other.freeze().unwrap();
        assert!(domain.equals(&other).is_ok());

        let mut smaller = Domain::from_values("kind", vec![json!("small")], false).unwrap();
        smaller.freeze().unwrap();
        assert!(matches!(domain.equals(&smaller), Err(DomainError::Mismatch { .. })));
    }
}
