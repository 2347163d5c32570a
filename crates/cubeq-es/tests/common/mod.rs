//! In-memory search backend answering the facet requests cubeq sends

use async_trait::async_trait;
use cubeq_es::{BackendError, SearchBackend};
use cubeq_expr::{lookup_path, FilterEvaluator};
use cubeq_ir::Filter;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct FakeBackend {
    docs: Vec<Value>,
    mapping: Value,
    /// Canned answers served before any real one
    canned: Mutex<VecDeque<Result<Value, BackendError>>>,
    pub searches: AtomicUsize,
    pub mappings: AtomicUsize,
    pub requests: Mutex<Vec<Value>>,
}

impl FakeBackend {
    pub fn new(index: &str, properties: Value, docs: Vec<Value>) -> Self {
        Self {
            docs,
            mapping: json!({index: {"doc": {"properties": properties}}}),
            canned: Mutex::new(VecDeque::new()),
            searches: AtomicUsize::new(0),
            mappings: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self, answer: Result<Value, BackendError>) {
        self.canned.lock().unwrap().push_back(answer);
    }

    pub fn last_request(&self) -> Value {
        self.requests.lock().unwrap().last().cloned().unwrap_or(Value::Null)
    }

    fn matching<'a>(&self, docs: impl Iterator<Item = &'a Value>, filter: &Value) -> Vec<&'a Value> {
        let filter = Filter::from_json(filter).expect("filter");
        let evaluator = FilterEvaluator::new(&filter).expect("evaluator");
        docs.filter(|doc| evaluator.matches(doc)).collect()
    }

    fn facet(&self, docs: &[&Value], facet: &Value) -> Value {
        let docs = match facet.get("facet_filter") {
            Some(filter) => self.matching(docs.iter().copied(), filter),
            None => docs.to_vec(),
        };
        if let Some(filter) = facet.get("filter") {
            let count = self.matching(docs.iter().copied(), filter).len();
            return json!({"_type": "filter", "count": count});
        }
        if let Some(terms) = facet.get("terms") {
            let mut counts: BTreeMap<String, (Value, u64)> = BTreeMap::new();
            let mut missing = 0;
            for doc in &docs {
                let found = keys(doc, terms, "");
                if found.is_empty() {
                    missing += 1;
                }
                for term in found {
                    counts.entry(term.to_string()).or_insert((term, 0)).1 += 1;
                }
            }
            let mut entries: Vec<(Value, u64)> = counts.into_values().collect();
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            let kept = entries.len().min(size_of(terms));
            let other: u64 = entries[kept..].iter().map(|(_, count)| count).sum();
            let terms: Vec<Value> = entries
                .into_iter()
                .take(kept)
                .map(|(term, count)| json!({"term": term, "count": count}))
                .collect();
            return json!({"_type": "terms", "missing": missing, "other": other, "terms": terms});
        }
        if let Some(stats) = facet.get("terms_stats") {
            let mut groups: BTreeMap<String, (Value, u64, Vec<f64>)> = BTreeMap::new();
            for doc in &docs {
                for term in keys(doc, stats, "key_") {
                    let entry = groups.entry(term.to_string()).or_insert((term, 0, Vec::new()));
                    entry.1 += 1;
                    entry.2.extend(numbers(doc, stats, "value_"));
                }
            }
            // Groups without values are left out
            let mut groups: Vec<(Value, u64, Vec<f64>)> =
                groups.into_values().filter(|(_, _, values)| !values.is_empty()).collect();
            groups.sort_by(|a, b| b.1.cmp(&a.1));
            let terms: Vec<Value> = groups
                .into_iter()
                .take(size_of(stats))
                .map(|(term, count, values)| {
                    let mut entry = statistics(&values);
                    entry["term"] = term;
                    entry["count"] = json!(count);
                    entry["total_count"] = json!(values.len());
                    entry
                })
                .collect();
            return json!({"_type": "terms_stats", "terms": terms});
        }
        if let Some(stats) = facet.get("statistical") {
            let values: Vec<f64> = docs.iter().flat_map(|doc| numbers(doc, stats, "")).collect();
            let mut out = statistics(&values);
            out["_type"] = json!("statistical");
            return out;
        }
        panic!("unexpected facet {facet}");
    }
}

#[async_trait]
impl SearchBackend for FakeBackend {
    async fn search(&self, _index: &str, body: &Value) -> Result<Value, BackendError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(body.clone());
        if let Some(answer) = self.canned.lock().unwrap().pop_front() {
            return answer;
        }

        let filter = body["query"]["filtered"]["filter"].clone();
        let filter = if filter.is_null() { json!({"match_all": {}}) } else { filter };
        let docs = self.matching(self.docs.iter(), &filter);

        let mut facets = Map::new();
        if let Some(requested) = body.get("facets").and_then(Value::as_object) {
            for (name, facet) in requested {
                facets.insert(name.clone(), self.facet(&docs, facet));
            }
        }
        let size = body["size"].as_u64().unwrap_or(10) as usize;
        let hits: Vec<Value> = docs.iter().take(size).map(|doc| json!({"_source": doc})).collect();
        Ok(json!({
            "_shards": {"total": 1, "successful": 1, "failed": 0},
            "hits": {"total": docs.len(), "hits": hits},
            "facets": facets
        }))
    }

    async fn mapping(&self, _index: &str) -> Result<Value, BackendError> {
        self.mappings.fetch_add(1, Ordering::SeqCst);
        Ok(self.mapping.clone())
    }
}

/// Values a facet groups `doc` under: a field's values, or the packed term
/// its script computes
fn keys(doc: &Value, facet: &Value, prefix: &str) -> Vec<Value> {
    if let Some(field) = facet[format!("{prefix}field")].as_str() {
        return match lookup_path(doc, field) {
            Value::Null => Vec::new(),
            Value::Array(values) => values,
            value => vec![value],
        };
    }
    let script = facet[format!("{prefix}script")]
        .as_str()
        .or_else(|| facet["script_field"].as_str())
        .expect("facet key");
    vec![Value::String(packed_term(script, doc))]
}

/// Terms a facet asks for; 10 when it does not say
fn size_of(facet: &Value) -> usize {
    facet["size"].as_u64().unwrap_or(10) as usize
}

fn numbers(doc: &Value, facet: &Value, prefix: &str) -> Vec<f64> {
    let field = facet[format!("{prefix}field")].as_str().expect("value field");
    match lookup_path(doc, field) {
        Value::Array(values) => values.iter().filter_map(Value::as_f64).collect(),
        value => value.as_f64().into_iter().collect(),
    }
}

fn statistics(values: &[f64]) -> Value {
    if values.is_empty() {
        return json!({"count": 0, "total": 0.0, "min": 0.0, "max": 0.0, "mean": 0.0});
    }
    let total: f64 = values.iter().sum();
    let n = values.len() as f64;
    let mean = total / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    json!({
        "count": values.len(),
        "total": total,
        "min": values.iter().cloned().fold(f64::INFINITY, f64::min),
        "max": values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        "mean": mean,
        "variance": variance,
        "std_deviation": variance.sqrt()
    })
}

/// Evaluate a packed-term script of the form
/// `Value2Pipe(getDocValue("f")) + "|" + Value2Pipe(floorInterval(getDocValue("g"), w))`
fn packed_term(script: &str, doc: &Value) -> String {
    let body = script.lines().last().unwrap_or_default();
    body.split(" + \"|\" + ")
        .map(|part| {
            let inner = part
                .trim()
                .strip_prefix("Value2Pipe(")
                .and_then(|p| p.strip_suffix(')'))
                .expect("packed part");
            let (inner, width) = match inner.strip_prefix("floorInterval(") {
                Some(rest) => {
                    let (field, width) = rest.strip_suffix(')').and_then(|r| r.rsplit_once(", ")).expect("floor");
                    (field, Some(width.parse::<f64>().expect("width")))
                }
                None => (inner, None),
            };
            let field = inner
                .strip_prefix("getDocValue(\"")
                .and_then(|f| f.strip_suffix("\")"))
                .expect("field read");
            let value = lookup_path(doc, field);
            let value = match (width, value.as_f64()) {
                (Some(w), Some(x)) => json!(((x / w).floor() * w) as i64),
                (Some(_), None) => Value::Null,
                (None, _) => value,
            };
            pipe(&value)
        })
        .collect::<Vec<_>>()
        .join("|")
}

fn pipe(value: &Value) -> String {
    match value {
        Value::Null => "\\0".to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(x) if x.fract() == 0.0 => (x as i64).to_string(),
            _ => n.to_string(),
        },
        Value::String(s) => s.replace('\\', "\\\\").replace('|', "\\p"),
        other => other.to_string(),
    }
}
