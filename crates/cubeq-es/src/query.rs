//! Running queries against a search backend

use cubeq_domain::PartKey;
use cubeq_engine::{project_rows, CompiledQuery, Qb, QueryResult, TaskScope};
use cubeq_ir::{Filter, Query, Schema};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::SearchBackend;
use crate::decode::{check_complete, count_of, decode, term_text, Decoder};
use crate::mode::{select_mode, EsMode};
use crate::request::{build_plan, facet_body, query_filter, scan_filter, FacetKind};
use crate::retry::{search_with_retry, with_retry, RetryPolicy};
use crate::schema::{from_mapping, SchemaCache};
use crate::EsError;

#[derive(Debug, Clone)]
pub struct EsSettings {
    pub retry: RetryPolicy,

    /// Most facets one request may carry
    pub max_facets: usize,

    /// Terms a terms facet returns
    pub term_size: usize,

    /// Most documents a scan fetches; a scan matching more fails
    pub scan_size: usize,
}

impl Default for EsSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_facets: 1000,
            term_size: 1000,
            scan_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EsResult {
    pub mode: EsMode,
    pub fingerprint: String,
    #[serde(skip)]
    pub result: QueryResult,
}

impl EsResult {
    /// `{mode, fingerprint}` with the cube or list fields alongside
    pub fn to_json(&self) -> Value {
        let mut out = self.result.to_json();
        if let Value::Object(obj) = &mut out {
            obj.insert("mode".to_string(), json!(self.mode));
            obj.insert("fingerprint".to_string(), json!(self.fingerprint));
        }
        out
    }
}

/// Query executor over one search backend, with the index schemas it has
/// read so far
pub struct EsQuery {
    backend: Arc<dyn SearchBackend>,
    qb: Qb,
    schemas: Arc<SchemaCache>,
    settings: EsSettings,
}

impl EsQuery {
    pub fn new(backend: Arc<dyn SearchBackend>, qb: Qb, settings: EsSettings) -> Self {
        Self {
            backend,
            qb,
            schemas: Arc::new(SchemaCache::new()),
            settings,
        }
    }

    /// Share a schema cache with other executors
    pub fn with_schema_cache(mut self, schemas: Arc<SchemaCache>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn settings(&self) -> &EsSettings {
        &self.settings
    }

    pub fn qb(&self) -> &Qb {
        &self.qb
    }

    pub fn schemas(&self) -> &SchemaCache {
        &self.schemas
    }

    /// Schema of `index`, read from its mapping on first use
    pub async fn schema(&self, index: &str, token: &CancellationToken) -> Result<Arc<Schema>, EsError> {
        let backend = &self.backend;
        let policy = &self.settings.retry;
        self.schemas
            .get_or_fetch(index, || async move {
                let mapping = with_retry(policy, token, "mapping", || backend.mapping(index)).await?;
                from_mapping(index, &mapping)
            })
            .await
    }

    /// Run `query` against the index it names
    pub async fn run(&self, query: &Query, token: &CancellationToken) -> Result<EsResult, EsError> {
        let started = Instant::now();
        let schema = self.schema(&query.from, token).await?;
        let cq = self.qb.compile(query, &schema)?;
        let fingerprint = cq.fingerprint.clone();
        let mut mode = select_mode(&cq, &schema, self.settings.max_facets);
        debug!(fingerprint = %fingerprint, mode = mode.name(), "Execution mode chosen");

        let result = match self.run_mode(mode, cq, &schema, token).await {
            Err(e) if e.wants_scan() && mode != EsMode::Scan => {
                warn!(fingerprint = %fingerprint, mode = mode.name(), error = %e, "Falling back to document scan");
                mode = EsMode::Scan;
                let cq = self.qb.compile(query, &schema)?;
                self.scan(cq, &schema, token).await
            }
            other => other,
        }?;

        info!(
            fingerprint = %fingerprint,
            index = %query.from,
            mode = mode.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend query complete"
        );
        Ok(EsResult {
            mode,
            fingerprint,
            result,
        })
    }

    async fn run_mode(
        &self,
        mode: EsMode,
        mut cq: CompiledQuery,
        schema: &Schema,
        token: &CancellationToken,
    ) -> Result<QueryResult, EsError> {
        match mode {
            EsMode::Scan => self.scan(cq, schema, token).await,
            EsMode::SetOp => self.set_op(cq, schema, token).await,
            EsMode::TwoStepCount => self.two_step_count(cq, schema, token).await,
            _ => {
                let filter = query_filter(&cq, schema)?;
                let plan = build_plan(mode, &mut cq, schema, filter, &self.settings)?;
                let response = self.search(&cq.from, &plan.body, token).await?;
                decode(&plan, &mut cq, schema, &response)
            }
        }
    }

    async fn search(&self, index: &str, body: &Value, token: &CancellationToken) -> Result<Value, EsError> {
        search_with_retry(self.backend.as_ref(), index, body, &self.settings.retry, token).await
    }

    fn hits_body(&self, filter: Value, size: usize) -> Value {
        json!({
            "query": {"filtered": {"query": {"match_all": {}}, "filter": filter}},
            "size": size
        })
    }

    /// Fetch matching documents and run the in-memory engine over them
    async fn scan(&self, cq: CompiledQuery, schema: &Schema, token: &CancellationToken) -> Result<QueryResult, EsError> {
        let body = self.hits_body(scan_filter(&cq, schema), self.settings.scan_size);
        let response = self.search(&cq.from, &body, token).await?;
        let (records, total) = hits(&response)?;
        if total > records.len() as u64 {
            return Err(EsError::ScanTruncated {
                total,
                fetched: records.len(),
            });
        }
        Ok(self.qb.scan(cq, &records, token).await?)
    }

    /// Project the documents the backend filter selects
    async fn set_op(&self, cq: CompiledQuery, schema: &Schema, token: &CancellationToken) -> Result<QueryResult, EsError> {
        let filter = query_filter(&cq, schema)?;
        // Without a sort, the first `limit` documents are the answer
        let enough = match cq.limit {
            Some(limit) if cq.sort.is_empty() => Some(limit),
            _ => None,
        };
        let size = enough.map_or(self.settings.scan_size, |limit| limit.min(self.settings.scan_size));
        let mut body = self.hits_body(filter, size);
        if let Some(mut fields) = cq.selects.iter().map(|s| s.field()).collect::<Option<Vec<&str>>>() {
            fields.extend(cq.sort.iter().map(|key| key.column.as_str()));
            fields.sort_unstable();
            fields.dedup();
            body["_source"] = json!(fields);
        }
        let response = self.search(&cq.from, &body, token).await?;
        let (records, total) = hits(&response)?;
        let fetched = records.len();
        if total > fetched as u64 && enough.map_or(true, |limit| fetched < limit) {
            return Err(EsError::ScanTruncated { total, fetched });
        }
        let matched = records
            .into_iter()
            .map(|record| {
                let mut row = Map::new();
                for select in &cq.selects {
                    row.insert(select.name.clone(), select.eval(&record)?);
                }
                Ok::<_, EsError>((Value::Object(row), record))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(QueryResult::List(project_rows(&cq, matched)))
    }

    /// Count over two discovered field edges. The first request finds the
    /// first edge's terms; each follow-up request carries one terms facet
    /// on the second edge per first-edge term, and they run concurrently.
    async fn two_step_count(
        &self,
        mut cq: CompiledQuery,
        schema: &Schema,
        token: &CancellationToken,
    ) -> Result<QueryResult, EsError> {
        let filter = query_filter(&cq, schema)?;
        let (Some(first), Some(second)) = (
            cq.edges[0].field().map(str::to_string),
            cq.edges[1].field().map(str::to_string),
        ) else {
            return Err(EsError::Unsupported("two-step count needs two field edges".to_string()));
        };
        let (first_nulls, second_nulls) = (cq.edges[0].allow_nulls, cq.edges[1].allow_nulls);
        let size = self.settings.term_size;

        let mut facets = Map::new();
        facets.insert("first".to_string(), json!({"terms": {"field": first, "size": size}}));
        if first_nulls {
            facets.insert(
                "first_missing".to_string(),
                json!({"filter": {"missing": {"field": first}}}),
            );
        }
        let response = self.search(&cq.from, &facet_body(filter.clone(), facets), token).await?;
        check_complete("first", &response["facets"]["first"])?;

        let mut terms: Vec<(Filter, Option<String>)> = Vec::new();
        let mut seen = HashSet::new();
        for entry in response["facets"]["first"]["terms"].as_array().map(Vec::as_slice).unwrap_or_default() {
            let Some(text) = term_text(&entry["term"]) else {
                continue;
            };
            if !seen.insert(text.clone()) {
                return Err(EsError::DuplicateTerm {
                    facet: "first".to_string(),
                    term: text,
                });
            }
            terms.push((Filter::term(first.as_str(), entry["term"].clone()), Some(text)));
        }
        if first_nulls && count_of(&response["facets"]["first_missing"], "count") > 0 {
            terms.push((Filter::Missing { field: first.clone() }, None));
        }

        let per_term = 1 + usize::from(second_nulls);
        let chunk = (self.settings.max_facets / per_term).max(1);
        let mut scope: TaskScope<(usize, Value), EsError> = TaskScope::with_token(token.child_token());
        for (c, group) in terms.chunks(chunk).enumerate() {
            let mut facets = Map::new();
            for (j, (condition, _)) in group.iter().enumerate() {
                let i = c * chunk + j;
                facets.insert(
                    format!("p{i}"),
                    json!({"terms": {"field": second, "size": size}, "facet_filter": condition.to_json()}),
                );
                if second_nulls {
                    let missing = Filter::and([condition.clone(), Filter::Missing { field: second.clone() }]);
                    facets.insert(format!("m{i}"), json!({"filter": missing.to_json()}));
                }
            }
            let body = facet_body(filter.clone(), facets);
            let backend = self.backend.clone();
            let index = cq.from.clone();
            let policy = self.settings.retry.clone();
            scope.spawn(move |token| async move {
                let response = search_with_retry(backend.as_ref(), &index, &body, &policy, &token).await?;
                Ok::<_, EsError>((c, response))
            });
        }
        let mut responses = scope.join_all().await?;
        responses.sort_by_key(|(c, _)| *c);
        debug!(terms = terms.len(), requests = responses.len(), "Two-step count fetched");

        let selects: Vec<usize> = (0..cq.selects.len()).collect();
        let mut decoder = Decoder::new(&mut cq, schema, false);
        for (i, (_, text)) in terms.into_iter().enumerate() {
            let Some((_, response)) = responses.get(i / chunk) else {
                return Err(EsError::Decode(format!("no response for term {i}")));
            };
            let Some(key) = decoder.edge_part(0, text) else {
                continue;
            };
            let facet = |name: &str| {
                response["facets"]
                    .get(name)
                    .ok_or_else(|| EsError::Decode(format!("response lacks facet {name}")))
            };
            let name = format!("p{i}");
            decoder.add_terms(&name, FacetKind::Terms, &selects, &[key], facet(&name)?)?;
            if second_nulls {
                let body = facet(&format!("m{i}"))?;
                for &select in &selects {
                    decoder.add_cell(FacetKind::Filter, select, &[key, PartKey::Null], body)?;
                }
            }
        }
        decoder.finish()
    }
}

/// `_source` of every hit, with the number of documents the backend matched
fn hits(response: &Value) -> Result<(Vec<Value>, u64), EsError> {
    let hits = response["hits"]["hits"]
        .as_array()
        .ok_or_else(|| EsError::Decode("response has no hits".to_string()))?;
    let total = response["hits"]["total"]
        .as_u64()
        .or_else(|| response["hits"]["total"]["value"].as_u64())
        .unwrap_or(hits.len() as u64);
    Ok((hits.iter().map(|hit| hit["_source"].clone()).collect(), total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hits_total_forms() {
        let old = json!({"hits": {"total": 1, "hits": [{"_source": {"a": 1}}]}});
        assert_eq!(hits(&old).unwrap(), (vec![json!({"a": 1})], 1));
        let new = json!({"hits": {"total": {"value": 3}, "hits": [{"_source": {"a": 2}}]}});
        assert_eq!(hits(&new).unwrap(), (vec![json!({"a": 2})], 3));
        assert!(matches!(hits(&json!({})), Err(EsError::Decode(_))));
    }

    #[test]
    fn test_result_meta() {
        let result = EsResult {
            mode: EsMode::TermsStats,
            fingerprint: "abc".to_string(),
            result: QueryResult::List(vec![json!({"n": 1})]),
        };
        assert_eq!(
            result.to_json(),
            json!({"list": [{"n": 1}], "mode": "terms_stats", "fingerprint": "abc"})
        );
    }
}
