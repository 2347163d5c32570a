//! HTTP API
//!
//! - `POST /query` - run `{query, data?}`; in memory when `data` is given,
//!   against the search backend otherwise
//! - `GET /schema` - markdown catalog of the schemas read so far
//! - `GET /schema/:index` - index columns as JSON, or `?format=markdown`
//! - `GET /health` - liveness
//! - `GET /metrics` - Prometheus metrics

use axum::extract::{Path, Query as QueryParams, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cubeq_engine::{ErrorKind, Qb, QbError};
use cubeq_es::{EsError, EsQuery};
use cubeq_ir::Query;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog;
use crate::log_event;
use crate::metrics::{Metrics, MetricsError};

/// Label for queries answered from request data
pub const MEMORY_MODE: &str = "memory";

pub struct AppState {
    pub es: EsQuery,
    pub qb: Qb,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(es: EsQuery, metrics: Metrics) -> Self {
        let qb = es.qb().clone();
        Self { es, qb, metrics }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Malformed query: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Qb(#[from] QbError),

    #[error(transparent)]
    Es(#[from] EsError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Label of failures that belong to the server rather than the query
const INTERNAL: &str = "internal";

impl ApiError {
    /// How a query failed; `None` when the server itself did
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ApiError::BadRequest(_) => Some(ErrorKind::Configuration),
            ApiError::Qb(e) => Some(e.kind()),
            ApiError::Es(e) => Some(e.kind()),
            ApiError::Metrics(_) => None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.kind() {
            Some(ErrorKind::Configuration) => StatusCode::BAD_REQUEST,
            Some(ErrorKind::DataInvariant) => StatusCode::UNPROCESSABLE_ENTITY,
            Some(ErrorKind::Transient) => StatusCode::SERVICE_UNAVAILABLE,
            // Client closed request
            Some(ErrorKind::Cancelled) => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn label(&self) -> &'static str {
        self.kind().map_or(INTERNAL, kind_label)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"error": self.to_string(), "kind": self.label()});
        (self.status(), Json(body)).into_response()
    }
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Configuration => "configuration",
        ErrorKind::DataInvariant => "data_invariant",
        ErrorKind::Transient => "transient",
        ErrorKind::Cancelled => "cancelled",
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: Value,

    /// Records to aggregate instead of the backend index
    #[serde(default)]
    pub data: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
pub struct SchemaParams {
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/query", post(query))
        .route("/schema", get(schema_catalog))
        .route("/schema/:index", get(schema))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let text = state.metrics.gather()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response())
}

async fn query(State(state): State<Arc<AppState>>, Json(request): Json<QueryRequest>) -> Result<Json<Value>, ApiError> {
    let request_id = Uuid::new_v4();
    let span = info_span!("query", request_id = %request_id);
    // Dropping the handler (client gone) cancels the query
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();

    async move {
        let started = Instant::now();
        let parsed = Query::from_json(request.query).map_err(|e| ApiError::BadRequest(e.to_string()));
        let (mode, outcome) = match parsed {
            Ok(q) => match request.data {
                Some(records) => {
                    let result = state.qb.run_task(&q, &records, &token).await;
                    let out = result.map(|r| {
                        let mut out = r.to_json();
                        if let Value::Object(obj) = &mut out {
                            obj.insert("mode".to_string(), json!(MEMORY_MODE));
                            obj.insert("fingerprint".to_string(), json!(q.fingerprint()));
                        }
                        out
                    });
                    (MEMORY_MODE, out.map_err(ApiError::from))
                }
                None => match state.es.run(&q, &token).await {
                    Ok(result) => (result.mode.name(), Ok(result.to_json())),
                    Err(e) => ("backend", Err(ApiError::from(e))),
                },
            },
            Err(e) => ("none", Err(e)),
        };

        let elapsed = started.elapsed();
        let label = match &outcome {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        state.metrics.record(mode, label, elapsed.as_secs_f64());
        match &outcome {
            Ok(_) => {
                log_event!(
                    level: tracing::Level::INFO,
                    event: "query_served",
                    mode: mode,
                    duration_ms: elapsed.as_millis() as u64,
                );
            }
            Err(e) => {
                warn!(mode, outcome = label, error = %e, "Query failed");
            }
        }
        outcome.map(Json)
    }
    .instrument(span)
    .await
}

async fn schema_catalog(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        catalog::catalog_markdown(&state.es.schemas().cached()),
    )
        .into_response()
}

async fn schema(
    State(state): State<Arc<AppState>>,
    Path(index): Path<String>,
    QueryParams(params): QueryParams<SchemaParams>,
) -> Result<Response, ApiError> {
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();
    let schema = state.es.schema(&index, &token).await?;
    match params.format.as_deref() {
        Some("markdown") => Ok((
            [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
            catalog::to_markdown(&schema),
        )
            .into_response()),
        _ => Ok(Json(schema.as_ref().clone()).into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::BadRequest("x".to_string()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::Qb(QbError::Cancelled).status().as_u16(), 499);
        assert_eq!(
            ApiError::Es(EsError::Backend(cubeq_es::BackendError::Timeout)).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::Es(EsError::Decode("facet".to_string())).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(kind_label(ErrorKind::DataInvariant), "data_invariant");
        assert_eq!(kind_label(ErrorKind::Cancelled), "cancelled");
        assert_eq!(ApiError::Es(EsError::NoFacets).label(), "data_invariant");
    }

    #[tokio::test]
    async fn test_server_failure_body() {
        let error = ApiError::Metrics(MetricsError::Prometheus(prometheus::Error::Msg("encode".to_string())));
        assert_eq!(error.kind(), None);
        assert_eq!(error.label(), "internal");

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["kind"], "internal");
    }
}
