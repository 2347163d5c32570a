//! Prometheus metrics for served queries

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics contain invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Query counters and latencies, kept in a registry of their own
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    queries_total: IntCounterVec,
    query_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let queries_total = IntCounterVec::new(
            Opts::new("cubeq_queries_total", "Queries served by execution mode and outcome"),
            &["mode", "outcome"],
        )?;
        let query_duration = HistogramVec::new(
            HistogramOpts::new("cubeq_query_duration_seconds", "Query latency in seconds")
                .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["mode"],
        )?;

        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(query_duration.clone()))?;

        Ok(Self {
            registry,
            queries_total,
            query_duration,
        })
    }

    /// Record one finished query; `outcome` is `ok` or an error kind
    pub fn record(&self, mode: &str, outcome: &str, duration_secs: f64) {
        self.queries_total.with_label_values(&[mode, outcome]).inc();
        self.query_duration.with_label_values(&[mode]).observe(duration_secs);
    }

    /// Metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
