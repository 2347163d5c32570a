//! HTTP front end for cubeq queries
//!
//! Serves cube queries against a search backend or over posted records,
//! with YAML configuration, structured logging and Prometheus metrics.

pub mod api;
pub mod catalog;
pub mod config;
pub mod logging;
pub mod metrics;

pub use api::{router, ApiError, AppState};
pub use config::{Config, ConfigError};
pub use metrics::Metrics;
