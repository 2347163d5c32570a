//! Search backend execution for cubeq queries
//!
//! A compiled query is translated into one faceted search request where the
//! backend can compute the aggregates (terms, terms_stats and statistical
//! facets), and the facet results are decoded back into the same cube the
//! in-memory engine would build. Anything the facets cannot express falls
//! back to fetching documents and running the in-memory engine over them.

mod backend;
mod decode;
mod error;
mod mode;
mod pack;
mod query;
mod request;
mod retry;
mod schema;

pub use backend::{BackendError, HttpBackend, SearchBackend};
pub use decode::{decode, Decoder};
pub use error::EsError;
pub use mode::{select_mode, EsMode};
pub use pack::{pack, unpack, PackError, NULL_TOKEN};
pub use query::{EsQuery, EsResult, EsSettings};
pub use request::{build_plan, query_filter, FacetKind, FacetPlan, Plan};
pub use retry::{search_with_retry, with_retry, RetryPolicy};
pub use schema::{from_mapping, SchemaCache};
