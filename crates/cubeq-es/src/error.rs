use cubeq_engine::{ErrorKind, QbError};
use cubeq_expr::ScriptError;
use thiserror::Error;

use crate::backend::BackendError;
use crate::pack::PackError;

#[derive(Debug, Error)]
pub enum EsError {
    #[error(transparent)]
    Qb(#[from] QbError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Pack(#[from] PackError),

    #[error("Query needs no facets; nothing to ask the backend")]
    NoFacets,

    #[error("Facet {facet} reported term {term:?} twice")]
    DuplicateTerm { facet: String, term: String },

    #[error("Facet {facet} left out terms covering {other} documents")]
    TermsTruncated { facet: String, other: u64 },

    #[error("Scan matched {total} documents but fetched only {fetched}")]
    ScanTruncated { total: u64, fetched: usize },

    #[error("Query needs {needed} facets, more than the limit of {limit}")]
    TooManyFacets { needed: usize, limit: usize },

    #[error("Malformed backend response: {0}")]
    Decode(String),

    /// The facet translation cannot express this query
    #[error("Not expressible as facets: {0}")]
    Unsupported(String),
}

impl EsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EsError::Qb(e) => e.kind(),
            EsError::Backend(e) if e.is_transient() => ErrorKind::Transient,
            EsError::Backend(BackendError::ScriptingDisabled(_)) | EsError::Backend(BackendError::Rejected { .. }) => {
                ErrorKind::Configuration
            }
            EsError::Backend(_) => ErrorKind::DataInvariant,
            EsError::Script(_) | EsError::TooManyFacets { .. } | EsError::Unsupported(_) => ErrorKind::Configuration,
            EsError::Pack(_)
            | EsError::NoFacets
            | EsError::DuplicateTerm { .. }
            | EsError::TermsTruncated { .. }
            | EsError::ScanTruncated { .. }
            | EsError::Decode(_) => ErrorKind::DataInvariant,
        }
    }

    /// Errors that send the query down the document-scan path instead
    pub fn wants_scan(&self) -> bool {
        matches!(
            self,
            EsError::Unsupported(_)
                | EsError::TooManyFacets { .. }
                | EsError::TermsTruncated { .. }
                | EsError::Script(ScriptError::Unsupported(_))
                | EsError::Script(ScriptError::NestedFieldOutsideScope(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(EsError::Backend(BackendError::Timeout).kind(), ErrorKind::Transient);
        assert_eq!(
            EsError::Backend(BackendError::ScriptingDisabled("off".to_string())).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            EsError::DuplicateTerm {
                facet: "terms".to_string(),
                term: "a".to_string()
            }
            .kind(),
            ErrorKind::DataInvariant
        );
        assert_eq!(EsError::Qb(QbError::Cancelled).kind(), ErrorKind::Cancelled);
        assert!(EsError::Unsupported("record edge".to_string()).wants_scan());
        assert!(!EsError::NoFacets.wants_scan());
        assert_eq!(EsError::NoFacets.kind(), ErrorKind::DataInvariant);
    }

    #[test]
    fn test_truncation_kinds() {
        let terms = EsError::TermsTruncated {
            facet: "terms".to_string(),
            other: 4,
        };
        assert!(terms.wants_scan());
        assert_eq!(terms.kind(), ErrorKind::DataInvariant);
        let scan = EsError::ScanTruncated { total: 12, fetched: 10 };
        assert!(!scan.wants_scan());
        assert_eq!(scan.kind(), ErrorKind::DataInvariant);
    }
}
