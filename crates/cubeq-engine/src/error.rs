//! Query errors and their classification

use cubeq_domain::DomainError;
use cubeq_expr::{EvalError, ParseError};
use cubeq_registry::{AggregateError, RegistryError};
use serde::Serialize;
use thiserror::Error;

/// How a failure should be reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The query itself is wrong; retrying will not help
    Configuration,
    /// The data contradicts a guarantee the query declared
    DataInvariant,
    /// The backend failed in a way a retry may fix
    Transient,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum QbError {
    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),

    #[error("Select {0} has no aggregate but the query is aggregated")]
    NoneInGroupedQuery(String),

    #[error("Cannot compile {column}: {source}")]
    Expression {
        column: String,
        #[source]
        source: ParseError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("Cube cell {0} was written twice")]
    CellWritten(String),

    #[error("Cube has no cell {0}")]
    NoSuchCell(String),

    #[error("Query was cancelled")]
    Cancelled,

    #[error("Query task failed: {0}")]
    TaskFailed(String),
}

impl QbError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QbError::Domain(DomainError::NotFrozen(_)) => ErrorKind::DataInvariant,
            QbError::DuplicateColumn(_)
            | QbError::NoneInGroupedQuery(_)
            | QbError::Expression { .. }
            | QbError::Registry(_)
            | QbError::Domain(_)
            | QbError::Eval(_) => ErrorKind::Configuration,
            QbError::Aggregate(_)
            | QbError::CellWritten(_)
            | QbError::NoSuchCell(_)
            | QbError::TaskFailed(_) => {
                ErrorKind::DataInvariant
            }
            QbError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classification() {
        let unknown = QbError::Registry(RegistryError::UnknownAggregate("mode".to_string()));
        assert_eq!(unknown.kind(), ErrorKind::Configuration);

        let conflict = QbError::Aggregate(AggregateError::Conflict {
            first: json!(1),
            second: json!(2),
        });
        assert_eq!(conflict.kind(), ErrorKind::DataInvariant);
        assert_eq!(QbError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
