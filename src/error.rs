use crate::ast::Operation;
use crate::backend::BackendKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("Invalid {kind} identifier '{name}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Unknown table: '{0}'")]
    UnknownTable(String),

    #[error("Unknown field '{field}' on table '{table}'")]
    UnknownField { table: String, field: String },

    #[error("Invalid {kind}: '{value}'")]
    InvalidKeyword { kind: &'static str, value: String },

    #[error("{operation} is not supported by the {backend} backend")]
    UnsupportedOperation {
        operation: Operation,
        backend: BackendKind,
    },

    #[error("Unsupported by the {backend} backend: {reason}")]
    Unsupported { backend: BackendKind, reason: String },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Subquery depth {depth} exceeds maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("No {backend} target registered for table '{table}'")]
    UnregisteredTarget { table: String, backend: BackendKind },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl QueryError {
    pub(crate) fn unsupported(backend: BackendKind, reason: impl Into<String>) -> Self {
        QueryError::Unsupported {
            backend,
            reason: reason.into(),
        }
    }

    pub(crate) fn query(reason: impl Into<String>) -> Self {
        QueryError::Query(reason.into())
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(err: serde_json::Error) -> Self {
        QueryError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for QueryError {
    fn from(err: serde_yaml::Error) -> Self {
        QueryError::Serialization(err.to_string())
    }
}
