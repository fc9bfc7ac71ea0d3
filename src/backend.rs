use crate::ast::{Operation, QueryAst};
use crate::condition::Condition;
use crate::error::{QueryError, Result};
use crate::operators::ComparisonOp;
use crate::schema::{Field, FieldMetadata, Param};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Kind of data store a query targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Relational,
    KeyValue,
    Search,
    ObjectStore,
}

impl BackendKind {
    /// Operation-level capability matrix.
    pub fn supports(&self, operation: Operation) -> bool {
        match self {
            BackendKind::Relational | BackendKind::KeyValue => true,
            BackendKind::Search => !matches!(
                operation,
                Operation::Listen | Operation::Notify | Operation::Unlisten
            ),
            BackendKind::ObjectStore => {
                !matches!(operation, Operation::Update | Operation::Notify)
            }
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Relational => write!(f, "relational"),
            BackendKind::KeyValue => write!(f, "key-value"),
            BackendKind::Search => write!(f, "search"),
            BackendKind::ObjectStore => write!(f, "object-store"),
        }
    }
}

/// What executing the rendered query returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    /// Tabular rows
    Rows,
    /// Search hits
    Documents,
    /// Key names from a scan
    Keys,
    /// A single scalar value or field map
    Value,
    /// Collection members (set, sorted set, list)
    Members,
    /// Object listing
    Objects,
    /// A single count
    Count,
    /// Number of affected rows/documents
    Affected,
    /// A channel subscription
    Subscription,
    /// Acknowledgement only
    Acknowledged,
}

/// Column produced by a query, enriched from the registry when available
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultField {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FieldMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryMetadata {
    pub operation: Operation,
    pub table: String,
    pub result_shape: ResultShape,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returned_fields: Option<Vec<ResultField>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_fields: Option<Vec<String>>,
}

impl QueryMetadata {
    pub(crate) fn new(ast: &QueryAst, result_shape: ResultShape) -> Self {
        Self {
            operation: ast.operation(),
            table: ast.target().name().to_string(),
            result_shape,
            returned_fields: None,
            modified_fields: None,
        }
    }
}

/// Output of a render call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedQuery {
    /// Backend-native query text or command list
    pub representation: String,
    /// Parameter names the caller must bind, in first-seen order
    pub required_params: Vec<String>,
    pub metadata: QueryMetadata,
}

/// A backend compiler.
///
/// Implementations hold only configuration populated during setup, so a
/// single renderer can be shared across threads.
pub trait QueryRenderer: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Render a validated AST into the backend's native form
    fn render(&self, ast: &QueryAst) -> Result<RenderedQuery>;
}

/// Fail unless the AST was built for `backend`, then run the full validation.
pub(crate) fn check_ast(backend: BackendKind, ast: &QueryAst) -> Result<()> {
    if ast.backend() != backend {
        return Err(QueryError::query(format!(
            "query was built for the {} backend, not {}",
            ast.backend(),
            backend
        )));
    }
    ast.validate()
}

/// Map entries ordered by field name.
pub(crate) fn sorted_entries(map: &HashMap<Field, Param>) -> Vec<(&Field, &Param)> {
    let mut entries: Vec<(&Field, &Param)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

/// Key and object backends address a single record by its id field. Returns
/// the id parameter for a filter of the form `id_field = :param`.
pub(crate) fn id_equality<'a>(
    backend: BackendKind,
    filter: &'a Condition,
    id_field: &str,
) -> Result<&'a Param> {
    match filter {
        Condition::Simple {
            field,
            op: ComparisonOp::Eq,
            param: Some(param),
        } if field.name() == id_field => Ok(param),
        Condition::Simple { field, op, .. } if field.name() == id_field => {
            Err(QueryError::unsupported(
                backend,
                format!("operator {} on id field {}; only = is supported", op, id_field),
            ))
        }
        Condition::Simple { field, .. } => Err(QueryError::unsupported(
            backend,
            format!("filter on field {}; only the id field {} can be filtered", field, id_field),
        )),
        Condition::Group { .. } => Err(QueryError::unsupported(
            backend,
            "boolean groups in WHERE",
        )),
        Condition::FieldComparison { .. } | Condition::Subquery { .. } => Err(
            QueryError::unsupported(backend, "only a single equality on the id field"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_matrix() {
        assert!(BackendKind::Relational.supports(Operation::Notify));
        assert!(BackendKind::KeyValue.supports(Operation::Update));
        assert!(!BackendKind::Search.supports(Operation::Listen));
        assert!(BackendKind::Search.supports(Operation::Update));
        assert!(!BackendKind::ObjectStore.supports(Operation::Update));
        assert!(!BackendKind::ObjectStore.supports(Operation::Notify));
        assert!(BackendKind::ObjectStore.supports(Operation::Listen));
    }

    #[test]
    fn test_unsupported_operation_message() {
        let err = QueryError::UnsupportedOperation {
            operation: Operation::Update,
            backend: BackendKind::ObjectStore,
        };
        assert_eq!(err.to_string(), "UPDATE is not supported by the object-store backend");
    }
}
