//! Backend-agnostic query AST.
//!
//! A [`QueryAst`] is produced by [`crate::builder::QueryBuilder`] and consumed
//! read-only by exactly one renderer. Its backend-specific clauses live in a
//! single [`Extension`] block whose variant fixes the target backend.

use crate::backend::BackendKind;
use crate::condition::{Condition, Selection};
use crate::error::{QueryError, Result};
use crate::operators::{
    AggregateFunc, ComparisonOp, ConflictAction, EventType, JoinType, SortDirection,
};
use crate::schema::{Alias, Field, Param, Table};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Query operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Count,
    Listen,
    Notify,
    Unlisten,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Select => write!(f, "SELECT"),
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
            Operation::Count => write!(f, "COUNT"),
            Operation::Listen => write!(f, "LISTEN"),
            Operation::Notify => write!(f, "NOTIFY"),
            Operation::Unlisten => write!(f, "UNLISTEN"),
        }
    }
}

pub fn valid_operation(value: &str) -> Result<Operation> {
    match value.trim().to_uppercase().as_str() {
        "SELECT" => Ok(Operation::Select),
        "INSERT" => Ok(Operation::Insert),
        "UPDATE" => Ok(Operation::Update),
        "DELETE" => Ok(Operation::Delete),
        "COUNT" => Ok(Operation::Count),
        "LISTEN" => Ok(Operation::Listen),
        "NOTIFY" => Ok(Operation::Notify),
        "UNLISTEN" => Ok(Operation::Unlisten),
        _ => Err(QueryError::InvalidKeyword {
            kind: "operation",
            value: value.to_string(),
        }),
    }
}

/// Join clause
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: Table,
    pub alias: Option<Alias>,
    pub on: Condition,
}

/// ORDER BY clause
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: Field,
    pub direction: SortDirection,
}

/// ON CONFLICT clause. A `DoUpdate` with no explicit assignments updates
/// every inserted non-conflict column from `EXCLUDED`.
#[derive(Debug, Clone, PartialEq)]
pub struct OnConflict {
    pub columns: Vec<Field>,
    pub action: ConflictAction,
    pub updates: HashMap<Field, Param>,
}

/// One HAVING clause; clauses are joined with AND.
#[derive(Debug, Clone, PartialEq)]
pub enum HavingClause {
    Condition(Condition),
    Aggregate {
        func: AggregateFunc,
        field: Option<Field>,
        op: ComparisonOp,
        param: Param,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationalExt {
    pub joins: Vec<Join>,
    pub group_by: Vec<Field>,
    pub having: Vec<HavingClause>,
    pub on_conflict: Option<OnConflict>,
    pub returning: Vec<Field>,
    pub distinct: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyValueExt {
    pub ttl: Option<Param>,
    pub score: Option<Param>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchExt {
    pub highlight: Vec<Field>,
    pub fragment_size: Option<u32>,
    pub min_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectStoreExt {
    pub content: Option<Param>,
    pub event_types: BTreeSet<EventType>,
}

/// Backend-specific clauses
#[derive(Debug, Clone, PartialEq)]
pub enum Extension {
    Relational(RelationalExt),
    KeyValue(KeyValueExt),
    Search(SearchExt),
    ObjectStore(ObjectStoreExt),
}

impl Extension {
    pub fn for_backend(backend: BackendKind) -> Self {
        match backend {
            BackendKind::Relational => Extension::Relational(RelationalExt::default()),
            BackendKind::KeyValue => Extension::KeyValue(KeyValueExt::default()),
            BackendKind::Search => Extension::Search(SearchExt::default()),
            BackendKind::ObjectStore => Extension::ObjectStore(ObjectStoreExt::default()),
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            Extension::Relational(_) => BackendKind::Relational,
            Extension::KeyValue(_) => BackendKind::KeyValue,
            Extension::Search(_) => BackendKind::Search,
            Extension::ObjectStore(_) => BackendKind::ObjectStore,
        }
    }
}

/// A complete query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryAst {
    pub(crate) operation: Operation,
    pub(crate) target: Table,
    pub(crate) projection: Vec<Selection>,
    pub(crate) filter: Option<Condition>,
    pub(crate) values: Vec<HashMap<Field, Param>>,
    pub(crate) updates: HashMap<Field, Param>,
    pub(crate) ordering: Vec<OrderBy>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) notify_payload: Option<Param>,
    pub(crate) extension: Extension,
}

impl QueryAst {
    pub(crate) fn new(backend: BackendKind, operation: Operation, target: Table) -> Self {
        Self {
            operation,
            target,
            projection: Vec::new(),
            filter: None,
            values: Vec::new(),
            updates: HashMap::new(),
            ordering: Vec::new(),
            limit: None,
            offset: None,
            notify_payload: None,
            extension: Extension::for_backend(backend),
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn target(&self) -> &Table {
        &self.target
    }

    pub fn backend(&self) -> BackendKind {
        self.extension.backend()
    }

    pub fn filter(&self) -> Option<&Condition> {
        self.filter.as_ref()
    }

    pub fn projection(&self) -> &[Selection] {
        &self.projection
    }

    pub fn extension(&self) -> &Extension {
        &self.extension
    }

    /// Change-notification channel for this query's target.
    pub fn channel(&self) -> String {
        format!("{}_changes", self.target)
    }

    /// Full validation pass over cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        let backend = self.backend();
        let op = self.operation;

        if !backend.supports(op) {
            return Err(QueryError::UnsupportedOperation {
                operation: op,
                backend,
            });
        }

        match op {
            Operation::Insert => self.validate_rows()?,
            Operation::Update if self.updates.is_empty() => {
                return Err(QueryError::query("UPDATE must have at least one SET value"));
            }
            _ => {}
        }

        if op != Operation::Insert && !self.values.is_empty() {
            return Err(QueryError::query(format!("VALUES are not valid on {}", op)));
        }
        if op != Operation::Update && !self.updates.is_empty() {
            return Err(QueryError::query(format!("SET is not valid on {}", op)));
        }

        if let Some(filter) = &self.filter {
            if !filter_allowed(backend, op) {
                return Err(QueryError::query(format!("WHERE is not valid on {}", op)));
            }
            filter.validate()?;
            if backend != BackendKind::Relational {
                check_portable_condition(backend, filter)?;
            }
        }

        if op != Operation::Select {
            if !self.projection.is_empty() {
                return Err(QueryError::query(format!("field selection is not valid on {}", op)));
            }
            if !self.ordering.is_empty() {
                return Err(QueryError::query(format!("ORDER BY is not valid on {}", op)));
            }
            if self.limit.is_some() || self.offset.is_some() {
                return Err(QueryError::query(format!("LIMIT/OFFSET are not valid on {}", op)));
            }
        }
        for selection in &self.projection {
            selection.expr.validate()?;
            if backend != BackendKind::Relational && selection.as_field().is_none() {
                return Err(QueryError::unsupported(
                    backend,
                    "projection expressions and aliases",
                ));
            }
        }

        if op != Operation::Notify && self.notify_payload.is_some() {
            return Err(QueryError::query(format!("notify payload is not valid on {}", op)));
        }

        match &self.extension {
            Extension::Relational(ext) => self.validate_relational(ext),
            Extension::KeyValue(ext) => self.validate_key_value(ext),
            Extension::Search(ext) => self.validate_search(ext),
            Extension::ObjectStore(ext) => self.validate_object_store(ext),
        }
    }

    fn validate_rows(&self) -> Result<()> {
        let first = self
            .values
            .first()
            .ok_or_else(|| QueryError::query("INSERT must have at least one row of values"))?;
        if first.is_empty() {
            return Err(QueryError::query("INSERT row must have at least one value"));
        }
        if self.values.len() > 1 {
            if self.backend() != BackendKind::Relational {
                return Err(QueryError::unsupported(self.backend(), "multi-row INSERT"));
            }
            let mut columns: Vec<&Field> = first.keys().collect();
            columns.sort();
            for row in &self.values[1..] {
                let mut row_columns: Vec<&Field> = row.keys().collect();
                row_columns.sort();
                if row_columns != columns {
                    return Err(QueryError::query(
                        "all INSERT rows must have the same columns",
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_relational(&self, ext: &RelationalExt) -> Result<()> {
        let op = self.operation;

        if !ext.joins.is_empty() && !matches!(op, Operation::Select | Operation::Count) {
            return Err(QueryError::query(format!("JOIN is not valid on {}", op)));
        }
        for join in &ext.joins {
            join.on.validate()?;
        }

        if op != Operation::Select {
            if !ext.group_by.is_empty() || !ext.having.is_empty() {
                return Err(QueryError::query(format!("GROUP BY/HAVING are not valid on {}", op)));
            }
            if ext.distinct {
                return Err(QueryError::query(format!("DISTINCT is not valid on {}", op)));
            }
        }
        if !ext.having.is_empty() && ext.group_by.is_empty() {
            return Err(QueryError::query("HAVING requires GROUP BY"));
        }
        for clause in &ext.having {
            match clause {
                HavingClause::Condition(condition) => condition.validate()?,
                HavingClause::Aggregate { func, field, op, .. } => {
                    if func.requires_field() && field.is_none() {
                        return Err(QueryError::query("HAVING aggregate requires a field"));
                    }
                    if !op.is_scalar_comparison() {
                        return Err(QueryError::query(format!(
                            "operator {} is not valid in a HAVING aggregate comparison",
                            op
                        )));
                    }
                }
            }
        }

        if let Some(conflict) = &ext.on_conflict {
            if op != Operation::Insert {
                return Err(QueryError::query(format!("ON CONFLICT is not valid on {}", op)));
            }
            if conflict.columns.is_empty() {
                return Err(QueryError::query("ON CONFLICT requires at least one column"));
            }
            if conflict.action == ConflictAction::DoNothing && !conflict.updates.is_empty() {
                return Err(QueryError::query("ON CONFLICT DO NOTHING cannot carry updates"));
            }
        }

        if !ext.returning.is_empty()
            && !matches!(op, Operation::Insert | Operation::Update | Operation::Delete)
        {
            return Err(QueryError::query(format!("RETURNING is not valid on {}", op)));
        }

        Ok(())
    }

    fn validate_key_value(&self, ext: &KeyValueExt) -> Result<()> {
        let op = self.operation;
        if (ext.ttl.is_some() || ext.score.is_some())
            && !matches!(op, Operation::Insert | Operation::Update)
        {
            return Err(QueryError::query(format!("TTL/score are not valid on {}", op)));
        }
        if op == Operation::Notify && self.notify_payload.is_none() {
            return Err(QueryError::query(
                "NOTIFY on the key-value backend requires a payload parameter",
            ));
        }
        Ok(())
    }

    fn validate_search(&self, ext: &SearchExt) -> Result<()> {
        let op = self.operation;
        if (!ext.highlight.is_empty() || ext.fragment_size.is_some() || ext.min_score.is_some())
            && op != Operation::Select
        {
            return Err(QueryError::query(format!(
                "highlight/min_score are not valid on {}",
                op
            )));
        }
        if ext.fragment_size.is_some() && ext.highlight.is_empty() {
            return Err(QueryError::query("fragment size requires highlight fields"));
        }
        Ok(())
    }

    fn validate_object_store(&self, ext: &ObjectStoreExt) -> Result<()> {
        let op = self.operation;
        match (op, &ext.content) {
            (Operation::Insert, None) => {
                return Err(QueryError::query(
                    "INSERT on the object-store backend requires a content parameter",
                ));
            }
            (Operation::Insert, Some(_)) | (_, None) => {}
            (_, Some(_)) => {
                return Err(QueryError::query(format!("content is not valid on {}", op)));
            }
        }
        if !ext.event_types.is_empty() && !matches!(op, Operation::Listen | Operation::Unlisten) {
            return Err(QueryError::query(format!("event types are not valid on {}", op)));
        }
        if self.offset.is_some() {
            return Err(QueryError::unsupported(BackendKind::ObjectStore, "OFFSET"));
        }
        if !self.ordering.is_empty() {
            return Err(QueryError::unsupported(BackendKind::ObjectStore, "ORDER BY"));
        }
        if !self.projection.is_empty() {
            return Err(QueryError::unsupported(BackendKind::ObjectStore, "field selection"));
        }
        Ok(())
    }
}

/// Operations that accept a WHERE clause on the given backend.
pub(crate) fn filter_allowed(backend: BackendKind, op: Operation) -> bool {
    match op {
        Operation::Select | Operation::Update | Operation::Delete | Operation::Count => true,
        Operation::Listen | Operation::Unlisten => backend == BackendKind::ObjectStore,
        Operation::Insert | Operation::Notify => false,
    }
}

/// Subqueries and field-to-field comparisons exist only on the relational
/// backend.
pub(crate) fn check_portable_condition(backend: BackendKind, condition: &Condition) -> Result<()> {
    if condition.contains_subquery() {
        return Err(QueryError::unsupported(backend, "subqueries"));
    }
    if condition.contains_field_comparison() {
        return Err(QueryError::unsupported(backend, "field-to-field comparisons"));
    }
    Ok(())
}
