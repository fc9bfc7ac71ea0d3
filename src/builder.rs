//! Fluent, validating query construction.
//!
//! [`QueryBuilder`] is a two-state machine: `Open` while every call has
//! succeeded, `Errored` after the first failure. All methods consume and
//! return the builder; once errored they are no-ops and [`QueryBuilder::build`]
//! returns the first error unchanged.
//!
//! ```rust
//! use polyquery::prelude::*;
//!
//! let mut registry = Registry::new();
//! registry
//!     .register_table("users", vec![("id", SqlType::BigInt, false), ("age", SqlType::Integer, false)])
//!     .unwrap();
//!
//! let ast = QueryBuilder::select(BackendKind::Relational, registry.must_table("users"))
//!     .where_gt(registry.must_field("users", "age"), Param::must("min_age"))
//!     .limit(10)
//!     .build()
//!     .unwrap();
//! assert_eq!(ast.operation(), Operation::Select);
//! ```

use crate::ast::{
    check_portable_condition, filter_allowed, Extension, HavingClause, Join, KeyValueExt,
    ObjectStoreExt, OnConflict, Operation, OrderBy, QueryAst, RelationalExt, SearchExt,
};
use crate::backend::BackendKind;
use crate::condition::{Condition, Expression, Selection};
use crate::error::{QueryError, Result};
use crate::operators::{
    AggregateFunc, ComparisonOp, ConflictAction, EventType, JoinType, LogicalOp, SortDirection,
    SubqueryOp,
};
use crate::schema::{Alias, Field, Param, Table};
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum BuilderState {
    Open(QueryAst),
    Errored(QueryError),
}

/// Query builder for any backend
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    backend: BackendKind,
    state: BuilderState,
}

impl QueryBuilder {
    /// Start a query. Fails immediately if the backend cannot perform the
    /// operation at all.
    pub fn new(backend: BackendKind, operation: Operation, table: Table) -> Self {
        let state = if backend.supports(operation) {
            BuilderState::Open(QueryAst::new(backend, operation, table))
        } else {
            let err = QueryError::UnsupportedOperation { operation, backend };
            tracing::debug!(error = %err, "query builder rejected operation");
            BuilderState::Errored(err)
        };
        Self { backend, state }
    }

    /// A builder that starts out errored, for callers that fail before a
    /// table or operation could be resolved.
    pub fn errored(backend: BackendKind, err: QueryError) -> Self {
        tracing::debug!(error = %err, %backend, "query builder entered errored state");
        Self {
            backend,
            state: BuilderState::Errored(err),
        }
    }

    pub fn select(backend: BackendKind, table: Table) -> Self {
        Self::new(backend, Operation::Select, table)
    }

    pub fn insert(backend: BackendKind, table: Table) -> Self {
        Self::new(backend, Operation::Insert, table)
    }

    pub fn update(backend: BackendKind, table: Table) -> Self {
        Self::new(backend, Operation::Update, table)
    }

    pub fn delete(backend: BackendKind, table: Table) -> Self {
        Self::new(backend, Operation::Delete, table)
    }

    pub fn count(backend: BackendKind, table: Table) -> Self {
        Self::new(backend, Operation::Count, table)
    }

    pub fn listen(backend: BackendKind, table: Table) -> Self {
        Self::new(backend, Operation::Listen, table)
    }

    pub fn notify(backend: BackendKind, table: Table) -> Self {
        Self::new(backend, Operation::Notify, table)
    }

    pub fn unlisten(backend: BackendKind, table: Table) -> Self {
        Self::new(backend, Operation::Unlisten, table)
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// The latched error, if any call has failed.
    pub fn error(&self) -> Option<&QueryError> {
        match &self.state {
            BuilderState::Open(_) => None,
            BuilderState::Errored(err) => Some(err),
        }
    }

    pub fn is_errored(&self) -> bool {
        self.error().is_some()
    }

    /// Apply a mutation if the builder is still open, latching its error.
    fn apply<F>(self, mutate: F) -> Self
    where
        F: FnOnce(&mut QueryAst) -> Result<()>,
    {
        let backend = self.backend;
        match self.state {
            BuilderState::Errored(_) => self,
            BuilderState::Open(mut ast) => match mutate(&mut ast) {
                Ok(()) => Self {
                    backend,
                    state: BuilderState::Open(ast),
                },
                Err(err) => {
                    tracing::debug!(error = %err, %backend, "query builder entered errored state");
                    Self {
                        backend,
                        state: BuilderState::Errored(err),
                    }
                }
            },
        }
    }

    /// Latch `err` unless an earlier error is already stored.
    pub fn fail(self, err: QueryError) -> Self {
        self.apply(|_| Err(err))
    }

    // Projection

    /// Select specific fields
    pub fn fields(self, fields: Vec<Field>) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "field selection")?;
            require_not_backend(ast, BackendKind::ObjectStore, "field selection")?;
            ast.projection.extend(fields.into_iter().map(Selection::field));
            Ok(())
        })
    }

    pub fn field(self, field: Field) -> Self {
        self.fields(vec![field])
    }

    /// Select a computed expression
    pub fn select_expr(self, expr: Expression, alias: Option<Alias>) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "projection expressions")?;
            let is_plain = matches!(expr, Expression::Field(_)) && alias.is_none();
            if !is_plain {
                relational_ext(ast, "projection expressions")?;
            }
            require_not_backend(ast, BackendKind::ObjectStore, "field selection")?;
            expr.validate()?;
            ast.projection.push(Selection { expr, alias });
            Ok(())
        })
    }

    /// Add an aggregate function
    pub fn aggregate(self, func: AggregateFunc, field: Option<Field>, alias: Option<Alias>) -> Self {
        self.select_expr(Expression::Aggregate { func, field }, alias)
    }

    // Filtering

    /// AND a condition onto the WHERE clause
    pub fn filter(self, condition: Condition) -> Self {
        self.combine_filter(LogicalOp::And, condition)
    }

    /// OR a condition onto the WHERE clause
    pub fn or_filter(self, condition: Condition) -> Self {
        self.combine_filter(LogicalOp::Or, condition)
    }

    fn combine_filter(self, logic: LogicalOp, condition: Condition) -> Self {
        self.apply(|ast| {
            let backend = ast.backend();
            if !filter_allowed(backend, ast.operation) {
                return Err(QueryError::query(format!("WHERE is not valid on {}", ast.operation)));
            }
            condition.validate()?;
            if backend != BackendKind::Relational {
                check_portable_condition(backend, &condition)?;
            }
            ast.filter = Some(match ast.filter.take() {
                None => condition,
                Some(Condition::Group {
                    logic: existing,
                    mut conditions,
                }) if existing == logic => {
                    conditions.push(condition);
                    Condition::Group { logic, conditions }
                }
                Some(existing) => Condition::Group {
                    logic,
                    conditions: vec![existing, condition],
                },
            });
            Ok(())
        })
    }

    pub fn where_op(self, field: Field, op: ComparisonOp, param: Param) -> Self {
        self.filter(Condition::Simple {
            field,
            op,
            param: Some(param),
        })
    }

    pub fn where_eq(self, field: Field, param: Param) -> Self {
        self.where_op(field, ComparisonOp::Eq, param)
    }

    pub fn where_ne(self, field: Field, param: Param) -> Self {
        self.where_op(field, ComparisonOp::Ne, param)
    }

    pub fn where_lt(self, field: Field, param: Param) -> Self {
        self.where_op(field, ComparisonOp::Lt, param)
    }

    pub fn where_le(self, field: Field, param: Param) -> Self {
        self.where_op(field, ComparisonOp::Le, param)
    }

    pub fn where_gt(self, field: Field, param: Param) -> Self {
        self.where_op(field, ComparisonOp::Gt, param)
    }

    pub fn where_ge(self, field: Field, param: Param) -> Self {
        self.where_op(field, ComparisonOp::Ge, param)
    }

    pub fn where_like(self, field: Field, param: Param) -> Self {
        self.where_op(field, ComparisonOp::Like, param)
    }

    pub fn where_in(self, field: Field, param: Param) -> Self {
        self.where_op(field, ComparisonOp::In, param)
    }

    pub fn where_not_in(self, field: Field, param: Param) -> Self {
        self.where_op(field, ComparisonOp::NotIn, param)
    }

    pub fn where_null(self, field: Field) -> Self {
        self.filter(Condition::is_null(field))
    }

    pub fn where_not_null(self, field: Field) -> Self {
        self.filter(Condition::is_not_null(field))
    }

    /// Compare two fields
    pub fn where_fields(self, left: Field, op: ComparisonOp, right: Field) -> Self {
        self.filter(Condition::FieldComparison { left, op, right })
    }

    /// AND a parenthesized group of conditions
    pub fn where_group(self, logic: LogicalOp, conditions: Vec<Condition>) -> Self {
        self.filter(Condition::Group { logic, conditions })
    }

    pub fn where_in_subquery(self, field: Field, query: QueryAst) -> Self {
        self.where_subquery(Some(field), SubqueryOp::In, query)
    }

    pub fn where_not_in_subquery(self, field: Field, query: QueryAst) -> Self {
        self.where_subquery(Some(field), SubqueryOp::NotIn, query)
    }

    pub fn where_exists(self, query: QueryAst) -> Self {
        self.where_subquery(None, SubqueryOp::Exists, query)
    }

    pub fn where_not_exists(self, query: QueryAst) -> Self {
        self.where_subquery(None, SubqueryOp::NotExists, query)
    }

    fn where_subquery(self, field: Option<Field>, op: SubqueryOp, query: QueryAst) -> Self {
        self.filter(Condition::Subquery {
            field,
            op,
            query: Box::new(query),
        })
    }

    // Writes

    /// Add one row of values to an INSERT
    pub fn values(self, row: Vec<(Field, Param)>) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Insert], "VALUES")?;
            let mut map = HashMap::with_capacity(row.len());
            for (field, param) in row {
                if map.contains_key(&field) {
                    return Err(QueryError::query(format!("field {} appears twice in a row", field)));
                }
                map.insert(field, param);
            }
            if map.is_empty() {
                return Err(QueryError::query("INSERT row must have at least one value"));
            }
            if !ast.values.is_empty() && ast.backend() != BackendKind::Relational {
                return Err(QueryError::unsupported(ast.backend(), "multi-row INSERT"));
            }
            ast.values.push(map);
            Ok(())
        })
    }

    /// Assign a field in an UPDATE
    pub fn set(self, field: Field, param: Param) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Update], "SET")?;
            if ast.updates.contains_key(&field) {
                return Err(QueryError::query(format!("field {} is assigned twice", field)));
            }
            ast.updates.insert(field, param);
            Ok(())
        })
    }

    pub fn set_many(self, assignments: Vec<(Field, Param)>) -> Self {
        assignments
            .into_iter()
            .fold(self, |builder, (field, param)| builder.set(field, param))
    }

    // Ordering and pagination

    pub fn order_by(self, field: Field, direction: SortDirection) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "ORDER BY")?;
            require_not_backend(ast, BackendKind::ObjectStore, "ORDER BY")?;
            ast.ordering.push(OrderBy { field, direction });
            Ok(())
        })
    }

    pub fn order_asc(self, field: Field) -> Self {
        self.order_by(field, SortDirection::Asc)
    }

    pub fn order_desc(self, field: Field) -> Self {
        self.order_by(field, SortDirection::Desc)
    }

    pub fn limit(self, limit: u64) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "LIMIT")?;
            ast.limit = Some(limit);
            Ok(())
        })
    }

    pub fn offset(self, offset: u64) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "OFFSET")?;
            require_not_backend(ast, BackendKind::ObjectStore, "OFFSET")?;
            ast.offset = Some(offset);
            Ok(())
        })
    }

    // Relational clauses

    pub fn distinct(self) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "DISTINCT")?;
            relational_ext(ast, "DISTINCT")?.distinct = true;
            Ok(())
        })
    }

    pub fn join(self, join_type: JoinType, table: Table, alias: Option<Alias>, on: Condition) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select, Operation::Count], "JOIN")?;
            let ext = relational_ext(ast, "JOIN")?;
            on.validate()?;
            ext.joins.push(Join {
                join_type,
                table,
                alias,
                on,
            });
            Ok(())
        })
    }

    pub fn inner_join(self, table: Table, on: Condition) -> Self {
        self.join(JoinType::Inner, table, None, on)
    }

    pub fn left_join(self, table: Table, on: Condition) -> Self {
        self.join(JoinType::Left, table, None, on)
    }

    pub fn group_by(self, fields: Vec<Field>) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "GROUP BY")?;
            relational_ext(ast, "GROUP BY")?.group_by.extend(fields);
            Ok(())
        })
    }

    pub fn having(self, condition: Condition) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "HAVING")?;
            condition.validate()?;
            relational_ext(ast, "HAVING")?
                .having
                .push(HavingClause::Condition(condition));
            Ok(())
        })
    }

    /// `HAVING func(field) op :param`
    pub fn having_aggregate(
        self,
        func: AggregateFunc,
        field: Option<Field>,
        op: ComparisonOp,
        param: Param,
    ) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "HAVING")?;
            if func.requires_field() && field.is_none() {
                return Err(QueryError::query("HAVING aggregate requires a field"));
            }
            if !op.is_scalar_comparison() {
                return Err(QueryError::query(format!(
                    "operator {} is not valid in a HAVING aggregate comparison",
                    op
                )));
            }
            relational_ext(ast, "HAVING")?.having.push(HavingClause::Aggregate {
                func,
                field,
                op,
                param,
            });
            Ok(())
        })
    }

    pub fn on_conflict(self, columns: Vec<Field>, action: ConflictAction) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Insert], "ON CONFLICT")?;
            if columns.is_empty() {
                return Err(QueryError::query("ON CONFLICT requires at least one column"));
            }
            let ext = relational_ext(ast, "ON CONFLICT")?;
            if ext.on_conflict.is_some() {
                return Err(QueryError::query("ON CONFLICT is already set"));
            }
            ext.on_conflict = Some(OnConflict {
                columns,
                action,
                updates: HashMap::new(),
            });
            Ok(())
        })
    }

    /// Explicit assignment for `ON CONFLICT ... DO UPDATE SET`
    pub fn on_conflict_set(self, field: Field, param: Param) -> Self {
        self.apply(|ast| {
            let ext = relational_ext(ast, "ON CONFLICT")?;
            match ext.on_conflict.as_mut() {
                Some(conflict) if conflict.action == ConflictAction::DoUpdate => {
                    if conflict.updates.contains_key(&field) {
                        return Err(QueryError::query(format!("field {} is assigned twice", field)));
                    }
                    conflict.updates.insert(field, param);
                    Ok(())
                }
                _ => Err(QueryError::query(
                    "conflict assignments require ON CONFLICT ... DO UPDATE",
                )),
            }
        })
    }

    pub fn returning(self, fields: Vec<Field>) -> Self {
        self.apply(|ast| {
            require_operation(
                ast,
                &[Operation::Insert, Operation::Update, Operation::Delete],
                "RETURNING",
            )?;
            relational_ext(ast, "RETURNING")?.returning.extend(fields);
            Ok(())
        })
    }

    // Key-value clauses

    pub fn ttl(self, param: Param) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Insert, Operation::Update], "TTL")?;
            key_value_ext(ast, "TTL")?.ttl = Some(param);
            Ok(())
        })
    }

    pub fn score(self, param: Param) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Insert, Operation::Update], "score")?;
            key_value_ext(ast, "score")?.score = Some(param);
            Ok(())
        })
    }

    // Search clauses

    pub fn highlight(self, fields: Vec<Field>) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "highlight")?;
            search_ext(ast, "highlight")?.highlight.extend(fields);
            Ok(())
        })
    }

    pub fn fragment_size(self, size: u32) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "highlight")?;
            search_ext(ast, "highlight")?.fragment_size = Some(size);
            Ok(())
        })
    }

    pub fn min_score(self, score: f64) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Select], "min_score")?;
            if !score.is_finite() || score < 0.0 {
                return Err(QueryError::query(format!(
                    "min_score must be a non-negative number, got {}",
                    score
                )));
            }
            search_ext(ast, "min_score")?.min_score = Some(score);
            Ok(())
        })
    }

    // Object-store clauses

    pub fn content(self, param: Param) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Insert], "content")?;
            object_store_ext(ast, "content")?.content = Some(param);
            Ok(())
        })
    }

    pub fn event_types(self, events: Vec<EventType>) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Listen, Operation::Unlisten], "event types")?;
            object_store_ext(ast, "event types")?.event_types.extend(events);
            Ok(())
        })
    }

    // Notifications

    pub fn notify_payload(self, param: Param) -> Self {
        self.apply(|ast| {
            require_operation(ast, &[Operation::Notify], "notify payload")?;
            ast.notify_payload = Some(param);
            Ok(())
        })
    }

    /// Finish the query, returning the first latched error or the first
    /// violated cross-field invariant.
    pub fn build(self) -> Result<QueryAst> {
        match self.state {
            BuilderState::Errored(err) => Err(err),
            BuilderState::Open(ast) => {
                ast.validate()?;
                Ok(ast)
            }
        }
    }

    /// Build, panicking on any error.
    pub fn must_build(self) -> QueryAst {
        match self.build() {
            Ok(ast) => ast,
            Err(err) => panic!("query construction failed: {}", err),
        }
    }
}

fn require_operation(ast: &QueryAst, allowed: &[Operation], clause: &str) -> Result<()> {
    if allowed.contains(&ast.operation) {
        Ok(())
    } else {
        Err(QueryError::query(format!("{} is not valid on {}", clause, ast.operation)))
    }
}

fn require_not_backend(ast: &QueryAst, backend: BackendKind, clause: &str) -> Result<()> {
    if ast.backend() == backend {
        Err(QueryError::unsupported(backend, clause))
    } else {
        Ok(())
    }
}

fn relational_ext<'a>(ast: &'a mut QueryAst, clause: &str) -> Result<&'a mut RelationalExt> {
    let backend = ast.backend();
    match &mut ast.extension {
        Extension::Relational(ext) => Ok(ext),
        _ => Err(QueryError::unsupported(backend, clause)),
    }
}

fn key_value_ext<'a>(ast: &'a mut QueryAst, clause: &str) -> Result<&'a mut KeyValueExt> {
    let backend = ast.backend();
    match &mut ast.extension {
        Extension::KeyValue(ext) => Ok(ext),
        _ => Err(QueryError::unsupported(backend, clause)),
    }
}

fn search_ext<'a>(ast: &'a mut QueryAst, clause: &str) -> Result<&'a mut SearchExt> {
    let backend = ast.backend();
    match &mut ast.extension {
        Extension::Search(ext) => Ok(ext),
        _ => Err(QueryError::unsupported(backend, clause)),
    }
}

fn object_store_ext<'a>(ast: &'a mut QueryAst, clause: &str) -> Result<&'a mut ObjectStoreExt> {
    let backend = ast.backend();
    match &mut ast.extension {
        Extension::ObjectStore(ext) => Ok(ext),
        _ => Err(QueryError::unsupported(backend, clause)),
    }
}
