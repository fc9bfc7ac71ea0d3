use crate::ast::{HavingClause, Operation, QueryAst, RelationalExt};
use crate::backend::{
    check_ast, sorted_entries, BackendKind, QueryMetadata, QueryRenderer, RenderedQuery,
    ResultField, ResultShape,
};
use crate::condition::{Condition, Expression, Operand, Selection};
use crate::context::{ParamSet, RenderContext};
use crate::error::{QueryError, Result};
use crate::operators::{ComparisonOp, ConflictAction, SubqueryOp};
use crate::schema::{Field, Registry};
use std::cell::RefCell;
use std::sync::Arc;

/// PostgreSQL renderer.
///
/// Emits SQL text with `:name` placeholders. Identifiers are written
/// unquoted; they are guaranteed to match `[A-Za-z_][A-Za-z0-9_]*`.
#[derive(Debug, Clone, Default)]
pub struct PostgresRenderer {
    registry: Option<Arc<Registry>>,
}

impl PostgresRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a registry so result metadata carries field types.
    pub fn with_registry(registry: Arc<Registry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    fn relational_ext(ast: &QueryAst) -> Result<&RelationalExt> {
        match ast.extension() {
            crate::ast::Extension::Relational(ext) => Ok(ext),
            _ => Err(QueryError::query(format!(
                "query was built for the {} backend, not relational",
                ast.backend()
            ))),
        }
    }

    fn render_statement(&self, ast: &QueryAst, ctx: &RenderContext<'_>) -> Result<String> {
        let ext = Self::relational_ext(ast)?;
        match ast.operation() {
            Operation::Select => render_select(ast, ext, ctx),
            Operation::Count => render_count(ast, ext, ctx),
            Operation::Insert => render_insert(ast, ext, ctx),
            Operation::Update => render_update(ast, ext, ctx),
            Operation::Delete => render_delete(ast, ext, ctx),
            Operation::Listen => Ok(format!("LISTEN {}", ast.channel())),
            Operation::Unlisten => Ok(format!("UNLISTEN {}", ast.channel())),
            Operation::Notify => Ok(match &ast.notify_payload {
                Some(payload) => format!("NOTIFY {}, {}", ast.channel(), ctx.placeholder(payload)),
                None => format!("NOTIFY {}", ast.channel()),
            }),
        }
    }

    fn result_field(&self, ast: &QueryAst, ext: &RelationalExt, name: String, source: Option<&Field>) -> ResultField {
        let metadata = match (&self.registry, source) {
            (Some(registry), Some(field)) => std::iter::once(ast.target())
                .chain(ext.joins.iter().map(|j| &j.table))
                .find_map(|table| registry.field_metadata(table.name(), field.name()))
                .cloned(),
            _ => None,
        };
        ResultField { name, metadata }
    }

    fn metadata(&self, ast: &QueryAst) -> Result<QueryMetadata> {
        let ext = Self::relational_ext(ast)?;
        let op = ast.operation();
        let shape = match op {
            Operation::Select => ResultShape::Rows,
            Operation::Count => ResultShape::Count,
            Operation::Insert | Operation::Update | Operation::Delete if !ext.returning.is_empty() => {
                ResultShape::Rows
            }
            Operation::Insert | Operation::Update | Operation::Delete => ResultShape::Affected,
            Operation::Listen | Operation::Unlisten => ResultShape::Subscription,
            Operation::Notify => ResultShape::Acknowledged,
        };
        let mut metadata = QueryMetadata::new(ast, shape);

        if op == Operation::Select && !ast.projection().is_empty() {
            metadata.returned_fields = Some(
                ast.projection()
                    .iter()
                    .enumerate()
                    .map(|(i, selection)| {
                        let name = selection.output_name().unwrap_or_else(|| format!("column{}", i + 1));
                        let source = match &selection.expr {
                            Expression::Field(field) => Some(field),
                            _ => None,
                        };
                        self.result_field(ast, ext, name, source)
                    })
                    .collect(),
            );
        }
        if !ext.returning.is_empty() {
            metadata.returned_fields = Some(
                ext.returning
                    .iter()
                    .map(|field| self.result_field(ast, ext, field.name().to_string(), Some(field)))
                    .collect(),
            );
        }

        match op {
            Operation::Insert => {
                if let Some(row) = ast.values.first() {
                    let mut columns: Vec<String> = row.keys().map(|f| f.name().to_string()).collect();
                    columns.sort();
                    metadata.modified_fields = Some(columns);
                }
            }
            Operation::Update => {
                metadata.modified_fields = Some(
                    sorted_entries(&ast.updates)
                        .into_iter()
                        .map(|(field, _)| field.name().to_string())
                        .collect(),
                );
            }
            _ => {}
        }

        Ok(metadata)
    }
}

impl QueryRenderer for PostgresRenderer {
    fn backend(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn render(&self, ast: &QueryAst) -> Result<RenderedQuery> {
        check_ast(BackendKind::Relational, ast)?;
        tracing::debug!(operation = %ast.operation(), table = %ast.target(), "rendering relational query");

        let params = RefCell::new(ParamSet::new());
        let ctx = RenderContext::new(&params);
        let sql = self.render_statement(ast, &ctx)?;
        let metadata = self.metadata(ast)?;

        Ok(RenderedQuery {
            representation: sql,
            required_params: params.into_inner().into_names(),
            metadata,
        })
    }
}

fn render_select(ast: &QueryAst, ext: &RelationalExt, ctx: &RenderContext<'_>) -> Result<String> {
    let mut sql = String::from("SELECT ");

    if ext.distinct {
        sql.push_str("DISTINCT ");
    }

    if ast.projection().is_empty() {
        sql.push('*');
    } else {
        let columns = ast
            .projection()
            .iter()
            .map(|selection| render_selection(selection, ctx))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&columns.join(", "));
    }

    sql.push_str(&format!(" FROM {}", ast.target()));
    push_joins(&mut sql, ext, ctx)?;
    push_where(&mut sql, ast, ctx)?;

    if !ext.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&join_fields(&ext.group_by));
    }

    if !ext.having.is_empty() {
        let clauses = ext
            .having
            .iter()
            .map(|clause| render_having(clause, ctx))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(" HAVING ");
        sql.push_str(&clauses.join(" AND "));
    }

    if !ast.ordering.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(
            &ast.ordering
                .iter()
                .map(|o| format!("{} {}", o.field, o.direction))
                .collect::<Vec<_>>()
                .join(", "),
        );
    }

    if let Some(limit) = ast.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    if let Some(offset) = ast.offset {
        sql.push_str(&format!(" OFFSET {}", offset));
    }

    Ok(sql)
}

fn render_count(ast: &QueryAst, ext: &RelationalExt, ctx: &RenderContext<'_>) -> Result<String> {
    let mut sql = format!("SELECT COUNT(*) FROM {}", ast.target());
    push_joins(&mut sql, ext, ctx)?;
    push_where(&mut sql, ast, ctx)?;
    Ok(sql)
}

fn render_insert(ast: &QueryAst, ext: &RelationalExt, ctx: &RenderContext<'_>) -> Result<String> {
    let first = ast
        .values
        .first()
        .ok_or_else(|| QueryError::query("INSERT must have at least one row of values"))?;
    let mut columns: Vec<&Field> = first.keys().collect();
    columns.sort();

    let mut rows = Vec::with_capacity(ast.values.len());
    for row in &ast.values {
        let placeholders = columns
            .iter()
            .map(|column| {
                row.get(*column)
                    .map(|param| ctx.placeholder(param))
                    .ok_or_else(|| QueryError::query(format!("INSERT row is missing column {}", column)))
            })
            .collect::<Result<Vec<_>>>()?;
        rows.push(format!("({})", placeholders.join(", ")));
    }

    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        ast.target(),
        column_list(columns.iter().copied())?,
        rows.join(", ")
    );

    if let Some(conflict) = &ext.on_conflict {
        sql.push_str(&format!(" ON CONFLICT ({})", column_list(conflict.columns.iter())?));
        match conflict.action {
            ConflictAction::DoNothing => sql.push_str(" DO NOTHING"),
            ConflictAction::DoUpdate => {
                let assignments: Vec<String> = if conflict.updates.is_empty() {
                    columns
                        .iter()
                        .filter(|column| !conflict.columns.iter().any(|c| c.name() == column.name()))
                        .map(|column| format!("{} = EXCLUDED.{}", column.name(), column.name()))
                        .collect()
                } else {
                    sorted_entries(&conflict.updates)
                        .into_iter()
                        .map(|(field, param)| format!("{} = {}", field.name(), ctx.placeholder(param)))
                        .collect()
                };
                if assignments.is_empty() {
                    return Err(QueryError::query(
                        "ON CONFLICT DO UPDATE has no columns to update",
                    ));
                }
                sql.push_str(" DO UPDATE SET ");
                sql.push_str(&assignments.join(", "));
            }
        }
    }

    push_returning(&mut sql, ext);
    Ok(sql)
}

fn render_update(ast: &QueryAst, ext: &RelationalExt, ctx: &RenderContext<'_>) -> Result<String> {
    if ast.updates.is_empty() {
        return Err(QueryError::query("UPDATE must have at least one SET value"));
    }

    let set_clauses: Vec<String> = sorted_entries(&ast.updates)
        .into_iter()
        .map(|(field, param)| format!("{} = {}", field.name(), ctx.placeholder(param)))
        .collect();

    let mut sql = format!("UPDATE {} SET {}", ast.target(), set_clauses.join(", "));
    push_where(&mut sql, ast, ctx)?;
    push_returning(&mut sql, ext);
    Ok(sql)
}

fn render_delete(ast: &QueryAst, ext: &RelationalExt, ctx: &RenderContext<'_>) -> Result<String> {
    let mut sql = format!("DELETE FROM {}", ast.target());
    push_where(&mut sql, ast, ctx)?;
    push_returning(&mut sql, ext);
    Ok(sql)
}

fn push_joins(sql: &mut String, ext: &RelationalExt, ctx: &RenderContext<'_>) -> Result<()> {
    for join in &ext.joins {
        sql.push_str(&format!(" {} {}", join.join_type, join.table));
        if let Some(alias) = &join.alias {
            sql.push_str(&format!(" {}", alias));
        }
        sql.push_str(" ON ");
        sql.push_str(&render_condition(&join.on, ctx)?);
    }
    Ok(())
}

fn push_where(sql: &mut String, ast: &QueryAst, ctx: &RenderContext<'_>) -> Result<()> {
    if let Some(filter) = ast.filter() {
        sql.push_str(" WHERE ");
        sql.push_str(&render_condition(filter, ctx)?);
    }
    Ok(())
}

fn push_returning(sql: &mut String, ext: &RelationalExt) {
    if !ext.returning.is_empty() {
        sql.push_str(" RETURNING ");
        sql.push_str(&join_fields(&ext.returning));
    }
}

/// Bare column names; a target column list cannot be qualified.
fn column_list<'f>(fields: impl Iterator<Item = &'f Field>) -> Result<String> {
    let mut names: Vec<&str> = Vec::new();
    for field in fields {
        if names.contains(&field.name()) {
            return Err(QueryError::query(format!("column {} is listed twice", field.name())));
        }
        names.push(field.name());
    }
    Ok(names.join(", "))
}

fn join_fields(fields: &[Field]) -> String {
    fields.iter().map(|f| f.to_string()).collect::<Vec<_>>().join(", ")
}

fn render_condition(condition: &Condition, ctx: &RenderContext<'_>) -> Result<String> {
    match condition {
        Condition::Simple { field, op, param } => {
            if op.is_null_check() {
                return Ok(format!("{} {}", field, op));
            }
            if *op == ComparisonOp::Match {
                return Err(QueryError::unsupported(BackendKind::Relational, "MATCH operator"));
            }
            let param = param.as_ref().ok_or_else(|| {
                QueryError::query(format!("operator {} on field {} requires a parameter", op, field))
            })?;
            if op.is_membership() {
                Ok(format!("{} {} ({})", field, op, ctx.placeholder(param)))
            } else {
                Ok(format!("{} {} {}", field, op, ctx.placeholder(param)))
            }
        }
        Condition::FieldComparison { left, op, right } => Ok(format!("{} {} {}", left, op, right)),
        Condition::Group { logic, conditions } => {
            let parts = conditions
                .iter()
                .map(|c| render_condition(c, ctx))
                .collect::<Result<Vec<_>>>()?;
            match parts.len() {
                0 => Err(QueryError::query(format!("empty {} group", logic))),
                1 => Ok(parts.into_iter().next().unwrap_or_default()),
                _ => Ok(format!("({})", parts.join(&format!(" {} ", logic)))),
            }
        }
        Condition::Subquery { field, op, query } => {
            let child = ctx.child()?;
            let ext = PostgresRenderer::relational_ext(query)?;
            let inner = render_select(query, ext, &child)?;
            match (op, field) {
                (SubqueryOp::In | SubqueryOp::NotIn, Some(field)) => {
                    Ok(format!("{} {} ({})", field, op, inner))
                }
                (SubqueryOp::Exists | SubqueryOp::NotExists, None) => Ok(format!("{} ({})", op, inner)),
                _ => Err(QueryError::query(format!("malformed {} subquery", op))),
            }
        }
    }
}

fn render_having(clause: &HavingClause, ctx: &RenderContext<'_>) -> Result<String> {
    match clause {
        HavingClause::Condition(condition) => render_condition(condition, ctx),
        HavingClause::Aggregate {
            func,
            field,
            op,
            param,
        } => {
            let column = field.as_ref().map(|f| f.to_string());
            Ok(format!("{} {} {}", func.to_sql(column.as_deref()), op, ctx.placeholder(param)))
        }
    }
}

fn render_selection(selection: &Selection, ctx: &RenderContext<'_>) -> Result<String> {
    let expr = render_expression(&selection.expr, ctx)?;
    Ok(match &selection.alias {
        Some(alias) => format!("{} AS {}", expr, alias),
        None => expr,
    })
}

fn render_expression(expr: &Expression, ctx: &RenderContext<'_>) -> Result<String> {
    match expr {
        Expression::Field(field) => Ok(field.to_string()),
        Expression::Aggregate { func, field } => {
            let column = field.as_ref().map(|f| f.to_string());
            Ok(func.to_sql(column.as_deref()))
        }
        Expression::Case { whens, otherwise } => {
            let mut sql = String::from("CASE");
            for (condition, param) in whens {
                sql.push_str(&format!(
                    " WHEN {} THEN {}",
                    render_condition(condition, ctx)?,
                    ctx.placeholder(param)
                ));
            }
            if let Some(param) = otherwise {
                sql.push_str(&format!(" ELSE {}", ctx.placeholder(param)));
            }
            sql.push_str(" END");
            Ok(sql)
        }
        Expression::Coalesce { fields, default } => {
            let mut args: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
            if let Some(param) = default {
                args.push(ctx.placeholder(param));
            }
            Ok(format!("COALESCE({})", args.join(", ")))
        }
        Expression::Math { func, field, arg } => Ok(match arg {
            Some(param) => format!("{}({}, {})", func, field, ctx.placeholder(param)),
            None => format!("{}({})", func, field),
        }),
        Expression::Arithmetic { left, op, right } => {
            let right = match right {
                Operand::Field(field) => field.to_string(),
                Operand::Param(param) => ctx.placeholder(param),
            };
            Ok(format!("({} {} {})", left, op, right))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::QueryBuilder;
    use crate::operators::{AggregateFunc, ArithmeticOp, JoinType, LogicalOp, MathFunction};
    use crate::schema::{Alias, Param, SqlType};

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_table(
                "users",
                vec![
                    ("id", SqlType::BigInt, false),
                    ("name", SqlType::Text, false),
                    ("email", SqlType::Text, true),
                    ("age", SqlType::Integer, false),
                    ("score", SqlType::Integer, false),
                ],
            )
            .unwrap();
        registry
            .register_table(
                "orders",
                vec![
                    ("id", SqlType::BigInt, false),
                    ("user_id", SqlType::BigInt, false),
                    ("total", SqlType::DoublePrecision, false),
                    ("status", SqlType::Text, false),
                ],
            )
            .unwrap();
        registry
    }

    fn select(r: &Registry, table: &str) -> QueryBuilder {
        QueryBuilder::select(BackendKind::Relational, r.must_table(table))
    }

    fn render(builder: QueryBuilder) -> RenderedQuery {
        PostgresRenderer::new().render(&builder.must_build()).unwrap()
    }

    #[test]
    fn test_select_where_limit() {
        let r = registry();
        let out = render(
            select(&r, "users")
                .where_eq(r.must_field("users", "name"), Param::must("p"))
                .limit(10),
        );

        assert_eq!(out.representation, "SELECT * FROM users WHERE name = :p LIMIT 10");
        assert_eq!(out.required_params, vec!["p"]);
        assert_eq!(out.metadata.result_shape, ResultShape::Rows);
        assert_eq!(out.metadata.returned_fields, None);
    }

    #[test]
    fn test_select_columns_order_offset() {
        let r = registry();
        let out = render(
            select(&r, "users")
                .fields(vec![r.must_field("users", "id"), r.must_field("users", "name")])
                .order_desc(r.must_field("users", "score"))
                .order_asc(r.must_field("users", "name"))
                .limit(20)
                .offset(40),
        );

        assert_eq!(
            out.representation,
            "SELECT id, name FROM users ORDER BY score DESC, name ASC LIMIT 20 OFFSET 40"
        );
        assert!(out.required_params.is_empty());
    }

    #[test]
    fn test_select_where_multiple() {
        let r = registry();
        let out = render(
            select(&r, "users")
                .where_eq(r.must_field("users", "age"), Param::must("age"))
                .where_gt(r.must_field("users", "score"), Param::must("min_score"))
                .where_null(r.must_field("users", "email")),
        );

        assert_eq!(
            out.representation,
            "SELECT * FROM users WHERE (age = :age AND score > :min_score AND email IS NULL)"
        );
        assert_eq!(out.required_params, vec!["age", "min_score"]);
    }

    #[test]
    fn test_null_check_param_not_required() {
        let r = registry();
        let out = render(select(&r, "users").filter(Condition::Simple {
            field: r.must_field("users", "email"),
            op: ComparisonOp::IsNotNull,
            param: Some(Param::must("ignored")),
        }));

        assert_eq!(out.representation, "SELECT * FROM users WHERE email IS NOT NULL");
        assert!(out.required_params.is_empty());
    }

    #[test]
    fn test_nested_groups() {
        let r = registry();
        let or = Condition::or(vec![
            Condition::eq(r.must_field("users", "name"), Param::must("a")),
            Condition::simple(r.must_field("users", "name"), ComparisonOp::Like, Param::must("b")).unwrap(),
        ])
        .unwrap();
        let out = render(
            select(&r, "users")
                .where_in(r.must_field("users", "id"), Param::must("ids"))
                .filter(or),
        );

        assert_eq!(
            out.representation,
            "SELECT * FROM users WHERE (id IN (:ids) AND (name = :a OR name LIKE :b))"
        );
        assert_eq!(out.required_params, vec!["ids", "a", "b"]);
    }

    #[test]
    fn test_or_filter() {
        let r = registry();
        let out = render(
            select(&r, "users")
                .where_eq(r.must_field("users", "name"), Param::must("a"))
                .or_filter(Condition::eq(r.must_field("users", "email"), Param::must("b"))),
        );
        assert_eq!(out.representation, "SELECT * FROM users WHERE (name = :a OR email = :b)");
    }

    #[test]
    fn test_match_rejected() {
        let r = registry();
        let ast = select(&r, "users")
            .where_op(r.must_field("users", "name"), ComparisonOp::Match, Param::must("q"))
            .must_build();
        let err = PostgresRenderer::new().render(&ast).unwrap_err();
        assert_eq!(
            err,
            QueryError::Unsupported {
                backend: BackendKind::Relational,
                reason: "MATCH operator".into(),
            }
        );
    }

    #[test]
    fn test_join_group_having() {
        let r = registry();
        let on = Condition::fields(
            r.must_qualified_field("u", "users", "id"),
            ComparisonOp::Eq,
            r.must_qualified_field("o", "orders", "user_id"),
        )
        .unwrap();
        let out = render(
            QueryBuilder::select(BackendKind::Relational, r.must_table("users"))
                .field(r.must_qualified_field("u", "users", "name"))
                .aggregate(
                    AggregateFunc::Sum,
                    Some(r.must_qualified_field("o", "orders", "total")),
                    Some(Alias::must("spent")),
                )
                .join(JoinType::Left, r.must_table("orders"), Some(Alias::must("o")), on)
                .where_eq(r.must_qualified_field("o", "orders", "status"), Param::must("status"))
                .group_by(vec![r.must_qualified_field("u", "users", "name")])
                .having_aggregate(
                    AggregateFunc::Count,
                    None,
                    ComparisonOp::Ge,
                    Param::must("min_orders"),
                ),
        );

        assert_eq!(
            out.representation,
            "SELECT u.name, SUM(o.total) AS spent FROM users LEFT JOIN orders o ON u.id = o.user_id \
             WHERE o.status = :status GROUP BY u.name HAVING COUNT(*) >= :min_orders"
        );
        assert_eq!(out.required_params, vec!["status", "min_orders"]);
    }

    #[test]
    fn test_distinct_and_expressions() {
        let r = registry();
        let case = Expression::Case {
            whens: vec![(
                Condition::simple(r.must_field("users", "score"), ComparisonOp::Ge, Param::must("gold")).unwrap(),
                Param::must("gold_label"),
            )],
            otherwise: Some(Param::must("default_label")),
        };
        let out = render(
            select(&r, "users")
                .distinct()
                .select_expr(case, Some(Alias::must("tier")))
                .select_expr(
                    Expression::Coalesce {
                        fields: vec![r.must_field("users", "email"), r.must_field("users", "name")],
                        default: None,
                    },
                    Some(Alias::must("contact")),
                )
                .select_expr(
                    Expression::Math {
                        func: MathFunction::Round,
                        field: r.must_field("users", "score"),
                        arg: Some(Param::must("digits")),
                    },
                    None,
                )
                .select_expr(
                    Expression::Arithmetic {
                        left: r.must_field("users", "age"),
                        op: ArithmeticOp::Mul,
                        right: Operand::Param(Param::must("factor")),
                    },
                    Some(Alias::must("scaled")),
                ),
        );

        assert_eq!(
            out.representation,
            "SELECT DISTINCT CASE WHEN score >= :gold THEN :gold_label ELSE :default_label END AS tier, \
             COALESCE(email, name) AS contact, ROUND(score, :digits), (age * :factor) AS scaled FROM users"
        );
        assert_eq!(
            out.required_params,
            vec!["gold", "gold_label", "default_label", "digits", "factor"]
        );
        let names: Vec<String> = out
            .metadata
            .returned_fields
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["tier", "contact", "column3", "scaled"]);
    }

    #[test]
    fn test_insert_sorted_columns() {
        let r = registry();
        let ast = QueryBuilder::insert(BackendKind::Relational, r.must_table("users"))
            .values(vec![
                (r.must_field("users", "name"), Param::must("name")),
                (r.must_field("users", "email"), Param::must("email")),
                (r.must_field("users", "age"), Param::must("age")),
            ])
            .returning(vec![r.must_field("users", "id")])
            .must_build();
        let out = PostgresRenderer::new().render(&ast).unwrap();

        assert_eq!(
            out.representation,
            "INSERT INTO users (age, email, name) VALUES (:age, :email, :name) RETURNING id"
        );
        assert_eq!(out.required_params, vec!["age", "email", "name"]);
        assert_eq!(out.metadata.result_shape, ResultShape::Rows);
        assert_eq!(
            out.metadata.modified_fields,
            Some(vec!["age".to_string(), "email".to_string(), "name".to_string()])
        );
    }

    #[test]
    fn test_insert_multi_row() {
        let r = registry();
        let out = render(
            QueryBuilder::insert(BackendKind::Relational, r.must_table("users"))
                .values(vec![
                    (r.must_field("users", "name"), Param::must("name1")),
                    (r.must_field("users", "age"), Param::must("age1")),
                ])
                .values(vec![
                    (r.must_field("users", "age"), Param::must("age2")),
                    (r.must_field("users", "name"), Param::must("name2")),
                ]),
        );
        assert_eq!(
            out.representation,
            "INSERT INTO users (age, name) VALUES (:age1, :name1), (:age2, :name2)"
        );
        assert_eq!(out.metadata.result_shape, ResultShape::Affected);
    }

    #[test]
    fn test_insert_on_conflict() {
        let r = registry();
        let base = || {
            QueryBuilder::insert(BackendKind::Relational, r.must_table("users")).values(vec![
                (r.must_field("users", "id"), Param::must("id")),
                (r.must_field("users", "score"), Param::must("score")),
                (r.must_field("users", "name"), Param::must("name")),
            ])
        };

        let nothing = render(base().on_conflict(vec![r.must_field("users", "id")], ConflictAction::DoNothing));
        assert_eq!(
            nothing.representation,
            "INSERT INTO users (id, name, score) VALUES (:id, :name, :score) ON CONFLICT (id) DO NOTHING"
        );

        let excluded = render(base().on_conflict(vec![r.must_field("users", "id")], ConflictAction::DoUpdate));
        assert_eq!(
            excluded.representation,
            "INSERT INTO users (id, name, score) VALUES (:id, :name, :score) \
             ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, score = EXCLUDED.score"
        );

        let explicit = render(
            base()
                .on_conflict(vec![r.must_field("users", "id")], ConflictAction::DoUpdate)
                .on_conflict_set(r.must_field("users", "score"), Param::must("new_score"))
                .on_conflict_set(r.must_field("users", "name"), Param::must("new_name")),
        );
        assert_eq!(
            explicit.representation,
            "INSERT INTO users (id, name, score) VALUES (:id, :name, :score) \
             ON CONFLICT (id) DO UPDATE SET name = :new_name, score = :new_score"
        );
        assert_eq!(
            explicit.required_params,
            vec!["id", "name", "score", "new_name", "new_score"]
        );
    }

    #[test]
    fn test_insert_columns_unqualified() {
        let r = registry();
        let out = render(
            QueryBuilder::insert(BackendKind::Relational, r.must_table("users"))
                .values(vec![
                    (r.must_qualified_field("users", "users", "name"), Param::must("n")),
                    (r.must_qualified_field("users", "users", "id"), Param::must("id")),
                ])
                .on_conflict(
                    vec![r.must_qualified_field("users", "users", "id")],
                    ConflictAction::DoUpdate,
                ),
        );
        assert_eq!(
            out.representation,
            "INSERT INTO users (id, name) VALUES (:id, :n) ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name"
        );
    }

    #[test]
    fn test_insert_column_listed_twice() {
        let r = registry();
        let ast = QueryBuilder::insert(BackendKind::Relational, r.must_table("users"))
            .values(vec![
                (r.must_field("users", "name"), Param::must("a")),
                (r.must_qualified_field("users", "users", "name"), Param::must("b")),
            ])
            .must_build();
        let err = PostgresRenderer::new().render(&ast).unwrap_err();
        assert!(err.to_string().contains("column name is listed twice"));
    }

    #[test]
    fn test_update_and_delete() {
        let r = registry();
        let update = render(
            QueryBuilder::update(BackendKind::Relational, r.must_table("users"))
                .set(r.must_field("users", "score"), Param::must("score"))
                .set(r.must_field("users", "name"), Param::must("name"))
                .where_eq(r.must_field("users", "id"), Param::must("id")),
        );
        assert_eq!(
            update.representation,
            "UPDATE users SET name = :name, score = :score WHERE id = :id"
        );
        assert_eq!(update.required_params, vec!["name", "score", "id"]);
        assert_eq!(
            update.metadata.modified_fields,
            Some(vec!["name".to_string(), "score".to_string()])
        );

        let delete = render(
            QueryBuilder::delete(BackendKind::Relational, r.must_table("users"))
                .where_lt(r.must_field("users", "age"), Param::must("age"))
                .returning(vec![r.must_field("users", "id"), r.must_field("users", "name")]),
        );
        assert_eq!(
            delete.representation,
            "DELETE FROM users WHERE age < :age RETURNING id, name"
        );
    }

    #[test]
    fn test_count_with_join() {
        let r = registry();
        let on = Condition::fields(
            r.must_qualified_field("users", "users", "id"),
            ComparisonOp::Eq,
            r.must_qualified_field("orders", "orders", "user_id"),
        )
        .unwrap();
        let out = render(
            QueryBuilder::count(BackendKind::Relational, r.must_table("users"))
                .inner_join(r.must_table("orders"), on)
                .where_gt(r.must_qualified_field("orders", "orders", "total"), Param::must("total")),
        );
        assert_eq!(
            out.representation,
            "SELECT COUNT(*) FROM users INNER JOIN orders ON users.id = orders.user_id WHERE orders.total > :total"
        );
        assert_eq!(out.metadata.result_shape, ResultShape::Count);
    }

    #[test]
    fn test_listen_notify_unlisten() {
        let r = registry();
        let table = || r.must_table("users");
        assert_eq!(
            render(QueryBuilder::listen(BackendKind::Relational, table())).representation,
            "LISTEN users_changes"
        );
        assert_eq!(
            render(QueryBuilder::unlisten(BackendKind::Relational, table())).representation,
            "UNLISTEN users_changes"
        );
        assert_eq!(
            render(QueryBuilder::notify(BackendKind::Relational, table())).representation,
            "NOTIFY users_changes"
        );
        let notify = render(
            QueryBuilder::notify(BackendKind::Relational, table()).notify_payload(Param::must("payload")),
        );
        assert_eq!(notify.representation, "NOTIFY users_changes, :payload");
        assert_eq!(notify.required_params, vec!["payload"]);
        assert_eq!(notify.metadata.result_shape, ResultShape::Acknowledged);
    }

    #[test]
    fn test_subquery_in_and_exists() {
        let r = registry();
        let sub = select(&r, "orders")
            .field(r.must_field("orders", "user_id"))
            .where_eq(r.must_field("orders", "status"), Param::must("status"))
            .must_build();
        let out = render(
            select(&r, "users")
                .where_eq(r.must_field("users", "name"), Param::must("status"))
                .where_in_subquery(r.must_field("users", "id"), sub.clone()),
        );
        assert_eq!(
            out.representation,
            "SELECT * FROM users WHERE (name = :status AND id IN \
             (SELECT user_id FROM orders WHERE status = :sq1_status))"
        );
        assert_eq!(out.required_params, vec!["status", "sq1_status"]);

        let out = render(select(&r, "users").where_not_exists(sub));
        assert_eq!(
            out.representation,
            "SELECT * FROM users WHERE NOT EXISTS (SELECT user_id FROM orders WHERE status = :sq1_status)"
        );
    }

    fn nested(r: &Registry, levels: usize) -> QueryAst {
        let mut query = select(r, "orders")
            .field(r.must_field("orders", "user_id"))
            .where_eq(r.must_field("orders", "id"), Param::must("x"))
            .must_build();
        for _ in 1..levels {
            query = select(r, "orders")
                .field(r.must_field("orders", "user_id"))
                .where_in_subquery(r.must_field("orders", "id"), query)
                .must_build();
        }
        select(r, "users")
            .where_in_subquery(r.must_field("users", "id"), query)
            .must_build()
    }

    #[test]
    fn test_subquery_depth_three_allowed() {
        let r = registry();
        let out = PostgresRenderer::new().render(&nested(&r, 3)).unwrap();
        assert_eq!(out.required_params, vec!["sq3_x"]);
        assert!(out.representation.contains("id = :sq3_x"));
    }

    #[test]
    fn test_subquery_depth_exceeded() {
        let r = registry();
        let err = PostgresRenderer::new().render(&nested(&r, 4)).unwrap_err();
        assert_eq!(err, QueryError::DepthExceeded { depth: 4, max: 3 });
    }

    #[test]
    fn test_registry_metadata() {
        let r = Arc::new(registry());
        let ast = select(&r, "users")
            .fields(vec![r.must_field("users", "email")])
            .must_build();
        let out = PostgresRenderer::with_registry(r.clone()).render(&ast).unwrap();
        let fields = out.metadata.returned_fields.unwrap();
        let meta = fields[0].metadata.as_ref().unwrap();
        assert_eq!(meta.sql_type, SqlType::Text);
        assert!(meta.nullable);
    }

    #[test]
    fn test_rejects_foreign_ast() {
        let r = registry();
        let ast = QueryBuilder::select(BackendKind::Search, r.must_table("users")).must_build();
        assert!(PostgresRenderer::new().render(&ast).is_err());
    }

    #[test]
    fn test_group_logic_single_child() {
        let r = registry();
        let out = render(select(&r, "users").where_group(
            LogicalOp::Or,
            vec![Condition::eq(r.must_field("users", "id"), Param::must("id"))],
        ));
        assert_eq!(out.representation, "SELECT * FROM users WHERE id = :id");
    }
}
