//! Declarative query documents.
//!
//! A [`QueryDocument`] is the serde form of a query, loaded from JSON or
//! YAML. Documents never become an AST directly: [`QueryDocument::to_builder`]
//! replays them as builder calls, with every name passing through the
//! registry and every keyword through the `valid_*` allowlists. Resolution
//! failures latch into the builder like any other error.

use crate::ast::{valid_operation, QueryAst};
use crate::backend::BackendKind;
use crate::builder::QueryBuilder;
use crate::condition::{Condition, Expression};
use crate::error::{QueryError, Result};
use crate::operators::{
    valid_aggregate, valid_conflict_action, valid_direction, valid_event_type, valid_join_type,
    valid_logic, valid_math_function, valid_operator, valid_subquery_operator, JoinType,
};
use crate::schema::{Alias, Field, Param, Registry, Table};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One WHERE / ON / HAVING / CASE condition.
///
/// Exactly one shape is used: `field` + `operator` [+ `param`],
/// `left_field` + `operator` + `right_field`, `logic` + `conditions`, or
/// `subquery` with an optional `field` and `operator`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subquery: Option<Box<QueryDocument>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrderDoc {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinDoc {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub join_type: Option<String>,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub on: ConditionDoc,
}

/// HAVING entry: an aggregate comparison or a plain condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HavingDoc {
    Aggregate {
        function: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        operator: String,
        param: String,
    },
    Condition(ConditionDoc),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OnConflictDoc {
    pub columns: Vec<String>,
    pub action: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updates: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregateDoc {
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WhenDoc {
    pub condition: ConditionDoc,
    pub then: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseDoc {
    pub whens: Vec<WhenDoc>,
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoalesceDoc {
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MathDoc {
    pub function: String,
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Serializable description of a query. Field references are `name` for the
/// main table or `qualifier.name`, where the qualifier is a table name or a
/// join alias.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryDocument {
    pub operation: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<ConditionDoc>,
    /// Rows of field → parameter name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updates: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default)]
    pub distinct: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<JoinDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub having: Vec<HavingDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_conflict: Option<OnConflictDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub returning: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregates: Vec<AggregateDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cases: Vec<CaseDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coalesce: Vec<CoalesceDoc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub math: Vec<MathDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_param: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_param: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub highlight: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_param: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_payload: Option<String>,
}

impl QueryDocument {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Replay this document against a builder for `backend`.
    pub fn to_builder(&self, registry: &Registry, backend: BackendKind) -> QueryBuilder {
        let start = valid_operation(&self.operation)
            .and_then(|op| Ok((op, registry.try_table(&self.table)?)));
        let builder = match start {
            Ok((operation, table)) => QueryBuilder::new(backend, operation, table),
            Err(err) => return QueryBuilder::errored(backend, err),
        };

        let mut resolver = Resolver {
            registry,
            backend,
            table: &self.table,
            aliases: HashMap::new(),
        };
        self.replay(builder, &mut resolver)
    }

    /// Replay and build in one step.
    pub fn build(&self, registry: &Registry, backend: BackendKind) -> Result<QueryAst> {
        self.to_builder(registry, backend).build()
    }

    fn replay(&self, mut b: QueryBuilder, r: &mut Resolver<'_>) -> QueryBuilder {
        for join in &self.joins {
            b = step(b, r.join(join), |b, (join_type, table, alias, on)| {
                b.join(join_type, table, alias, on)
            });
        }

        if !self.fields.is_empty() {
            b = step(b, r.fields(&self.fields), QueryBuilder::fields);
        }
        for agg in &self.aggregates {
            let resolved = valid_aggregate(&agg.function).and_then(|func| {
                Ok((func, r.optional_field(agg.field.as_deref())?, r.alias(agg.alias.as_deref())?))
            });
            b = step(b, resolved, |b, (func, field, alias)| b.aggregate(func, field, alias));
        }
        for case in &self.cases {
            b = step(b, r.case(case), |b, (expr, alias)| b.select_expr(expr, alias));
        }
        for coalesce in &self.coalesce {
            let resolved = (|| -> Result<_> {
                Ok((
                    Expression::Coalesce {
                        fields: r.fields(&coalesce.fields)?,
                        default: r.optional_param(coalesce.default.as_deref())?,
                    },
                    r.alias(coalesce.alias.as_deref())?,
                ))
            })();
            b = step(b, resolved, |b, (expr, alias)| b.select_expr(expr, alias));
        }
        for math in &self.math {
            let resolved = (|| -> Result<_> {
                Ok((
                    Expression::Math {
                        func: valid_math_function(&math.function)?,
                        field: r.field(&math.field)?,
                        arg: r.optional_param(math.arg.as_deref())?,
                    },
                    r.alias(math.alias.as_deref())?,
                ))
            })();
            b = step(b, resolved, |b, (expr, alias)| b.select_expr(expr, alias));
        }

        if let Some(filter) = &self.filter {
            b = step(b, r.condition(filter), QueryBuilder::filter);
        }

        for row in &self.values {
            b = step(b, r.assignments(row), QueryBuilder::values);
        }
        if !self.updates.is_empty() {
            b = step(b, r.assignments(&self.updates), QueryBuilder::set_many);
        }

        if !self.group_by.is_empty() {
            b = step(b, r.fields(&self.group_by), QueryBuilder::group_by);
        }
        for having in &self.having {
            b = match having {
                HavingDoc::Aggregate {
                    function,
                    field,
                    operator,
                    param,
                } => {
                    let resolved = (|| -> Result<_> {
                        Ok((
                            valid_aggregate(function)?,
                            r.optional_field(field.as_deref())?,
                            valid_operator(operator)?,
                            Param::try_new(param)?,
                        ))
                    })();
                    step(b, resolved, |b, (func, field, op, param)| {
                        b.having_aggregate(func, field, op, param)
                    })
                }
                HavingDoc::Condition(condition) => step(b, r.condition(condition), QueryBuilder::having),
            };
        }

        for order in &self.order_by {
            let resolved = (|| -> Result<_> {
                let direction = valid_direction(order.direction.as_deref().unwrap_or("ASC"))?;
                Ok((r.field(&order.field)?, direction))
            })();
            b = step(b, resolved, |b, (field, direction)| b.order_by(field, direction));
        }
        if let Some(limit) = self.limit {
            b = b.limit(limit);
        }
        if let Some(offset) = self.offset {
            b = b.offset(offset);
        }
        if self.distinct {
            b = b.distinct();
        }

        if let Some(conflict) = &self.on_conflict {
            let resolved = (|| -> Result<_> {
                Ok((r.fields(&conflict.columns)?, valid_conflict_action(&conflict.action)?))
            })();
            b = step(b, resolved, |b, (columns, action)| b.on_conflict(columns, action));
            for (field, param) in &conflict.updates {
                let resolved = (|| -> Result<_> { Ok((r.field(field)?, Param::try_new(param)?)) })();
                b = step(b, resolved, |b, (field, param)| b.on_conflict_set(field, param));
            }
        }
        if !self.returning.is_empty() {
            b = step(b, r.fields(&self.returning), QueryBuilder::returning);
        }

        if let Some(ttl) = &self.ttl_param {
            b = step(b, Param::try_new(ttl), QueryBuilder::ttl);
        }
        if let Some(score) = &self.score_param {
            b = step(b, Param::try_new(score), QueryBuilder::score);
        }
        if !self.highlight.is_empty() {
            b = step(b, r.fields(&self.highlight), QueryBuilder::highlight);
        }
        if let Some(size) = self.fragment_size {
            b = b.fragment_size(size);
        }
        if let Some(score) = self.min_score {
            b = b.min_score(score);
        }
        if let Some(content) = &self.content_param {
            b = step(b, Param::try_new(content), QueryBuilder::content);
        }
        if !self.event_types.is_empty() {
            let resolved = self
                .event_types
                .iter()
                .map(|e| valid_event_type(e))
                .collect::<Result<Vec<_>>>();
            b = step(b, resolved, QueryBuilder::event_types);
        }
        if let Some(payload) = &self.notify_payload {
            b = step(b, Param::try_new(payload), QueryBuilder::notify_payload);
        }

        b
    }
}

/// Apply `f` with a resolved value, or latch the resolution error.
fn step<T>(
    builder: QueryBuilder,
    resolved: Result<T>,
    f: impl FnOnce(QueryBuilder, T) -> QueryBuilder,
) -> QueryBuilder {
    match resolved {
        Ok(value) => f(builder, value),
        Err(err) => builder.fail(err),
    }
}

/// Name resolution against the registry, tracking join aliases.
struct Resolver<'a> {
    registry: &'a Registry,
    backend: BackendKind,
    table: &'a str,
    aliases: HashMap<String, String>,
}

type ResolvedJoin = (JoinType, Table, Option<Alias>, Condition);

impl<'a> Resolver<'a> {
    fn field(&self, reference: &str) -> Result<Field> {
        match reference.split_once('.') {
            Some((qualifier, name)) => {
                let table = self
                    .aliases
                    .get(qualifier)
                    .map(String::as_str)
                    .unwrap_or(qualifier);
                self.registry.try_qualified_field(qualifier, table, name)
            }
            None => self.registry.try_field(self.table, reference),
        }
    }

    fn fields(&self, references: &[String]) -> Result<Vec<Field>> {
        references.iter().map(|f| self.field(f)).collect()
    }

    fn optional_field(&self, reference: Option<&str>) -> Result<Option<Field>> {
        reference.map(|f| self.field(f)).transpose()
    }

    fn optional_param(&self, name: Option<&str>) -> Result<Option<Param>> {
        name.map(Param::try_new).transpose()
    }

    fn alias(&self, name: Option<&str>) -> Result<Option<Alias>> {
        name.map(Alias::try_new).transpose()
    }

    fn assignments(&self, map: &BTreeMap<String, String>) -> Result<Vec<(Field, Param)>> {
        map.iter()
            .map(|(field, param)| -> Result<(Field, Param)> { Ok((self.field(field)?, Param::try_new(param)?)) })
            .collect()
    }

    fn join(&mut self, join: &JoinDoc) -> Result<ResolvedJoin> {
        let join_type = valid_join_type(join.join_type.as_deref().unwrap_or("INNER"))?;
        let table = self.registry.try_table(&join.table)?;
        let alias = self.alias(join.alias.as_deref())?;
        if let Some(alias) = &alias {
            self.aliases
                .insert(alias.name().to_string(), join.table.clone());
        }
        let on = self.condition(&join.on)?;
        Ok((join_type, table, alias, on))
    }

    fn case(&self, case: &CaseDoc) -> Result<(Expression, Option<Alias>)> {
        let whens = case
            .whens
            .iter()
            .map(|when| -> Result<(Condition, Param)> {
                Ok((self.condition(&when.condition)?, Param::try_new(&when.then)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((
            Expression::Case {
                whens,
                otherwise: self.optional_param(case.otherwise.as_deref())?,
            },
            self.alias(case.alias.as_deref())?,
        ))
    }

    fn condition(&self, doc: &ConditionDoc) -> Result<Condition> {
        if let Some(subquery) = &doc.subquery {
            let field = self.optional_field(doc.field.as_deref())?;
            let default_op = if field.is_some() { "IN" } else { "EXISTS" };
            let op = valid_subquery_operator(doc.operator.as_deref().unwrap_or(default_op))?;
            let query = subquery.build(self.registry, self.backend)?;
            return Condition::subquery(field, op, query);
        }

        if let Some(logic) = &doc.logic {
            let conditions = doc
                .conditions
                .iter()
                .map(|c| self.condition(c))
                .collect::<Result<Vec<_>>>()?;
            return Condition::group(valid_logic(logic)?, conditions);
        }

        let operator = doc
            .operator
            .as_deref()
            .ok_or_else(|| QueryError::query("condition is missing an operator"))?;
        let op = valid_operator(operator)?;

        if let (Some(left), Some(right)) = (&doc.left_field, &doc.right_field) {
            return Condition::fields(self.field(left)?, op, self.field(right)?);
        }

        let field = doc.field.as_deref().ok_or_else(|| {
            QueryError::query("condition needs a field, left_field/right_field, logic or subquery")
        })?;
        let field = self.field(field)?;
        if op.is_null_check() {
            return Ok(Condition::Simple {
                field,
                op,
                param: None,
            });
        }
        let param = doc.param.as_deref().ok_or_else(|| {
            QueryError::query(format!("operator {} on field {} requires a parameter", op, field))
        })?;
        Condition::simple(field, op, Param::try_new(param)?)
    }
}
