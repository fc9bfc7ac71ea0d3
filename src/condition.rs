//! Condition and expression IR shared by every backend.

use crate::ast::{Operation, QueryAst};
use crate::error::{QueryError, Result};
use crate::operators::{
    AggregateFunc, ArgRule, ArithmeticOp, ComparisonOp, LogicalOp, MathFunction, SubqueryOp,
};
use crate::schema::{Alias, Field, Param};

/// Filter condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `field op :param`. Null checks carry no parameter.
    Simple {
        field: Field,
        op: ComparisonOp,
        param: Option<Param>,
    },
    FieldComparison {
        left: Field,
        op: ComparisonOp,
        right: Field,
    },
    Group {
        logic: LogicalOp,
        conditions: Vec<Condition>,
    },
    Subquery {
        field: Option<Field>,
        op: SubqueryOp,
        query: Box<QueryAst>,
    },
}

impl Condition {
    pub fn simple(field: Field, op: ComparisonOp, param: Param) -> Result<Self> {
        let condition = Condition::Simple {
            field,
            op,
            param: Some(param),
        };
        condition.validate()?;
        Ok(condition)
    }

    pub fn eq(field: Field, param: Param) -> Self {
        Condition::Simple {
            field,
            op: ComparisonOp::Eq,
            param: Some(param),
        }
    }

    pub fn is_null(field: Field) -> Self {
        Condition::Simple {
            field,
            op: ComparisonOp::IsNull,
            param: None,
        }
    }

    pub fn is_not_null(field: Field) -> Self {
        Condition::Simple {
            field,
            op: ComparisonOp::IsNotNull,
            param: None,
        }
    }

    pub fn fields(left: Field, op: ComparisonOp, right: Field) -> Result<Self> {
        let condition = Condition::FieldComparison { left, op, right };
        condition.validate()?;
        Ok(condition)
    }

    pub fn and(conditions: Vec<Condition>) -> Result<Self> {
        Self::group(LogicalOp::And, conditions)
    }

    pub fn or(conditions: Vec<Condition>) -> Result<Self> {
        Self::group(LogicalOp::Or, conditions)
    }

    pub fn group(logic: LogicalOp, conditions: Vec<Condition>) -> Result<Self> {
        let condition = Condition::Group { logic, conditions };
        condition.validate()?;
        Ok(condition)
    }

    pub fn subquery(field: Option<Field>, op: SubqueryOp, query: QueryAst) -> Result<Self> {
        let condition = Condition::Subquery {
            field,
            op,
            query: Box::new(query),
        };
        condition.validate()?;
        Ok(condition)
    }

    /// Check the structural invariants of this condition tree.
    pub fn validate(&self) -> Result<()> {
        match self {
            Condition::Simple { field, op, param } => {
                if op.binds_param() && param.is_none() {
                    return Err(QueryError::query(format!(
                        "operator {} on field {} requires a parameter",
                        op, field
                    )));
                }
                Ok(())
            }
            Condition::FieldComparison { left, op, right } => {
                if !op.is_scalar_comparison() {
                    return Err(QueryError::query(format!(
                        "operator {} cannot compare field {} to field {}",
                        op, left, right
                    )));
                }
                Ok(())
            }
            Condition::Group { logic, conditions } => {
                if conditions.is_empty() {
                    return Err(QueryError::query(format!("empty {} group", logic)));
                }
                conditions.iter().try_for_each(Condition::validate)
            }
            Condition::Subquery { field, op, query } => {
                match (op.requires_field(), field) {
                    (true, None) => {
                        return Err(QueryError::query(format!("{} subquery requires a field", op)))
                    }
                    (false, Some(field)) => {
                        return Err(QueryError::query(format!(
                            "{} subquery must not carry a field (got {})",
                            op, field
                        )))
                    }
                    _ => {}
                }
                if query.operation != Operation::Select {
                    return Err(QueryError::query(format!(
                        "subquery must be a SELECT, got {}",
                        query.operation
                    )));
                }
                if op.requires_field() && query.projection.len() != 1 {
                    return Err(QueryError::query(format!(
                        "{} subquery must project exactly one column",
                        op
                    )));
                }
                query.validate()
            }
        }
    }

    pub fn contains_subquery(&self) -> bool {
        match self {
            Condition::Subquery { .. } => true,
            Condition::Group { conditions, .. } => conditions.iter().any(Condition::contains_subquery),
            Condition::Simple { .. } | Condition::FieldComparison { .. } => false,
        }
    }

    pub fn contains_field_comparison(&self) -> bool {
        match self {
            Condition::FieldComparison { .. } => true,
            Condition::Group { conditions, .. } => {
                conditions.iter().any(Condition::contains_field_comparison)
            }
            Condition::Simple { .. } | Condition::Subquery { .. } => false,
        }
    }
}

/// Right-hand side of an arithmetic expression
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(Field),
    Param(Param),
}

/// Projection expression. Everything except [`Expression::Field`] is
/// relational-only.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Field(Field),
    Aggregate {
        func: AggregateFunc,
        field: Option<Field>,
    },
    /// `CASE WHEN cond THEN :p ... [ELSE :p] END`
    Case {
        whens: Vec<(Condition, Param)>,
        otherwise: Option<Param>,
    },
    Coalesce {
        fields: Vec<Field>,
        default: Option<Param>,
    },
    Math {
        func: MathFunction,
        field: Field,
        arg: Option<Param>,
    },
    Arithmetic {
        left: Field,
        op: ArithmeticOp,
        right: Operand,
    },
}

impl Expression {
    pub fn validate(&self) -> Result<()> {
        match self {
            Expression::Field(_) | Expression::Arithmetic { .. } => Ok(()),
            Expression::Aggregate { func, field } => {
                if func.requires_field() && field.is_none() {
                    return Err(QueryError::query(format!(
                        "aggregate {} requires a field",
                        func.to_sql(Some("..."))
                    )));
                }
                Ok(())
            }
            Expression::Case { whens, .. } => {
                if whens.is_empty() {
                    return Err(QueryError::query("CASE requires at least one WHEN"));
                }
                for (condition, _) in whens {
                    condition.validate()?;
                    if condition.contains_subquery() {
                        return Err(QueryError::query("CASE conditions cannot contain subqueries"));
                    }
                }
                Ok(())
            }
            Expression::Coalesce { fields, default } => {
                if fields.is_empty() || (fields.len() == 1 && default.is_none()) {
                    return Err(QueryError::query("COALESCE requires at least two arguments"));
                }
                Ok(())
            }
            Expression::Math { func, arg, .. } => match (func.arg_rule(), arg) {
                (ArgRule::Required, None) => {
                    Err(QueryError::query(format!("{} requires an argument", func)))
                }
                (ArgRule::None, Some(_)) => {
                    Err(QueryError::query(format!("{} takes no argument", func)))
                }
                _ => Ok(()),
            },
        }
    }
}

/// One projected item
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub expr: Expression,
    pub alias: Option<Alias>,
}

impl Selection {
    pub fn field(field: Field) -> Self {
        Self {
            expr: Expression::Field(field),
            alias: None,
        }
    }

    pub fn as_field(&self) -> Option<&Field> {
        match &self.expr {
            Expression::Field(field) if self.alias.is_none() => Some(field),
            _ => None,
        }
    }

    /// Name of the column this selection produces, if it has one.
    pub fn output_name(&self) -> Option<String> {
        match (&self.alias, &self.expr) {
            (Some(alias), _) => Some(alias.name().to_string()),
            (None, Expression::Field(field)) => Some(field.name().to_string()),
            _ => None,
        }
    }
}
