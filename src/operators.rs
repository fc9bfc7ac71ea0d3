//! Operator and keyword allowlists.
//!
//! Every keyword that reaches a renderer is one of these enums. The `valid_*`
//! functions are the only string entry points and reject anything outside
//! the enumeration, naming the offending value.

use crate::error::{QueryError, Result};
use std::fmt;

fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

fn invalid(kind: &'static str, value: &str) -> QueryError {
    QueryError::InvalidKeyword {
        kind,
        value: value.to_string(),
    }
}

/// Comparison operators for filter conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    ILike,
    /// Full-text match; only the search backend can express it.
    Match,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl ComparisonOp {
    /// Whether the operator consumes a parameter value.
    pub fn binds_param(&self) -> bool {
        !self.is_null_check()
    }

    pub fn is_null_check(&self) -> bool {
        matches!(self, ComparisonOp::IsNull | ComparisonOp::IsNotNull)
    }

    pub fn is_membership(&self) -> bool {
        matches!(self, ComparisonOp::In | ComparisonOp::NotIn)
    }

    /// Operators meaningful between two fields.
    pub fn is_scalar_comparison(&self) -> bool {
        matches!(
            self,
            ComparisonOp::Eq
                | ComparisonOp::Ne
                | ComparisonOp::Lt
                | ComparisonOp::Le
                | ComparisonOp::Gt
                | ComparisonOp::Ge
        )
    }
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOp::Eq => write!(f, "="),
            ComparisonOp::Ne => write!(f, "!="),
            ComparisonOp::Lt => write!(f, "<"),
            ComparisonOp::Le => write!(f, "<="),
            ComparisonOp::Gt => write!(f, ">"),
            ComparisonOp::Ge => write!(f, ">="),
            ComparisonOp::Like => write!(f, "LIKE"),
            ComparisonOp::NotLike => write!(f, "NOT LIKE"),
            ComparisonOp::ILike => write!(f, "ILIKE"),
            ComparisonOp::Match => write!(f, "MATCH"),
            ComparisonOp::In => write!(f, "IN"),
            ComparisonOp::NotIn => write!(f, "NOT IN"),
            ComparisonOp::IsNull => write!(f, "IS NULL"),
            ComparisonOp::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

pub fn valid_operator(value: &str) -> Result<ComparisonOp> {
    let op = match normalize(value).as_str() {
        "=" | "==" => ComparisonOp::Eq,
        "!=" | "<>" => ComparisonOp::Ne,
        "<" => ComparisonOp::Lt,
        "<=" => ComparisonOp::Le,
        ">" => ComparisonOp::Gt,
        ">=" => ComparisonOp::Ge,
        "LIKE" => ComparisonOp::Like,
        "NOT LIKE" => ComparisonOp::NotLike,
        "ILIKE" => ComparisonOp::ILike,
        "MATCH" => ComparisonOp::Match,
        "IN" => ComparisonOp::In,
        "NOT IN" => ComparisonOp::NotIn,
        "IS NULL" => ComparisonOp::IsNull,
        "IS NOT NULL" => ComparisonOp::IsNotNull,
        _ => return Err(invalid("operator", value)),
    };
    Ok(op)
}

/// Operators for subquery conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubqueryOp {
    In,
    NotIn,
    Exists,
    NotExists,
}

impl SubqueryOp {
    /// `IN`/`NOT IN` compare a field; `EXISTS`/`NOT EXISTS` must not.
    pub fn requires_field(&self) -> bool {
        matches!(self, SubqueryOp::In | SubqueryOp::NotIn)
    }
}

impl fmt::Display for SubqueryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubqueryOp::In => write!(f, "IN"),
            SubqueryOp::NotIn => write!(f, "NOT IN"),
            SubqueryOp::Exists => write!(f, "EXISTS"),
            SubqueryOp::NotExists => write!(f, "NOT EXISTS"),
        }
    }
}

pub fn valid_subquery_operator(value: &str) -> Result<SubqueryOp> {
    match normalize(value).as_str() {
        "IN" => Ok(SubqueryOp::In),
        "NOT IN" => Ok(SubqueryOp::NotIn),
        "EXISTS" => Ok(SubqueryOp::Exists),
        "NOT EXISTS" => Ok(SubqueryOp::NotExists),
        _ => Err(invalid("subquery operator", value)),
    }
}

/// Logical operators for combining conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    And,
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "AND"),
            LogicalOp::Or => write!(f, "OR"),
        }
    }
}

pub fn valid_logic(value: &str) -> Result<LogicalOp> {
    match normalize(value).as_str() {
        "AND" => Ok(LogicalOp::And),
        "OR" => Ok(LogicalOp::Or),
        _ => Err(invalid("logic operator", value)),
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

pub fn valid_direction(value: &str) -> Result<SortDirection> {
    match normalize(value).as_str() {
        "ASC" => Ok(SortDirection::Asc),
        "DESC" => Ok(SortDirection::Desc),
        _ => Err(invalid("sort direction", value)),
    }
}

/// Join type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl fmt::Display for JoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinType::Inner => write!(f, "INNER JOIN"),
            JoinType::Left => write!(f, "LEFT JOIN"),
            JoinType::Right => write!(f, "RIGHT JOIN"),
            JoinType::Full => write!(f, "FULL JOIN"),
        }
    }
}

pub fn valid_join_type(value: &str) -> Result<JoinType> {
    match normalize(value).trim_end_matches(" JOIN") {
        "INNER" => Ok(JoinType::Inner),
        "LEFT" => Ok(JoinType::Left),
        "RIGHT" => Ok(JoinType::Right),
        "FULL" => Ok(JoinType::Full),
        _ => Err(invalid("join type", value)),
    }
}

/// Aggregate function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunc {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    /// `COUNT` without a field renders `COUNT(*)`; every other function needs one.
    pub fn requires_field(&self) -> bool {
        !matches!(self, AggregateFunc::Count)
    }

    pub fn to_sql(&self, column: Option<&str>) -> String {
        let column = column.unwrap_or("*");
        match self {
            AggregateFunc::Count => format!("COUNT({})", column),
            AggregateFunc::CountDistinct => format!("COUNT(DISTINCT {})", column),
            AggregateFunc::Sum => format!("SUM({})", column),
            AggregateFunc::Avg => format!("AVG({})", column),
            AggregateFunc::Min => format!("MIN({})", column),
            AggregateFunc::Max => format!("MAX({})", column),
        }
    }
}

pub fn valid_aggregate(value: &str) -> Result<AggregateFunc> {
    match normalize(value).as_str() {
        "COUNT" => Ok(AggregateFunc::Count),
        "COUNT_DISTINCT" | "COUNT DISTINCT" => Ok(AggregateFunc::CountDistinct),
        "SUM" => Ok(AggregateFunc::Sum),
        "AVG" => Ok(AggregateFunc::Avg),
        "MIN" => Ok(AggregateFunc::Min),
        "MAX" => Ok(AggregateFunc::Max),
        _ => Err(invalid("aggregate function", value)),
    }
}

/// ON CONFLICT action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictAction {
    DoNothing,
    DoUpdate,
}

impl fmt::Display for ConflictAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictAction::DoNothing => write!(f, "DO NOTHING"),
            ConflictAction::DoUpdate => write!(f, "DO UPDATE"),
        }
    }
}

pub fn valid_conflict_action(value: &str) -> Result<ConflictAction> {
    match normalize(value).trim_start_matches("DO ") {
        "NOTHING" => Ok(ConflictAction::DoNothing),
        "UPDATE" => Ok(ConflictAction::DoUpdate),
        _ => Err(invalid("conflict action", value)),
    }
}

/// How many arguments a math function takes besides its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgRule {
    None,
    Optional,
    Required,
}

/// Math function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFunction {
    Round,
    Floor,
    Ceil,
    Abs,
    Sqrt,
    Power,
}

impl MathFunction {
    pub fn arg_rule(&self) -> ArgRule {
        match self {
            MathFunction::Round => ArgRule::Optional,
            MathFunction::Power => ArgRule::Required,
            MathFunction::Floor | MathFunction::Ceil | MathFunction::Abs | MathFunction::Sqrt => {
                ArgRule::None
            }
        }
    }
}

impl fmt::Display for MathFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MathFunction::Round => write!(f, "ROUND"),
            MathFunction::Floor => write!(f, "FLOOR"),
            MathFunction::Ceil => write!(f, "CEIL"),
            MathFunction::Abs => write!(f, "ABS"),
            MathFunction::Sqrt => write!(f, "SQRT"),
            MathFunction::Power => write!(f, "POWER"),
        }
    }
}

pub fn valid_math_function(value: &str) -> Result<MathFunction> {
    match normalize(value).as_str() {
        "ROUND" => Ok(MathFunction::Round),
        "FLOOR" => Ok(MathFunction::Floor),
        "CEIL" | "CEILING" => Ok(MathFunction::Ceil),
        "ABS" => Ok(MathFunction::Abs),
        "SQRT" => Ok(MathFunction::Sqrt),
        "POWER" | "POW" => Ok(MathFunction::Power),
        _ => Err(invalid("math function", value)),
    }
}

/// Binary arithmetic operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl fmt::Display for ArithmeticOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArithmeticOp::Add => write!(f, "+"),
            ArithmeticOp::Sub => write!(f, "-"),
            ArithmeticOp::Mul => write!(f, "*"),
            ArithmeticOp::Div => write!(f, "/"),
        }
    }
}

pub fn valid_arithmetic_operator(value: &str) -> Result<ArithmeticOp> {
    match value.trim() {
        "+" => Ok(ArithmeticOp::Add),
        "-" => Ok(ArithmeticOp::Sub),
        "*" => Ok(ArithmeticOp::Mul),
        "/" => Ok(ArithmeticOp::Div),
        _ => Err(invalid("arithmetic operator", value)),
    }
}

/// Object-store event types a subscription can filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    ObjectCreated,
    ObjectCreatedPut,
    ObjectCreatedCopy,
    ObjectRemoved,
    ObjectRemovedDelete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ObjectCreated => "s3:ObjectCreated:*",
            EventType::ObjectCreatedPut => "s3:ObjectCreated:Put",
            EventType::ObjectCreatedCopy => "s3:ObjectCreated:Copy",
            EventType::ObjectRemoved => "s3:ObjectRemoved:*",
            EventType::ObjectRemovedDelete => "s3:ObjectRemoved:Delete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn valid_event_type(value: &str) -> Result<EventType> {
    match normalize(value).as_str() {
        "S3:OBJECTCREATED:*" | "CREATED" => Ok(EventType::ObjectCreated),
        "S3:OBJECTCREATED:PUT" => Ok(EventType::ObjectCreatedPut),
        "S3:OBJECTCREATED:COPY" => Ok(EventType::ObjectCreatedCopy),
        "S3:OBJECTREMOVED:*" | "REMOVED" => Ok(EventType::ObjectRemoved),
        "S3:OBJECTREMOVED:DELETE" => Ok(EventType::ObjectRemovedDelete),
        _ => Err(invalid("event type", value)),
    }
}
