//! Identifier types and the table/field registry.
//!
//! [`Table`], [`Field`], [`Param`] and [`Alias`] can only be obtained through
//! validating constructors. Renderers format nothing else into their output,
//! so this module is the injection boundary for the whole crate.

use crate::error::{QueryError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

const MAX_IDENTIFIER_LEN: usize = 63;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

pub(crate) fn check_identifier(kind: &'static str, name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.len() > MAX_IDENTIFIER_LEN {
        "longer than 63 characters"
    } else if !IDENTIFIER_RE.is_match(name) {
        "must match [A-Za-z_][A-Za-z0-9_]*"
    } else {
        return Ok(());
    };
    Err(QueryError::InvalidIdentifier {
        kind,
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

/// A registered table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Table {
    name: String,
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A registered field, optionally qualified by a table name or alias.
///
/// Ordering is by field name first, which is the order renderers use for
/// column lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Field {
    name: String,
    qualifier: Option<String>,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}.{}", q, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A named parameter. Carries no value; values are bound by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Param {
    name: String,
}

impl Param {
    pub fn try_new(name: &str) -> Result<Self> {
        check_identifier("param", name)?;
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Panics if `name` is not a valid parameter name.
    pub fn must(name: &str) -> Self {
        match Self::try_new(name) {
            Ok(param) => param,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Output alias for a projected expression or a joined table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Alias {
    name: String,
}

impl Alias {
    pub fn try_new(name: &str) -> Result<Self> {
        check_identifier("alias", name)?;
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Panics if `name` is not a valid alias.
    pub fn must(name: &str) -> Self {
        match Self::try_new(name) {
            Ok(alias) => alias,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// SQL type of a registered field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    BigInt,
    Integer,
    SmallInt,
    Real,
    DoublePrecision,
    Text,
    Boolean,
    Timestamp,
    Json,
    Bytea,
}

impl SqlType {
    pub fn to_sql(&self) -> &'static str {
        match self {
            SqlType::BigInt => "BIGINT",
            SqlType::Integer => "INTEGER",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Real => "REAL",
            SqlType::DoublePrecision => "DOUBLE PRECISION",
            SqlType::Text => "TEXT",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Json => "JSONB",
            SqlType::Bytea => "BYTEA",
        }
    }
}

/// Field metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldMetadata {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
}

/// Table schema
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub fields: Vec<FieldMetadata>,
}

impl TableSchema {
    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Registry of known tables and fields.
///
/// Populated once during setup, then used read-only to construct identifiers.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    tables: HashMap<String, TableSchema>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table and its fields
    pub fn register_table(&mut self, name: &str, fields: Vec<(&str, SqlType, bool)>) -> Result<()> {
        check_identifier("table", name)?;

        if self.tables.contains_key(name) {
            return Err(QueryError::Schema(format!("Table {} already registered", name)));
        }

        let mut columns: Vec<FieldMetadata> = Vec::with_capacity(fields.len());
        for (field_name, sql_type, nullable) in fields {
            check_identifier("field", field_name)?;
            if columns.iter().any(|c| c.name == field_name) {
                return Err(QueryError::Schema(format!(
                    "Field {} declared twice on table {}",
                    field_name, name
                )));
            }
            columns.push(FieldMetadata {
                name: field_name.to_string(),
                sql_type,
                nullable,
            });
        }

        self.tables.insert(
            name.to_string(),
            TableSchema {
                name: name.to_string(),
                fields: columns,
            },
        );

        Ok(())
    }

    pub fn try_table(&self, name: &str) -> Result<Table> {
        check_identifier("table", name)?;
        if !self.tables.contains_key(name) {
            return Err(QueryError::UnknownTable(name.to_string()));
        }
        Ok(Table {
            name: name.to_string(),
        })
    }

    pub fn try_field(&self, table: &str, field: &str) -> Result<Field> {
        check_identifier("field", field)?;
        let schema = self.schema(table)?;
        if schema.field(field).is_none() {
            return Err(QueryError::UnknownField {
                table: table.to_string(),
                field: field.to_string(),
            });
        }
        Ok(Field {
            name: field.to_string(),
            qualifier: None,
        })
    }

    /// Field rendered as `qualifier.field`. The qualifier is either the table
    /// name itself or a join alias.
    pub fn try_qualified_field(&self, qualifier: &str, table: &str, field: &str) -> Result<Field> {
        check_identifier("alias", qualifier)?;
        let mut resolved = self.try_field(table, field)?;
        resolved.qualifier = Some(qualifier.to_string());
        Ok(resolved)
    }

    /// Panics if the table is not registered.
    pub fn must_table(&self, name: &str) -> Table {
        match self.try_table(name) {
            Ok(table) => table,
            Err(err) => panic!("{}", err),
        }
    }

    /// Panics if the field is not registered on the table.
    pub fn must_field(&self, table: &str, field: &str) -> Field {
        match self.try_field(table, field) {
            Ok(field) => field,
            Err(err) => panic!("{}", err),
        }
    }

    /// Panics if the qualified field cannot be constructed.
    pub fn must_qualified_field(&self, qualifier: &str, table: &str, field: &str) -> Field {
        match self.try_qualified_field(qualifier, table, field) {
            Ok(field) => field,
            Err(err) => panic!("{}", err),
        }
    }

    pub fn field_metadata(&self, table: &str, field: &str) -> Option<&FieldMetadata> {
        self.tables.get(table).and_then(|schema| schema.field(field))
    }

    pub fn get_schema(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table)
    }

    /// List all registered table names, sorted
    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    fn schema(&self, table: &str) -> Result<&TableSchema> {
        check_identifier("table", table)?;
        self.tables
            .get(table)
            .ok_or_else(|| QueryError::UnknownTable(table.to_string()))
    }
}
