//! polyquery - Retargetable query compiler
//!
//! polyquery builds one validated, backend-agnostic query AST and renders it
//! into the native form of several kinds of data store. It never connects to
//! or executes against a store; rendered queries carry named placeholders
//! and the list of parameters the caller must bind.
//!
//! # Architecture
//!
//! - **Identifiers**: Tables, fields, params and aliases only come from the
//!   [`Registry`](schema::Registry) or validating constructors
//! - **Builder**: A sticky-error state machine that rejects incompatible
//!   clauses as they are added
//! - **AST**: Shared conditions and clauses plus one backend extension block
//! - **Renderers**: One [`QueryRenderer`] per backend, safe to share across threads
//!
//! # Backends
//!
//! - **Relational**: PostgreSQL SQL text
//! - **Key/value**: Redis commands
//! - **Search**: Elasticsearch REST requests with a JSON body
//! - **Object store**: S3 API operations as JSON
//!
//! # Example
//!
//! ```rust
//! use polyquery::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let mut registry = Registry::new();
//!     registry.register_table(
//!         "players",
//!         vec![
//!             ("id", SqlType::BigInt, false),
//!             ("name", SqlType::Text, false),
//!             ("score", SqlType::Integer, false),
//!         ],
//!     )?;
//!
//!     let query = QueryBuilder::select(BackendKind::Relational, registry.try_table("players")?)
//!         .fields(vec![registry.try_field("players", "name")?, registry.try_field("players", "score")?])
//!         .where_gt(registry.try_field("players", "score")?, Param::try_new("min_score")?)
//!         .order_desc(registry.try_field("players", "score")?)
//!         .limit(10)
//!         .build()?;
//!
//!     #[cfg(feature = "postgres")]
//!     {
//!         let rendered = PostgresRenderer::new().render(&query)?;
//!         assert_eq!(
//!             rendered.representation,
//!             "SELECT name, score FROM players WHERE score > :min_score ORDER BY score DESC LIMIT 10"
//!         );
//!         assert_eq!(rendered.required_params, vec!["min_score"]);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! Renderers are enabled via Cargo features (all on by default):
//!
//! ```toml
//! [dependencies]
//! polyquery = { version = "0.1", default-features = false, features = ["postgres", "redis"] }
//! ```

pub mod ast;
pub mod backend;
pub mod builder;
pub mod condition;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod operators;
pub mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;

#[cfg(feature = "s3")]
pub mod s3;

pub use ast::{Extension, Operation, QueryAst};
pub use backend::{BackendKind, QueryMetadata, QueryRenderer, RenderedQuery, ResultField, ResultShape};
pub use builder::QueryBuilder;
pub use condition::{Condition, Expression, Operand, Selection};
pub use config::{
    DataStructure, KeyValueConfig, KeyValueTarget, ObjectStoreConfig, ObjectTarget, RefreshPolicy,
    SearchConfig, SearchTarget,
};
pub use context::MAX_SUBQUERY_DEPTH;
pub use document::QueryDocument;
pub use error::{QueryError, Result};
pub use operators::{
    AggregateFunc, ArithmeticOp, ComparisonOp, ConflictAction, EventType, JoinType, LogicalOp,
    MathFunction, SortDirection, SubqueryOp,
};
pub use schema::{Alias, Field, FieldMetadata, Param, Registry, SqlType, Table, TableSchema};

#[cfg(feature = "postgres")]
pub use postgres::PostgresRenderer;

#[cfg(feature = "redis")]
pub use redis::RedisRenderer;

#[cfg(feature = "elasticsearch")]
pub use elasticsearch::ElasticsearchRenderer;

#[cfg(feature = "s3")]
pub use s3::S3Renderer;

/// Prelude for common imports
pub mod prelude {
    pub use crate::ast::{Operation, QueryAst};
    pub use crate::backend::{BackendKind, QueryRenderer, RenderedQuery, ResultShape};
    pub use crate::builder::QueryBuilder;
    pub use crate::condition::{Condition, Expression, Operand};
    pub use crate::config::{
        DataStructure, KeyValueConfig, KeyValueTarget, ObjectStoreConfig, ObjectTarget,
        RefreshPolicy, SearchConfig, SearchTarget,
    };
    pub use crate::document::QueryDocument;
    pub use crate::error::{QueryError, Result};
    pub use crate::operators::{
        AggregateFunc, ArithmeticOp, ComparisonOp, ConflictAction, EventType, JoinType, LogicalOp,
        MathFunction, SortDirection, SubqueryOp,
    };
    pub use crate::schema::{Alias, Field, Param, Registry, SqlType, Table};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PostgresRenderer;

    #[cfg(feature = "redis")]
    pub use crate::redis::RedisRenderer;

    #[cfg(feature = "elasticsearch")]
    pub use crate::elasticsearch::ElasticsearchRenderer;

    #[cfg(feature = "s3")]
    pub use crate::s3::S3Renderer;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _registry = Registry::new();
        let _sql_type = SqlType::Text;
        let _comp_op = ComparisonOp::Eq;
        let _log_op = LogicalOp::And;
        assert_eq!(MAX_SUBQUERY_DEPTH, 3);
    }
}
