//! Object-store renderer producing S3 API operations as JSON.
//!
//! Every table maps to a bucket and key prefix. Objects are addressed by
//! `prefix + :id`; listings and subscriptions narrow the prefix with an `=`
//! or `LIKE` filter on the id field.

use crate::ast::{Extension, ObjectStoreExt, Operation, QueryAst};
use crate::backend::{
    check_ast, id_equality, sorted_entries, BackendKind, QueryMetadata, QueryRenderer,
    RenderedQuery, ResultShape,
};
use crate::condition::Condition;
use crate::config::{ObjectStoreConfig, ObjectTarget, Targets};
use crate::context::{ParamSet, RenderContext};
use crate::error::{QueryError, Result};
use crate::operators::{ComparisonOp, EventType};
use crate::schema::{Param, Registry, Table};
use serde_json::{json, Map, Value};
use std::cell::RefCell;

/// Fields written as HTTP headers rather than user metadata.
const HEADER_FIELDS: [(&str, &str); 6] = [
    ("cache_control", "Cache-Control"),
    ("content_disposition", "Content-Disposition"),
    ("content_encoding", "Content-Encoding"),
    ("content_language", "Content-Language"),
    ("content_type", "Content-Type"),
    ("expires", "Expires"),
];

const METADATA_PREFIX: &str = "x-amz-meta-";

fn header_name(field: &str) -> Option<&'static str> {
    HEADER_FIELDS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, header)| *header)
}

#[derive(Debug, Clone)]
pub struct S3Renderer {
    targets: Targets<ObjectTarget>,
}

impl Default for S3Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl S3Renderer {
    pub fn new() -> Self {
        Self {
            targets: Targets::new(BackendKind::ObjectStore),
        }
    }

    /// Bind `table` to a bucket and prefix.
    pub fn with_target(mut self, table: &Table, target: ObjectTarget) -> Result<Self> {
        self.targets.register(table, target)?;
        Ok(self)
    }

    pub fn from_config(registry: &Registry, config: ObjectStoreConfig) -> Result<Self> {
        let mut renderer = Self::new();
        renderer.targets.register_all(registry, config)?;
        Ok(renderer)
    }
}

impl QueryRenderer for S3Renderer {
    fn backend(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    fn render(&self, ast: &QueryAst) -> Result<RenderedQuery> {
        check_ast(BackendKind::ObjectStore, ast)?;
        let target = self.targets.resolve(ast.target())?;
        let ext = match ast.extension() {
            Extension::ObjectStore(ext) => ext,
            _ => return Err(QueryError::query("missing object-store extension block")),
        };
        tracing::debug!(
            operation = %ast.operation(),
            table = %ast.target(),
            bucket = %target.bucket,
            "rendering object-store operation"
        );

        let params = RefCell::new(ParamSet::new());
        let writer = OperationWriter {
            ast,
            ext,
            target,
            ctx: RenderContext::new(&params),
        };
        let (operation, shape) = writer.render()?;

        let mut metadata = QueryMetadata::new(ast, shape);
        if ast.operation() == Operation::Insert {
            metadata.modified_fields = ast.values.first().map(|row| {
                sorted_entries(row)
                    .into_iter()
                    .map(|(field, _)| field.name().to_string())
                    .collect()
            });
        }

        Ok(RenderedQuery {
            representation: serde_json::to_string(&operation)?,
            required_params: params.into_inner().into_names(),
            metadata,
        })
    }
}

struct OperationWriter<'a> {
    ast: &'a QueryAst,
    ext: &'a ObjectStoreExt,
    target: &'a ObjectTarget,
    ctx: RenderContext<'a>,
}

impl<'a> OperationWriter<'a> {
    fn render(&self) -> Result<(Value, ResultShape)> {
        match self.ast.operation() {
            Operation::Select => Ok((self.list(false)?, ResultShape::Objects)),
            Operation::Count => Ok((self.list(true)?, ResultShape::Count)),
            Operation::Insert => Ok((self.put()?, ResultShape::Affected)),
            Operation::Delete => {
                let filter = self.ast.filter().ok_or_else(|| {
                    QueryError::query(format!(
                        "DELETE on the object-store backend requires {} = :param",
                        self.target.id_field
                    ))
                })?;
                let id = id_equality(BackendKind::ObjectStore, filter, &self.target.id_field)?;
                Ok((
                    json!({
                        "operation": "DeleteObject",
                        "bucket": self.target.bucket,
                        "key": self.key(id),
                    }),
                    ResultShape::Affected,
                ))
            }
            Operation::Listen => Ok((self.subscription("PutBucketNotification")?, ResultShape::Subscription)),
            Operation::Unlisten => Ok((
                self.subscription("DeleteBucketNotification")?,
                ResultShape::Subscription,
            )),
            op => Err(QueryError::UnsupportedOperation {
                operation: op,
                backend: BackendKind::ObjectStore,
            }),
        }
    }

    fn key(&self, id: &Param) -> String {
        format!("{}{}", self.target.prefix, self.ctx.placeholder(id))
    }

    /// Key prefix from the configured prefix and an optional id filter.
    fn prefix(&self) -> Result<String> {
        let filter = match self.ast.filter() {
            Some(filter) => filter,
            None => return Ok(self.target.prefix.clone()),
        };
        match filter {
            Condition::Simple {
                field,
                op: ComparisonOp::Eq | ComparisonOp::Like,
                param: Some(param),
            } if field.name() == self.target.id_field => Ok(self.key(param)),
            other => id_equality(BackendKind::ObjectStore, other, &self.target.id_field)
                .map(|param| self.key(param)),
        }
    }

    fn list(&self, count: bool) -> Result<Value> {
        let mut op = Map::new();
        op.insert("operation".into(), json!("ListObjectsV2"));
        op.insert("bucket".into(), json!(self.target.bucket));
        op.insert("prefix".into(), json!(self.prefix()?));
        if let Some(limit) = self.ast.limit {
            op.insert("max_keys".into(), json!(limit));
        }
        if count {
            op.insert("count".into(), json!(true));
        }
        Ok(Value::Object(op))
    }

    fn put(&self) -> Result<Value> {
        let row = self
            .ast
            .values
            .first()
            .ok_or_else(|| QueryError::query("INSERT must have at least one row of values"))?;
        let content = self.ext.content.as_ref().ok_or_else(|| {
            QueryError::query("INSERT on the object-store backend requires a content parameter")
        })?;
        let id = row
            .iter()
            .find(|(field, _)| field.name() == self.target.id_field)
            .map(|(_, param)| param)
            .ok_or_else(|| {
                QueryError::query(format!(
                    "INSERT on the object-store backend requires a value for id field {}",
                    self.target.id_field
                ))
            })?;

        let mut op = Map::new();
        op.insert("operation".into(), json!("PutObject"));
        op.insert("bucket".into(), json!(self.target.bucket));
        op.insert("key".into(), json!(self.key(id)));
        op.insert("body".into(), json!(self.ctx.placeholder(content)));

        let mut headers = Map::new();
        let mut metadata = Map::new();
        for (field, param) in sorted_entries(row) {
            if field.name() == self.target.id_field {
                continue;
            }
            let value = json!(self.ctx.placeholder(param));
            match header_name(field.name()) {
                Some(header) => headers.insert(header.to_string(), value),
                None => metadata.insert(format!("{}{}", METADATA_PREFIX, field.name()), value),
            };
        }
        if !headers.is_empty() {
            op.insert("headers".into(), Value::Object(headers));
        }
        if !metadata.is_empty() {
            op.insert("metadata".into(), Value::Object(metadata));
        }

        Ok(Value::Object(op))
    }

    fn subscription(&self, operation: &str) -> Result<Value> {
        let mut op = Map::new();
        op.insert("operation".into(), json!(operation));
        op.insert("bucket".into(), json!(self.target.bucket));
        op.insert("channel".into(), json!(self.ast.channel()));

        let events: Vec<&str> = if self.ext.event_types.is_empty() {
            vec![EventType::ObjectCreated.as_str(), EventType::ObjectRemoved.as_str()]
        } else {
            self.ext.event_types.iter().map(EventType::as_str).collect()
        };
        op.insert("events".into(), json!(events));

        let prefix = self.prefix()?;
        if !prefix.is_empty() {
            op.insert("filter".into(), json!({ "prefix": prefix }));
        }
        Ok(Value::Object(op))
    }
}
