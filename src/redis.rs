//! Key/value renderer producing Redis commands.
//!
//! Each table maps to a key pattern with a single `{id}` slot. A query
//! addresses one key via `id_field = :param`; without a WHERE clause reads
//! fall back to a cursor scan over the pattern. Multiple commands are
//! separated by newlines.

use crate::ast::{Extension, KeyValueExt, Operation, QueryAst};
use crate::backend::{
    check_ast, id_equality, sorted_entries, BackendKind, QueryMetadata, QueryRenderer,
    RenderedQuery, ResultField, ResultShape,
};
use crate::config::{DataStructure, KeyValueConfig, KeyValueTarget, Targets};
use crate::context::{ParamSet, RenderContext};
use crate::error::{QueryError, Result};
use crate::operators::SortDirection;
use crate::schema::{Field, Param, Registry, Table};
use std::cell::RefCell;

#[derive(Debug, Clone)]
pub struct RedisRenderer {
    targets: Targets<KeyValueTarget>,
}

impl Default for RedisRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl RedisRenderer {
    pub fn new() -> Self {
        Self {
            targets: Targets::new(BackendKind::KeyValue),
        }
    }

    /// Bind `table` to a key pattern.
    pub fn with_target(mut self, table: &Table, target: KeyValueTarget) -> Result<Self> {
        self.targets.register(table, target)?;
        Ok(self)
    }

    pub fn from_config(registry: &Registry, config: KeyValueConfig) -> Result<Self> {
        let mut renderer = Self::new();
        renderer.targets.register_all(registry, config)?;
        Ok(renderer)
    }
}

impl QueryRenderer for RedisRenderer {
    fn backend(&self) -> BackendKind {
        BackendKind::KeyValue
    }

    fn render(&self, ast: &QueryAst) -> Result<RenderedQuery> {
        check_ast(BackendKind::KeyValue, ast)?;
        let target = self.targets.resolve(ast.target())?;
        let ext = match ast.extension() {
            Extension::KeyValue(ext) => ext,
            _ => return Err(QueryError::query("missing key-value extension block")),
        };
        tracing::debug!(
            operation = %ast.operation(),
            table = %ast.target(),
            structure = ?target.structure,
            "rendering key-value commands"
        );

        let params = RefCell::new(ParamSet::new());
        let ctx = RenderContext::new(&params);
        let writer = CommandWriter { ast, ext, target, ctx };
        let (commands, shape) = writer.render()?;

        let mut metadata = QueryMetadata::new(ast, shape);
        if ast.operation() == Operation::Select && !ast.projection().is_empty() {
            metadata.returned_fields = Some(
                ast.projection()
                    .iter()
                    .filter_map(|s| s.output_name())
                    .map(|name| ResultField { name, metadata: None })
                    .collect(),
            );
        }
        metadata.modified_fields = writer.modified_fields();

        Ok(RenderedQuery {
            representation: commands.join("\n"),
            required_params: params.into_inner().into_names(),
            metadata,
        })
    }
}

struct CommandWriter<'a> {
    ast: &'a QueryAst,
    ext: &'a KeyValueExt,
    target: &'a KeyValueTarget,
    ctx: RenderContext<'a>,
}

impl<'a> CommandWriter<'a> {
    fn render(&self) -> Result<(Vec<String>, ResultShape)> {
        let channel = self.ast.channel();
        match self.ast.operation() {
            Operation::Select => self.select(),
            Operation::Count => self.count(),
            Operation::Insert => {
                let row = self
                    .ast
                    .values
                    .first()
                    .ok_or_else(|| QueryError::query("INSERT must have at least one row of values"))?;
                let id = row
                    .iter()
                    .find(|(field, _)| field.name() == self.target.id_field)
                    .map(|(_, param)| param)
                    .ok_or_else(|| {
                        QueryError::query(format!(
                            "INSERT on the key-value backend requires a value for id field {}",
                            self.target.id_field
                        ))
                    })?;
                let key = self.key(id);
                let fields = self.value_fields(sorted_entries(row));
                Ok((self.write(&key, fields)?, ResultShape::Affected))
            }
            Operation::Update => {
                if self.ast.updates.keys().any(|field| field.name() == self.target.id_field) {
                    return Err(QueryError::unsupported(
                        BackendKind::KeyValue,
                        format!("assigning id field {} in an UPDATE", self.target.id_field),
                    ));
                }
                let key = self.key(self.required_id("UPDATE")?);
                let fields = self.value_fields(sorted_entries(&self.ast.updates));
                Ok((self.write(&key, fields)?, ResultShape::Affected))
            }
            Operation::Delete => {
                let key = self.key(self.required_id("DELETE")?);
                Ok((vec![format!("DEL {}", key)], ResultShape::Affected))
            }
            Operation::Listen => Ok((vec![format!("SUBSCRIBE {}", channel)], ResultShape::Subscription)),
            Operation::Unlisten => Ok((
                vec![format!("UNSUBSCRIBE {}", channel)],
                ResultShape::Subscription,
            )),
            Operation::Notify => {
                let payload = self.ast.notify_payload.as_ref().ok_or_else(|| {
                    QueryError::query("NOTIFY on the key-value backend requires a payload parameter")
                })?;
                Ok((
                    vec![format!("PUBLISH {} {}", channel, self.ctx.placeholder(payload))],
                    ResultShape::Acknowledged,
                ))
            }
        }
    }

    fn key(&self, id: &Param) -> String {
        self.target.key(&self.ctx.placeholder(id))
    }

    fn filter_id(&self) -> Result<Option<&'a Param>> {
        match self.ast.filter() {
            Some(filter) => id_equality(BackendKind::KeyValue, filter, &self.target.id_field).map(Some),
            None => Ok(None),
        }
    }

    fn required_id(&self, operation: &str) -> Result<&'a Param> {
        self.filter_id()?.ok_or_else(|| {
            QueryError::query(format!(
                "{} on the key-value backend requires {} = :param",
                operation, self.target.id_field
            ))
        })
    }

    fn scan(&self) -> String {
        format!("SCAN 0 MATCH {}", self.target.scan_pattern())
    }

    fn select(&self) -> Result<(Vec<String>, ResultShape)> {
        let structure = self.target.structure;
        let projection: Vec<&Field> = self
            .ast
            .projection()
            .iter()
            .filter_map(|s| s.as_field())
            .collect();

        if !projection.is_empty() && structure != DataStructure::Hash {
            return Err(QueryError::unsupported(
                BackendKind::KeyValue,
                "field selection outside hash keys",
            ));
        }
        let ranged = matches!(structure, DataStructure::SortedSet | DataStructure::List);
        if !ranged && (self.ast.limit.is_some() || self.ast.offset.is_some()) {
            return Err(QueryError::unsupported(
                BackendKind::KeyValue,
                "LIMIT/OFFSET outside sorted sets and lists",
            ));
        }
        if structure != DataStructure::SortedSet && !self.ast.ordering.is_empty() {
            return Err(QueryError::unsupported(
                BackendKind::KeyValue,
                "ORDER BY outside sorted sets",
            ));
        }

        let id = match self.filter_id()? {
            Some(id) => id,
            None => {
                if self.ast.limit.is_some() || self.ast.offset.is_some() || !self.ast.ordering.is_empty() {
                    return Err(QueryError::unsupported(
                        BackendKind::KeyValue,
                        "LIMIT/OFFSET/ORDER BY on a key scan",
                    ));
                }
                return Ok((vec![self.scan()], ResultShape::Keys));
            }
        };
        let key = self.key(id);

        let (command, shape) = match structure {
            DataStructure::String => (format!("GET {}", key), ResultShape::Value),
            DataStructure::Hash => match projection.as_slice() {
                [] => (format!("HGETALL {}", key), ResultShape::Value),
                [field] => (format!("HGET {} {}", key, field.name()), ResultShape::Value),
                fields => (
                    format!(
                        "HMGET {} {}",
                        key,
                        fields.iter().map(|f| f.name()).collect::<Vec<_>>().join(" ")
                    ),
                    ResultShape::Value,
                ),
            },
            DataStructure::Set => (format!("SMEMBERS {}", key), ResultShape::Members),
            DataStructure::SortedSet => {
                let (start, stop) = self.rank_window()?;
                let descending = self
                    .ast
                    .ordering
                    .first()
                    .is_some_and(|o| o.direction == SortDirection::Desc);
                let verb = if descending { "ZREVRANGE" } else { "ZRANGE" };
                (
                    format!("{} {} {} {} WITHSCORES", verb, key, start, stop),
                    ResultShape::Members,
                )
            }
            DataStructure::List => {
                let (start, stop) = self.rank_window()?;
                (format!("LRANGE {} {} {}", key, start, stop), ResultShape::Members)
            }
        };
        Ok((vec![command], shape))
    }

    /// Inclusive rank range from LIMIT/OFFSET; `-1` means the end.
    fn rank_window(&self) -> Result<(u64, i64)> {
        let start = self.ast.offset.unwrap_or(0);
        match self.ast.limit {
            None => Ok((start, -1)),
            Some(0) => Err(QueryError::unsupported(BackendKind::KeyValue, "LIMIT 0 on a range read")),
            Some(limit) => {
                let stop = start
                    .checked_add(limit - 1)
                    .and_then(|stop| i64::try_from(stop).ok())
                    .ok_or_else(|| QueryError::query("LIMIT/OFFSET range overflows"))?;
                Ok((start, stop))
            }
        }
    }

    fn count(&self) -> Result<(Vec<String>, ResultShape)> {
        let id = match self.filter_id()? {
            Some(id) => id,
            None => return Ok((vec![self.scan()], ResultShape::Count)),
        };
        let verb = match self.target.structure {
            DataStructure::String => "EXISTS",
            DataStructure::Hash => "HLEN",
            DataStructure::Set => "SCARD",
            DataStructure::SortedSet => "ZCARD",
            DataStructure::List => "LLEN",
        };
        Ok((vec![format!("{} {}", verb, self.key(id))], ResultShape::Count))
    }

    /// Written fields minus the id, which lives in the key.
    fn value_fields<'b>(&self, entries: Vec<(&'b Field, &'b Param)>) -> Vec<(&'b Field, &'b Param)> {
        entries
            .into_iter()
            .filter(|(field, _)| field.name() != self.target.id_field)
            .collect()
    }

    fn write(&self, key: &str, fields: Vec<(&Field, &Param)>) -> Result<Vec<String>> {
        if fields.is_empty() {
            return Err(QueryError::query(format!(
                "{} on key {} writes no fields besides {}",
                self.ast.operation(),
                self.target.key_pattern,
                self.target.id_field
            )));
        }
        let ctx = &self.ctx;
        let values = || {
            fields
                .iter()
                .map(|(_, param)| ctx.placeholder(param))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let expire = |commands: &mut Vec<String>| {
            if let Some(ttl) = &self.ext.ttl {
                commands.push(format!("EXPIRE {} {}", key, ctx.placeholder(ttl)));
            }
        };

        let mut commands = Vec::new();
        match self.target.structure {
            DataStructure::String => {
                let [(_, value)] = fields.as_slice() else {
                    return Err(QueryError::unsupported(
                        BackendKind::KeyValue,
                        "writing more than one field to a string key",
                    ));
                };
                match &self.ext.ttl {
                    Some(ttl) => commands.push(format!(
                        "SETEX {} {} {}",
                        key,
                        ctx.placeholder(ttl),
                        ctx.placeholder(value)
                    )),
                    None => commands.push(format!("SET {} {}", key, ctx.placeholder(value))),
                }
            }
            DataStructure::Hash => {
                let pairs = fields
                    .iter()
                    .map(|(field, param)| format!("{} {}", field.name(), ctx.placeholder(param)))
                    .collect::<Vec<_>>()
                    .join(" ");
                commands.push(format!("HSET {} {}", key, pairs));
                expire(&mut commands);
            }
            DataStructure::Set => {
                commands.push(format!("SADD {} {}", key, values()));
                expire(&mut commands);
            }
            DataStructure::SortedSet => {
                let score = self.ext.score.as_ref().ok_or_else(|| {
                    QueryError::query("writing to a sorted set requires a score parameter")
                })?;
                let [(_, member)] = fields.as_slice() else {
                    return Err(QueryError::unsupported(
                        BackendKind::KeyValue,
                        "writing more than one member to a sorted set",
                    ));
                };
                commands.push(format!(
                    "ZADD {} {} {}",
                    key,
                    ctx.placeholder(score),
                    ctx.placeholder(member)
                ));
                expire(&mut commands);
            }
            DataStructure::List => {
                commands.push(format!("RPUSH {} {}", key, values()));
                expire(&mut commands);
            }
        }
        Ok(commands)
    }

    fn modified_fields(&self) -> Option<Vec<String>> {
        let names = |entries: Vec<(&Field, &Param)>| {
            self.value_fields(entries)
                .into_iter()
                .map(|(field, _)| field.name().to_string())
                .collect::<Vec<_>>()
        };
        match self.ast.operation() {
            Operation::Insert => self.ast.values.first().map(|row| names(sorted_entries(row))),
            Operation::Update => Some(names(sorted_entries(&self.ast.updates))),
            _ => None,
        }
    }
}
