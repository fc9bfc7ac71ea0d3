//! Search renderer producing Elasticsearch REST requests.
//!
//! The representation is the request line (`METHOD /path`) followed, when
//! the request has a body, by a newline and compact JSON. Parameters appear
//! in bodies as the JSON string `":name"`.

use crate::ast::{Extension, Operation, QueryAst, SearchExt};
use crate::backend::{
    check_ast, sorted_entries, BackendKind, QueryMetadata, QueryRenderer, RenderedQuery,
    ResultField, ResultShape,
};
use crate::condition::Condition;
use crate::config::{RefreshPolicy, SearchConfig, SearchTarget, Targets};
use crate::context::{ParamSet, RenderContext};
use crate::error::{QueryError, Result};
use crate::operators::{ComparisonOp, LogicalOp};
use crate::schema::{Field, Param, Registry, Table};
use serde_json::{json, Map, Value};
use std::cell::RefCell;

#[derive(Debug, Clone)]
pub struct ElasticsearchRenderer {
    targets: Targets<SearchTarget>,
}

impl Default for ElasticsearchRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ElasticsearchRenderer {
    pub fn new() -> Self {
        Self {
            targets: Targets::new(BackendKind::Search),
        }
    }

    /// Bind `table` to an index.
    pub fn with_target(mut self, table: &Table, target: SearchTarget) -> Result<Self> {
        self.targets.register(table, target)?;
        Ok(self)
    }

    pub fn from_config(registry: &Registry, config: SearchConfig) -> Result<Self> {
        let mut renderer = Self::new();
        renderer.targets.register_all(registry, config)?;
        Ok(renderer)
    }
}

impl QueryRenderer for ElasticsearchRenderer {
    fn backend(&self) -> BackendKind {
        BackendKind::Search
    }

    fn render(&self, ast: &QueryAst) -> Result<RenderedQuery> {
        check_ast(BackendKind::Search, ast)?;
        let target = self.targets.resolve(ast.target())?;
        let ext = match ast.extension() {
            Extension::Search(ext) => ext,
            _ => return Err(QueryError::query("missing search extension block")),
        };
        tracing::debug!(
            operation = %ast.operation(),
            table = %ast.target(),
            index = %target.index,
            "rendering search request"
        );

        let params = RefCell::new(ParamSet::new());
        let request = RequestWriter {
            ast,
            ext,
            target,
            ctx: RenderContext::new(&params),
        };
        let (line, body, shape) = request.render()?;

        let representation = match body {
            Some(body) => format!("{}\n{}", line, serde_json::to_string(&body)?),
            None => line,
        };

        let mut metadata = QueryMetadata::new(ast, shape);
        match ast.operation() {
            Operation::Select if !ast.projection().is_empty() => {
                metadata.returned_fields = Some(
                    ast.projection()
                        .iter()
                        .filter_map(|s| s.output_name())
                        .map(|name| ResultField { name, metadata: None })
                        .collect(),
                );
            }
            Operation::Insert => {
                metadata.modified_fields = ast.values.first().map(field_names);
            }
            Operation::Update => metadata.modified_fields = Some(field_names(&ast.updates)),
            _ => {}
        }

        Ok(RenderedQuery {
            representation,
            required_params: params.into_inner().into_names(),
            metadata,
        })
    }
}

fn field_names(map: &std::collections::HashMap<Field, Param>) -> Vec<String> {
    sorted_entries(map)
        .into_iter()
        .map(|(field, _)| field.name().to_string())
        .collect()
}

struct RequestWriter<'a> {
    ast: &'a QueryAst,
    ext: &'a SearchExt,
    target: &'a SearchTarget,
    ctx: RenderContext<'a>,
}

impl<'a> RequestWriter<'a> {
    fn render(&self) -> Result<(String, Option<Value>, ResultShape)> {
        let index = &self.target.index;
        match self.ast.operation() {
            Operation::Select => {
                let body = self.search_body()?;
                Ok((format!("POST /{}/_search", index), Some(body), ResultShape::Documents))
            }
            Operation::Count => {
                let body = json!({ "query": self.query()? });
                Ok((format!("POST /{}/_count", index), Some(body), ResultShape::Count))
            }
            Operation::Insert => self.insert(),
            Operation::Update => {
                let query = self.query()?;
                let script = self.script()?;
                Ok((
                    format!(
                        "POST /{}/_update_by_query?refresh={}",
                        index,
                        by_query_refresh(self.target.refresh)
                    ),
                    Some(json!({ "query": query, "script": script })),
                    ResultShape::Affected,
                ))
            }
            Operation::Delete => self.delete(),
            op => Err(QueryError::UnsupportedOperation {
                operation: op,
                backend: BackendKind::Search,
            }),
        }
    }

    fn param(&self, param: &Param) -> Value {
        Value::String(self.ctx.placeholder(param))
    }

    fn query(&self) -> Result<Value> {
        match self.ast.filter() {
            Some(filter) => self.translate(filter),
            None => Ok(json!({ "match_all": {} })),
        }
    }

    fn search_body(&self) -> Result<Value> {
        let mut body = Map::new();
        body.insert("query".into(), self.query()?);

        if let Some(limit) = self.ast.limit {
            body.insert("size".into(), json!(limit));
        }
        if let Some(offset) = self.ast.offset {
            body.insert("from".into(), json!(offset));
        }
        if !self.ast.ordering.is_empty() {
            let sort: Vec<Value> = self
                .ast
                .ordering
                .iter()
                .map(|o| {
                    json!({ o.field.name(): { "order": o.direction.to_string().to_lowercase() } })
                })
                .collect();
            body.insert("sort".into(), Value::Array(sort));
        }
        if !self.ast.projection().is_empty() {
            let source: Vec<Value> = self
                .ast
                .projection()
                .iter()
                .filter_map(|s| s.as_field())
                .map(|f| json!(f.name()))
                .collect();
            body.insert("_source".into(), Value::Array(source));
        }
        if !self.ext.highlight.is_empty() {
            let fields: Map<String, Value> = self
                .ext
                .highlight
                .iter()
                .map(|f| (f.name().to_string(), json!({})))
                .collect();
            let mut highlight = Map::new();
            highlight.insert("fields".into(), Value::Object(fields));
            if let Some(size) = self.ext.fragment_size {
                highlight.insert("fragment_size".into(), json!(size));
            }
            body.insert("highlight".into(), Value::Object(highlight));
        }
        if let Some(min_score) = self.ext.min_score {
            body.insert("min_score".into(), json!(min_score));
        }

        Ok(Value::Object(body))
    }

    fn document(&self, row: &std::collections::HashMap<Field, Param>) -> Value {
        let doc: Map<String, Value> = sorted_entries(row)
            .into_iter()
            .map(|(field, param)| (field.name().to_string(), self.param(param)))
            .collect();
        Value::Object(doc)
    }

    fn insert(&self) -> Result<(String, Option<Value>, ResultShape)> {
        let row = self
            .ast
            .values
            .first()
            .ok_or_else(|| QueryError::query("INSERT must have at least one row of values"))?;
        let index = &self.target.index;
        let refresh = self.target.refresh.as_str();

        let id = row
            .iter()
            .find(|(field, _)| field.name() == self.target.id_field)
            .map(|(_, param)| param);
        let line = match id {
            Some(id) => format!(
                "PUT /{}/_doc/{}?refresh={}",
                index,
                self.ctx.placeholder(id),
                refresh
            ),
            None => format!("POST /{}/_doc?refresh={}", index, refresh),
        };
        Ok((line, Some(self.document(row)), ResultShape::Affected))
    }

    fn delete(&self) -> Result<(String, Option<Value>, ResultShape)> {
        let index = &self.target.index;
        if let Some(Condition::Simple {
            field,
            op: ComparisonOp::Eq,
            param: Some(id),
        }) = self.ast.filter()
        {
            if field.name() == self.target.id_field {
                return Ok((
                    format!(
                        "DELETE /{}/_doc/{}?refresh={}",
                        index,
                        self.ctx.placeholder(id),
                        self.target.refresh.as_str()
                    ),
                    None,
                    ResultShape::Affected,
                ));
            }
        }
        Ok((
            format!(
                "POST /{}/_delete_by_query?refresh={}",
                index,
                by_query_refresh(self.target.refresh)
            ),
            Some(json!({ "query": self.query()? })),
            ResultShape::Affected,
        ))
    }

    /// Painless script assigning each updated field from `params`.
    fn script(&self) -> Result<Value> {
        let entries = sorted_entries(&self.ast.updates);
        if entries.is_empty() {
            return Err(QueryError::query("UPDATE must have at least one SET value"));
        }
        let source = entries
            .iter()
            .map(|(field, _)| format!("ctx._source.{0} = params.{0}", field.name()))
            .collect::<Vec<_>>()
            .join("; ");
        let params: Map<String, Value> = entries
            .iter()
            .map(|(field, param)| (field.name().to_string(), self.param(param)))
            .collect();
        Ok(json!({
            "lang": "painless",
            "params": params,
            "source": source,
        }))
    }

    fn translate(&self, condition: &Condition) -> Result<Value> {
        match condition {
            Condition::Simple { field, op, param } => self.translate_simple(field, *op, param.as_ref()),
            Condition::Group { logic, conditions } => {
                let clauses = conditions
                    .iter()
                    .map(|c| self.translate(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(match logic {
                    LogicalOp::And => json!({ "bool": { "must": clauses } }),
                    LogicalOp::Or => json!({ "bool": { "should": clauses, "minimum_should_match": 1 } }),
                })
            }
            Condition::FieldComparison { .. } => Err(QueryError::unsupported(
                BackendKind::Search,
                "field-to-field comparisons",
            )),
            Condition::Subquery { .. } => Err(QueryError::unsupported(BackendKind::Search, "subqueries")),
        }
    }

    fn translate_simple(&self, field: &Field, op: ComparisonOp, param: Option<&Param>) -> Result<Value> {
        let name = field.name();
        let value = || {
            param.map(|p| self.param(p)).ok_or_else(|| {
                QueryError::query(format!("operator {} on field {} requires a parameter", op, field))
            })
        };

        Ok(match op {
            ComparisonOp::IsNull => must_not(json!({ "exists": { "field": name } })),
            ComparisonOp::IsNotNull => json!({ "exists": { "field": name } }),
            ComparisonOp::Eq => json!({ "term": { name: value()? } }),
            ComparisonOp::Ne => must_not(json!({ "term": { name: value()? } })),
            ComparisonOp::Lt => json!({ "range": { name: { "lt": value()? } } }),
            ComparisonOp::Le => json!({ "range": { name: { "lte": value()? } } }),
            ComparisonOp::Gt => json!({ "range": { name: { "gt": value()? } } }),
            ComparisonOp::Ge => json!({ "range": { name: { "gte": value()? } } }),
            ComparisonOp::Like => json!({ "wildcard": { name: { "value": value()? } } }),
            ComparisonOp::NotLike => must_not(json!({ "wildcard": { name: { "value": value()? } } })),
            ComparisonOp::ILike => json!({
                "wildcard": { name: { "value": value()?, "case_insensitive": true } }
            }),
            ComparisonOp::Match => match &self.target.analyzer {
                Some(analyzer) => json!({ "match": { name: { "query": value()?, "analyzer": analyzer } } }),
                None => json!({ "match": { name: { "query": value()? } } }),
            },
            ComparisonOp::In => json!({ "terms": { name: value()? } }),
            ComparisonOp::NotIn => must_not(json!({ "terms": { name: value()? } })),
        })
    }
}

fn must_not(clause: Value) -> Value {
    json!({ "bool": { "must_not": [clause] } })
}

/// By-query endpoints accept only `true`/`false`.
fn by_query_refresh(policy: RefreshPolicy) -> &'static str {
    match policy {
        RefreshPolicy::False => "false",
        RefreshPolicy::True | RefreshPolicy::WaitFor => "true",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::QueryBuilder;
    use crate::schema::SqlType;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_table(
                "products",
                vec![
                    ("sku", SqlType::Text, false),
                    ("name", SqlType::Text, false),
                    ("description", SqlType::Text, true),
                    ("price", SqlType::DoublePrecision, false),
                    ("tags", SqlType::Text, true),
                ],
            )
            .unwrap();
        registry
    }

    fn renderer(r: &Registry) -> ElasticsearchRenderer {
        ElasticsearchRenderer::new()
            .with_target(
                &r.must_table("products"),
                SearchTarget::new("products", "sku").with_analyzer("english"),
            )
            .unwrap()
    }

    fn select(r: &Registry) -> QueryBuilder {
        QueryBuilder::select(BackendKind::Search, r.must_table("products"))
    }

    fn render(r: &Registry, builder: QueryBuilder) -> RenderedQuery {
        renderer(r).render(&builder.must_build()).unwrap()
    }

    fn split(out: &RenderedQuery) -> (&str, Value) {
        let (line, body) = out.representation.split_once('\n').unwrap();
        (line, serde_json::from_str(body).unwrap())
    }

    #[test]
    fn test_like_and_in() {
        let r = registry();
        let out = render(
            &r,
            select(&r)
                .where_like(r.must_field("products", "name"), Param::must("pattern"))
                .where_in(r.must_field("products", "tags"), Param::must("tags"))
                .limit(5),
        );
        let (line, body) = split(&out);
        assert_eq!(line, "POST /products/_search");
        assert_eq!(
            body,
            json!({
                "query": { "bool": { "must": [
                    { "wildcard": { "name": { "value": ":pattern" } } },
                    { "terms": { "tags": ":tags" } }
                ] } },
                "size": 5
            })
        );
        assert_eq!(out.required_params, vec!["pattern", "tags"]);
        assert_eq!(out.metadata.result_shape, ResultShape::Documents);
    }

    #[test]
    fn test_match_all_and_body_options() {
        let r = registry();
        let out = render(
            &r,
            select(&r)
                .fields(vec![r.must_field("products", "sku"), r.must_field("products", "name")])
                .order_desc(r.must_field("products", "price"))
                .offset(10)
                .highlight(vec![r.must_field("products", "description")])
                .fragment_size(120)
                .min_score(0.5),
        );
        let (_, body) = split(&out);
        assert_eq!(
            body,
            json!({
                "query": { "match_all": {} },
                "from": 10,
                "sort": [{ "price": { "order": "desc" } }],
                "_source": ["sku", "name"],
                "highlight": { "fields": { "description": {} }, "fragment_size": 120 },
                "min_score": 0.5
            })
        );
        assert!(out.required_params.is_empty());
    }

    #[test]
    fn test_operator_translation() {
        let r = registry();
        let price = || r.must_field("products", "price");
        let name = || r.must_field("products", "name");
        let query = |builder: QueryBuilder| split(&render(&r, builder)).1["query"].clone();

        assert_eq!(
            query(select(&r).where_ne(name(), Param::must("n"))),
            json!({ "bool": { "must_not": [{ "term": { "name": ":n" } }] } })
        );
        assert_eq!(
            query(select(&r).where_ge(price(), Param::must("min"))),
            json!({ "range": { "price": { "gte": ":min" } } })
        );
        assert_eq!(
            query(select(&r).where_op(name(), ComparisonOp::ILike, Param::must("n"))),
            json!({ "wildcard": { "name": { "value": ":n", "case_insensitive": true } } })
        );
        assert_eq!(
            query(select(&r).where_op(name(), ComparisonOp::Match, Param::must("text"))),
            json!({ "match": { "name": { "query": ":text", "analyzer": "english" } } })
        );
        assert_eq!(
            query(select(&r).where_null(r.must_field("products", "description"))),
            json!({ "bool": { "must_not": [{ "exists": { "field": "description" } }] } })
        );
        assert_eq!(
            query(
                select(&r)
                    .where_eq(name(), Param::must("a"))
                    .or_filter(Condition::eq(name(), Param::must("b")))
            ),
            json!({ "bool": {
                "should": [{ "term": { "name": ":a" } }, { "term": { "name": ":b" } }],
                "minimum_should_match": 1
            } })
        );
    }

    #[test]
    fn test_insert_with_and_without_id() {
        let r = registry();
        let with_id = render(
            &r,
            QueryBuilder::insert(BackendKind::Search, r.must_table("products")).values(vec![
                (r.must_field("products", "price"), Param::must("price")),
                (r.must_field("products", "sku"), Param::must("sku")),
                (r.must_field("products", "name"), Param::must("name")),
            ]),
        );
        let (line, body) = split(&with_id);
        assert_eq!(line, "PUT /products/_doc/:sku?refresh=false");
        assert_eq!(body, json!({ "name": ":name", "price": ":price", "sku": ":sku" }));
        assert_eq!(with_id.required_params, vec!["sku", "name", "price"]);
        assert_eq!(
            with_id.representation.lines().nth(1),
            Some(r#"{"name":":name","price":":price","sku":":sku"}"#)
        );

        let without_id = render(
            &r,
            QueryBuilder::insert(BackendKind::Search, r.must_table("products"))
                .values(vec![(r.must_field("products", "name"), Param::must("name"))]),
        );
        assert_eq!(split(&without_id).0, "POST /products/_doc?refresh=false");
    }

    #[test]
    fn test_update_by_query_script() {
        let r = registry();
        let out = render(
            &r,
            QueryBuilder::update(BackendKind::Search, r.must_table("products"))
                .set(r.must_field("products", "price"), Param::must("price"))
                .set(r.must_field("products", "name"), Param::must("name"))
                .where_eq(r.must_field("products", "sku"), Param::must("sku")),
        );
        let (line, body) = split(&out);
        assert_eq!(line, "POST /products/_update_by_query?refresh=false");
        assert_eq!(
            body,
            json!({
                "query": { "term": { "sku": ":sku" } },
                "script": {
                    "lang": "painless",
                    "source": "ctx._source.name = params.name; ctx._source.price = params.price",
                    "params": { "name": ":name", "price": ":price" }
                }
            })
        );
        assert_eq!(out.required_params, vec!["sku", "name", "price"]);
    }

    #[test]
    fn test_delete_by_id_and_by_query() {
        let r = registry();
        let renderer = ElasticsearchRenderer::new()
            .with_target(
                &r.must_table("products"),
                SearchTarget::new("products", "sku").with_refresh(RefreshPolicy::WaitFor),
            )
            .unwrap();

        let by_id = QueryBuilder::delete(BackendKind::Search, r.must_table("products"))
            .where_eq(r.must_field("products", "sku"), Param::must("sku"))
            .must_build();
        assert_eq!(
            renderer.render(&by_id).unwrap().representation,
            "DELETE /products/_doc/:sku?refresh=wait_for"
        );

        let by_query = QueryBuilder::delete(BackendKind::Search, r.must_table("products"))
            .where_lt(r.must_field("products", "price"), Param::must("price"))
            .must_build();
        assert_eq!(
            renderer.render(&by_query).unwrap().representation,
            "POST /products/_delete_by_query?refresh=true\n{\"query\":{\"range\":{\"price\":{\"lt\":\":price\"}}}}"
        );
    }

    #[test]
    fn test_count() {
        let r = registry();
        let out = render(
            &r,
            QueryBuilder::count(BackendKind::Search, r.must_table("products"))
                .where_eq(r.must_field("products", "name"), Param::must("name")),
        );
        assert_eq!(
            out.representation,
            "POST /products/_count\n{\"query\":{\"term\":{\"name\":\":name\"}}}"
        );
        assert_eq!(out.metadata.result_shape, ResultShape::Count);
    }

    #[test]
    fn test_listen_rejected_in_builder() {
        let r = registry();
        let err = QueryBuilder::listen(BackendKind::Search, r.must_table("products"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::UnsupportedOperation {
                operation: Operation::Listen,
                backend: BackendKind::Search,
            }
        );
    }
}
