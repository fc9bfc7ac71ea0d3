use polyquery::prelude::*;

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_table(
            "users",
            vec![
                ("id", SqlType::Text, false),
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
                ("id", SqlType::Text, false),
                ("user_id", SqlType::Text, false),
                ("total", SqlType::DoublePrecision, false),
            ],
        )
        .unwrap();
    registry
        .register_table(
            "media",
            vec![
                ("key", SqlType::Text, false),
                ("content_type", SqlType::Text, true),
                ("author", SqlType::Text, true),
            ],
        )
        .unwrap();
    registry
}

fn insert_users(r: &Registry, backend: BackendKind, columns: &[&str]) -> QueryAst {
    let row = columns
        .iter()
        .map(|c| (r.must_field("users", c), Param::must(c)))
        .collect();
    QueryBuilder::insert(backend, r.must_table("users"))
        .values(row)
        .must_build()
}

#[test]
fn test_sticky_error_preserved() {
    let r = registry();
    let first = Param::try_new("bad-name").unwrap_err();

    let builder = QueryBuilder::select(BackendKind::Relational, r.must_table("users"))
        .fail(first.clone())
        .where_eq(r.must_field("users", "id"), Param::must("id"))
        .where_group(LogicalOp::And, vec![])
        .limit(10);

    assert!(builder.is_errored());
    assert_eq!(builder.build().unwrap_err(), first);
}

#[test]
fn test_unknown_identifiers_rejected() {
    let r = registry();
    assert_eq!(
        r.try_table("accounts").unwrap_err(),
        QueryError::UnknownTable("accounts".into())
    );
    assert!(matches!(
        r.try_field("users", "name; DROP TABLE users").unwrap_err(),
        QueryError::InvalidIdentifier { .. }
    ));
    assert!(Alias::try_new("1alias").is_err());
}

#[test]
fn test_operation_gating_in_builder() {
    let r = registry();
    let err = QueryBuilder::update(BackendKind::ObjectStore, r.must_table("media"))
        .set(r.must_field("media", "author"), Param::must("author"))
        .build()
        .unwrap_err();
    assert_eq!(
        err,
        QueryError::UnsupportedOperation {
            operation: Operation::Update,
            backend: BackendKind::ObjectStore,
        }
    );
    let message = err.to_string();
    assert!(message.contains("UPDATE") && message.contains("object-store"));

    for op in [Operation::Listen, Operation::Notify, Operation::Unlisten] {
        let err = QueryBuilder::new(BackendKind::Search, op, r.must_table("users"))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::UnsupportedOperation {
                operation: op,
                backend: BackendKind::Search,
            }
        );
    }
}

#[test]
fn test_clause_gating_in_builder() {
    let r = registry();
    let sub = QueryBuilder::select(BackendKind::Relational, r.must_table("orders"))
        .field(r.must_field("orders", "user_id"))
        .must_build();

    let err = QueryBuilder::select(BackendKind::KeyValue, r.must_table("users"))
        .where_in_subquery(r.must_field("users", "id"), sub)
        .build()
        .unwrap_err();
    assert!(matches!(err, QueryError::Unsupported { backend: BackendKind::KeyValue, .. }));

    let err = QueryBuilder::select(BackendKind::Search, r.must_table("users"))
        .distinct()
        .build()
        .unwrap_err();
    assert!(matches!(err, QueryError::Unsupported { backend: BackendKind::Search, .. }));
}

#[test]
fn test_document_loader_goes_through_registry() {
    let r = registry();
    let doc = QueryDocument::from_json(
        r#"{"operation": "SELECT", "table": "users", "fields": ["ssn"]}"#,
    )
    .unwrap();
    assert_eq!(
        doc.build(&r, BackendKind::Relational).unwrap_err(),
        QueryError::UnknownField {
            table: "users".into(),
            field: "ssn".into(),
        }
    );
}

#[cfg(feature = "postgres")]
mod postgres_tests {
    use super::*;

    #[test]
    fn test_select_scenario() {
        let r = registry();
        let ast = QueryBuilder::select(BackendKind::Relational, r.must_table("users"))
            .where_eq(r.must_field("users", "name"), Param::must("p"))
            .limit(10)
            .must_build();
        let out = PostgresRenderer::new().render(&ast).unwrap();

        assert_eq!(out.representation, "SELECT * FROM users WHERE name = :p LIMIT 10");
        assert_eq!(out.required_params, vec!["p"]);
    }

    #[test]
    fn test_subquery_namespacing() {
        let r = registry();
        let sub = QueryBuilder::select(BackendKind::Relational, r.must_table("orders"))
            .field(r.must_field("orders", "user_id"))
            .where_gt(r.must_field("orders", "total"), Param::must("p"))
            .must_build();
        let ast = QueryBuilder::select(BackendKind::Relational, r.must_table("users"))
            .where_eq(r.must_field("users", "age"), Param::must("p"))
            .where_in_subquery(r.must_field("users", "id"), sub)
            .must_build();
        let out = PostgresRenderer::new().render(&ast).unwrap();

        assert_eq!(out.required_params, vec!["p", "sq1_p"]);
        assert!(out.representation.contains("age = :p"));
        assert!(out.representation.contains("total > :sq1_p"));
    }

    #[test]
    fn test_depth_four_rejected() {
        let r = registry();
        let mut query = QueryBuilder::select(BackendKind::Relational, r.must_table("orders"))
            .field(r.must_field("orders", "user_id"))
            .must_build();
        for _ in 0..3 {
            query = QueryBuilder::select(BackendKind::Relational, r.must_table("orders"))
                .field(r.must_field("orders", "user_id"))
                .where_in_subquery(r.must_field("orders", "id"), query)
                .must_build();
        }
        let ast = QueryBuilder::select(BackendKind::Relational, r.must_table("users"))
            .where_exists(query)
            .must_build();

        assert_eq!(
            PostgresRenderer::new().render(&ast).unwrap_err(),
            QueryError::DepthExceeded {
                depth: 4,
                max: polyquery::MAX_SUBQUERY_DEPTH,
            }
        );
    }

    #[test]
    fn test_insert_deterministic_under_insertion_order() {
        let r = registry();
        let renderer = PostgresRenderer::new();
        let a = renderer
            .render(&insert_users(&r, BackendKind::Relational, &["score", "name", "id", "email"]))
            .unwrap();
        let b = renderer
            .render(&insert_users(&r, BackendKind::Relational, &["email", "id", "score", "name"]))
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(
            a.representation,
            "INSERT INTO users (email, id, name, score) VALUES (:email, :id, :name, :score)"
        );
    }

    #[test]
    fn test_rendered_query_serializes() {
        let r = registry();
        let ast = QueryBuilder::count(BackendKind::Relational, r.must_table("users")).must_build();
        let out = PostgresRenderer::new().render(&ast).unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["metadata"]["operation"], "COUNT");
        assert_eq!(json["metadata"]["result_shape"], "count");
        assert!(json["metadata"].get("returned_fields").is_none());
    }

    #[test]
    fn test_document_renders_like_builder() {
        let r = registry();
        let doc = QueryDocument::from_yaml(
            "operation: update\ntable: users\nupdates: {score: score, name: name}\nwhere: {field: id, operator: '=', param: id}\nreturning: [id]\n",
        )
        .unwrap();
        let out = PostgresRenderer::new()
            .render(&doc.build(&r, BackendKind::Relational).unwrap())
            .unwrap();
        assert_eq!(
            out.representation,
            "UPDATE users SET name = :name, score = :score WHERE id = :id RETURNING id"
        );
        assert_eq!(out.metadata.result_shape, ResultShape::Rows);
    }
}

#[cfg(feature = "redis")]
mod redis_tests {
    use super::*;

    fn renderer(r: &Registry) -> RedisRenderer {
        RedisRenderer::new()
            .with_target(
                &r.must_table("users"),
                KeyValueTarget::new("user:{id}", DataStructure::Hash, "id"),
            )
            .unwrap()
    }

    #[test]
    fn test_hset_lexicographic() {
        let r = registry();
        let out = renderer(&r)
            .render(&insert_users(&r, BackendKind::KeyValue, &["score", "name", "id", "email"]))
            .unwrap();
        assert_eq!(
            out.representation,
            "HSET user::id email :email name :name score :score"
        );
        assert_eq!(out.required_params, vec!["id", "email", "name", "score"]);
    }

    #[test]
    fn test_group_where_fails_at_render() {
        let r = registry();
        let ast = QueryBuilder::select(BackendKind::KeyValue, r.must_table("users"))
            .where_eq(r.must_field("users", "id"), Param::must("id"))
            .where_eq(r.must_field("users", "name"), Param::must("name"))
            .must_build();
        assert!(matches!(
            renderer(&r).render(&ast),
            Err(QueryError::Unsupported { backend: BackendKind::KeyValue, .. })
        ));
    }
}

#[cfg(feature = "elasticsearch")]
mod elasticsearch_tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_like_wildcard_and_in_terms() {
        let r = registry();
        let renderer = ElasticsearchRenderer::new()
            .with_target(&r.must_table("users"), SearchTarget::new("users", "id"))
            .unwrap();
        let ast = QueryBuilder::select(BackendKind::Search, r.must_table("users"))
            .where_like(r.must_field("users", "name"), Param::must("pattern"))
            .where_in(r.must_field("users", "age"), Param::must("ages"))
            .must_build();
        let out = renderer.render(&ast).unwrap();

        let (line, body) = out.representation.split_once('\n').unwrap();
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(line, "POST /users/_search");
        assert_eq!(
            body["query"]["bool"]["must"],
            json!([
                { "wildcard": { "name": { "value": ":pattern" } } },
                { "terms": { "age": ":ages" } }
            ])
        );
        assert_eq!(out.required_params, vec!["pattern", "ages"]);
    }

    #[test]
    fn test_from_config_unregistered_table() {
        let r = registry();
        let renderer = ElasticsearchRenderer::from_config(
            &r,
            SearchConfig::from_json(r#"{"targets": {"orders": {"index": "orders", "id_field": "id"}}}"#)
                .unwrap(),
        )
        .unwrap();
        let ast = QueryBuilder::count(BackendKind::Search, r.must_table("users")).must_build();
        assert_eq!(
            renderer.render(&ast).unwrap_err(),
            QueryError::UnregisteredTarget {
                table: "users".into(),
                backend: BackendKind::Search,
            }
        );
    }
}

#[cfg(feature = "s3")]
mod s3_tests {
    use super::*;

    #[test]
    fn test_group_where_fails_at_render() {
        let r = registry();
        let renderer = S3Renderer::new()
            .with_target(&r.must_table("media"), ObjectTarget::new("media-bucket", "", "key"))
            .unwrap();
        let ast = QueryBuilder::delete(BackendKind::ObjectStore, r.must_table("media"))
            .where_eq(r.must_field("media", "key"), Param::must("a"))
            .or_filter(Condition::eq(r.must_field("media", "key"), Param::must("b")))
            .must_build();
        assert!(matches!(
            renderer.render(&ast),
            Err(QueryError::Unsupported { backend: BackendKind::ObjectStore, .. })
        ));
    }
}

#[cfg(all(feature = "postgres", feature = "redis", feature = "elasticsearch", feature = "s3"))]
mod cross_backend_tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn renderers(r: &Registry) -> Vec<Arc<dyn QueryRenderer>> {
        vec![
            Arc::new(PostgresRenderer::new()),
            Arc::new(
                RedisRenderer::new()
                    .with_target(
                        &r.must_table("users"),
                        KeyValueTarget::new("user:{id}", DataStructure::Hash, "id"),
                    )
                    .unwrap(),
            ),
            Arc::new(
                ElasticsearchRenderer::new()
                    .with_target(&r.must_table("users"), SearchTarget::new("users", "id"))
                    .unwrap(),
            ),
            Arc::new(
                S3Renderer::new()
                    .with_target(&r.must_table("users"), ObjectTarget::new("users-bucket", "u/", "id"))
                    .unwrap(),
            ),
        ]
    }

    #[test]
    fn test_same_query_every_backend() {
        let r = registry();
        for renderer in renderers(&r) {
            let ast = QueryBuilder::select(renderer.backend(), r.must_table("users"))
                .where_eq(r.must_field("users", "id"), Param::must("id"))
                .must_build();
            let out = renderer.render(&ast).unwrap();
            assert_eq!(out.required_params, vec!["id"], "{}", renderer.backend());
            assert_eq!(out.metadata.operation, Operation::Select);
        }
    }

    #[test]
    fn test_renderers_shared_across_threads() {
        let r = Arc::new(registry());
        let handles: Vec<_> = renderers(&r)
            .into_iter()
            .map(|renderer| {
                let r = Arc::clone(&r);
                thread::spawn(move || {
                    let ast = QueryBuilder::count(renderer.backend(), r.must_table("users")).must_build();
                    let first = renderer.render(&ast).unwrap();
                    let second = renderer.render(&ast).unwrap();
                    assert_eq!(first, second);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
