//! The async compiler against the same scenarios as the blocking one.

use std::sync::Arc;

use schema_orm_core::{ErrorKind, OrmError};
use schema_orm_db::query::{AggregateFunc, Expression, OrderBy};
use schema_orm_db::value::record;
use schema_orm_db::{ConnectionRegistry, Record, Registry, Value};
use schema_orm_query::{
    Field, FieldFunc, Filter, IgnoreErrors, QueryContext, QuerySchema, SaveOptions, Schema, TransactionMode,
};
use schema_orm_test::{assert_num_queries, fixtures, MemoryDatabase};

fn setup() -> (Arc<MemoryDatabase>, ConnectionRegistry, Registry) {
    let registry = fixtures::registry();
    let db = Arc::new(MemoryDatabase::new());
    let connections = ConnectionRegistry::new();
    connections.register("default", Arc::clone(&db));
    fixtures::seed(&*db, &registry).unwrap();
    db.reset_query_count();
    (db, connections, registry)
}

fn ids(value: &Value) -> Vec<i64> {
    let mut ids: Vec<i64> = value
        .clone()
        .into_items()
        .iter()
        .filter_map(|v| v.as_map()?.get("id")?.as_int())
        .collect();
    ids.sort_unstable();
    ids
}

fn follow_schema(registry: &Registry) -> Schema {
    Schema::builder("User", &registry.model("user").unwrap())
        .field(Field::new("username"))
        .field(Field::new("followers").schema_self())
        .field(Field::new("followings").schema_self())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_cycle_matches_blocking_query_count() {
    let (db, connections, registry) = setup();
    let schema = follow_schema(&registry);

    for concurrent in [true, false] {
        let ctx = QueryContext::new().concurrent(concurrent);
        let alice = assert_num_queries(&db, 6, || async {
            schema.ainit(&connections, Value::from(1), &ctx).await.unwrap()
        })
        .await;
        assert_eq!(ids(&alice.data()["followers"]), [2, 3]);
        assert_eq!(ids(&alice.data()["followings"]), [2]);

        let bob = assert_num_queries(&db, 3, || async {
            schema.ainit(&connections, Value::from(2), &ctx).await.unwrap()
        })
        .await;
        assert_eq!(ids(&bob.data()["followers"]), [1]);
    }
}

#[tokio::test]
async fn test_async_sliced_aggregate() {
    let (_db, connections, registry) = setup();
    let user = registry.model("user").unwrap();
    let schema = Schema::builder("User", &user)
        .field(Field::expression(
            "total_views",
            Expression::aggregate(AggregateFunc::Sum, Expression::col("articles.views")),
        ))
        .build()
        .unwrap();
    let qs = user
        .objects()
        .order_by(vec![OrderBy::asc(Expression::col("id"))])
        .limit(2);
    let rows = schema
        .aget_values(&connections, qs, &QueryContext::new())
        .await
        .unwrap();
    let totals: Vec<Value> = rows.iter().map(|r| r["total_views"].clone()).collect();
    assert_eq!(totals, [Value::from(40), Value::from(5)]);
}

#[tokio::test]
async fn test_async_failures_follow_policy() {
    let (_db, connections, registry) = setup();
    let user = registry.model("user").unwrap();
    let broken = Field::function(
        "score",
        FieldFunc::constant(|| Err(OrmError::OperationalError("timeout".into()))),
    );
    let strict = Schema::builder("User", &user)
        .field(Field::new("username"))
        .field(Field::new("articles"))
        .field(broken.clone())
        .build()
        .unwrap();
    let err = strict
        .ainit(&connections, Value::from(1), &QueryContext::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IsolatedField);

    let lenient = Schema::builder("User", &user)
        .field(Field::new("username"))
        .field(Field::new("articles"))
        .field(broken.fail_silently())
        .build()
        .unwrap();
    let alice = lenient
        .ainit(&connections, Value::from(1), &QueryContext::new())
        .await
        .unwrap();
    assert_eq!(alice.data()["score"], Value::Null);
    assert_eq!(alice.data()["articles"], Value::List(vec![Value::from(1), Value::from(2)]));
}

#[tokio::test]
async fn test_async_save_round_trip() {
    let (db, connections, registry) = setup();
    let user = registry.model("user").unwrap();
    let schema = Schema::builder("User", &user)
        .field(Field::new("username"))
        .build()
        .unwrap();
    let ctx = QueryContext::new();

    let pk = schema
        .asave(&connections, &record([("username", Value::from("dave"))]), &ctx, &SaveOptions::default())
        .await
        .unwrap();
    let retry = record([("id", pk.clone()), ("username", Value::from("dave"))]);
    let err = schema
        .asave(&connections, &retry, &ctx, &SaveOptions::default().must_create(true))
        .await
        .unwrap_err();
    assert!(err.is_integrity());
    assert_eq!(
        schema.asave(&connections, &retry, &ctx, &SaveOptions::default()).await.unwrap(),
        pk
    );
    assert_eq!(db.rows(&user).len(), 4);

    let saved = schema
        .abulk_save(
            &connections,
            &[record([("username", Value::from("alice"))]), record([("username", Value::from("erin"))])],
            &ctx,
            &SaveOptions::default().ignore_bulk_errors(true),
        )
        .await
        .unwrap();
    assert!(saved[0].is_none());
    assert!(saved[1].is_some());
}

#[tokio::test]
async fn test_async_nested_rollback() {
    let (db, connections, registry) = setup();
    let article = Schema::builder("Article", &registry.model("article").unwrap())
        .field(Field::new("title"))
        .build()
        .unwrap();
    let schema = Schema::builder("Author", &registry.model("user").unwrap())
        .field(Field::new("username"))
        .field(Field::new("articles").schema(&article))
        .build()
        .unwrap();
    let data = record([
        ("username", Value::from("dave")),
        (
            "articles",
            Value::List(vec![
                Value::Map(record([("title", Value::from("One"))])),
                Value::Map(record([("title", Value::Null)])),
            ]),
        ),
    ]);
    let ctx = QueryContext::new();

    assert!(schema
        .asave(&connections, &data, &ctx, &SaveOptions::default())
        .await
        .is_err());
    let count = |name: &str| db.rows(&registry.model(name).unwrap()).len();
    assert_eq!((count("user"), count("article")), (3, 3));
    assert!(!db.in_transaction());

    let options = SaveOptions::default()
        .transaction(TransactionMode::None)
        .ignore_relation_errors(IgnoreErrors::All);
    schema.asave(&connections, &data, &ctx, &options).await.unwrap();
    assert_eq!((count("user"), count("article")), (4, 4));

    // inside a transaction the skipped relation leaves nothing behind
    let mut data = data;
    data.insert("username".to_string(), Value::from("erin"));
    let options = SaveOptions::default().ignore_relation_errors(IgnoreErrors::All);
    schema.asave(&connections, &data, &ctx, &options).await.unwrap();
    assert_eq!((count("user"), count("article")), (5, 4));
    assert!(!db.in_transaction());
}

#[tokio::test]
async fn test_async_count_ignores_pagination() {
    let (db, _connections, registry) = setup();
    let article = registry.model("article").unwrap();
    let query = QuerySchema::builder(&article)
        .filter(Filter::new("author"))
        .pagination("page", "limit")
        .build()
        .unwrap();
    let input: Record = record([
        ("author", Value::from(1)),
        ("page", Value::from(2)),
        ("limit", Value::from(1)),
    ]);
    let bound = query.bind(&input).unwrap();
    assert_eq!(bound.acount(&*db, article.objects()).await.unwrap(), 2);
}
