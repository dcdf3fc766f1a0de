use std::sync::Arc;

use schema_orm::prelude::*;
use schema_orm_test::{fixtures, MemoryDatabase};

#[tokio::test]
async fn test_prelude_covers_a_full_round_trip() {
    let registry = fixtures::registry();
    let db = Arc::new(MemoryDatabase::new());
    let connections = ConnectionRegistry::new();
    connections.register("default", Arc::clone(&db));
    fixtures::seed(&*db, &registry).unwrap();

    let article = Schema::builder("Article", &registry.model("article").unwrap())
        .field(Field::new("title"))
        .build()
        .unwrap();
    let author = Schema::builder("Author", &registry.model("user").unwrap())
        .field(Field::new("username"))
        .field(Field::new("articles").schema(&article))
        .build()
        .unwrap();

    let data = schema_orm::db::value::record([
        ("username", Value::from("dave")),
        (
            "articles",
            Value::List(vec![Value::Map(schema_orm::db::value::record([(
                "title",
                Value::from("Hello"),
            )]))]),
        ),
    ]);
    let ctx = QueryContext::new();
    let pk = author
        .asave(&connections, &data, &ctx, &SaveOptions::default())
        .await
        .unwrap();

    let dave = author.ainit(&connections, pk, &ctx).await.unwrap();
    let json = dave.to_json();
    assert_eq!(json["username"], "dave");
    assert_eq!(json["articles"][0]["title"], "Hello");
}
