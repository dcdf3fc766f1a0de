//! Read-path behavior against the seeded in-memory database.

use std::sync::Arc;

use indexmap::IndexMap;
use schema_orm_core::{ErrorKind, OrmError};
use schema_orm_db::query::{AggregateFunc, Expression, Lookup, OrderBy, Q};
use schema_orm_db::{ConnectionRegistry, Model, Registry, Value};
use schema_orm_query::{Field, FieldFunc, FuncOutput, QueryContext, QuerySource, Schema, SchemaSlot};
use schema_orm_test::{assert_num_queries_sync, fixtures, MemoryDatabase};

struct Env {
    db: Arc<MemoryDatabase>,
    connections: ConnectionRegistry,
    registry: Registry,
}

impl Env {
    fn new() -> Self {
        let registry = fixtures::registry();
        let db = Arc::new(MemoryDatabase::new());
        let connections = ConnectionRegistry::new();
        connections.register("default", Arc::clone(&db));
        fixtures::seed(&*db, &registry).unwrap();
        db.reset_query_count();
        Self {
            db,
            connections,
            registry,
        }
    }

    fn model(&self, name: &str) -> Model {
        self.registry.model(name).unwrap()
    }
}

fn ids(value: &Value) -> Vec<i64> {
    value
        .clone()
        .into_items()
        .iter()
        .filter_map(|v| v.as_map()?.get("id")?.as_int())
        .collect()
}

fn article_schema(env: &Env) -> Schema {
    Schema::builder("Article", &env.model("article"))
        .field(Field::new("title"))
        .field(Field::new("views"))
        .build()
        .unwrap()
}

fn follow_schema(env: &Env) -> Schema {
    Schema::builder("User", &env.model("user"))
        .field(Field::new("username"))
        .field(Field::new("followers").schema_self())
        .field(Field::new("followings").schema_self())
        .build()
        .unwrap()
}

#[test]
fn test_duplicate_keys_return_one_row_each_in_first_seen_order() {
    let env = Env::new();
    let schema = Schema::builder("User", &env.model("user"))
        .field(Field::new("username"))
        .build()
        .unwrap();
    let pks = vec![Value::from(2), Value::from(1), Value::from(2), Value::from(1)];
    let rows = schema
        .get_values(&env.connections, pks, &QueryContext::new())
        .unwrap();
    let names: Vec<&str> = rows.iter().filter_map(|r| r.get("username")?.as_str()).collect();
    assert_eq!(names, ["bob", "alice"]);
    assert_eq!(env.db.query_count(), 1);
}

#[test]
fn test_isolated_fields_present_without_matches() {
    let env = Env::new();
    let profile = Schema::builder("Profile", &env.model("profile"))
        .field(Field::new("bio"))
        .build()
        .unwrap();
    let schema = Schema::builder("User", &env.model("user"))
        .field(Field::new("username"))
        .field(Field::new("articles").schema(&article_schema(&env)))
        .field(Field::new("profile").schema(&profile))
        .build()
        .unwrap();
    let rows = schema
        .get_values(&env.connections, vec![Value::from(3), Value::from(1)], &QueryContext::new())
        .unwrap();

    let carol = &rows[0];
    assert_eq!(carol.get("articles"), Some(&Value::List(vec![])));
    assert_eq!(carol.get("profile"), Some(&Value::Null));

    let alice = &rows[1];
    assert_eq!(ids(&alice["articles"]), [1, 2]);
    let bio = alice["profile"].as_map().and_then(|p| p.get("bio")).cloned();
    assert_eq!(bio, Some(Value::from("Hello")));
}

#[test]
fn test_self_referential_schema_terminates_on_cycle() {
    let env = Env::new();
    let schema = follow_schema(&env);
    let ctx = QueryContext::new();

    let alice = assert_num_queries_sync(&env.db, 6, || {
        schema.init(&env.connections, Value::from(1), &ctx).unwrap()
    });
    let mut followers = ids(&alice.data()["followers"]);
    followers.sort_unstable();
    assert_eq!(followers, [2, 3]);
    assert_eq!(ids(&alice.data()["followings"]), [2]);

    // bob's nested view of alice is the snapshot taken before her
    // relations were resolved
    let bob = alice.data()["followings"].clone().into_items().remove(0);
    let bob = bob.as_map().unwrap();
    assert_eq!(bob.get("username"), Some(&Value::from("bob")));
    assert_eq!(ids(&bob["followers"]), [1]);
    let nested_alice = bob["followers"].clone().into_items().remove(0);
    assert_eq!(nested_alice.as_map().unwrap().get("username"), Some(&Value::from("alice")));
    assert!(env.db.statements().iter().all(|s| s == "SELECT user"));
}

#[test]
fn test_same_schema_under_two_scopes_keeps_each_shape() {
    let env = Env::new();
    let schema = Schema::builder("User", &env.model("user"))
        .field(Field::new("username"))
        .field(Field::new("email"))
        .field(Field::new("followers").schema_self())
        .field(Field::new("followings").schema_self())
        .build()
        .unwrap();
    let ctx = QueryContext::new().include(["followers.email", "followings.username"]);

    // bob is both a follower and a following of alice, each with its own fetch
    let alice = assert_num_queries_sync(&env.db, 5, || {
        schema.init(&env.connections, Value::from(1), &ctx).unwrap()
    });
    let keys = |row: &Value| {
        let mut keys: Vec<String> = row.as_map().unwrap().keys().cloned().collect();
        keys.sort_unstable();
        keys
    };

    let followers = alice.data()["followers"].clone().into_items();
    assert_eq!(followers.len(), 2);
    for follower in &followers {
        assert_eq!(keys(follower), ["email", "id"]);
    }
    let followings = alice.data()["followings"].clone().into_items();
    assert_eq!(followings.len(), 1);
    assert_eq!(keys(&followings[0]), ["id", "username"]);
    assert_eq!(
        followings[0].as_map().unwrap().get("username"),
        Some(&Value::from("bob"))
    );
    assert!(alice.data().get("username").is_none());
}

#[test]
fn test_shared_context_skips_resolved_rows() {
    let env = Env::new();
    let schema = follow_schema(&env);
    let ctx = QueryContext::new();
    schema.init(&env.connections, Value::from(1), &ctx).unwrap();
    env.db.reset_query_count();

    // direct fetch plus the two link queries; alice is not serialized again
    let bob = assert_num_queries_sync(&env.db, 3, || {
        schema.init(&env.connections, Value::from(2), &ctx).unwrap()
    });
    assert_eq!(ids(&bob.data()["followers"]), [1]);
    assert_eq!(ids(&bob.data()["followings"]), [1]);
}

#[test]
fn test_sliced_sum_counts_every_related_row() {
    let env = Env::new();
    let user = env.model("user");
    let schema = Schema::builder("User", &user)
        .field(Field::new("username"))
        .field(Field::expression(
            "total_views",
            Expression::aggregate(AggregateFunc::Sum, Expression::col("articles.views")),
        ))
        .build()
        .unwrap();
    let qs = user.objects().order_by(vec![OrderBy::asc(Expression::col("id"))]).limit(2);
    let rows = schema
        .get_values(&env.connections, qs, &QueryContext::new())
        .unwrap();
    let totals: Vec<Value> = rows.iter().map(|r| r["total_views"].clone()).collect();
    assert_eq!(totals, [Value::from(40), Value::from(5)]);
}

#[test]
fn test_scope_reaches_nested_schemas() {
    let env = Env::new();
    let schema = Schema::builder("User", &env.model("user"))
        .field(Field::new("username"))
        .field(Field::new("email"))
        .field(Field::new("articles").schema(&article_schema(&env)))
        .build()
        .unwrap();
    let ctx = QueryContext::new().include(["username", "articles.title"]);
    let alice = schema.init(&env.connections, Value::from(1), &ctx).unwrap();
    assert!(alice.get("email").is_none());
    assert_eq!(alice.pk(), Some(&Value::from(1)));
    let first = alice.data()["articles"].clone().into_items().remove(0);
    let first = first.as_map().unwrap();
    assert_eq!(first.get("title"), Some(&Value::from("Intro")));
    assert!(first.get("views").is_none());

    let ctx = QueryContext::new().exclude(["articles"]);
    let alice = assert_num_queries_sync(&env.db, 1, || {
        schema.init(&env.connections, Value::from(1), &ctx).unwrap()
    });
    assert!(alice.get("articles").is_none());
}

#[test]
fn test_function_fields() {
    let env = Env::new();
    let article = env.model("article");
    let top = article.clone();
    let schema = Schema::builder("User", &env.model("user"))
        .field(Field::new("username"))
        .field(Field::function(
            "site",
            FieldFunc::constant(|| Ok(FuncOutput::Value(Value::from("demo")))),
        ))
        .field(Field::function(
            "top_article",
            FieldFunc::per_pk(move |pk| {
                Ok(FuncOutput::Queryset(
                    top.objects()
                        .filter(Q::filter("author", Lookup::Exact(pk.clone())))
                        .order_by(vec![OrderBy::desc(Expression::col("views"))])
                        .limit(1),
                ))
            })
            .returns_related("article"),
        )
        .schema(&article_schema(&env))
        .single())
        .field(Field::function(
            "badge",
            FieldFunc::batch(|pks| {
                let mut out = IndexMap::new();
                for pk in pks {
                    let badge = if pk.as_int() == Some(1) { "founder" } else { "member" };
                    out.insert(pk.clone(), FuncOutput::Value(Value::from(badge)));
                }
                Ok(out)
            }),
        ))
        .build()
        .unwrap();

    let rows = schema
        .get_values(&env.connections, vec![Value::from(1), Value::from(3)], &QueryContext::new())
        .unwrap();
    assert_eq!(rows[0]["site"], Value::from("demo"));
    assert_eq!(rows[1]["site"], Value::from("demo"));
    assert_eq!(rows[0]["badge"], Value::from("founder"));
    assert_eq!(rows[1]["badge"], Value::from("member"));
    let top = rows[0]["top_article"].as_map().unwrap();
    assert_eq!(top.get("title"), Some(&Value::from("Rust")));
    assert_eq!(rows[1]["top_article"], Value::Null);
}

#[test]
fn test_queryset_fields_detect_their_link() {
    let env = Env::new();
    let article = env.model("article");
    let schema = Schema::builder("User", &env.model("user"))
        .field(Field::new("username"))
        .field(
            Field::queryset(
                "popular",
                article
                    .objects()
                    .filter(Q::filter("views", Lookup::Gte(Value::from(10)))),
            )
            .schema(&article_schema(&env)),
        )
        .field(Field::queryset(
            "latest",
            article.objects().order_by(vec![OrderBy::desc(Expression::col("id"))]).limit(1),
        ))
        .build()
        .unwrap();
    let rows = schema
        .get_values(&env.connections, vec![Value::from(1), Value::from(2)], &QueryContext::new())
        .unwrap();
    assert_eq!(ids(&rows[0]["popular"]), [1, 2]);
    assert_eq!(rows[1]["popular"], Value::List(vec![]));
    // the sliced queryset runs once per owner
    assert_eq!(rows[0]["latest"], Value::List(vec![Value::from(2)]));
    assert_eq!(rows[1]["latest"], Value::List(vec![Value::from(3)]));
}

#[test]
fn test_properties_see_hidden_dependencies() {
    let env = Env::new();
    let schema = Schema::builder("User", &env.model("user"))
        .field(Field::new("username"))
        .field(Field::new("email"))
        .field(Field::property("contact", ["username", "email"], |row| {
            let name = row.get("username").map(ToString::to_string).unwrap_or_default();
            match row.get("email").and_then(Value::as_str) {
                Some(email) => Value::from(format!("{name} <{email}>")),
                None => Value::from(name),
            }
        }))
        .build()
        .unwrap();
    let ctx = QueryContext::new().include(["contact"]);
    let rows = schema
        .get_values(&env.connections, vec![Value::from(1), Value::from(2)], &ctx)
        .unwrap();
    assert_eq!(rows[0]["contact"], Value::from("alice <alice@example.com>"));
    assert_eq!(rows[1]["contact"], Value::from("bob"));
    assert!(rows[0].get("email").is_none());
}

#[test]
fn test_failing_function_policy() {
    let env = Env::new();
    let broken = || {
        FieldFunc::per_pk(|_| Err(OrmError::DatabaseError("lookup service down".into())))
    };
    let strict = Schema::builder("User", &env.model("user"))
        .field(Field::new("username"))
        .field(Field::function("score", broken()))
        .build()
        .unwrap();
    let err = strict
        .init(&env.connections, Value::from(1), &QueryContext::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IsolatedField);
    assert_eq!(err.root().kind(), ErrorKind::Database);

    let lenient = Schema::builder("User", &env.model("user"))
        .field(Field::new("username"))
        .field(Field::function("score", broken()).fail_silently())
        .build()
        .unwrap();
    let alice = lenient
        .init(&env.connections, Value::from(1), &QueryContext::new())
        .unwrap();
    assert_eq!(alice.data()["score"], Value::Null);

    let ctx = QueryContext::new().force_raise_error(true);
    assert!(lenient.init(&env.connections, Value::from(1), &ctx).is_err());
}

#[test]
fn test_init_on_empty_source() {
    let env = Env::new();
    let schema = article_schema(&env);
    let err = schema
        .init(&env.connections, Value::from(99), &QueryContext::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyQueryset);

    let none = schema.model().objects().none();
    let rows = assert_num_queries_sync(&env.db, 0, || {
        schema.get_values(&env.connections, none, &QueryContext::new()).unwrap()
    });
    assert!(rows.is_empty());
}

#[test]
fn test_records_source_and_parse() {
    #[derive(serde::Deserialize)]
    struct Title {
        id: i64,
        title: String,
    }

    let env = Env::new();
    let schema = article_schema(&env);
    let earlier = schema
        .get_values(&env.connections, Value::from(3), &QueryContext::new())
        .unwrap();
    let again = schema
        .serialize(&env.connections, QuerySource::Records(earlier), &QueryContext::new())
        .unwrap();
    let parsed: Title = again[0].parse().unwrap();
    assert_eq!(parsed.id, 3);
    assert_eq!(parsed.title, "Async");
}

#[test]
fn test_schema_slot_binds_late() {
    let env = Env::new();
    let slot = SchemaSlot::new();
    let schema = Schema::builder("Comment", &env.model("comment"))
        .field(Field::new("body"))
        .field(Field::new("article").schema_slot(&slot))
        .build()
        .unwrap();
    slot.set(article_schema(&env)).unwrap();
    let great = schema
        .init(&env.connections, Value::from(3), &QueryContext::new())
        .unwrap();
    let article = great.data()["article"].as_map().unwrap();
    assert_eq!(article.get("title"), Some(&Value::from("Async")));
}
