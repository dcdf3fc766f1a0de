//! A small social-network model set with seed data.
//!
//! | model     | fields                                                          |
//! |-----------|-----------------------------------------------------------------|
//! | `user`    | `id`, `username` (unique), `email?`, `created_at`, `followings` |
//! | `follow`  | `id`, `follower` → user, `following` → user                     |
//! | `article` | `id`, `title`, `views` (default 0), `author` → user, `created_at` |
//! | `comment` | `id`, `body`, `article` → article, `author?` → user             |
//! | `profile` | `id`, `user` ↔ user, `bio?`                                     |
//! | `admin`   | inherits `user`; `level` (default 1)                            |
//!
//! Reverse names: `user.followers`, `user.following_links`,
//! `user.follower_links`, `user.articles`, `user.comments`, `user.profile`,
//! `article.comments`.

use schema_orm_core::OrmResult;
use schema_orm_db::executor::Executor;
use schema_orm_db::model::{FieldDef, FieldType, ModelDef, Registry};
use schema_orm_db::value::{record, Value};

/// Builds the fixture registry.
///
/// # Panics
///
/// Panics if the fixture declarations are inconsistent.
pub fn registry() -> Registry {
    Registry::builder()
        .model(
            ModelDef::new("user")
                .field(FieldDef::auto_pk("id"))
                .field(FieldDef::new("username", FieldType::CharField).unique())
                .field(FieldDef::new("email", FieldType::CharField).nullable())
                .field(FieldDef::new("created_at", FieldType::DateTimeField).auto_now_add())
                .field(
                    FieldDef::many_to_many("followings", "user", "follow", "follower", "following")
                        .related_name("followers"),
                ),
        )
        .model(
            ModelDef::new("follow")
                .field(FieldDef::auto_pk("id"))
                .field(FieldDef::foreign_key("follower", "user").related_name("following_links"))
                .field(FieldDef::foreign_key("following", "user").related_name("follower_links")),
        )
        .model(
            ModelDef::new("article")
                .field(FieldDef::auto_pk("id"))
                .field(FieldDef::new("title", FieldType::CharField))
                .field(FieldDef::new("views", FieldType::IntegerField).default(0))
                .field(FieldDef::foreign_key("author", "user").related_name("articles"))
                .field(FieldDef::new("created_at", FieldType::DateTimeField).auto_now_add()),
        )
        .model(
            ModelDef::new("comment")
                .field(FieldDef::auto_pk("id"))
                .field(FieldDef::new("body", FieldType::TextField))
                .field(FieldDef::foreign_key("article", "article").related_name("comments"))
                .field(
                    FieldDef::foreign_key("author", "user")
                        .nullable()
                        .related_name("comments"),
                ),
        )
        .model(
            ModelDef::new("profile")
                .field(FieldDef::auto_pk("id"))
                .field(FieldDef::one_to_one("user", "user").related_name("profile"))
                .field(FieldDef::new("bio", FieldType::TextField).nullable()),
        )
        .model(
            ModelDef::new("admin")
                .parent("user")
                .field(FieldDef::new("level", FieldType::IntegerField).default(1)),
        )
        .build()
        .expect("fixture registry is valid")
}

/// Inserts the seed rows:
///
/// - users `alice` (1), `bob` (2, no email) and `carol` (3, also an admin
///   with level 2);
/// - follows alice → bob, bob → alice, carol → alice;
/// - articles `Intro` (1, alice, 10 views), `Rust` (2, alice, 30 views),
///   `Async` (3, bob, 5 views);
/// - comments `Nice` (article 1, bob), `Thanks` (article 1, alice),
///   `Great` (article 3, carol);
/// - a profile (1) for alice with bio `Hello`.
///
/// # Errors
///
/// Returns the first insert error.
pub fn seed(db: &dyn Executor, registry: &Registry) -> OrmResult<()> {
    let user = registry.model("user")?;
    let follow = registry.model("follow")?;
    let article = registry.model("article")?;
    let comment = registry.model("comment")?;
    let profile = registry.model("profile")?;
    let admin = registry.model("admin")?;

    for (id, username, email) in [
        (1, "alice", Some("alice@example.com")),
        (2, "bob", None),
        (3, "carol", Some("carol@example.com")),
    ] {
        db.insert(
            &user,
            &record([
                ("id", Value::from(id)),
                ("username", Value::from(username)),
                ("email", Value::from(email)),
            ]),
        )?;
    }
    db.insert_child(&admin, &record([("id", Value::from(3)), ("level", Value::from(2))]))?;

    for (follower, following) in [(1, 2), (2, 1), (3, 1)] {
        db.insert(
            &follow,
            &record([
                ("follower", Value::from(follower)),
                ("following", Value::from(following)),
            ]),
        )?;
    }

    for (id, title, author, views) in [(1, "Intro", 1, 10), (2, "Rust", 1, 30), (3, "Async", 2, 5)] {
        db.insert(
            &article,
            &record([
                ("id", Value::from(id)),
                ("title", Value::from(title)),
                ("author", Value::from(author)),
                ("views", Value::from(views)),
            ]),
        )?;
    }

    for (id, body, on, author) in [(1, "Nice", 1, 2), (2, "Thanks", 1, 1), (3, "Great", 3, 3)] {
        db.insert(
            &comment,
            &record([
                ("id", Value::from(id)),
                ("body", Value::from(body)),
                ("article", Value::from(on)),
                ("author", Value::from(author)),
            ]),
        )?;
    }

    db.insert(
        &profile,
        &record([
            ("id", Value::from(1)),
            ("user", Value::from(1)),
            ("bio", Value::from("Hello")),
        ]),
    )?;
    Ok(())
}
