//! # schema-orm
//!
//! Declarative schemas over a relational model layer.
//!
//! This is the meta-crate that re-exports the sub-crates for convenient
//! access. A [`Schema`] names the fields to read or write; the compiler
//! turns it into one direct fetch plus one batched query per isolated
//! field on reads, and into transactional inserts, updates and relation
//! writes on saves.
//!
//! ```ignore
//! use schema_orm::prelude::*;
//!
//! let article = Schema::builder("Article", &registry.model("article")?)
//!     .field(Field::new("title"))
//!     .build()?;
//! let author = Schema::builder("Author", &registry.model("user")?)
//!     .field(Field::new("username"))
//!     .field(Field::new("articles").schema(&article))
//!     .build()?;
//! let rows = author.get_values(&connections, Value::from(1), &QueryContext::new())?;
//! ```

/// Error types, settings, and logging setup.
pub use schema_orm_core as core;

/// Values, models, querysets, executors, and transactions.
pub use schema_orm_db as db;

/// Schemas, the query compiler, and query schemas.
pub use schema_orm_query as query;

/// In-memory backend, fixtures, and query-count assertions.
#[cfg(feature = "testing")]
pub use schema_orm_test as test;

// Third-party re-exports
pub use async_trait::async_trait;
pub use chrono;
pub use serde;
pub use serde_json;
pub use tracing;

pub use schema_orm_query::{Field, QueryContext, SaveOptions, Schema};

/// The types most programs need.
pub mod prelude {
    pub use schema_orm_core::{ErrorKind, OrmError, OrmResult, Settings};
    pub use schema_orm_db::{
        AggregateFunc, ConnectionRegistry, Expression, Lookup, Model, OrderBy, QuerySet, Record,
        Registry, Value, Q,
    };
    pub use schema_orm_query::{
        Field, FieldFunc, Filter, FuncOutput, IgnoreErrors, Order, QueryContext, QuerySchema,
        SaveOptions, Schema, SchemaInstance, TransactionMode,
    };
}
