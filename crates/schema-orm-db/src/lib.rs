//! # schema-orm-db
//!
//! Model layer of schema-orm. Provides the runtime model [`Registry`](model::Registry),
//! the lazy [`QuerySet`](query::QuerySet), the backend-agnostic
//! [`Value`](value::Value) and the [`Executor`](executor::Executor) traits that
//! concrete backends implement.
//!
//! ## Architecture
//!
//! A [`QuerySet`](query::QuerySet) describes a query through method chaining
//! without touching the database. Work only happens when a terminal method
//! (`fetch`, `count`, `update`, ...) hands the description to an executor,
//! blocking or suspension-based. Every terminal call is one round-trip.
//!
//! ## Module Overview
//!
//! - [`model`] - Field definitions, model metadata and relation path resolution
//! - [`value`] - The [`Value`](value::Value) enum and [`Record`](value::Record) rows
//! - [`query`] - Lookups, `Q` objects, expressions and the lazy `QuerySet`
//! - [`executor`] - Blocking and async executor traits
//! - [`connections`] - Database aliases mapped to executors
//! - [`transactions`] - Scoped transaction guards

// These clippy lints are intentionally allowed for the model crate:
// - struct_excessive_bools: FieldDef carries one flag per column option
// - too_many_lines: path resolution and registry validation are long match chains
// - cast_precision_loss: i64-to-f64 casts are acceptable for numeric comparisons
// - result_large_err: OrmError is the workspace error type and is used consistently
// - doc_markdown: backtick requirements for documentation items are too strict
// - needless_pass_by_value: builder APIs take owned values
// - return_self_not_must_use: builder pattern methods are self-documenting
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::result_large_err)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::use_self)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::match_same_arms)]
// significant_drop_tightening: false positives with lock guards held across match arms
#![allow(clippy::significant_drop_tightening)]

pub mod connections;
pub mod executor;
pub mod model;
pub mod query;
pub mod transactions;
pub mod value;

// Re-export the most commonly used types at the crate root.
pub use connections::{Connection, ConnectionRegistry};
pub use executor::{aget_instance, get_instance, AsyncExecutor, Executor};
pub use model::{FieldDef, FieldType, Model, ModelDef, Registry, ResolvedPath};
pub use query::{
    AggregateFunc, Expression, Lookup, NullsOrder, OrderBy, QuerySet, SelectColumn, Subquery,
    When, Q,
};
pub use transactions::{atomic, atomic_async, AsyncAtomic, Atomic};
pub use value::{Record, Value};
