//! # schema-orm-query
//!
//! The schema layer of schema-orm: declarative schemas over models, and the
//! engine that turns them into reads and writes.
//!
//! ## Architecture
//!
//! A [`Schema`] is built once from [`Field`] declarations. The classifier
//! decides for every field whether it is a plain column, an annotated
//! expression, an isolated field resolved by a follow-up query (relation,
//! queryset or function), or unmapped. At call time the query compiler
//! fetches columns and expressions in one query, resolves each isolated field
//! with one more query over every owning key, and serializes nested schemas
//! recursively under a [`RecursionGuard`] shared by the whole call tree.
//! Writes split input data into columns, relation keys and nested relation
//! objects and persist them inside an optional transaction.
//!
//! Every entry point has a blocking form over
//! [`Executor`](schema_orm_db::Executor) and an async form over
//! [`AsyncExecutor`](schema_orm_db::AsyncExecutor), sharing all non-I/O code.
//!
//! ## Module Overview
//!
//! - [`field`] - Field declarations, modes, defaults and function sources
//! - [`classifier`] - Classified fields
//! - [`schema`] - Schemas, mode variants and serialization entry points
//! - [`context`] - Per-call scope, error policy and the recursion guard
//! - [`compiler`] - The blocking and async query compilers
//! - [`generator`] - Filter, order and pagination inputs over a queryset

// These clippy lints are intentionally allowed for the schema crate:
// - struct_excessive_bools: SchemaField and SaveOptions carry one flag per option
// - too_many_lines: classification and the write state machine are long match chains
// - result_large_err: OrmError is the workspace error type and is used consistently
// - doc_markdown: backtick requirements for documentation items are too strict
// - needless_pass_by_value: builder APIs take owned values
// - return_self_not_must_use: builder pattern methods are self-documenting
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::result_large_err)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::use_self)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::type_complexity)]
// significant_drop_tightening: false positives with lock guards held across match arms
#![allow(clippy::significant_drop_tightening)]

pub mod classifier;
pub mod compiler;
pub mod context;
pub mod field;
pub mod generator;
pub mod schema;

// Re-export the most commonly used types at the crate root.
pub use classifier::{FieldKind, Isolation, SchemaField};
pub use compiler::{AsyncQueryCompiler, IgnoreErrors, QueryCompiler, SaveOptions, TransactionMode};
pub use context::{GuardKey, QueryContext, RecursionGuard, Scope};
pub use field::{
    DefaultFactory, Field, FieldFunc, FieldMode, FuncOutput, OperationMode, Property, QuerysetSource,
    RelatedSchema, ReturnRule, SchemaSlot,
};
pub use generator::{BoundQuery, Filter, Order, QuerySchema, QuerySchemaBuilder};
pub use schema::{to_record, QuerySource, Schema, SchemaBuilder, SchemaId, SchemaInstance};
