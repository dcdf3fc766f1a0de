//! # schema-orm-test
//!
//! Testing support for schema-orm. Provides [`MemoryDatabase`], an
//! in-memory backend implementing both executor traits with relational
//! constraint checks and statement counting, query-count assertions for
//! catching N+1 regressions, and a fixture model set with seed data.

// Test-support crate: panicking fixtures are documented where they occur.
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::float_cmp)]

pub mod assert_queries;
mod engine;
pub mod fixtures;
pub mod memory_database;

pub use assert_queries::{
    assert_max_queries, assert_max_queries_sync, assert_num_queries, assert_num_queries_sync,
};
pub use memory_database::MemoryDatabase;
