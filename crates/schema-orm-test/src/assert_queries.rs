//! Query counting assertions for database tests.
//!
//! Provides [`assert_num_queries`] which counts the statements a
//! [`MemoryDatabase`] executes during an async closure and asserts that the
//! count matches an expected value. This is how N+1 regressions in schema
//! serialization are caught. Blocking forms are provided for the sync API.
//!
//! ## Example
//!
//! ```rust,no_run
//! use schema_orm_test::{assert_num_queries, MemoryDatabase};
//!
//! async fn example(db: &MemoryDatabase) {
//!     assert_num_queries(db, 0, || async {
//!         // nothing touches the database
//!     })
//!     .await;
//! }
//! ```

use std::future::Future;

use crate::memory_database::MemoryDatabase;

/// Asserts that exactly `expected_count` queries are executed during the
/// async closure.
///
/// Resets the query counter on the [`MemoryDatabase`] before executing the
/// closure, then checks the counter after execution.
///
/// # Panics
///
/// Panics if the number of queries does not match `expected_count`.
pub async fn assert_num_queries<F, Fut, T>(db: &MemoryDatabase, expected_count: usize, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    db.reset_query_count();
    let result = f().await;
    let actual = db.query_count();
    assert_eq!(
        actual,
        expected_count,
        "Expected {expected_count} SQL queries, but {actual} were executed: {:?}",
        db.statements()
    );
    result
}

/// Asserts that at most `max_count` queries are executed during the async
/// closure.
///
/// # Panics
///
/// Panics if more than `max_count` queries are executed.
pub async fn assert_max_queries<F, Fut, T>(db: &MemoryDatabase, max_count: usize, f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    db.reset_query_count();
    let result = f().await;
    let actual = db.query_count();
    assert!(
        actual <= max_count,
        "Expected at most {max_count} SQL queries, but {actual} were executed"
    );
    result
}

/// Blocking form of [`assert_num_queries`].
///
/// # Panics
///
/// Panics if the number of queries does not match `expected_count`.
pub fn assert_num_queries_sync<T>(db: &MemoryDatabase, expected_count: usize, f: impl FnOnce() -> T) -> T {
    db.reset_query_count();
    let result = f();
    let actual = db.query_count();
    assert_eq!(
        actual,
        expected_count,
        "Expected {expected_count} SQL queries, but {actual} were executed: {:?}",
        db.statements()
    );
    result
}

/// Blocking form of [`assert_max_queries`].
///
/// # Panics
///
/// Panics if more than `max_count` queries are executed.
pub fn assert_max_queries_sync<T>(db: &MemoryDatabase, max_count: usize, f: impl FnOnce() -> T) -> T {
    db.reset_query_count();
    let result = f();
    let actual = db.query_count();
    assert!(
        actual <= max_count,
        "Expected at most {max_count} SQL queries, but {actual} were executed"
    );
    result
}
