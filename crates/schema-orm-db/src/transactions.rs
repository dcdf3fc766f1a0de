//! Scoped transactions.
//!
//! [`Atomic`] (blocking) and [`AsyncAtomic`] (suspension-based) are guards
//! around one transaction or savepoint. They roll back on every exit path
//! that does not explicitly commit: an early `?` return, a panic unwinding
//! through the scope, or, for the async guard, the owning future being
//! dropped (cancelled). [`atomic`] and [`atomic_async`] wrap a closure in a
//! guard, committing on `Ok` and rolling back on `Err`.
//!
//! Nesting is delegated to the executor: a `begin` inside an open
//! transaction opens a savepoint.
//!
//! # Examples
//!
//! ```ignore
//! use schema_orm_db::transactions::atomic;
//!
//! let pk = atomic(db, || {
//!     let pk = user.objects().create(db, &data)?;
//!     profile.objects().create(db, &profile_data)?;
//!     Ok(pk)
//! })?;
//! ```

use std::future::Future;
use std::sync::Arc;

use schema_orm_core::OrmResult;

use crate::executor::{AsyncExecutor, Executor};

/// A blocking transaction guard that rolls back unless committed.
pub struct Atomic<'a> {
    db: &'a dyn Executor,
    finished: bool,
}

impl<'a> Atomic<'a> {
    /// Opens a transaction (or savepoint) on `db`.
    pub fn begin(db: &'a dyn Executor) -> OrmResult<Self> {
        db.begin()?;
        Ok(Self {
            db,
            finished: false,
        })
    }

    /// Commits the transaction.
    pub fn commit(mut self) -> OrmResult<()> {
        self.finished = true;
        self.db.commit()
    }

    /// Rolls the transaction back.
    pub fn rollback(mut self) -> OrmResult<()> {
        self.finished = true;
        self.db.rollback()
    }
}

impl Drop for Atomic<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.db.rollback() {
                tracing::warn!(error = %e, "rollback of abandoned transaction failed");
            }
        }
    }
}

/// Runs `f` inside a transaction: commit on `Ok`, roll back on `Err`.
pub fn atomic<T, F>(db: &dyn Executor, f: F) -> OrmResult<T>
where
    F: FnOnce() -> OrmResult<T>,
{
    let txn = Atomic::begin(db)?;
    match f() {
        Ok(result) => {
            txn.commit()?;
            Ok(result)
        }
        Err(e) => {
            // Attempt to rollback; if rollback fails, return the original error
            if let Err(rollback_err) = txn.rollback() {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

/// A suspension-based transaction guard.
///
/// Dropping the guard without committing (for example when the future
/// holding it is cancelled) schedules a rollback on the current Tokio
/// runtime.
pub struct AsyncAtomic {
    db: Arc<dyn AsyncExecutor>,
    finished: bool,
}

impl AsyncAtomic {
    /// Opens a transaction (or savepoint) on `db`.
    pub async fn begin(db: Arc<dyn AsyncExecutor>) -> OrmResult<Self> {
        db.begin().await?;
        Ok(Self {
            db,
            finished: false,
        })
    }

    /// Commits the transaction.
    pub async fn commit(mut self) -> OrmResult<()> {
        self.finished = true;
        self.db.commit().await
    }

    /// Rolls the transaction back.
    pub async fn rollback(mut self) -> OrmResult<()> {
        self.finished = true;
        self.db.rollback().await
    }
}

impl Drop for AsyncAtomic {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let db = Arc::clone(&self.db);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = db.rollback().await {
                        tracing::warn!(error = %e, "rollback of cancelled transaction failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!("transaction guard dropped outside a runtime; rollback skipped");
            }
        }
    }
}

/// Runs the future produced by `f` inside a transaction: commit on `Ok`,
/// roll back on `Err` or cancellation.
pub async fn atomic_async<T, F, Fut>(db: Arc<dyn AsyncExecutor>, f: F) -> OrmResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = OrmResult<T>>,
{
    let txn = AsyncAtomic::begin(db).await?;
    match f().await {
        Ok(result) => {
            txn.commit().await?;
            Ok(result)
        }
        Err(e) => {
            if let Err(rollback_err) = txn.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::query::queryset::{QuerySet, SelectColumn};
    use crate::value::{Record, Value};
    use schema_orm_core::OrmError;
    use std::sync::Mutex;

    /// A mock executor that records transaction statements.
    #[derive(Default)]
    struct MockDb {
        log: Mutex<Vec<&'static str>>,
    }

    impl MockDb {
        fn push(&self, stmt: &'static str) {
            self.log.lock().unwrap().push(stmt);
        }

        fn log(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    impl Executor for MockDb {
        fn fetch(&self, _: &QuerySet, _: &[SelectColumn]) -> OrmResult<Vec<Record>> {
            Ok(Vec::new())
        }
        fn count(&self, _: &QuerySet) -> OrmResult<usize> {
            Ok(0)
        }
        fn insert(&self, _: &Model, _: &Record) -> OrmResult<Value> {
            self.push("INSERT");
            Ok(Value::Int(1))
        }
        fn insert_child(&self, _: &Model, _: &Record) -> OrmResult<()> {
            Ok(())
        }
        fn update(&self, _: &QuerySet, _: &Record) -> OrmResult<usize> {
            Ok(0)
        }
        fn delete(&self, _: &QuerySet) -> OrmResult<usize> {
            Ok(0)
        }
        fn begin(&self) -> OrmResult<()> {
            self.push("BEGIN");
            Ok(())
        }
        fn commit(&self) -> OrmResult<()> {
            self.push("COMMIT");
            Ok(())
        }
        fn rollback(&self) -> OrmResult<()> {
            self.push("ROLLBACK");
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl AsyncExecutor for MockDb {
        async fn fetch(&self, qs: &QuerySet, cols: &[SelectColumn]) -> OrmResult<Vec<Record>> {
            Executor::fetch(self, qs, cols)
        }
        async fn count(&self, qs: &QuerySet) -> OrmResult<usize> {
            Executor::count(self, qs)
        }
        async fn insert(&self, model: &Model, values: &Record) -> OrmResult<Value> {
            Executor::insert(self, model, values)
        }
        async fn insert_child(&self, model: &Model, values: &Record) -> OrmResult<()> {
            Executor::insert_child(self, model, values)
        }
        async fn update(&self, qs: &QuerySet, values: &Record) -> OrmResult<usize> {
            Executor::update(self, qs, values)
        }
        async fn delete(&self, qs: &QuerySet) -> OrmResult<usize> {
            Executor::delete(self, qs)
        }
        async fn begin(&self) -> OrmResult<()> {
            Executor::begin(self)
        }
        async fn commit(&self) -> OrmResult<()> {
            Executor::commit(self)
        }
        async fn rollback(&self) -> OrmResult<()> {
            Executor::rollback(self)
        }
    }

    #[test]
    fn test_atomic_commits_on_ok() {
        let db = MockDb::default();
        let result = atomic(&db, || Ok(42));
        assert_eq!(result.unwrap(), 42);
        assert_eq!(db.log(), vec!["BEGIN", "COMMIT"]);
    }

    #[test]
    fn test_atomic_rolls_back_on_err() {
        let db = MockDb::default();
        let result: OrmResult<()> = atomic(&db, || Err(OrmError::IntegrityError("dup".into())));
        assert!(result.unwrap_err().is_integrity());
        assert_eq!(db.log(), vec!["BEGIN", "ROLLBACK"]);
    }

    #[test]
    fn test_guard_rolls_back_on_drop() {
        let db = MockDb::default();
        {
            let _txn = Atomic::begin(&db).unwrap();
        }
        assert_eq!(db.log(), vec!["BEGIN", "ROLLBACK"]);
    }

    #[test]
    fn test_guard_commit_disarms_drop() {
        let db = MockDb::default();
        Atomic::begin(&db).unwrap().commit().unwrap();
        assert_eq!(db.log(), vec!["BEGIN", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_atomic_async_commit_and_rollback() {
        let db = Arc::new(MockDb::default());
        let handle: Arc<dyn AsyncExecutor> = db.clone();
        let ok = atomic_async(Arc::clone(&handle), || async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let err: OrmResult<()> = atomic_async(handle, || async {
            Err(OrmError::DatabaseError("boom".into()))
        })
        .await;
        assert!(err.is_err());
        assert_eq!(db.log(), vec!["BEGIN", "COMMIT", "BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_async_guard_rolls_back_when_dropped() {
        let db = Arc::new(MockDb::default());
        let handle: Arc<dyn AsyncExecutor> = db.clone();
        let guard = AsyncAtomic::begin(handle).await.unwrap();
        drop(guard);
        // let the spawned rollback run
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(db.log(), vec!["BEGIN", "ROLLBACK"]);
    }
}
