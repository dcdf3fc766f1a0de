//! Database executor traits.
//!
//! [`Executor`] (blocking) and [`AsyncExecutor`] (suspension-based) are the
//! bridge between the query layer and concrete backends. Both evaluate
//! [`QuerySet`] descriptions directly; a SQL backend compiles them, the
//! in-memory test backend interprets them. Every method call is one
//! database round-trip.
//!
//! Backends are expected to support nested `begin` calls (savepoints) and to
//! report uniqueness, not-null and foreign-key violations as
//! [`OrmError::IntegrityError`].

use schema_orm_core::{OrmError, OrmResult};

use crate::model::Model;
use crate::query::queryset::{QuerySet, SelectColumn};
use crate::value::{Record, Value};

/// Blocking database executor.
pub trait Executor: Send + Sync {
    /// Evaluates `columns` for every row matched by `qs`, honoring its
    /// ordering and slice window.
    fn fetch(&self, qs: &QuerySet, columns: &[SelectColumn]) -> OrmResult<Vec<Record>>;

    /// Counts the rows matched by `qs`.
    fn count(&self, qs: &QuerySet) -> OrmResult<usize>;

    /// Returns `true` if `qs` matches at least one row.
    fn exists(&self, qs: &QuerySet) -> OrmResult<bool> {
        Ok(self.count(&qs.clone().without_ordering().limit(1))? > 0)
    }

    /// Inserts a row (all tables of an inheritance chain) and returns its primary key.
    fn insert(&self, model: &Model, values: &Record) -> OrmResult<Value>;

    /// Inserts only the child-table portion of `model` for a primary key
    /// whose parent rows already exist.
    fn insert_child(&self, model: &Model, values: &Record) -> OrmResult<()>;

    /// Updates every row matched by `qs`, returning the affected-row count.
    fn update(&self, qs: &QuerySet, values: &Record) -> OrmResult<usize>;

    /// Deletes every row matched by `qs`, returning the affected-row count.
    fn delete(&self, qs: &QuerySet) -> OrmResult<usize>;

    /// Opens a transaction, or a savepoint inside an open one.
    fn begin(&self) -> OrmResult<()>;

    /// Commits the innermost transaction or savepoint.
    fn commit(&self) -> OrmResult<()>;

    /// Rolls back the innermost transaction or savepoint.
    fn rollback(&self) -> OrmResult<()>;
}

/// Suspension-based database executor. Mirrors [`Executor`] method for method.
#[async_trait::async_trait]
pub trait AsyncExecutor: Send + Sync {
    /// See [`Executor::fetch`].
    async fn fetch(&self, qs: &QuerySet, columns: &[SelectColumn]) -> OrmResult<Vec<Record>>;

    /// See [`Executor::count`].
    async fn count(&self, qs: &QuerySet) -> OrmResult<usize>;

    /// See [`Executor::exists`].
    async fn exists(&self, qs: &QuerySet) -> OrmResult<bool> {
        Ok(self.count(&qs.clone().without_ordering().limit(1)).await? > 0)
    }

    /// See [`Executor::insert`].
    async fn insert(&self, model: &Model, values: &Record) -> OrmResult<Value>;

    /// See [`Executor::insert_child`].
    async fn insert_child(&self, model: &Model, values: &Record) -> OrmResult<()>;

    /// See [`Executor::update`].
    async fn update(&self, qs: &QuerySet, values: &Record) -> OrmResult<usize>;

    /// See [`Executor::delete`].
    async fn delete(&self, qs: &QuerySet) -> OrmResult<usize>;

    /// See [`Executor::begin`].
    async fn begin(&self) -> OrmResult<()>;

    /// See [`Executor::commit`].
    async fn commit(&self) -> OrmResult<()>;

    /// See [`Executor::rollback`].
    async fn rollback(&self) -> OrmResult<()>;
}

/// Fetches every concrete field of the single row matched by `qs`.
///
/// Returns `Ok(None)` when nothing matches and
/// [`OrmError::MultipleObjectsReturned`] when more than one row does.
pub fn get_instance(db: &dyn Executor, qs: &QuerySet) -> OrmResult<Option<Record>> {
    let columns = concrete_columns(qs.model());
    let rows = qs.clone().limit(2).fetch(db, &columns)?;
    single_row(qs.model(), rows)
}

/// Async form of [`get_instance`].
pub async fn aget_instance(db: &dyn AsyncExecutor, qs: &QuerySet) -> OrmResult<Option<Record>> {
    let columns = concrete_columns(qs.model());
    let rows = qs.clone().limit(2).afetch(db, &columns).await?;
    single_row(qs.model(), rows)
}

fn concrete_columns(model: &Model) -> Vec<SelectColumn> {
    model
        .concrete_fields()
        .into_iter()
        .map(|f| SelectColumn::column(f.name.clone()))
        .collect()
}

fn single_row(model: &Model, mut rows: Vec<Record>) -> OrmResult<Option<Record>> {
    match rows.len() {
        0 => Ok(None),
        1 => Ok(rows.pop()),
        _ => Err(OrmError::MultipleObjectsReturned(model.ident().to_string())),
    }
}
