//! An in-memory database for tests.
//!
//! [`MemoryDatabase`] implements both [`Executor`] and [`AsyncExecutor`] by
//! interpreting querysets against in-memory tables. It enforces the
//! constraints a relational backend would (NOT NULL, UNIQUE, FOREIGN KEY),
//! stores multi-table inheritance as one table per model, cascades deletes,
//! supports nested transactions through snapshots, and counts every data
//! statement for [`assert_num_queries`](crate::assert_num_queries).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use schema_orm_db::connections::ConnectionRegistry;
//! use schema_orm_test::MemoryDatabase;
//!
//! let db = Arc::new(MemoryDatabase::new());
//! let connections = ConnectionRegistry::new();
//! connections.register("default", Arc::clone(&db));
//! assert_eq!(db.query_count(), 0);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use schema_orm_core::{OrmError, OrmResult};
use schema_orm_db::executor::{AsyncExecutor, Executor};
use schema_orm_db::model::{FieldDef, FieldType, Model};
use schema_orm_db::query::{QuerySet, SelectColumn};
use schema_orm_db::value::{Record, Value};

use crate::engine::{Evaluator, Store};

#[derive(Debug, Default)]
struct State {
    store: Store,
    savepoints: Vec<Store>,
}

/// An in-memory database with statement counting.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    state: Mutex<State>,
    query_count: AtomicUsize,
    statements: Mutex<Vec<String>>,
}

impl MemoryDatabase {
    /// Creates an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of data statements executed since the last reset.
    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Resets the statement counter and log.
    pub fn reset_query_count(&self) {
        self.query_count.store(0, Ordering::SeqCst);
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// The statements executed since the last reset, such as `"SELECT user"`.
    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every stored row of `model` with all its concrete columns, in
    /// insertion order. Not counted as a statement.
    pub fn rows(&self, model: &Model) -> Vec<Record> {
        let state = self.lock();
        state
            .store
            .keys(model)
            .iter()
            .map(|pk| state.store.full_row(model, pk))
            .collect()
    }

    /// Returns `true` while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        !self.lock().savepoints.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, statement: String) {
        tracing::debug!(%statement, "memory database statement");
        self.query_count.fetch_add(1, Ordering::SeqCst);
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(statement);
    }

    fn read<T>(&self, statement: String, f: impl FnOnce(&Store) -> OrmResult<T>) -> OrmResult<T> {
        self.record(statement);
        let state = self.lock();
        f(&state.store)
    }

    /// Runs `f` on a copy of the store, keeping the copy only on success.
    fn write<T>(
        &self,
        statement: String,
        f: impl FnOnce(&mut Store) -> OrmResult<T>,
    ) -> OrmResult<T> {
        self.record(statement);
        let mut state = self.lock();
        let mut draft = state.store.clone();
        let result = f(&mut draft)?;
        state.store = draft;
        Ok(result)
    }
}

fn check_columns(model: &Model, values: &Record) -> OrmResult<()> {
    for name in values.keys() {
        if name == "pk" {
            continue;
        }
        match model.get_field(name) {
            Ok(field) if field.is_concrete() => {}
            _ => {
                return Err(OrmError::DatabaseError(format!(
                    "table {model} has no column named {name}"
                )))
            }
        }
    }
    Ok(())
}

fn given_pk(model: &Model, values: &Record) -> Option<Value> {
    values
        .get(model.pk_name())
        .or_else(|| values.get("pk"))
        .filter(|v| !v.is_null())
        .cloned()
}

fn default_for(field: &FieldDef) -> Value {
    if field.auto_now || field.auto_now_add {
        let now = Utc::now();
        return match field.field_type {
            FieldType::DateField => Value::Date(now.date_naive()),
            _ => Value::DateTime(now),
        };
    }
    field.default.clone().unwrap_or(Value::Null)
}

fn root_of(model: &Model) -> Model {
    model.lineage().pop().unwrap_or_else(|| model.clone())
}

/// Writes the part of a row stored in `model`'s own table.
fn write_local(store: &mut Store, model: &Model, pk: &Value, values: &Record) {
    let row: Record = model
        .local_concrete_fields()
        .into_iter()
        .map(|field| {
            let value = if field.primary_key {
                pk.clone()
            } else {
                values
                    .get(&field.name)
                    .cloned()
                    .unwrap_or_else(|| default_for(field))
            };
            (field.name.clone(), value)
        })
        .collect();
    store.table_mut(model).rows.insert(pk.clone(), row);
}

fn validate_row(store: &Store, model: &Model, pk: &Value) -> OrmResult<()> {
    for m in model.lineage() {
        for field in m.local_concrete_fields() {
            if field.primary_key {
                continue;
            }
            let value = store.cell(&m, pk, &field.name);
            if value.is_null() {
                if !field.null {
                    return Err(OrmError::IntegrityError(format!(
                        "NOT NULL constraint failed: {m}.{}",
                        field.name
                    )));
                }
                continue;
            }
            if field.unique
                && store
                    .keys(&m)
                    .iter()
                    .any(|other| other != pk && store.cell(&m, other, &field.name) == value)
            {
                return Err(OrmError::IntegrityError(format!(
                    "UNIQUE constraint failed: {m}.{}",
                    field.name
                )));
            }
            if matches!(
                field.field_type,
                FieldType::ForeignKey { .. } | FieldType::OneToOneField { .. }
            ) {
                let target = m.related_model(field)?;
                if !store.contains(&target, &value) {
                    return Err(OrmError::IntegrityError(format!(
                        "FOREIGN KEY constraint failed: {m}.{}",
                        field.name
                    )));
                }
            }
        }
    }
    Ok(())
}

fn insert_row(store: &mut Store, model: &Model, values: &Record) -> OrmResult<Value> {
    check_columns(model, values)?;
    let root = root_of(model);
    let pk_field = model.get_field(model.pk_name())?;
    let pk = match given_pk(model, values) {
        Some(pk) => pk,
        None if pk_field.field_type.is_auto() => Value::Int(store.table_mut(&root).last_id + 1),
        None => default_for(pk_field),
    };
    if pk.is_null() {
        return Err(OrmError::IntegrityError(format!(
            "NOT NULL constraint failed: {root}.{}",
            model.pk_name()
        )));
    }
    if store.contains(&root, &pk) {
        return Err(OrmError::IntegrityError(format!(
            "UNIQUE constraint failed: {root}.{}",
            model.pk_name()
        )));
    }
    if let Some(id) = pk.as_int() {
        let table = store.table_mut(&root);
        table.last_id = table.last_id.max(id);
    }
    for m in model.lineage().iter().rev() {
        write_local(store, m, &pk, values);
    }
    validate_row(store, model, &pk)?;
    Ok(pk)
}

fn insert_child_row(store: &mut Store, model: &Model, values: &Record) -> OrmResult<()> {
    check_columns(model, values)?;
    let Some(pk) = given_pk(model, values) else {
        return Err(OrmError::IntegrityError(format!(
            "NOT NULL constraint failed: {model}.{}",
            model.pk_name()
        )));
    };
    let Some(parent) = model.parent() else {
        return Err(OrmError::NotSupported(format!(
            "'{model}' has no parent table"
        )));
    };
    if !store.contains(&parent, &pk) {
        return Err(OrmError::IntegrityError(format!(
            "FOREIGN KEY constraint failed: {model}.{}",
            model.pk_name()
        )));
    }
    if store.contains(model, &pk) {
        return Err(OrmError::IntegrityError(format!(
            "UNIQUE constraint failed: {model}.{}",
            model.pk_name()
        )));
    }
    write_local(store, model, &pk, values);
    validate_row(store, model, &pk)
}

fn update_rows(store: &mut Store, qs: &QuerySet, values: &Record) -> OrmResult<usize> {
    let model = qs.model();
    check_columns(model, values)?;
    if values.contains_key("pk") || values.contains_key(model.pk_name()) {
        return Err(OrmError::NotSupported(format!(
            "updating the primary key of '{model}'"
        )));
    }
    let pks = Evaluator::new(store).select(qs, None)?;
    for pk in &pks {
        for (name, value) in values {
            let Some(owner) = Store::column_owner(model, name) else {
                continue;
            };
            if let Some(row) = store.table_mut(&owner).rows.get_mut(pk) {
                row.insert(name.clone(), value.clone());
            }
        }
    }
    for pk in &pks {
        validate_row(store, model, pk)?;
    }
    Ok(pks.len())
}

/// Removes rows from every table of `model`'s inheritance family, then
/// cascades to rows referencing them.
fn delete_rows(store: &mut Store, model: &Model, pks: &[Value]) {
    let registry = model.registry();
    let root = root_of(model);
    let family: Vec<Model> = registry.models().filter(|m| m.is_sub_model(&root)).collect();

    let mut removed = Vec::new();
    for pk in pks {
        let mut found = false;
        for m in &family {
            found |= store.table_mut(m).rows.shift_remove(pk).is_some();
        }
        if found {
            removed.push(pk.clone());
        }
    }
    if removed.is_empty() {
        return;
    }

    for m in registry.models() {
        for field in m.own_fields() {
            if !matches!(
                field.field_type,
                FieldType::ForeignKey { .. } | FieldType::OneToOneField { .. }
            ) {
                continue;
            }
            let targets_family = field
                .field_type
                .related_model()
                .is_some_and(|to| family.iter().any(|f| f.ident() == to));
            if !targets_family {
                continue;
            }
            let referencing: Vec<Value> = store
                .keys(&m)
                .into_iter()
                .filter(|key| removed.contains(&store.cell(&m, key, &field.name)))
                .collect();
            if !referencing.is_empty() {
                delete_rows(store, &m, &referencing);
            }
        }
    }
}

impl Executor for MemoryDatabase {
    fn fetch(&self, qs: &QuerySet, columns: &[SelectColumn]) -> OrmResult<Vec<Record>> {
        self.read(format!("SELECT {}", qs.model()), |store| {
            Evaluator::new(store).fetch(qs, columns)
        })
    }

    fn count(&self, qs: &QuerySet) -> OrmResult<usize> {
        self.read(format!("COUNT {}", qs.model()), |store| {
            Ok(Evaluator::new(store).select(qs, None)?.len())
        })
    }

    fn insert(&self, model: &Model, values: &Record) -> OrmResult<Value> {
        self.write(format!("INSERT {model}"), |store| {
            insert_row(store, model, values)
        })
    }

    fn insert_child(&self, model: &Model, values: &Record) -> OrmResult<()> {
        self.write(format!("INSERT {model}"), |store| {
            insert_child_row(store, model, values)
        })
    }

    fn update(&self, qs: &QuerySet, values: &Record) -> OrmResult<usize> {
        self.write(format!("UPDATE {}", qs.model()), |store| {
            update_rows(store, qs, values)
        })
    }

    fn delete(&self, qs: &QuerySet) -> OrmResult<usize> {
        self.write(format!("DELETE {}", qs.model()), |store| {
            let pks = Evaluator::new(store).select(qs, None)?;
            delete_rows(store, qs.model(), &pks);
            Ok(pks.len())
        })
    }

    fn begin(&self) -> OrmResult<()> {
        let mut state = self.lock();
        let snapshot = state.store.clone();
        state.savepoints.push(snapshot);
        tracing::trace!(depth = state.savepoints.len(), "begin");
        Ok(())
    }

    fn commit(&self) -> OrmResult<()> {
        let mut state = self.lock();
        state
            .savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| OrmError::OperationalError("no transaction is active".to_string()))
    }

    fn rollback(&self) -> OrmResult<()> {
        let mut state = self.lock();
        let snapshot = state
            .savepoints
            .pop()
            .ok_or_else(|| OrmError::OperationalError("no transaction is active".to_string()))?;
        state.store = snapshot;
        tracing::trace!(depth = state.savepoints.len(), "rollback");
        Ok(())
    }
}

#[async_trait::async_trait]
impl AsyncExecutor for MemoryDatabase {
    async fn fetch(&self, qs: &QuerySet, columns: &[SelectColumn]) -> OrmResult<Vec<Record>> {
        tokio::task::yield_now().await;
        Executor::fetch(self, qs, columns)
    }

    async fn count(&self, qs: &QuerySet) -> OrmResult<usize> {
        tokio::task::yield_now().await;
        Executor::count(self, qs)
    }

    async fn insert(&self, model: &Model, values: &Record) -> OrmResult<Value> {
        tokio::task::yield_now().await;
        Executor::insert(self, model, values)
    }

    async fn insert_child(&self, model: &Model, values: &Record) -> OrmResult<()> {
        tokio::task::yield_now().await;
        Executor::insert_child(self, model, values)
    }

    async fn update(&self, qs: &QuerySet, values: &Record) -> OrmResult<usize> {
        tokio::task::yield_now().await;
        Executor::update(self, qs, values)
    }

    async fn delete(&self, qs: &QuerySet) -> OrmResult<usize> {
        tokio::task::yield_now().await;
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
