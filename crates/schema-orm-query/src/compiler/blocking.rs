//! The blocking compiler.

use indexmap::IndexMap;
use schema_orm_core::logging::query_span;
use schema_orm_core::{OrmError, OrmResult};
use schema_orm_db::connections::ConnectionRegistry;
use schema_orm_db::executor::Executor;
use schema_orm_db::query::{QuerySet, SelectColumn};
use schema_orm_db::transactions::atomic;
use schema_orm_db::value::{Record, Value};

use super::{
    assign, create_columns, dedup, input_pk, local_columns, missing_links, nested_items, nested_schema,
    normalize, pk_columns, pk_list, pk_values, plan_keys, plan_links, plan_objects, prune_query, recover,
    related_keys, relation_keys, relation_outcome, shape, snapshot, update_columns, without_pk, write_target,
    group, KeyWrite, LinkPlan, Links, Normalized, ObjectWrite, Pending, ReadPlan, SaveOptions, WriteBundle,
};
use crate::classifier::SchemaField;
use crate::context::QueryContext;
use crate::field::OperationMode;
use crate::schema::{QuerySource, Schema};

/// Where a write runs.
struct WriteScope<'d> {
    db: &'d dyn Executor,
    transactional: bool,
}

/// Compiles schema reads and writes into statements on a blocking executor.
pub struct QueryCompiler<'a> {
    schema: &'a Schema,
    connections: &'a ConnectionRegistry,
    ctx: &'a QueryContext,
}

impl<'a> QueryCompiler<'a> {
    /// Creates a compiler for one call.
    pub const fn new(schema: &'a Schema, connections: &'a ConnectionRegistry, ctx: &'a QueryContext) -> Self {
        Self {
            schema,
            connections,
            ctx,
        }
    }

    fn fetch(&self, qs: &QuerySet, columns: &[SelectColumn]) -> OrmResult<Vec<Record>> {
        let conn = self.connections.get(qs.using_db().or(self.ctx.database()))?;
        qs.fetch(conn.executor(), columns)
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Fetches the rows of `source`, every in-scope field resolved.
    pub fn get_values(&self, source: QuerySource) -> OrmResult<Vec<Record>> {
        let span = query_span(self.schema.name(), "get_values");
        let _entered = span.enter();

        let Some(Normalized { qs, order }) = normalize(self.schema, source, self.ctx)? else {
            return Ok(Vec::new());
        };
        let plan = ReadPlan::new(self.schema, self.ctx, qs.is_sliced())?;
        let pk = self.schema.pk_name();
        let mut rows = dedup(self.fetch(&qs, &plan.columns)?, pk, order.as_deref());
        tracing::debug!(rows = rows.len(), "direct fetch");
        if rows.is_empty() {
            return Ok(rows);
        }
        plan.prefill(&mut rows);
        let pks = pk_list(&rows, pk);
        let guard = self.ctx.recursion();
        let key = self.ctx.guard_key(self.schema.id());
        guard.register_missing(&key, snapshot(&plan, &rows, pk));

        let mut resolved: Vec<(&SchemaField, Links)> = Vec::with_capacity(plan.isolated.len());
        for &field in &plan.isolated {
            match self.resolve_links(field, &pks) {
                Ok(links) => resolved.push((field, links)),
                Err(err) => recover(self.ctx, field, err)?,
            }
        }
        for (field, links) in &resolved {
            match self.materialize(field, links) {
                Ok(values) => assign(&mut rows, pk, field.name(), &values),
                Err(err) => recover(self.ctx, field, err)?,
            }
        }

        let rows: Vec<Record> = rows.into_iter().map(|row| plan.finish(row)).collect();
        guard.register(
            &key,
            rows.iter()
                .map(|row| (row.get(pk).cloned().unwrap_or(Value::Null), row.clone())),
        );
        Ok(rows)
    }

    fn resolve_links(&self, field: &SchemaField, pks: &[Value]) -> OrmResult<Links> {
        match plan_links(field, pks)? {
            LinkPlan::Joined(qs, columns) => Ok(group(self.fetch(&qs, &columns)?, pks)),
            LinkPlan::PerOwner(queries, columns) => {
                let mut links = Links::new();
                for (owner, qs) in queries {
                    let rows = self.fetch(&qs, &columns)?;
                    links.extend(group(rows, std::slice::from_ref(&owner)));
                }
                Ok(links)
            }
            LinkPlan::Function(groups) => {
                let mut links = Links::new();
                for (owners, pending) in groups {
                    let values = match pending {
                        Pending::Ready(values) => values,
                        Pending::Fetch(qs) => pk_values(&qs, self.fetch(&qs, &pk_columns(&qs))?),
                    };
                    for owner in owners {
                        links.insert(owner, values.clone());
                    }
                }
                Ok(links)
            }
        }
    }

    fn materialize(&self, field: &SchemaField, links: &Links) -> OrmResult<IndexMap<Value, Value>> {
        let Some(nested) = nested_schema(self.schema, field)? else {
            return Ok(shape(field, links, |v| Some(v.clone())));
        };
        let ctx = self.ctx.derive(field.name());
        let key = ctx.guard_key(nested.id());
        let guard = self.ctx.recursion();
        let missing = guard.unresolved(&key, &related_keys(links));
        if !missing.is_empty() {
            QueryCompiler::new(&nested, self.connections, &ctx).get_values(QuerySource::Pks(missing))?;
        }
        Ok(shape(field, links, |pk| guard.get(&key, pk).map(Value::Map)))
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Persists one object and its relations, returning its primary key.
    pub fn save_data(&self, data: &Record, options: &SaveOptions) -> OrmResult<Value> {
        let span = query_span(self.schema.name(), "save");
        let _entered = span.enter();
        options.validate()?;
        let (alias, transactional) = write_target(self.ctx, options);
        let conn = self.connections.get(alias)?;
        let scope = WriteScope {
            db: conn.executor(),
            transactional,
        };
        let extra = Record::new();
        let result = if transactional {
            atomic(scope.db, || self.save_one(&scope, data, &extra, options))
        } else {
            self.save_one(&scope, data, &extra, options)
        };
        result.map_err(|err| self.ctx.map_error(err))
    }

    /// Persists a list of objects, one primary key (or `None`) per element.
    pub fn bulk_save_data(&self, data: &[Record], options: &SaveOptions) -> OrmResult<Vec<Option<Value>>> {
        let span = query_span(self.schema.name(), "bulk_save");
        let _entered = span.enter();
        options.validate()?;
        let (alias, transactional) = write_target(self.ctx, options);
        let conn = self.connections.get(alias)?;
        let scope = WriteScope {
            db: conn.executor(),
            transactional,
        };
        let extra = Record::new();
        let result = if transactional {
            atomic(scope.db, || self.save_many(&scope, data, &extra, options))
        } else {
            self.save_many(&scope, data, &extra, options)
        };
        result.map_err(|err| self.ctx.map_error(err))
    }

    fn save_many(
        &self,
        scope: &WriteScope<'_>,
        items: &[Record],
        extra: &Record,
        options: &SaveOptions,
    ) -> OrmResult<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            if !options.ignore_bulk_errors {
                out.push(Some(self.save_one(scope, item, extra, options)?));
                continue;
            }
            let result = if scope.transactional {
                atomic(scope.db, || self.save_one(scope, item, extra, options))
            } else {
                self.save_one(scope, item, extra, options)
            };
            match result {
                Ok(pk) => out.push(Some(pk)),
                Err(err) => {
                    tracing::warn!(schema = self.schema.name(), index, error = %err, "bulk element failed, skipped");
                    out.push(None);
                }
            }
        }
        Ok(out)
    }

    fn save_one(&self, scope: &WriteScope<'_>, data: &Record, extra: &Record, options: &SaveOptions) -> OrmResult<Value> {
        let model = self.schema.model();
        let db = scope.db;
        let (pk, created, bundle) = match input_pk(self.schema, data) {
            Some(pk) if !options.must_create => {
                let bundle = WriteBundle::split(self.schema, data, OperationMode::Update);
                let columns = update_columns(self.schema, &bundle.columns, extra);
                let target = model.objects().pk_in(vec![pk.clone()]);
                let affected = if columns.is_empty() {
                    target.count(db)?
                } else {
                    target.update(db, &columns)?
                };
                if affected > 0 {
                    tracing::debug!(schema = self.schema.name(), pk = %pk, "updated");
                    (pk, false, bundle)
                } else if self.parent_exists(db, &pk)? {
                    let bundle = WriteBundle::split(self.schema, data, OperationMode::Create);
                    let columns = create_columns(self.schema, &bundle.columns, Some(&pk), extra);
                    db.insert_child(model, &local_columns(model, &columns))?;
                    let rest = without_pk(model, columns);
                    if !rest.is_empty() {
                        target.update(db, &rest)?;
                    }
                    tracing::debug!(schema = self.schema.name(), pk = %pk, "extended parent row");
                    (pk, true, bundle)
                } else if options.must_update {
                    return Err(OrmError::UpdateFailed(format!(
                        "{} with pk {pk} does not exist",
                        self.schema.name()
                    )));
                } else {
                    self.create(db, Some(&pk), data, extra)?
                }
            }
            None if options.must_update => {
                return Err(OrmError::MissingPrimaryKey(format!(
                    "{} data carries no primary key",
                    self.schema.name()
                )));
            }
            pk => self.create(db, pk.as_ref(), data, extra)?,
        };
        if options.with_relations {
            self.save_relations(scope, &pk, created, &bundle, options)?;
        }
        Ok(pk)
    }

    fn create(
        &self,
        db: &dyn Executor,
        pk: Option<&Value>,
        data: &Record,
        extra: &Record,
    ) -> OrmResult<(Value, bool, WriteBundle<'a>)> {
        let bundle = WriteBundle::split(self.schema, data, OperationMode::Create);
        let columns = create_columns(self.schema, &bundle.columns, pk, extra);
        let pk = self.schema.model().objects().create(db, &columns)?;
        tracing::debug!(schema = self.schema.name(), pk = %pk, "created");
        Ok((pk, true, bundle))
    }

    fn parent_exists(&self, db: &dyn Executor, pk: &Value) -> OrmResult<bool> {
        match self.schema.model().parent() {
            Some(parent) => parent.objects().pk_in(vec![pk.clone()]).exists(db),
            None => Ok(false),
        }
    }

    fn save_relations(
        &self,
        scope: &WriteScope<'_>,
        pk: &Value,
        created: bool,
        bundle: &WriteBundle<'_>,
        options: &SaveOptions,
    ) -> OrmResult<()> {
        // a skipped relation must not leave partial writes in the transaction
        let savepoint = scope.transactional && options.ignore_relation_errors.skips_any();
        for (field, value) in &bundle.keys {
            let keys = relation_keys(field, value);
            let step = || self.save_keys(scope.db, field, pk, &keys, created);
            let result = if savepoint { atomic(scope.db, step) } else { step() };
            relation_outcome(self.schema, field, result, options)?;
        }
        for (field, value) in &bundle.objects {
            let step = || self.save_objects(scope, field, pk, value, created, options);
            let result = if savepoint { atomic(scope.db, step) } else { step() };
            relation_outcome(self.schema, field, result, options)?;
        }
        Ok(())
    }

    fn save_keys(&self, db: &dyn Executor, field: &SchemaField, pk: &Value, keys: &[Value], created: bool) -> OrmResult<()> {
        match plan_keys(field, pk, keys, created) {
            Some(KeyWrite::Through {
                stale,
                existing,
                through,
                own,
                other,
            }) => {
                if let Some(stale) = stale {
                    stale.delete(db)?;
                }
                let existing = match existing {
                    Some(qs) => qs.values(db, &[other.as_str()])?,
                    None => Vec::new(),
                };
                for row in missing_links(&own, &other, pk, keys, &existing) {
                    through.create(db, &row)?;
                }
            }
            Some(KeyWrite::Reverse { clear, set }) => {
                if let Some((qs, values)) = clear {
                    qs.update(db, &values)?;
                }
                if let Some((qs, values)) = set {
                    qs.update(db, &values)?;
                }
            }
            None => {}
        }
        Ok(())
    }

    fn save_objects(
        &self,
        scope: &WriteScope<'_>,
        field: &SchemaField,
        pk: &Value,
        value: &Value,
        created: bool,
        options: &SaveOptions,
    ) -> OrmResult<()> {
        let Some(nested) = nested_schema(self.schema, field)? else {
            return Ok(());
        };
        let items = nested_items(value);
        let nested_options = options.nested();
        let compiler = QueryCompiler::new(&nested, self.connections, self.ctx);
        match plan_objects(field, pk, created) {
            Some(ObjectWrite::Reverse { extra, prune }) => {
                let saved: Vec<Value> = compiler
                    .save_many(scope, &items, &extra, &nested_options)?
                    .into_iter()
                    .flatten()
                    .collect();
                if let Some((related, fk)) = prune {
                    prune_query(&related, &fk, pk, saved).delete(scope.db)?;
                }
            }
            Some(ObjectWrite::Through) => {
                let saved: Vec<Value> = compiler
                    .save_many(scope, &items, &Record::new(), &nested_options)?
                    .into_iter()
                    .flatten()
                    .collect();
                self.save_keys(scope.db, field, pk, &saved, created)?;
            }
            None => {}
        }
        Ok(())
    }
}
