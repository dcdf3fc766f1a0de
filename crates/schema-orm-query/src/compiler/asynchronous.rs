//! The async compiler.
//!
//! Same state machine as [`QueryCompiler`](super::QueryCompiler), with every
//! statement awaited on an [`AsyncExecutor`]. The recursive entry points
//! (`get_values` and `save_one`) return boxed futures. With
//! [`QueryContext::concurrent`] set, the link queries of a call's isolated
//! fields run concurrently; nested schemas are still serialized one after
//! another so they observe each other's recursion-guard entries.

use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use indexmap::IndexMap;
use schema_orm_core::logging::query_span;
use schema_orm_core::{OrmError, OrmResult};
use schema_orm_db::connections::ConnectionRegistry;
use schema_orm_db::executor::AsyncExecutor;
use schema_orm_db::query::{QuerySet, SelectColumn};
use schema_orm_db::transactions::atomic_async;
use schema_orm_db::value::{Record, Value};
use tracing::Instrument;

use super::{
    assign, create_columns, dedup, group, input_pk, local_columns, missing_links, nested_items, nested_schema,
    normalize, pk_columns, pk_list, pk_values, plan_keys, plan_links, plan_objects, prune_query, recover,
    related_keys, relation_keys, relation_outcome, shape, snapshot, update_columns, without_pk, write_target,
    KeyWrite, LinkPlan, Links, Normalized, ObjectWrite, Pending, ReadPlan, SaveOptions, WriteBundle,
};
use crate::classifier::SchemaField;
use crate::context::QueryContext;
use crate::field::OperationMode;
use crate::schema::{QuerySource, Schema};

struct AsyncWriteScope {
    db: Arc<dyn AsyncExecutor>,
    transactional: bool,
}

/// Compiles schema reads and writes into statements on an async executor.
pub struct AsyncQueryCompiler<'a> {
    schema: &'a Schema,
    connections: &'a ConnectionRegistry,
    ctx: &'a QueryContext,
}

impl<'a> AsyncQueryCompiler<'a> {
    /// Creates a compiler for one call.
    pub const fn new(schema: &'a Schema, connections: &'a ConnectionRegistry, ctx: &'a QueryContext) -> Self {
        Self {
            schema,
            connections,
            ctx,
        }
    }

    async fn fetch(&self, qs: &QuerySet, columns: &[SelectColumn]) -> OrmResult<Vec<Record>> {
        let conn = self.connections.get(qs.using_db().or(self.ctx.database()))?;
        qs.afetch(conn.async_executor(), columns).await
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Fetches the rows of `source`, every in-scope field resolved.
    pub fn get_values(&self, source: QuerySource) -> BoxFuture<'_, OrmResult<Vec<Record>>> {
        let span = query_span(self.schema.name(), "get_values");
        Box::pin(self.read(source).instrument(span))
    }

    async fn read(&self, source: QuerySource) -> OrmResult<Vec<Record>> {
        let Some(Normalized { qs, order }) = normalize(self.schema, source, self.ctx)? else {
            return Ok(Vec::new());
        };
        let plan = ReadPlan::new(self.schema, self.ctx, qs.is_sliced())?;
        let pk = self.schema.pk_name();
        let mut rows = dedup(self.fetch(&qs, &plan.columns).await?, pk, order.as_deref());
        tracing::debug!(rows = rows.len(), "direct fetch");
        if rows.is_empty() {
            return Ok(rows);
        }
        plan.prefill(&mut rows);
        let pks = pk_list(&rows, pk);
        let guard = self.ctx.recursion();
        let key = self.ctx.guard_key(self.schema.id());
        guard.register_missing(&key, snapshot(&plan, &rows, pk));

        let outcomes: Vec<Option<Links>> = if self.ctx.is_concurrent() && plan.isolated.len() > 1 {
            try_join_all(plan.isolated.iter().map(|field| self.try_links(field, &pks))).await?
        } else {
            let mut outcomes = Vec::with_capacity(plan.isolated.len());
            for field in &plan.isolated {
                outcomes.push(self.try_links(field, &pks).await?);
            }
            outcomes
        };

        for (&field, links) in plan.isolated.iter().zip(outcomes) {
            let Some(links) = links else { continue };
            match self.materialize(field, &links).await {
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

    /// Resolves one field's links; `None` when a silenced failure left the placeholder.
    async fn try_links(&self, field: &SchemaField, pks: &[Value]) -> OrmResult<Option<Links>> {
        match self.resolve_links(field, pks).await {
            Ok(links) => Ok(Some(links)),
            Err(err) => recover(self.ctx, field, err).map(|()| None),
        }
    }

    async fn resolve_links(&self, field: &SchemaField, pks: &[Value]) -> OrmResult<Links> {
        match plan_links(field, pks)? {
            LinkPlan::Joined(qs, columns) => Ok(group(self.fetch(&qs, &columns).await?, pks)),
            LinkPlan::PerOwner(queries, columns) => {
                let mut links = Links::new();
                for (owner, qs) in queries {
                    let rows = self.fetch(&qs, &columns).await?;
                    links.extend(group(rows, std::slice::from_ref(&owner)));
                }
                Ok(links)
            }
            LinkPlan::Function(groups) => {
                let mut links = Links::new();
                for (owners, pending) in groups {
                    let values = match pending {
                        Pending::Ready(values) => values,
                        Pending::Fetch(qs) => {
                            let rows = self.fetch(&qs, &pk_columns(&qs)).await?;
                            pk_values(&qs, rows)
                        }
                    };
                    for owner in owners {
                        links.insert(owner, values.clone());
                    }
                }
                Ok(links)
            }
        }
    }

    async fn materialize(&self, field: &SchemaField, links: &Links) -> OrmResult<IndexMap<Value, Value>> {
        let Some(nested) = nested_schema(self.schema, field)? else {
            return Ok(shape(field, links, |v| Some(v.clone())));
        };
        let ctx = self.ctx.derive(field.name());
        let key = ctx.guard_key(nested.id());
        let guard = self.ctx.recursion();
        let missing = guard.unresolved(&key, &related_keys(links));
        if !missing.is_empty() {
            AsyncQueryCompiler::new(&nested, self.connections, &ctx)
                .get_values(QuerySource::Pks(missing))
                .await?;
        }
        Ok(shape(field, links, |pk| guard.get(&key, pk).map(Value::Map)))
    }

    // ── Writes ───────────────────────────────────────────────────────

    fn write_scope(&self, options: &SaveOptions) -> OrmResult<AsyncWriteScope> {
        options.validate()?;
        let (alias, transactional) = write_target(self.ctx, options);
        Ok(AsyncWriteScope {
            db: self.connections.get(alias)?.async_handle(),
            transactional,
        })
    }

    /// Persists one object and its relations, returning its primary key.
    pub async fn save_data(&self, data: &Record, options: &SaveOptions) -> OrmResult<Value> {
        let span = query_span(self.schema.name(), "save");
        async {
            let scope = self.write_scope(options)?;
            let extra = Record::new();
            if scope.transactional {
                atomic_async(Arc::clone(&scope.db), || self.save_one(&scope, data, &extra, options)).await
            } else {
                self.save_one(&scope, data, &extra, options).await
            }
        }
        .instrument(span)
        .await
        .map_err(|err| self.ctx.map_error(err))
    }

    /// Persists a list of objects, one primary key (or `None`) per element.
    pub async fn bulk_save_data(&self, data: &[Record], options: &SaveOptions) -> OrmResult<Vec<Option<Value>>> {
        let span = query_span(self.schema.name(), "bulk_save");
        async {
            let scope = self.write_scope(options)?;
            let extra = Record::new();
            if scope.transactional {
                atomic_async(Arc::clone(&scope.db), || self.save_many(&scope, data, &extra, options)).await
            } else {
                self.save_many(&scope, data, &extra, options).await
            }
        }
        .instrument(span)
        .await
        .map_err(|err| self.ctx.map_error(err))
    }

    async fn save_many(
        &self,
        scope: &AsyncWriteScope,
        items: &[Record],
        extra: &Record,
        options: &SaveOptions,
    ) -> OrmResult<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            if !options.ignore_bulk_errors {
                out.push(Some(self.save_one(scope, item, extra, options).await?));
                continue;
            }
            let result = if scope.transactional {
                atomic_async(Arc::clone(&scope.db), || self.save_one(scope, item, extra, options)).await
            } else {
                self.save_one(scope, item, extra, options).await
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

    fn save_one<'s>(
        &'s self,
        scope: &'s AsyncWriteScope,
        data: &'s Record,
        extra: &'s Record,
        options: &'s SaveOptions,
    ) -> BoxFuture<'s, OrmResult<Value>> {
        Box::pin(async move {
            let model = self.schema.model();
            let db = scope.db.as_ref();
            let (pk, created, bundle) = match input_pk(self.schema, data) {
                Some(pk) if !options.must_create => {
                    let bundle = WriteBundle::split(self.schema, data, OperationMode::Update);
                    let columns = update_columns(self.schema, &bundle.columns, extra);
                    let target = model.objects().pk_in(vec![pk.clone()]);
                    let affected = if columns.is_empty() {
                        target.acount(db).await?
                    } else {
                        target.aupdate(db, &columns).await?
                    };
                    if affected > 0 {
                        tracing::debug!(schema = self.schema.name(), pk = %pk, "updated");
                        (pk, false, bundle)
                    } else if self.parent_exists(db, &pk).await? {
                        let bundle = WriteBundle::split(self.schema, data, OperationMode::Create);
                        let columns = create_columns(self.schema, &bundle.columns, Some(&pk), extra);
                        db.insert_child(model, &local_columns(model, &columns)).await?;
                        let rest = without_pk(model, columns);
                        if !rest.is_empty() {
                            target.aupdate(db, &rest).await?;
                        }
                        tracing::debug!(schema = self.schema.name(), pk = %pk, "extended parent row");
                        (pk, true, bundle)
                    } else if options.must_update {
                        return Err(OrmError::UpdateFailed(format!(
                            "{} with pk {pk} does not exist",
                            self.schema.name()
                        )));
                    } else {
                        self.create(db, Some(&pk), data, extra).await?
                    }
                }
                None if options.must_update => {
                    return Err(OrmError::MissingPrimaryKey(format!(
                        "{} data carries no primary key",
                        self.schema.name()
                    )));
                }
                pk => self.create(db, pk.as_ref(), data, extra).await?,
            };
            if options.with_relations {
                self.save_relations(scope, &pk, created, &bundle, options).await?;
            }
            Ok(pk)
        })
    }

    async fn create(
        &self,
        db: &dyn AsyncExecutor,
        pk: Option<&Value>,
        data: &Record,
        extra: &Record,
    ) -> OrmResult<(Value, bool, WriteBundle<'a>)> {
        let bundle = WriteBundle::split(self.schema, data, OperationMode::Create);
        let columns = create_columns(self.schema, &bundle.columns, pk, extra);
        let pk = self.schema.model().objects().acreate(db, &columns).await?;
        tracing::debug!(schema = self.schema.name(), pk = %pk, "created");
        Ok((pk, true, bundle))
    }

    async fn parent_exists(&self, db: &dyn AsyncExecutor, pk: &Value) -> OrmResult<bool> {
        match self.schema.model().parent() {
            Some(parent) => parent.objects().pk_in(vec![pk.clone()]).aexists(db).await,
            None => Ok(false),
        }
    }

    async fn save_relations(
        &self,
        scope: &AsyncWriteScope,
        pk: &Value,
        created: bool,
        bundle: &WriteBundle<'_>,
        options: &SaveOptions,
    ) -> OrmResult<()> {
        // a skipped relation must not leave partial writes in the transaction
        let savepoint = scope.transactional && options.ignore_relation_errors.skips_any();
        for (field, value) in &bundle.keys {
            let keys = relation_keys(field, value);
            let step = || self.save_keys(scope.db.as_ref(), field, pk, &keys, created);
            let result = if savepoint {
                atomic_async(Arc::clone(&scope.db), step).await
            } else {
                step().await
            };
            relation_outcome(self.schema, field, result, options)?;
        }
        for (field, value) in &bundle.objects {
            let step = || self.save_objects(scope, field, pk, value, created, options);
            let result = if savepoint {
                atomic_async(Arc::clone(&scope.db), step).await
            } else {
                step().await
            };
            relation_outcome(self.schema, field, result, options)?;
        }
        Ok(())
    }

    async fn save_keys(
        &self,
        db: &dyn AsyncExecutor,
        field: &SchemaField,
        pk: &Value,
        keys: &[Value],
        created: bool,
    ) -> OrmResult<()> {
        match plan_keys(field, pk, keys, created) {
            Some(KeyWrite::Through {
                stale,
                existing,
                through,
                own,
                other,
            }) => {
                if let Some(stale) = stale {
                    stale.adelete(db).await?;
                }
                let existing = match existing {
                    Some(qs) => qs.avalues(db, &[other.as_str()]).await?,
                    None => Vec::new(),
                };
                for row in missing_links(&own, &other, pk, keys, &existing) {
                    through.acreate(db, &row).await?;
                }
            }
            Some(KeyWrite::Reverse { clear, set }) => {
                if let Some((qs, values)) = clear {
                    qs.aupdate(db, &values).await?;
                }
                if let Some((qs, values)) = set {
                    qs.aupdate(db, &values).await?;
                }
            }
            None => {}
        }
        Ok(())
    }

    async fn save_objects(
        &self,
        scope: &AsyncWriteScope,
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
        let compiler = AsyncQueryCompiler::new(&nested, self.connections, self.ctx);
        match plan_objects(field, pk, created) {
            Some(ObjectWrite::Reverse { extra, prune }) => {
                let saved: Vec<Value> = compiler
                    .save_many(scope, &items, &extra, &nested_options)
                    .await?
                    .into_iter()
                    .flatten()
                    .collect();
                if let Some((related, fk)) = prune {
                    prune_query(&related, &fk, pk, saved)
                        .adelete(scope.db.as_ref())
                        .await?;
                }
            }
            Some(ObjectWrite::Through) => {
                let saved: Vec<Value> = compiler
                    .save_many(scope, &items, &Record::new(), &nested_options)
                    .await?
                    .into_iter()
                    .flatten()
                    .collect();
                self.save_keys(scope.db.as_ref(), field, pk, &saved, created).await?;
            }
            None => {}
        }
        Ok(())
    }
}
