//! The query compiler.
//!
//! Reads and writes are implemented twice, once over the blocking
//! [`Executor`](schema_orm_db::executor::Executor) ([`QueryCompiler`]) and
//! once over the suspension-based
//! [`AsyncExecutor`](schema_orm_db::executor::AsyncExecutor)
//! ([`AsyncQueryCompiler`]). Both run the same state machine. Everything that
//! does not touch the database lives here and is shared: input
//! normalization, the read plan, the sliced-aggregate rewrite, link-query
//! construction and grouping, row assembly, and the write bundle.
//!
//! # Read path
//!
//! 1. Normalize the source to a queryset (no query at all for an empty key list).
//! 2. Fetch the primary key, columns and expressions in one query;
//!    deduplicate by primary key keeping the first position.
//! 3. Register the rows in the recursion guard under the schema and field
//!    scope they were fetched with, then resolve each isolated
//!    field with one link query over every owning key.
//! 4. Serialize the related keys the guard does not know yet through the
//!    nested schema, sharing the guard, and merge the results back.
//!
//! # Write path
//!
//! Data is split into columns, relation keys and nested relation objects.
//! An object with a primary key is updated first; zero affected rows fall
//! back to a child-table insert (multi-table inheritance), an
//! [`OrmError::UpdateFailed`] under `must_update`, or a create. Relations
//! are then persisted, each failure being suppressible per error kind.

mod asynchronous;
mod blocking;

pub use asynchronous::AsyncQueryCompiler;
pub use blocking::QueryCompiler;

use std::collections::HashSet;

use chrono::Utc;
use indexmap::IndexMap;
use schema_orm_core::settings::SETTINGS;
use schema_orm_core::{ErrorKind, OrmError, OrmResult};
use schema_orm_db::model::{FieldType, Model, ResolvedPath};
use schema_orm_db::query::{Expression, Lookup, QuerySet, SelectColumn, When, Q};
use schema_orm_db::value::{record, Record, Value};

use crate::classifier::{check_binding, FieldKind, Isolation, RelationWrite, SchemaField};
use crate::context::QueryContext;
use crate::field::{DefaultFactory, FuncCall, FuncOutput, OperationMode};
use crate::schema::{QuerySource, Schema};

// ── Save options ─────────────────────────────────────────────────────

/// Which relation-persistence errors are logged and skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IgnoreErrors {
    /// Every error propagates.
    #[default]
    None,
    /// Every error is skipped.
    All,
    /// Errors whose root cause has one of these kinds are skipped.
    Kinds(Vec<ErrorKind>),
}

impl IgnoreErrors {
    /// Returns `true` if `err` may be skipped.
    pub fn allows(&self, err: &OrmError) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(&err.root().kind()),
        }
    }

    /// Returns `true` if some error may be skipped.
    pub fn skips_any(&self) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Kinds(kinds) => !kinds.is_empty(),
        }
    }
}

impl From<bool> for IgnoreErrors {
    fn from(ignore: bool) -> Self {
        if ignore {
            Self::All
        } else {
            Self::None
        }
    }
}

impl From<Vec<ErrorKind>> for IgnoreErrors {
    fn from(kinds: Vec<ErrorKind>) -> Self {
        Self::Kinds(kinds)
    }
}

/// Whether (and where) a write runs in a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TransactionMode {
    /// No transaction.
    None,
    /// A transaction on the call's database.
    #[default]
    Default,
    /// A transaction on the named database; the writes run there too.
    Alias(String),
}

impl From<bool> for TransactionMode {
    fn from(transaction: bool) -> Self {
        if transaction {
            Self::Default
        } else {
            Self::None
        }
    }
}

impl From<&str> for TransactionMode {
    fn from(alias: &str) -> Self {
        Self::Alias(alias.to_string())
    }
}

/// Flags of one save call.
///
/// ```
/// use schema_orm_core::ErrorKind;
/// use schema_orm_query::SaveOptions;
///
/// let options = SaveOptions::default()
///     .must_create(true)
///     .ignore_relation_errors(vec![ErrorKind::Integrity])
///     .transaction(false);
/// assert!(options.must_create);
/// ```
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Insert without trying an update first.
    pub must_create: bool,
    /// Only update; never insert.
    pub must_update: bool,
    /// Persist relation keys and nested relation objects.
    pub with_relations: bool,
    /// Relation errors that are logged and skipped.
    pub ignore_relation_errors: IgnoreErrors,
    /// In bulk saves, replace failed elements with `None` instead of aborting.
    pub ignore_bulk_errors: bool,
    /// Transaction scope.
    pub transaction: TransactionMode,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            must_create: false,
            must_update: false,
            with_relations: true,
            ignore_relation_errors: IgnoreErrors::None,
            ignore_bulk_errors: SETTINGS.get().query.ignore_bulk_errors,
            transaction: TransactionMode::Default,
        }
    }
}

impl SaveOptions {
    /// Sets `must_create`.
    #[must_use]
    pub const fn must_create(mut self, value: bool) -> Self {
        self.must_create = value;
        self
    }

    /// Sets `must_update`.
    #[must_use]
    pub const fn must_update(mut self, value: bool) -> Self {
        self.must_update = value;
        self
    }

    /// Sets `with_relations`.
    #[must_use]
    pub const fn with_relations(mut self, value: bool) -> Self {
        self.with_relations = value;
        self
    }

    /// Sets which relation errors are skipped.
    #[must_use]
    pub fn ignore_relation_errors(mut self, value: impl Into<IgnoreErrors>) -> Self {
        self.ignore_relation_errors = value.into();
        self
    }

    /// Sets `ignore_bulk_errors`.
    #[must_use]
    pub const fn ignore_bulk_errors(mut self, value: bool) -> Self {
        self.ignore_bulk_errors = value;
        self
    }

    /// Sets the transaction scope.
    #[must_use]
    pub fn transaction(mut self, value: impl Into<TransactionMode>) -> Self {
        self.transaction = value.into();
        self
    }

    pub(crate) fn validate(&self) -> OrmResult<()> {
        if self.must_create && self.must_update {
            return Err(OrmError::ConfigurationError(
                "must_create and must_update are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    /// Options for nested relation objects.
    pub(crate) fn nested(&self) -> Self {
        Self {
            must_create: false,
            must_update: false,
            with_relations: true,
            transaction: TransactionMode::None,
            ..self.clone()
        }
    }
}

/// The database a write runs on and whether it opens a transaction.
pub(crate) fn write_target<'c>(ctx: &'c QueryContext, options: &'c SaveOptions) -> (Option<&'c str>, bool) {
    match &options.transaction {
        TransactionMode::None => (ctx.database(), false),
        TransactionMode::Default => (ctx.database(), true),
        TransactionMode::Alias(alias) => (Some(alias.as_str()), true),
    }
}

// ── Read planning ────────────────────────────────────────────────────

pub(crate) const OWNER: &str = "__owner";
pub(crate) const KEY: &str = "__key";
pub(crate) const VALUE: &str = "__value";

/// Owning primary key to related values, in first-seen order.
pub(crate) type Links = IndexMap<Value, Vec<Value>>;

/// A normalized read source.
pub(crate) struct Normalized {
    pub qs: QuerySet,
    /// The key order to restore, for key-list sources.
    pub order: Option<Vec<Value>>,
}

fn record_pk<'r>(schema: &Schema, data: &'r Record) -> Option<&'r Value> {
    data.get(schema.pk_name())
        .or_else(|| data.get("pk"))
        .or_else(|| data.get(schema.model().pk_name()))
        .filter(|v| !v.is_null())
}

/// Turns a source into a queryset; `None` means nothing can match.
pub(crate) fn normalize(
    schema: &Schema,
    source: QuerySource,
    ctx: &QueryContext,
) -> OrmResult<Option<Normalized>> {
    let model = schema.model();
    let mut pks = match source {
        QuerySource::Queryset(qs) => {
            if !qs.model().is_sub_model(model) {
                return Err(OrmError::ConfigurationError(format!(
                    "Schema '{}' cannot read '{}' rows",
                    schema.name(),
                    qs.model()
                )));
            }
            if qs.is_none() {
                return Ok(None);
            }
            let qs = if ctx.is_single() { qs.limit(1) } else { qs };
            return Ok(Some(Normalized { qs, order: None }));
        }
        QuerySource::Pk(pk) => vec![pk],
        QuerySource::Pks(pks) => pks,
        QuerySource::Records(records) => records
            .iter()
            .filter_map(|r| record_pk(schema, r).cloned())
            .collect(),
    };
    let mut seen = HashSet::new();
    pks.retain(|pk| !pk.is_null() && seen.insert(pk.clone()));
    if ctx.is_single() {
        pks.truncate(1);
    }
    if pks.is_empty() {
        return Ok(None);
    }
    Ok(Some(Normalized {
        qs: model.objects().pk_in(pks.clone()),
        order: Some(pks),
    }))
}

/// The current value of a create default.
pub(crate) fn default_value(field: &SchemaField) -> Option<Value> {
    match field.default_factory()? {
        DefaultFactory::Static(value) => Some(value.clone()),
        DefaultFactory::Now => Some(now_for(field)),
    }
}

fn now_for(field: &SchemaField) -> Value {
    let now = Utc::now();
    match field.model_field().map(|f| &f.field_type) {
        Some(FieldType::DateField) => Value::Date(now.date_naive()),
        _ => Value::DateTime(now),
    }
}

/// What one read fetches directly and what it resolves afterwards.
pub(crate) struct ReadPlan<'s> {
    pub columns: Vec<SelectColumn>,
    pub isolated: Vec<&'s SchemaField>,
    prefill: Vec<(String, Value)>,
    properties: Vec<&'s SchemaField>,
    output: Vec<String>,
}

impl<'s> ReadPlan<'s> {
    pub fn new(schema: &'s Schema, ctx: &QueryContext, sliced: bool) -> OrmResult<Self> {
        let model = schema.model();
        let requested: Vec<&SchemaField> = schema
            .fields()
            .filter(|f| {
                (f.is_primary_key() || f.mode().readable()) && ctx.in_scope(f.name(), f.is_primary_key())
            })
            .collect();
        let mut needed: Vec<&str> = requested.iter().map(|f| f.name()).collect();
        for field in &requested {
            if let Some(prop) = field.property() {
                for dep in prop.deps() {
                    if !needed.contains(&dep.as_str()) {
                        needed.push(dep);
                    }
                }
            }
        }

        let mut plan = Self {
            columns: Vec::new(),
            isolated: Vec::new(),
            prefill: Vec::new(),
            properties: Vec::new(),
            output: requested.iter().map(|f| f.name().to_string()).collect(),
        };
        for field in schema.fields().filter(|f| needed.contains(&f.name())) {
            match field.kind() {
                FieldKind::Column { path } => plan
                    .columns
                    .push(SelectColumn::expr(field.name(), Expression::col(path.clone()))),
                FieldKind::Expression(expr) => plan
                    .columns
                    .push(SelectColumn::expr(field.name(), prepare(model, expr, sliced)?)),
                FieldKind::Isolated(_) => {
                    plan.isolated.push(field);
                    plan.prefill.push((field.name().to_string(), field.placeholder()));
                }
                FieldKind::Unmapped => {
                    if field.property().is_some() {
                        plan.properties.push(field);
                        plan.prefill.push((field.name().to_string(), Value::Null));
                    } else {
                        let value = default_value(field).unwrap_or(Value::Null);
                        plan.prefill.push((field.name().to_string(), value));
                    }
                }
            }
        }
        for (name, expr) in ctx.force_expressions() {
            plan.columns
                .push(SelectColumn::expr(name.clone(), prepare(model, expr, sliced)?));
            plan.output.push(name.clone());
        }
        Ok(plan)
    }

    /// Sets every isolated and unmapped field to its placeholder.
    pub fn prefill(&self, rows: &mut [Record]) {
        for row in rows {
            for (name, value) in &self.prefill {
                row.insert(name.clone(), value.clone());
            }
        }
    }

    /// Computes properties and keeps only the requested fields, in order.
    pub fn finish(&self, mut row: Record) -> Record {
        for field in &self.properties {
            if let Some(prop) = field.property() {
                let value = prop.compute(&row);
                row.insert(field.name().to_string(), value);
            }
        }
        self.output
            .iter()
            .map(|name| {
                let value = row.swap_remove(name.as_str()).unwrap_or(Value::Null);
                (name.clone(), value)
            })
            .collect()
    }
}

fn prepare(model: &Model, expr: &Expression, sliced: bool) -> OrmResult<Expression> {
    if sliced {
        rewrite_sliced(model, expr)
    } else {
        Ok(expr.clone())
    }
}

/// Rewrites aggregates over to-many paths into subqueries correlated on the
/// outer primary key, so a slice on the outer query cannot truncate them.
pub(crate) fn rewrite_sliced(model: &Model, expr: &Expression) -> OrmResult<Expression> {
    let rewrite = |e: &Expression| rewrite_sliced(model, e).map(Box::new);
    Ok(match expr {
        Expression::Aggregate {
            func,
            field,
            distinct,
            filter,
        } => {
            let Expression::Col(path) = field.as_ref() else {
                return Ok(expr.clone());
            };
            let resolved = model.resolve_path(path)?;
            let Some(hop) = resolved
                .segments
                .iter()
                .position(|s| s.field.field_type.is_many())
            else {
                return Ok(expr.clone());
            };
            let prefix = ResolvedPath {
                segments: resolved.segments[..=hop].to_vec(),
            };
            let not_supported =
                || OrmError::NotSupported(format!("aggregate over '{path}' on a sliced queryset"));
            let target = prefix.target_model()?.ok_or_else(not_supported)?;
            let link = prefix.reverse_path().ok_or_else(not_supported)?;
            let prefix_path = join_names(&prefix.segments);
            let rest = join_names(&resolved.segments[hop + 1..]);
            let column = if rest.is_empty() {
                target.pk_name().to_string()
            } else {
                rest
            };
            let filter = filter
                .as_deref()
                .map(|q| Box::new(strip_prefix(q, &prefix_path, target.pk_name())));
            Expression::subquery(
                target.objects(),
                link,
                model.pk_name(),
                Expression::Aggregate {
                    func: *func,
                    field: Box::new(Expression::col(column)),
                    distinct: *distinct,
                    filter,
                },
            )
        }
        Expression::Func { name, args } => Expression::Func {
            name: name.clone(),
            args: args
                .iter()
                .map(|a| rewrite_sliced(model, a))
                .collect::<OrmResult<_>>()?,
        },
        Expression::Case { whens, default } => Expression::Case {
            whens: whens
                .iter()
                .map(|w| {
                    Ok(When {
                        condition: w.condition.clone(),
                        then: rewrite_sliced(model, &w.then)?,
                    })
                })
                .collect::<OrmResult<_>>()?,
            default: default.as_deref().map(rewrite).transpose()?,
        },
        Expression::Add(l, r) => Expression::Add(rewrite(l)?, rewrite(r)?),
        Expression::Sub(l, r) => Expression::Sub(rewrite(l)?, rewrite(r)?),
        Expression::Mul(l, r) => Expression::Mul(rewrite(l)?, rewrite(r)?),
        Expression::Div(l, r) => Expression::Div(rewrite(l)?, rewrite(r)?),
        Expression::Col(_) | Expression::Value(_) | Expression::Subquery(_) => expr.clone(),
    })
}

fn join_names(segments: &[schema_orm_db::model::PathSegment]) -> String {
    segments
        .iter()
        .map(|s| s.field.name.as_str())
        .collect::<Vec<_>>()
        .join(".")
}

/// Re-roots a condition written against the outer model onto the model at `prefix`.
fn strip_prefix(q: &Q, prefix: &str, pk: &str) -> Q {
    match q {
        Q::Filter { field, lookup } => {
            let field = if field == prefix {
                pk.to_string()
            } else {
                field
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .map_or_else(|| field.clone(), str::to_string)
            };
            Q::Filter {
                field,
                lookup: lookup.clone(),
            }
        }
        Q::And(items) => Q::And(items.iter().map(|q| strip_prefix(q, prefix, pk)).collect()),
        Q::Or(items) => Q::Or(items.iter().map(|q| strip_prefix(q, prefix, pk)).collect()),
        Q::Not(inner) => Q::Not(Box::new(strip_prefix(inner, prefix, pk))),
    }
}

/// Keeps the first row per primary key, restoring `order` when given.
pub(crate) fn dedup(rows: Vec<Record>, pk: &str, order: Option<&[Value]>) -> Vec<Record> {
    let mut by_pk: IndexMap<Value, Record> = IndexMap::new();
    for row in rows {
        let key = row.get(pk).cloned().unwrap_or(Value::Null);
        by_pk.entry(key).or_insert(row);
    }
    match order {
        Some(order) => order.iter().filter_map(|pk| by_pk.swap_remove(pk)).collect(),
        None => by_pk.into_values().collect(),
    }
}

pub(crate) fn pk_list(rows: &[Record], pk: &str) -> Vec<Value> {
    rows.iter()
        .map(|r| r.get(pk).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Finished copies of freshly fetched rows, recorded before isolated fields resolve.
pub(crate) fn snapshot(plan: &ReadPlan<'_>, rows: &[Record], pk: &str) -> Vec<(Value, Record)> {
    rows.iter()
        .map(|r| {
            let key = r.get(pk).cloned().unwrap_or(Value::Null);
            (key, plan.finish(r.clone()))
        })
        .collect()
}

// ── Isolated fields ──────────────────────────────────────────────────

/// A function result still to be turned into values.
pub(crate) enum Pending {
    Ready(Vec<Value>),
    /// The primary keys of a queryset.
    Fetch(QuerySet),
}

/// The queries resolving one isolated field.
pub(crate) enum LinkPlan {
    /// One query covering every owner.
    Joined(QuerySet, Vec<SelectColumn>),
    /// One query per owner, for sliced querysets.
    PerOwner(Vec<(Value, QuerySet)>, Vec<SelectColumn>),
    /// Function results, each shared by a group of owners.
    Function(Vec<(Vec<Value>, Pending)>),
}

fn link_columns(link: &str, key: &str, value: &str) -> Vec<SelectColumn> {
    vec![
        SelectColumn::expr(OWNER, Expression::col(link)),
        SelectColumn::expr(KEY, Expression::col(key)),
        SelectColumn::expr(VALUE, Expression::col(value)),
    ]
}

fn pending(field: &SchemaField, output: FuncOutput) -> Pending {
    match output {
        FuncOutput::Queryset(qs) => Pending::Fetch(qs),
        FuncOutput::Pks(pks) => Pending::Ready(pks.into_iter().filter(|v| !v.is_null()).collect()),
        FuncOutput::Pk(pk) => Pending::Ready(pk.into_items()),
        FuncOutput::Value(value) if field.related_single() => Pending::Ready(vec![value]),
        FuncOutput::Value(value) => Pending::Ready(value.into_items()),
    }
}

/// Builds the queries (or calls the function) for one isolated field.
pub(crate) fn plan_links(field: &SchemaField, pks: &[Value]) -> OrmResult<LinkPlan> {
    let FieldKind::Isolated(isolation) = field.kind() else {
        return Ok(LinkPlan::Function(Vec::new()));
    };
    Ok(match isolation {
        Isolation::Relation {
            target,
            link,
            value,
        } => LinkPlan::Joined(
            target
                .objects()
                .filter(Q::filter(link.clone(), Lookup::In(pks.to_vec()))),
            link_columns(link, target.pk_name(), value),
        ),
        Isolation::Queryset {
            source,
            link,
            value,
        } => {
            let qs = source.queryset();
            let columns = link_columns(link, qs.model().pk_name(), value);
            if qs.is_sliced() {
                LinkPlan::PerOwner(
                    pks.iter()
                        .map(|pk| {
                            let owned = qs
                                .clone()
                                .filter(Q::filter(link.clone(), Lookup::Exact(pk.clone())));
                            (pk.clone(), owned)
                        })
                        .collect(),
                    columns,
                )
            } else {
                LinkPlan::Joined(
                    qs.filter(Q::filter(link.clone(), Lookup::In(pks.to_vec()))),
                    columns,
                )
            }
        }
        Isolation::Function(func) => LinkPlan::Function(match &func.call {
            FuncCall::Constant(f) => vec![(pks.to_vec(), pending(field, f()?))],
            FuncCall::PerPk(f) => pks
                .iter()
                .map(|pk| Ok((vec![pk.clone()], pending(field, f(pk)?))))
                .collect::<OrmResult<_>>()?,
            FuncCall::Batch(f) => {
                let mut outputs = f(pks)?;
                pks.iter()
                    .map(|pk| {
                        let result = outputs
                            .swap_remove(pk)
                            .map_or_else(|| Pending::Ready(Vec::new()), |out| pending(field, out));
                        (vec![pk.clone()], result)
                    })
                    .collect()
            }
        }),
    })
}

/// Columns selecting a queryset's primary keys.
pub(crate) fn pk_columns(qs: &QuerySet) -> Vec<SelectColumn> {
    vec![SelectColumn::column(qs.model().pk_name())]
}

/// The distinct primary keys of fetched rows.
pub(crate) fn pk_values(qs: &QuerySet, rows: Vec<Record>) -> Vec<Value> {
    let pk = qs.model().pk_name();
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter_map(|mut r| r.swap_remove(pk))
        .filter(|v| !v.is_null() && seen.insert(v.clone()))
        .collect()
}

/// Groups link-query rows by owner, dropping owners outside `pks` and
/// fan-out duplicates of the same related row.
pub(crate) fn group(rows: Vec<Record>, pks: &[Value]) -> Links {
    let owners: HashSet<&Value> = pks.iter().collect();
    let mut seen: HashSet<(Value, Value)> = HashSet::new();
    let mut links = Links::new();
    for mut row in rows {
        let owner = row.swap_remove(OWNER).unwrap_or(Value::Null);
        let key = row.swap_remove(KEY).unwrap_or(Value::Null);
        let value = row.swap_remove(VALUE).unwrap_or(Value::Null);
        if value.is_null() || !owners.contains(&owner) {
            continue;
        }
        if seen.insert((owner.clone(), key)) {
            links.entry(owner).or_default().push(value);
        }
    }
    links
}

/// The distinct related values across every owner.
pub(crate) fn related_keys(links: &Links) -> Vec<Value> {
    let mut seen = HashSet::new();
    links
        .values()
        .flatten()
        .filter(|v| seen.insert(*v))
        .cloned()
        .collect()
}

/// Builds each owner's field value from its related values.
pub(crate) fn shape<F>(field: &SchemaField, links: &Links, lookup: F) -> IndexMap<Value, Value>
where
    F: Fn(&Value) -> Option<Value>,
{
    links
        .iter()
        .map(|(owner, values)| {
            let mut items = values.iter().filter_map(&lookup);
            let value = if field.related_single() {
                items.next().unwrap_or(Value::Null)
            } else {
                Value::List(items.collect())
            };
            (owner.clone(), value)
        })
        .collect()
}

pub(crate) fn assign(rows: &mut [Record], pk: &str, name: &str, values: &IndexMap<Value, Value>) {
    for row in rows {
        let key = row.get(pk).cloned().unwrap_or(Value::Null);
        if let Some(value) = values.get(&key) {
            row.insert(name.to_string(), value.clone());
        }
    }
}

/// The nested schema of `field`, checked against the field's related model.
pub(crate) fn nested_schema(owner: &Schema, field: &SchemaField) -> OrmResult<Option<Schema>> {
    let Some(related) = &field.related_schema else {
        return Ok(None);
    };
    let schema = related.resolve(owner)?;
    if let Some(model) = field.related_model() {
        check_binding(owner.model(), field.name(), model, schema.model())?;
    }
    Ok(Some(schema))
}

/// Applies the isolated-field failure policy.
pub(crate) fn recover(ctx: &QueryContext, field: &SchemaField, err: OrmError) -> OrmResult<()> {
    if field.fail_silently() && !ctx.raises_errors() {
        tracing::warn!(field = field.name(), error = %err, "isolated field failed, using placeholder");
        Ok(())
    } else {
        Err(err.in_field(field.name()))
    }
}

// ── Write planning ───────────────────────────────────────────────────

/// Input data split by how each part is persisted.
pub(crate) struct WriteBundle<'s> {
    pub pk: Option<Value>,
    pub columns: Record,
    pub keys: Vec<(&'s SchemaField, Value)>,
    pub objects: Vec<(&'s SchemaField, Value)>,
}

fn holds_objects(value: &Value) -> bool {
    match value {
        Value::Map(_) => true,
        Value::List(items) => items.iter().any(|v| matches!(v, Value::Map(_))),
        _ => false,
    }
}

/// Reduces nested objects to their primary key.
fn reduce_key(field: &SchemaField, value: &Value) -> Value {
    match value {
        Value::Map(map) => field
            .related_model()
            .and_then(|m| map.get(m.pk_name()).or_else(|| map.get("pk")))
            .cloned()
            .unwrap_or(Value::Null),
        other => other.clone(),
    }
}

impl<'s> WriteBundle<'s> {
    pub fn split(schema: &'s Schema, data: &Record, op: OperationMode) -> Self {
        let mut bundle = Self {
            pk: record_pk(schema, data).cloned(),
            columns: Record::new(),
            keys: Vec::new(),
            objects: Vec::new(),
        };
        for (name, value) in data {
            let Some(field) = schema.field(name) else {
                tracing::debug!(schema = schema.name(), field = %name, "ignoring unknown input field");
                continue;
            };
            if field.is_primary_key() || !field.mode().allows(op) {
                continue;
            }
            if field.relation_update_enabled() {
                if field.has_related_schema() && holds_objects(value) {
                    bundle.objects.push((field, value.clone()));
                } else {
                    bundle.keys.push((field, value.clone()));
                }
            } else if let Some(column) = &field.column {
                bundle.columns.insert(column.clone(), reduce_key(field, value));
            }
        }
        bundle
    }
}

/// Column values for an insert: input, primary key, stamps and defaults.
pub(crate) fn create_columns(schema: &Schema, columns: &Record, pk: Option<&Value>, extra: &Record) -> Record {
    let mut out = columns.clone();
    if let Some(pk) = pk {
        out.insert(schema.model().pk_name().to_string(), pk.clone());
    }
    out.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    for field in schema.fields() {
        let Some(column) = &field.column else { continue };
        if out.contains_key(column) {
            continue;
        }
        if let Some(value) = default_value(field) {
            out.insert(column.clone(), value);
        }
    }
    out
}

/// Column values for an update: input, stamps and refreshed `auto_now` columns.
pub(crate) fn update_columns(schema: &Schema, columns: &Record, extra: &Record) -> Record {
    let mut out = columns.clone();
    out.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    for field in schema.fields() {
        if let (Some(column), Some(def)) = (&field.column, field.model_field()) {
            if def.auto_now && !field.is_primary_key() {
                out.insert(column.clone(), now_for(field));
            }
        }
    }
    out
}

/// The part of `columns` stored in `model`'s own table.
pub(crate) fn local_columns(model: &Model, columns: &Record) -> Record {
    let local: Vec<&str> = model
        .local_concrete_fields()
        .into_iter()
        .map(|f| f.name.as_str())
        .collect();
    columns
        .iter()
        .filter(|(k, _)| local.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// `columns` without the primary key.
pub(crate) fn without_pk(model: &Model, mut columns: Record) -> Record {
    columns.shift_remove(model.pk_name());
    columns.shift_remove("pk");
    columns
}

/// The distinct, non-null keys of a relation-key assignment.
pub(crate) fn relation_keys(field: &SchemaField, value: &Value) -> Vec<Value> {
    let mut seen = HashSet::new();
    value
        .clone()
        .into_items()
        .iter()
        .map(|v| reduce_key(field, v))
        .filter(|v| !v.is_null() && seen.insert(v.clone()))
        .collect()
}

/// The nested records of a relation-object assignment.
pub(crate) fn nested_items(value: &Value) -> Vec<Record> {
    value
        .clone()
        .into_items()
        .into_iter()
        .filter_map(|v| match v {
            Value::Map(map) => Some(map),
            _ => None,
        })
        .collect()
}

/// Statements persisting a relation-key assignment.
pub(crate) enum KeyWrite {
    /// Through rows: drop stale links, read the remaining ones, add the missing.
    Through {
        stale: Option<QuerySet>,
        existing: Option<QuerySet>,
        through: QuerySet,
        own: String,
        other: String,
    },
    /// Foreign keys on related rows: clear the old, point the new.
    Reverse {
        clear: Option<(QuerySet, Record)>,
        set: Option<(QuerySet, Record)>,
    },
}

pub(crate) fn plan_keys(field: &SchemaField, pk: &Value, keys: &[Value], created: bool) -> Option<KeyWrite> {
    match field.relation_write.as_ref()? {
        RelationWrite::ManyToMany {
            through,
            own,
            other,
        } => {
            let linked = through
                .objects()
                .filter(Q::filter(own.clone(), Lookup::Exact(pk.clone())));
            let stale = (!created).then(|| {
                linked
                    .clone()
                    .exclude(Q::filter(other.clone(), Lookup::In(keys.to_vec())))
            });
            Some(KeyWrite::Through {
                stale,
                existing: (!created).then_some(linked),
                through: through.objects(),
                own: own.clone(),
                other: other.clone(),
            })
        }
        RelationWrite::Reverse {
            related,
            field: fk,
            nullable,
        } => {
            let clear = (!created && *nullable).then(|| {
                (
                    related
                        .objects()
                        .filter(Q::filter(fk.clone(), Lookup::Exact(pk.clone())))
                        .exclude(Q::filter(related.pk_name(), Lookup::In(keys.to_vec()))),
                    record([(fk.clone(), Value::Null)]),
                )
            });
            let set = (!keys.is_empty()).then(|| {
                (
                    related.objects().pk_in(keys.to_vec()),
                    record([(fk.clone(), pk.clone())]),
                )
            });
            Some(KeyWrite::Reverse { clear, set })
        }
    }
}

/// Through rows still to insert, given the links already present.
pub(crate) fn missing_links(own: &str, other: &str, pk: &Value, keys: &[Value], existing: &[Record]) -> Vec<Record> {
    let present: HashSet<&Value> = existing.iter().filter_map(|r| r.get(other)).collect();
    keys.iter()
        .filter(|k| !present.contains(k))
        .map(|k| record([(own.to_string(), pk.clone()), (other.to_string(), k.clone())]))
        .collect()
}

/// How nested relation objects are attached to their owner.
pub(crate) enum ObjectWrite {
    /// Stamp the owner key on each object; drop unlisted rows after an update.
    Reverse { extra: Record, prune: Option<(Model, String)> },
    /// Save the objects, then link them through the relation keys.
    Through,
}

pub(crate) fn plan_objects(field: &SchemaField, pk: &Value, created: bool) -> Option<ObjectWrite> {
    match field.relation_write.as_ref()? {
        RelationWrite::Reverse {
            related,
            field: fk,
            ..
        } => Some(ObjectWrite::Reverse {
            extra: record([(fk.clone(), pk.clone())]),
            prune: (!created).then(|| (related.clone(), fk.clone())),
        }),
        RelationWrite::ManyToMany { .. } => Some(ObjectWrite::Through),
    }
}

/// Related rows of `owner` not among `kept`.
pub(crate) fn prune_query(related: &Model, fk: &str, owner: &Value, kept: Vec<Value>) -> QuerySet {
    related
        .objects()
        .filter(Q::filter(fk, Lookup::Exact(owner.clone())))
        .exclude(Q::filter(related.pk_name(), Lookup::In(kept)))
}

/// Applies the relation-error policy.
pub(crate) fn relation_outcome(
    schema: &Schema,
    field: &SchemaField,
    result: OrmResult<()>,
    options: &SaveOptions,
) -> OrmResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if options.ignore_relation_errors.allows(&err) => {
            tracing::warn!(
                schema = schema.name(),
                field = field.name(),
                error = %err,
                "relation save failed, skipped"
            );
            Ok(())
        }
        Err(err) => Err(err.in_relation(field.name())),
    }
}

/// The primary key of a save input.
pub(crate) fn input_pk(schema: &Schema, data: &Record) -> Option<Value> {
    record_pk(schema, data).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;
    use schema_orm_db::query::AggregateFunc;
    use schema_orm_test::fixtures;

    fn user_schema() -> Schema {
        let user = fixtures::registry().model("user").unwrap();
        Schema::builder("User", &user)
            .field(Field::new("username"))
            .field(Field::new("email").mode("ra"))
            .field(Field::new("followers"))
            .field(Field::new("created_at"))
            .field(Field::new("nickname").default("anon"))
            .field(Field::property("shout", ["username"], |row| {
                Value::from(row.get("username").map(ToString::to_string).unwrap_or_default().to_uppercase())
            }))
            .build()
            .unwrap()
    }

    #[test]
    fn test_normalize_dedups_keys() {
        let schema = user_schema();
        let ctx = QueryContext::new();
        let source = QuerySource::Pks(vec![2.into(), 1.into(), 2.into(), Value::Null]);
        let normalized = normalize(&schema, source, &ctx).unwrap().unwrap();
        assert_eq!(normalized.order, Some(vec![Value::from(2), Value::from(1)]));

        assert!(normalize(&schema, QuerySource::Pks(vec![]), &ctx).unwrap().is_none());
        let none = schema.model().objects().none();
        assert!(normalize(&schema, none.into(), &ctx).unwrap().is_none());

        let single = ctx.single(true);
        let normalized = normalize(&schema, QuerySource::Pks(vec![3.into(), 1.into()]), &single)
            .unwrap()
            .unwrap();
        assert_eq!(normalized.order, Some(vec![Value::from(3)]));
    }

    #[test]
    fn test_dedup_restores_order() {
        let rows = vec![
            record([("id", Value::from(1))]),
            record([("id", Value::from(2))]),
            record([("id", Value::from(1))]),
        ];
        let out = dedup(rows.clone(), "id", None);
        assert_eq!(pk_list(&out, "id"), vec![Value::from(1), Value::from(2)]);
        let order = [Value::from(2), Value::from(3), Value::from(1)];
        let out = dedup(rows, "id", Some(&order));
        assert_eq!(pk_list(&out, "id"), vec![Value::from(2), Value::from(1)]);
    }

    #[test]
    fn test_read_plan_scope_and_properties() {
        let schema = user_schema();
        let ctx = QueryContext::new().include(["shout", "followers"]);
        let plan = ReadPlan::new(&schema, &ctx, false).unwrap();
        let aliases: Vec<&str> = plan.columns.iter().map(|c| c.alias.as_str()).collect();
        // username is fetched for the property but not returned
        assert_eq!(aliases, vec!["id", "username"]);
        assert_eq!(plan.isolated.len(), 1);

        let mut rows = vec![record([("id", Value::from(1)), ("username", Value::from("bob"))])];
        plan.prefill(&mut rows);
        let row = plan.finish(rows.remove(0));
        assert_eq!(row.keys().collect::<Vec<_>>(), vec!["id", "followers", "shout"]);
        assert_eq!(row["shout"], Value::from("BOB"));
        assert_eq!(row["followers"], Value::List(vec![]));
    }

    #[test]
    fn test_unmapped_default_prefill() {
        let schema = user_schema();
        let plan = ReadPlan::new(&schema, &QueryContext::new().include(["nickname"]), false).unwrap();
        let mut rows = vec![record([("id", Value::from(1))])];
        plan.prefill(&mut rows);
        assert_eq!(plan.finish(rows.remove(0))["nickname"], Value::from("anon"));
    }

    #[test]
    fn test_sliced_aggregate_rewrite() {
        let user = fixtures::registry().model("user").unwrap();
        let expr = Expression::Aggregate {
            func: AggregateFunc::Sum,
            field: Box::new(Expression::col("articles.views")),
            distinct: false,
            filter: Some(Box::new(Q::filter("articles.views", Lookup::Gt(Value::from(5))))),
        };
        let rewritten = rewrite_sliced(&user, &expr).unwrap();
        let Expression::Subquery(sub) = rewritten else {
            panic!("expected a subquery");
        };
        assert_eq!(sub.link, "author");
        assert_eq!(sub.outer, "id");
        assert_eq!(sub.queryset.model().ident(), "article");
        let Expression::Aggregate { field, filter, .. } = &sub.value else {
            panic!("expected an aggregate");
        };
        assert!(matches!(field.as_ref(), Expression::Col(c) if c == "views"));
        assert_eq!(
            filter.as_deref(),
            Some(&Q::filter("views", Lookup::Gt(Value::from(5))))
        );

        let plain = Expression::col("username");
        assert!(matches!(rewrite_sliced(&user, &plain).unwrap(), Expression::Col(_)));
    }

    #[test]
    fn test_group_filters_owners_and_fanout() {
        let rows = vec![
            record([(OWNER, Value::from(1)), (KEY, Value::from(10)), (VALUE, Value::from("a"))]),
            record([(OWNER, Value::from(1)), (KEY, Value::from(10)), (VALUE, Value::from("a"))]),
            record([(OWNER, Value::from(1)), (KEY, Value::from(11)), (VALUE, Value::from("a"))]),
            record([(OWNER, Value::from(9)), (KEY, Value::from(12)), (VALUE, Value::from("z"))]),
            record([(OWNER, Value::from(2)), (KEY, Value::Null), (VALUE, Value::Null)]),
        ];
        let links = group(rows, &[Value::from(1), Value::from(2)]);
        assert_eq!(links.len(), 1);
        assert_eq!(links[&Value::from(1)], vec![Value::from("a"), Value::from("a")]);
        assert_eq!(related_keys(&links), vec![Value::from("a")]);
    }

    #[test]
    fn test_write_bundle_split() {
        let schema = user_schema();
        let data = record([
            ("id", Value::from(1)),
            ("username", Value::from("alice")),
            ("email", Value::from("a@x")),
            ("followers", Value::List(vec![Value::from(2)])),
            ("unknown", Value::from(0)),
        ]);
        let update = WriteBundle::split(&schema, &data, OperationMode::Update);
        assert_eq!(update.pk, Some(Value::from(1)));
        assert_eq!(update.columns.keys().collect::<Vec<_>>(), vec!["username"]);
        assert_eq!(update.keys.len(), 1);
        assert!(update.objects.is_empty());

        let create = WriteBundle::split(&schema, &data, OperationMode::Create);
        assert!(create.columns.contains_key("email"));
        let columns = create_columns(&schema, &create.columns, None, &Record::new());
        assert!(matches!(columns["created_at"], Value::DateTime(_)));
        assert!(!columns.contains_key("nickname"));
    }

    #[test]
    fn test_options() {
        assert!(SaveOptions::default().must_create(true).must_update(true).validate().is_err());
        let ignore = IgnoreErrors::Kinds(vec![ErrorKind::Integrity]);
        assert!(ignore.allows(&OrmError::IntegrityError("x".into()).in_relation("a")));
        assert!(!ignore.allows(&OrmError::DatabaseError("x".into())));
        assert_eq!(TransactionMode::from("replica"), TransactionMode::Alias("replica".into()));
        assert_eq!(TransactionMode::from(false), TransactionMode::None);
    }
}
