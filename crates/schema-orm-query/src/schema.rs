//! Schemas: classified field tables bound to a model.
//!
//! A [`Schema`] is built once from [`Field`] declarations and is immutable
//! afterwards; clones share the same table. It is the entry point for every
//! read ([`serialize`](Schema::serialize), [`init`](Schema::init),
//! [`get_values`](Schema::get_values)) and write ([`save`](Schema::save),
//! [`bulk_save`](Schema::bulk_save)), each with an async twin.
//!
//! # Examples
//!
//! ```
//! use schema_orm_query::{Field, Schema};
//! use schema_orm_test::fixtures;
//!
//! let registry = fixtures::registry();
//! let user = registry.model("user").unwrap();
//! let schema = Schema::builder("UserRef", &user)
//!     .field(Field::new("username"))
//!     .field(Field::new("followers").schema_self().many())
//!     .build()
//!     .unwrap();
//!
//! // the primary key is always part of a schema
//! assert_eq!(schema.pk_field().name(), "id");
//! assert!(schema.field("followers").unwrap().is_isolated());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use schema_orm_core::{OrmError, OrmResult};
use schema_orm_db::connections::ConnectionRegistry;
use schema_orm_db::model::Model;
use schema_orm_db::query::QuerySet;
use schema_orm_db::value::{record_to_json, Record, Value};

use crate::classifier::{classify, SchemaField};
use crate::compiler::{AsyncQueryCompiler, QueryCompiler, SaveOptions};
use crate::context::QueryContext;
use crate::field::{Field, OperationMode};

/// The identity of a schema (or schema variant), used to key the recursion guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaId(u64);

impl SchemaId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct SchemaInner {
    id: SchemaId,
    name: String,
    model: Model,
    fields: IndexMap<String, SchemaField>,
    pk: String,
    mode: Option<OperationMode>,
    variants: Mutex<HashMap<OperationMode, Schema>>,
}

/// An immutable, classified field table bound to a model.
#[derive(Clone)]
pub struct Schema(Arc<SchemaInner>);

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.0.name)
            .field("model", &self.0.model.ident())
            .field("fields", &self.0.fields.keys().collect::<Vec<_>>())
            .field("mode", &self.0.mode)
            .finish()
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

/// Collects field declarations for a schema.
#[derive(Debug)]
pub struct SchemaBuilder {
    name: String,
    model: Model,
    fields: Vec<Field>,
}

impl SchemaBuilder {
    /// Adds a field declaration.
    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds several field declarations.
    #[must_use]
    pub fn fields(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Classifies every field.
    ///
    /// The primary key is added (read-only) when no declared field maps to
    /// it.
    pub fn build(self) -> OrmResult<Schema> {
        let mut fields: IndexMap<String, SchemaField> = IndexMap::new();
        for decl in &self.fields {
            if fields.contains_key(&decl.name) {
                return Err(OrmError::Classification(format!(
                    "{}: field '{}' is declared twice",
                    self.name, decl.name
                )));
            }
            let field = classify(&self.model, decl)?;
            fields.insert(decl.name.clone(), field);
        }

        let pk = match fields.values().find(|f| f.is_primary_key()) {
            Some(field) => field.name().to_string(),
            None => {
                let pk_name = self.model.pk_name().to_string();
                if fields.contains_key(&pk_name) {
                    return Err(OrmError::Classification(format!(
                        "{}: field '{pk_name}' shadows the primary key",
                        self.name
                    )));
                }
                let field = classify(&self.model, &Field::new(pk_name.clone()).mode("r"))?;
                fields.shift_insert(0, pk_name.clone(), field);
                pk_name
            }
        };

        for field in fields.values() {
            if let Some(prop) = field.property() {
                if let Some(missing) = prop.deps().iter().find(|d| !fields.contains_key(*d)) {
                    return Err(OrmError::Classification(format!(
                        "{}: property '{}' depends on unknown field '{missing}'",
                        self.name,
                        field.name()
                    )));
                }
            }
        }

        tracing::debug!(schema = %self.name, model = %self.model, fields = fields.len(), "schema built");
        Ok(Schema(Arc::new(SchemaInner {
            id: SchemaId::next(),
            name: self.name,
            model: self.model,
            fields,
            pk,
            mode: None,
            variants: Mutex::new(HashMap::new()),
        })))
    }
}

impl Schema {
    /// Starts a schema bound to `model`.
    pub fn builder(name: impl Into<String>, model: &Model) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            model: model.clone(),
            fields: Vec::new(),
        }
    }

    /// The identity keying this schema in the recursion guard.
    pub fn id(&self) -> SchemaId {
        self.0.id
    }

    /// The schema name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The bound model.
    pub fn model(&self) -> &Model {
        &self.0.model
    }

    /// The operation this variant is specialized for, if any.
    pub fn mode(&self) -> Option<OperationMode> {
        self.0.mode
    }

    /// Every field, in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &SchemaField> {
        self.0.fields.values()
    }

    /// Looks a field up by name; `pk` names the primary key field.
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        let name = if name == "pk" { self.0.pk.as_str() } else { name };
        self.0.fields.get(name)
    }

    /// The primary key field.
    pub fn pk_field(&self) -> &SchemaField {
        // build() always registers the primary key
        &self.0.fields[self.0.pk.as_str()]
    }

    /// The name of the primary key field.
    pub fn pk_name(&self) -> &str {
        &self.0.pk
    }

    /// The variant of this schema holding only the fields taking part in `op`.
    ///
    /// Variants are memoized per schema and keep the primary key.
    pub fn variant(&self, op: OperationMode) -> Self {
        let mut variants = self.0.variants.lock().unwrap_or_else(PoisonError::into_inner);
        variants
            .entry(op)
            .or_insert_with(|| {
                let fields = self
                    .0
                    .fields
                    .iter()
                    .filter(|(_, f)| f.participates(op))
                    .map(|(k, f)| (k.clone(), f.clone()))
                    .collect();
                Self(Arc::new(SchemaInner {
                    id: SchemaId::next(),
                    name: format!("{}[{op}]", self.0.name),
                    model: self.0.model.clone(),
                    fields,
                    pk: self.0.pk.clone(),
                    mode: Some(op),
                    variants: Mutex::new(HashMap::new()),
                }))
            })
            .clone()
    }

    fn compiler<'a>(&'a self, connections: &'a ConnectionRegistry, ctx: &'a QueryContext) -> QueryCompiler<'a> {
        QueryCompiler::new(self, connections, ctx)
    }

    fn async_compiler<'a>(
        &'a self,
        connections: &'a ConnectionRegistry,
        ctx: &'a QueryContext,
    ) -> AsyncQueryCompiler<'a> {
        AsyncQueryCompiler::new(self, connections, ctx)
    }

    fn instances(&self, rows: Vec<Record>) -> Vec<SchemaInstance> {
        rows.into_iter()
            .map(|data| SchemaInstance {
                schema: self.clone(),
                data,
            })
            .collect()
    }

    fn first(&self, rows: Vec<Record>) -> OrmResult<SchemaInstance> {
        self.instances(rows)
            .into_iter()
            .next()
            .ok_or_else(|| OrmError::EmptyQueryset(format!("{} matched no rows", self.name())))
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Fetches fully populated rows as records.
    pub fn get_values(
        &self,
        connections: &ConnectionRegistry,
        source: impl Into<QuerySource>,
        ctx: &QueryContext,
    ) -> OrmResult<Vec<Record>> {
        self.compiler(connections, ctx).get_values(source.into())
    }

    /// Serializes every row of `source`.
    pub fn serialize(
        &self,
        connections: &ConnectionRegistry,
        source: impl Into<QuerySource>,
        ctx: &QueryContext,
    ) -> OrmResult<Vec<SchemaInstance>> {
        let rows = self.get_values(connections, source, ctx)?;
        Ok(self.instances(rows))
    }

    /// Serializes the single row of `source`.
    ///
    /// Fails with [`OrmError::EmptyQueryset`] when nothing matches.
    pub fn init(
        &self,
        connections: &ConnectionRegistry,
        source: impl Into<QuerySource>,
        ctx: &QueryContext,
    ) -> OrmResult<SchemaInstance> {
        let ctx = ctx.clone().single(true);
        let rows = self.get_values(connections, source, &ctx)?;
        self.first(rows)
    }

    /// Async form of [`get_values`](Self::get_values).
    pub async fn aget_values(
        &self,
        connections: &ConnectionRegistry,
        source: impl Into<QuerySource>,
        ctx: &QueryContext,
    ) -> OrmResult<Vec<Record>> {
        self.async_compiler(connections, ctx)
            .get_values(source.into())
            .await
    }

    /// Async form of [`serialize`](Self::serialize).
    pub async fn aserialize(
        &self,
        connections: &ConnectionRegistry,
        source: impl Into<QuerySource>,
        ctx: &QueryContext,
    ) -> OrmResult<Vec<SchemaInstance>> {
        let rows = self.aget_values(connections, source, ctx).await?;
        Ok(self.instances(rows))
    }

    /// Async form of [`init`](Self::init).
    pub async fn ainit(
        &self,
        connections: &ConnectionRegistry,
        source: impl Into<QuerySource>,
        ctx: &QueryContext,
    ) -> OrmResult<SchemaInstance> {
        let ctx = ctx.clone().single(true);
        let rows = self.aget_values(connections, source, &ctx).await?;
        self.first(rows)
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Persists one object, returning its primary key.
    pub fn save(
        &self,
        connections: &ConnectionRegistry,
        data: &Record,
        ctx: &QueryContext,
        options: &SaveOptions,
    ) -> OrmResult<Value> {
        self.compiler(connections, ctx).save_data(data, options)
    }

    /// Persists a list of objects, returning one primary key per element.
    ///
    /// With `ignore_bulk_errors`, a failed element yields `None`.
    pub fn bulk_save(
        &self,
        connections: &ConnectionRegistry,
        data: &[Record],
        ctx: &QueryContext,
        options: &SaveOptions,
    ) -> OrmResult<Vec<Option<Value>>> {
        self.compiler(connections, ctx).bulk_save_data(data, options)
    }

    /// Async form of [`save`](Self::save).
    pub async fn asave(
        &self,
        connections: &ConnectionRegistry,
        data: &Record,
        ctx: &QueryContext,
        options: &SaveOptions,
    ) -> OrmResult<Value> {
        self.async_compiler(connections, ctx)
            .save_data(data, options)
            .await
    }

    /// Async form of [`bulk_save`](Self::bulk_save).
    pub async fn abulk_save(
        &self,
        connections: &ConnectionRegistry,
        data: &[Record],
        ctx: &QueryContext,
        options: &SaveOptions,
    ) -> OrmResult<Vec<Option<Value>>> {
        self.async_compiler(connections, ctx)
            .bulk_save_data(data, options)
            .await
    }
}

/// What a read is run against.
#[derive(Debug, Clone)]
pub enum QuerySource {
    /// Every row of a queryset.
    Queryset(QuerySet),
    /// One primary key.
    Pk(Value),
    /// A list of primary keys; duplicates collapse to their first position.
    Pks(Vec<Value>),
    /// Records carrying primary keys, such as earlier results.
    Records(Vec<Record>),
}

impl From<QuerySet> for QuerySource {
    fn from(qs: QuerySet) -> Self {
        Self::Queryset(qs)
    }
}

impl From<Value> for QuerySource {
    fn from(pk: Value) -> Self {
        Self::Pk(pk)
    }
}

impl From<Vec<Value>> for QuerySource {
    fn from(pks: Vec<Value>) -> Self {
        Self::Pks(pks)
    }
}

impl From<Vec<Record>> for QuerySource {
    fn from(records: Vec<Record>) -> Self {
        Self::Records(records)
    }
}

/// One serialized row.
#[derive(Debug, Clone)]
pub struct SchemaInstance {
    schema: Schema,
    data: Record,
}

impl SchemaInstance {
    /// The schema the row was produced by.
    pub const fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The field values.
    pub const fn data(&self) -> &Record {
        &self.data
    }

    /// Consumes the instance, returning its values.
    pub fn into_data(self) -> Record {
        self.data
    }

    /// The value of one field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        let name = if name == "pk" { self.schema.pk_name() } else { name };
        self.data.get(name)
    }

    /// The primary key.
    pub fn pk(&self) -> Option<&Value> {
        self.data.get(self.schema.pk_name())
    }

    /// The row as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        record_to_json(&self.data)
    }

    /// Deserializes the row into a caller-defined type.
    pub fn parse<T: DeserializeOwned>(&self) -> OrmResult<T> {
        Ok(serde_json::from_value(self.to_json())?)
    }
}

/// Converts a serializable value into a record for [`Schema::save`].
pub fn to_record<T: Serialize>(value: &T) -> OrmResult<Record> {
    match Value::from(serde_json::to_value(value)?) {
        Value::Map(record) => Ok(record),
        other => Err(OrmError::SerializationError(format!(
            "expected an object, got {other}"
        ))),
    }
}
