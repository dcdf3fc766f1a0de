//! Schema field declarations.
//!
//! A [`Field`] is the unclassified declaration a schema author writes: a name,
//! where its value comes from (a model path, an expression, a queryset, a
//! function or a property over other fields), an optional nested schema, a
//! mode and a few flags. [`Schema::builder`](crate::Schema::builder) hands
//! each declaration to the classifier, which turns it into an immutable
//! [`SchemaField`](crate::SchemaField).
//!
//! # Examples
//!
//! ```
//! use schema_orm_query::{Field, FieldFunc, FuncOutput};
//! use schema_orm_db::query::{AggregateFunc, Expression};
//! use schema_orm_db::value::Value;
//!
//! let fields = vec![
//!     Field::new("username"),
//!     Field::new("author_name").source("author.username"),
//!     Field::expression(
//!         "total_views",
//!         Expression::aggregate(AggregateFunc::Sum, Expression::col("articles.views")),
//!     ),
//!     Field::new("followers").schema_self().many(),
//!     Field::function(
//!         "badge",
//!         FieldFunc::per_pk(|pk| Ok(FuncOutput::Value(Value::from(format!("#{pk}"))))),
//!     ),
//! ];
//! assert_eq!(fields.len(), 5);
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use schema_orm_core::{OrmError, OrmResult};
use schema_orm_db::query::{Expression, QuerySet};
use schema_orm_db::value::{Record, Value};

use crate::schema::Schema;

/// The operation a schema variant is specialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationMode {
    /// Serialization.
    Read,
    /// Saving over an existing row.
    Update,
    /// Inserting a new row.
    Create,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "r",
            Self::Update => "w",
            Self::Create => "a",
        })
    }
}

/// Which operations a field takes part in.
///
/// Parsed from a flag string: `r` (read), `w` (write, on update and
/// create), `a` (write on create only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMode {
    read: bool,
    write: bool,
    create: bool,
}

impl Default for FieldMode {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
        }
    }
}

impl FieldMode {
    /// A read-only mode.
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
        create: false,
    };

    /// Parses a flag string such as `"rw"` or `"ra"`.
    pub fn parse(flags: &str) -> OrmResult<Self> {
        let mut mode = Self {
            read: false,
            write: false,
            create: false,
        };
        for flag in flags.chars() {
            match flag {
                'r' => mode.read = true,
                'w' => {
                    mode.write = true;
                    mode.create = true;
                }
                'a' => mode.create = true,
                other => {
                    return Err(OrmError::Classification(format!(
                        "Unknown mode flag '{other}' in '{flags}'"
                    )))
                }
            }
        }
        Ok(mode)
    }

    /// Returns `true` if the field participates in `op`.
    pub const fn allows(self, op: OperationMode) -> bool {
        match op {
            OperationMode::Read => self.read,
            OperationMode::Update => self.write,
            OperationMode::Create => self.create,
        }
    }

    /// Returns `true` if the field can be read.
    pub const fn readable(self) -> bool {
        self.read
    }

    /// Returns `true` if the field can be written on update.
    pub const fn writable(self) -> bool {
        self.write
    }

    /// Drops every write flag.
    #[must_use]
    pub const fn read_only(self) -> Self {
        Self {
            read: self.read,
            write: false,
            create: false,
        }
    }
}

impl fmt::Display for FieldMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.read {
            f.write_str("r")?;
        }
        if self.write {
            f.write_str("w")?;
        } else if self.create {
            f.write_str("a")?;
        }
        Ok(())
    }
}

/// A value filled in on create when the input leaves a field out.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultFactory {
    /// A fixed value.
    Static(Value),
    /// The current date or timestamp, matching the column type.
    Now,
}

/// What a function-sourced field returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnRule {
    /// Primary keys of the named model.
    Related(String),
    /// Plain values.
    Scalar,
}

/// The result of a field function.
#[derive(Debug, Clone)]
pub enum FuncOutput {
    /// A queryset whose primary keys are the result.
    Queryset(QuerySet),
    /// A list of primary keys.
    Pks(Vec<Value>),
    /// A single primary key.
    Pk(Value),
    /// A plain value.
    Value(Value),
}

type ConstantFn = dyn Fn() -> OrmResult<FuncOutput> + Send + Sync;
type PerPkFn = dyn Fn(&Value) -> OrmResult<FuncOutput> + Send + Sync;
type BatchFn = dyn Fn(&[Value]) -> OrmResult<IndexMap<Value, FuncOutput>> + Send + Sync;

#[derive(Clone)]
pub(crate) enum FuncCall {
    Constant(Arc<ConstantFn>),
    PerPk(Arc<PerPkFn>),
    Batch(Arc<BatchFn>),
}

/// A computed field source.
///
/// Three call shapes are supported: a zero-argument function whose result is
/// shared by every row, a one-argument function called once per primary key,
/// and a batch function called once with every primary key and returning a
/// per-key mapping.
#[derive(Clone)]
pub struct FieldFunc {
    pub(crate) call: FuncCall,
    pub(crate) returns: ReturnRule,
}

impl fmt::Debug for FieldFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self.call {
            FuncCall::Constant(_) => "constant",
            FuncCall::PerPk(_) => "per_pk",
            FuncCall::Batch(_) => "batch",
        };
        f.debug_struct("FieldFunc")
            .field("shape", &shape)
            .field("returns", &self.returns)
            .finish()
    }
}

impl FieldFunc {
    /// A function evaluated once for the whole row set.
    pub fn constant<F>(f: F) -> Self
    where
        F: Fn() -> OrmResult<FuncOutput> + Send + Sync + 'static,
    {
        Self {
            call: FuncCall::Constant(Arc::new(f)),
            returns: ReturnRule::Scalar,
        }
    }

    /// A function evaluated once per primary key.
    pub fn per_pk<F>(f: F) -> Self
    where
        F: Fn(&Value) -> OrmResult<FuncOutput> + Send + Sync + 'static,
    {
        Self {
            call: FuncCall::PerPk(Arc::new(f)),
            returns: ReturnRule::Scalar,
        }
    }

    /// A function evaluated once with every primary key.
    pub fn batch<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> OrmResult<IndexMap<Value, FuncOutput>> + Send + Sync + 'static,
    {
        Self {
            call: FuncCall::Batch(Arc::new(f)),
            returns: ReturnRule::Scalar,
        }
    }

    /// Declares that the function returns primary keys of `model`.
    #[must_use]
    pub fn returns_related(mut self, model: impl Into<String>) -> Self {
        self.returns = ReturnRule::Related(model.into());
        self
    }

    /// The declared return rule.
    pub const fn return_rule(&self) -> &ReturnRule {
        &self.returns
    }
}

type QuerysetFactory = dyn Fn() -> QuerySet + Send + Sync;

/// Where a queryset-sourced field gets its queryset.
#[derive(Clone)]
pub enum QuerysetSource {
    /// A pre-built queryset.
    Fixed(QuerySet),
    /// A callable producing a fresh queryset per resolution.
    Factory(Arc<QuerysetFactory>),
}

impl fmt::Debug for QuerysetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(qs) => f.debug_tuple("Fixed").field(&qs.model().ident()).finish(),
            Self::Factory(_) => f.write_str("Factory"),
        }
    }
}

impl QuerysetSource {
    /// Produces the queryset.
    pub fn queryset(&self) -> QuerySet {
        match self {
            Self::Fixed(qs) => qs.clone(),
            Self::Factory(f) => f(),
        }
    }
}

/// A lazily filled schema reference, for mutually recursive schemas.
///
/// ```
/// use schema_orm_query::SchemaSlot;
///
/// let slot = SchemaSlot::new();
/// assert!(slot.get().is_none());
/// ```
#[derive(Clone, Default)]
pub struct SchemaSlot(Arc<OnceLock<Schema>>);

impl fmt::Debug for SchemaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SchemaSlot")
            .field(&self.0.get().map(Schema::name))
            .finish()
    }
}

impl SchemaSlot {
    /// Creates an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills the slot. Returns the schema back if it was already filled.
    pub fn set(&self, schema: Schema) -> Result<(), Schema> {
        self.0.set(schema)
    }

    /// The schema, once filled.
    pub fn get(&self) -> Option<&Schema> {
        self.0.get()
    }
}

/// The nested schema of a relation field.
#[derive(Debug, Clone)]
pub enum RelatedSchema {
    /// A schema known when the field is declared.
    Fixed(Schema),
    /// The schema the field belongs to.
    SelfRef,
    /// A schema filled in after declaration.
    Slot(SchemaSlot),
}

impl RelatedSchema {
    /// Resolves to a concrete schema; `owner` stands in for [`RelatedSchema::SelfRef`].
    pub fn resolve(&self, owner: &Schema) -> OrmResult<Schema> {
        match self {
            Self::Fixed(schema) => Ok(schema.clone()),
            Self::SelfRef => Ok(owner.clone()),
            Self::Slot(slot) => slot.get().cloned().ok_or_else(|| {
                OrmError::ConfigurationError(format!(
                    "Nested schema slot used by '{}' was never filled",
                    owner.name()
                ))
            }),
        }
    }
}

type PropertyFn = dyn Fn(&Record) -> Value + Send + Sync;

/// A value computed from other fields of the same row.
#[derive(Clone)]
pub struct Property {
    pub(crate) deps: Vec<String>,
    pub(crate) compute: Arc<PropertyFn>,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property").field("deps", &self.deps).finish()
    }
}

impl Property {
    /// The schema fields this property reads.
    pub fn deps(&self) -> &[String] {
        &self.deps
    }

    /// Computes the property for one assembled row.
    pub fn compute(&self, row: &Record) -> Value {
        (self.compute)(row)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum FieldSource {
    Implicit,
    Path(String),
    Expression(Expression),
    Queryset(QuerysetSource),
    Function(FieldFunc),
    Property(Property),
}

/// A field declaration, classified when its schema is built.
#[derive(Debug, Clone)]
pub struct Field {
    pub(crate) name: String,
    pub(crate) source: FieldSource,
    pub(crate) related: Option<RelatedSchema>,
    pub(crate) single: Option<bool>,
    pub(crate) mode: Option<String>,
    pub(crate) fail_silently: bool,
    pub(crate) default: Option<DefaultFactory>,
    pub(crate) link: Option<String>,
}

impl Field {
    fn with_source(name: impl Into<String>, source: FieldSource) -> Self {
        Self {
            name: name.into(),
            source,
            related: None,
            single: None,
            mode: None,
            fail_silently: false,
            default: None,
            link: None,
        }
    }

    /// A field read from the model path of the same name.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_source(name, FieldSource::Implicit)
    }

    /// A field backed by an expression evaluated in the direct fetch.
    pub fn expression(name: impl Into<String>, expr: Expression) -> Self {
        Self::with_source(name, FieldSource::Expression(expr))
    }

    /// A field resolved through a pre-built related queryset.
    pub fn queryset(name: impl Into<String>, qs: QuerySet) -> Self {
        Self::with_source(name, FieldSource::Queryset(QuerysetSource::Fixed(qs)))
    }

    /// A field resolved through a queryset built on demand.
    pub fn queryset_factory<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> QuerySet + Send + Sync + 'static,
    {
        Self::with_source(
            name,
            FieldSource::Queryset(QuerysetSource::Factory(Arc::new(f))),
        )
    }

    /// A field computed by a function of the row primary keys.
    pub fn function(name: impl Into<String>, func: FieldFunc) -> Self {
        Self::with_source(name, FieldSource::Function(func))
    }

    /// A field computed from other fields once the row is assembled.
    pub fn property<I, S, F>(name: impl Into<String>, deps: I, f: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        Self::with_source(
            name,
            FieldSource::Property(Property {
                deps: deps.into_iter().map(Into::into).collect(),
                compute: Arc::new(f),
            }),
        )
    }

    /// Reads the field from a dotted model path instead of its own name.
    #[must_use]
    pub fn source(mut self, path: impl Into<String>) -> Self {
        self.source = FieldSource::Path(path.into());
        self
    }

    /// Serializes related rows through `schema`.
    #[must_use]
    pub fn schema(mut self, schema: &Schema) -> Self {
        self.related = Some(RelatedSchema::Fixed(schema.clone()));
        self
    }

    /// Serializes related rows through the schema this field belongs to.
    #[must_use]
    pub fn schema_self(mut self) -> Self {
        self.related = Some(RelatedSchema::SelfRef);
        self
    }

    /// Serializes related rows through a schema filled in later.
    #[must_use]
    pub fn schema_slot(mut self, slot: &SchemaSlot) -> Self {
        self.related = Some(RelatedSchema::Slot(slot.clone()));
        self
    }

    /// Declares a list relation.
    #[must_use]
    pub const fn many(mut self) -> Self {
        self.single = Some(false);
        self
    }

    /// Declares a scalar relation.
    #[must_use]
    pub const fn single(mut self) -> Self {
        self.single = Some(true);
        self
    }

    /// Sets the mode flags (`r`, `w`, `a`).
    #[must_use]
    pub fn mode(mut self, flags: impl Into<String>) -> Self {
        self.mode = Some(flags.into());
        self
    }

    /// Resolution failures of this field are logged and defaulted instead of raised.
    #[must_use]
    pub const fn fail_silently(mut self) -> Self {
        self.fail_silently = true;
        self
    }

    /// A value used on create when the input omits the field.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultFactory::Static(value.into()));
        self
    }

    /// Uses the current date or time as the create default.
    #[must_use]
    pub fn default_now(mut self) -> Self {
        self.default = Some(DefaultFactory::Now);
        self
    }

    /// The path from a queryset field's model back to the owning model.
    #[must_use]
    pub fn link(mut self, path: impl Into<String>) -> Self {
        self.link = Some(path.into());
        self
    }

    /// The declared name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        let mode = FieldMode::parse("rw").unwrap();
        assert!(mode.allows(OperationMode::Read));
        assert!(mode.allows(OperationMode::Update));
        assert!(mode.allows(OperationMode::Create));

        let mode = FieldMode::parse("ra").unwrap();
        assert!(!mode.allows(OperationMode::Update));
        assert!(mode.allows(OperationMode::Create));
        assert_eq!(mode.to_string(), "ra");

        assert!(FieldMode::parse("rx").is_err());
    }

    #[test]
    fn test_mode_read_only() {
        let mode = FieldMode::default().read_only();
        assert_eq!(mode, FieldMode::READ_ONLY);
        assert_eq!(mode.to_string(), "r");
    }

    #[test]
    fn test_field_builders() {
        let field = Field::new("followers")
            .schema_self()
            .many()
            .mode("r")
            .fail_silently();
        assert_eq!(field.name(), "followers");
        assert!(matches!(field.related, Some(RelatedSchema::SelfRef)));
        assert_eq!(field.single, Some(false));
        assert!(field.fail_silently);

        let renamed = Field::new("author_name").source("author.username");
        assert!(matches!(renamed.source, FieldSource::Path(ref p) if p == "author.username"));
    }

    #[test]
    fn test_property_compute() {
        let field = Field::property("shout", ["username"], |row| {
            Value::from(row["username"].to_string().to_uppercase())
        });
        let FieldSource::Property(prop) = field.source else {
            panic!("expected a property");
        };
        let row: Record = [("username".to_string(), Value::from("bob"))].into_iter().collect();
        assert_eq!(prop.compute(&row), Value::from("BOB"));
        assert_eq!(prop.deps(), ["username".to_string()]);
    }

    #[test]
    fn test_func_return_rule() {
        let func = FieldFunc::constant(|| Ok(FuncOutput::Pks(vec![]))).returns_related("user");
        assert_eq!(func.return_rule(), &ReturnRule::Related("user".into()));
        assert!(format!("{func:?}").contains("constant"));
    }
}
