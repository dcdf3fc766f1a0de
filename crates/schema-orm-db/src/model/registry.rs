//! The model registry and the [`Model`] handle.
//!
//! A [`Registry`] is built once from a set of [`ModelDef`]s. Building
//! validates relation targets, resolves default related names, and attaches
//! reverse relations to their target models. [`Model`] is a cheap, clonable
//! handle into a built registry that answers every metadata question the
//! query layer asks: field lookup, relation path resolution, inheritance,
//! expression output types and filter validation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use schema_orm_core::{OrmError, OrmResult};

use super::fields::{FieldDef, FieldType};
use crate::query::expressions::{AggregateFunc, Expression};
use crate::query::lookups::Q;
use crate::query::queryset::QuerySet;
use crate::value::Value;

/// The declaration of one model.
///
/// # Examples
///
/// ```
/// use schema_orm_db::model::{FieldDef, FieldType, ModelDef, Registry};
///
/// let registry = Registry::builder()
///     .model(
///         ModelDef::new("user")
///             .field(FieldDef::auto_pk("id"))
///             .field(FieldDef::new("username", FieldType::CharField).unique()),
///     )
///     .model(
///         ModelDef::new("article")
///             .field(FieldDef::auto_pk("id"))
///             .field(FieldDef::foreign_key("author", "user").related_name("articles")),
///     )
///     .build()
///     .unwrap();
///
/// let user = registry.model("user").unwrap();
/// assert!(user.get_field("articles").is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ModelDef {
    name: String,
    fields: Vec<FieldDef>,
    parent: Option<String>,
}

impl ModelDef {
    /// Starts a model declaration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            parent: None,
        }
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Declares multi-table inheritance from `parent`.
    ///
    /// The child shares the parent's primary key and stores only its own
    /// fields in its own table.
    #[must_use]
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

#[derive(Debug)]
struct ModelEntry {
    name: String,
    parent: Option<usize>,
    pk_name: String,
    fields: Vec<FieldDef>,
    reverse_fields: Vec<FieldDef>,
}

#[derive(Debug)]
struct RegistryInner {
    models: Vec<ModelEntry>,
    by_name: HashMap<String, usize>,
}

/// A validated set of models.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field(
                "models",
                &self.inner.models.iter().map(|m| &m.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Collects [`ModelDef`]s and builds a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    defs: Vec<ModelDef>,
}

impl RegistryBuilder {
    /// Adds a model declaration.
    #[must_use]
    pub fn model(mut self, def: ModelDef) -> Self {
        self.defs.push(def);
        self
    }

    /// Validates every declaration and derives reverse relations.
    pub fn build(self) -> OrmResult<Registry> {
        let mut by_name = HashMap::new();
        for (idx, def) in self.defs.iter().enumerate() {
            if by_name.insert(def.name.clone(), idx).is_some() {
                return Err(OrmError::ConfigurationError(format!(
                    "Model '{}' is declared twice",
                    def.name
                )));
            }
        }

        let mut models = Vec::with_capacity(self.defs.len());
        for def in &self.defs {
            let parent = match &def.parent {
                Some(parent) => Some(*by_name.get(parent).ok_or_else(|| {
                    OrmError::ConfigurationError(format!(
                        "Model '{}' inherits from unknown model '{parent}'",
                        def.name
                    ))
                })?),
                None => None,
            };
            models.push(ModelEntry {
                name: def.name.clone(),
                parent,
                pk_name: String::new(),
                fields: def.fields.clone(),
                reverse_fields: Vec::new(),
            });
        }

        for idx in 0..models.len() {
            let root = root_of(&models, idx)?;
            let pks: Vec<String> = models[root]
                .fields
                .iter()
                .filter(|f| f.primary_key)
                .map(|f| f.name.clone())
                .collect();
            let [pk_name] = pks.as_slice() else {
                return Err(OrmError::ConfigurationError(format!(
                    "Model '{}' must declare exactly one primary key",
                    models[root].name
                )));
            };
            if root != idx && models[idx].fields.iter().any(|f| f.primary_key) {
                return Err(OrmError::ConfigurationError(format!(
                    "Model '{}' inherits its primary key and cannot declare another",
                    models[idx].name
                )));
            }
            models[idx].pk_name = pk_name.clone();
        }

        let mut reverse: Vec<(usize, FieldDef)> = Vec::new();
        for model in &mut models {
            for field in &mut model.fields {
                let owner = model.name.clone();
                let one_to_one = matches!(field.field_type, FieldType::OneToOneField { .. });
                match &mut field.field_type {
                    FieldType::ForeignKey { to, related_name }
                    | FieldType::OneToOneField { to, related_name } => {
                        let target = *by_name.get(to.as_str()).ok_or_else(|| {
                            unknown_target(&owner, &field.name, to)
                        })?;
                        let name = related_name
                            .get_or_insert_with(|| {
                                if one_to_one {
                                    owner.clone()
                                } else {
                                    format!("{owner}_set")
                                }
                            })
                            .clone();
                        let field_type = if one_to_one {
                            FieldType::ReverseOneToOne {
                                model: owner.clone(),
                                field: field.name.clone(),
                            }
                        } else {
                            FieldType::ReverseForeignKey {
                                model: owner.clone(),
                                field: field.name.clone(),
                            }
                        };
                        reverse.push((target, FieldDef::new(name, field_type)));
                    }
                    FieldType::ManyToManyField {
                        to,
                        through,
                        related_name,
                        ..
                    } => {
                        let target = *by_name.get(to.as_str()).ok_or_else(|| {
                            unknown_target(&owner, &field.name, to)
                        })?;
                        if !by_name.contains_key(through.as_str()) {
                            return Err(unknown_target(&owner, &field.name, through));
                        }
                        let name = related_name
                            .get_or_insert_with(|| format!("{owner}_set"))
                            .clone();
                        reverse.push((
                            target,
                            FieldDef::new(
                                name,
                                FieldType::ReverseManyToMany {
                                    model: owner.clone(),
                                    field: field.name.clone(),
                                },
                            ),
                        ));
                    }
                    _ => {}
                }
            }
        }

        for (target, field) in reverse {
            let entry = &mut models[target];
            if entry.fields.iter().chain(&entry.reverse_fields).any(|f| f.name == field.name) {
                return Err(OrmError::ConfigurationError(format!(
                    "Reverse relation '{}' clashes with an existing field on '{}'",
                    field.name, entry.name
                )));
            }
            entry.reverse_fields.push(field);
        }

        let registry = Registry {
            inner: Arc::new(RegistryInner { models, by_name }),
        };
        registry.check_through_models()?;
        tracing::debug!(models = registry.inner.models.len(), "model registry built");
        Ok(registry)
    }
}

fn root_of(models: &[ModelEntry], idx: usize) -> OrmResult<usize> {
    let mut current = idx;
    for _ in 0..=models.len() {
        match models[current].parent {
            Some(parent) => current = parent,
            None => return Ok(current),
        }
    }
    Err(OrmError::ConfigurationError(format!(
        "Inheritance cycle involving model '{}'",
        models[idx].name
    )))
}

fn unknown_target(model: &str, field: &str, target: &str) -> OrmError {
    OrmError::ConfigurationError(format!(
        "Relation '{model}.{field}' points at unknown model '{target}'"
    ))
}

impl Registry {
    /// Starts building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Returns the model with the given name.
    pub fn model(&self, name: &str) -> OrmResult<Model> {
        self.inner
            .by_name
            .get(name)
            .map(|&index| Model {
                registry: Arc::clone(&self.inner),
                index,
            })
            .ok_or_else(|| OrmError::ConfigurationError(format!("Unknown model '{name}'")))
    }

    /// Iterates over every registered model in declaration order.
    pub fn models(&self) -> impl Iterator<Item = Model> + '_ {
        (0..self.inner.models.len()).map(|index| Model {
            registry: Arc::clone(&self.inner),
            index,
        })
    }

    fn check_through_models(&self) -> OrmResult<()> {
        for model in self.models() {
            for field in model.own_fields() {
                if let FieldType::ManyToManyField {
                    to,
                    through,
                    source_field,
                    target_field,
                    ..
                } = &field.field_type
                {
                    let through_model = self.model(through)?;
                    for (link, expected) in [(source_field, model.ident()), (target_field, to.as_str())] {
                        let link_field = through_model.get_field(link)?;
                        let points_at = match &link_field.field_type {
                            FieldType::ForeignKey { to, .. } => Some(to.as_str()),
                            _ => None,
                        };
                        if points_at != Some(expected) {
                            return Err(OrmError::ConfigurationError(format!(
                                "'{through}.{link}' must be a foreign key to '{expected}'"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// A handle to one model of a [`Registry`].
#[derive(Clone)]
pub struct Model {
    registry: Arc<RegistryInner>,
    index: usize,
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.registry, &other.registry) && self.index == other.index
    }
}

impl Eq for Model {}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Model({})", self.ident())
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ident())
    }
}

/// One step of a resolved relation path.
#[derive(Debug, Clone)]
pub struct PathSegment {
    /// The model the field was looked up on.
    pub model: Model,
    /// The field at this step.
    pub field: FieldDef,
}

/// The result of resolving a dotted path such as `author.username`.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// Every step of the path, in order. Never empty.
    pub segments: Vec<PathSegment>,
}

impl ResolvedPath {
    /// The last step of the path.
    pub fn terminal(&self) -> &PathSegment {
        // segments is never empty; resolve_path rejects empty paths
        &self.segments[self.segments.len() - 1]
    }

    /// Returns `true` if no step of the path is a to-many relation.
    pub fn is_single(&self) -> bool {
        self.segments.iter().all(|s| !s.field.field_type.is_many())
    }

    /// Returns `true` for a single concrete column on the origin model.
    pub fn is_direct_column(&self) -> bool {
        self.segments.len() == 1 && self.terminal().field.is_concrete()
    }

    /// Returns `true` if the path crosses at least one relation before the terminal.
    pub fn is_traversal(&self) -> bool {
        self.segments.len() > 1
    }

    /// Returns the model a relation-terminated path lands on.
    pub fn target_model(&self) -> OrmResult<Option<Model>> {
        let terminal = self.terminal();
        if terminal.field.is_relation() {
            terminal.model.related_model(&terminal.field).map(Some)
        } else {
            Ok(None)
        }
    }

    /// The path leading from the target model back to the origin model.
    ///
    /// Only defined when every segment is a relation.
    pub fn reverse_path(&self) -> Option<String> {
        let mut names = Vec::with_capacity(self.segments.len());
        for segment in self.segments.iter().rev() {
            names.push(segment.field.reverse_name()?.to_string());
        }
        Some(names.join("."))
    }
}

impl Model {
    fn entry(&self) -> &ModelEntry {
        &self.registry.models[self.index]
    }

    fn handle(&self, index: usize) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            index,
        }
    }

    /// The model's identity, used as the recursion-map key and the storage table name.
    pub fn ident(&self) -> &str {
        &self.entry().name
    }

    /// The primary key field name.
    pub fn pk_name(&self) -> &str {
        &self.entry().pk_name
    }

    /// The registry this model belongs to.
    pub fn registry(&self) -> Registry {
        Registry {
            inner: Arc::clone(&self.registry),
        }
    }

    /// The parent model under multi-table inheritance.
    pub fn parent(&self) -> Option<Self> {
        self.entry().parent.map(|p| self.handle(p))
    }

    /// The model followed by its ancestors, nearest first.
    pub fn lineage(&self) -> Vec<Self> {
        let mut chain = vec![self.clone()];
        let mut current = self.parent();
        while let Some(model) = current {
            current = model.parent();
            chain.push(model);
        }
        chain
    }

    /// Returns `true` if `self` is `other` or inherits from it.
    pub fn is_sub_model(&self, other: &Self) -> bool {
        self.lineage().iter().any(|m| m == other)
    }

    /// Fields declared on this model itself (not inherited, not reverse).
    pub fn own_fields(&self) -> &[FieldDef] {
        &self.entry().fields
    }

    /// Concrete fields stored in this model's own table: the primary key plus
    /// its own concrete fields.
    pub fn local_concrete_fields(&self) -> Vec<&FieldDef> {
        let mut out = Vec::new();
        if self.entry().parent.is_some() {
            if let Ok(pk) = self.get_field(self.pk_name()) {
                out.push(pk);
            }
        }
        out.extend(self.own_fields().iter().filter(|f| f.is_concrete()));
        out
    }

    /// Every field visible on this model: inherited first, then own, then reverse.
    pub fn fields(&self) -> Vec<&FieldDef> {
        let mut out = Vec::new();
        let lineage: Vec<usize> = {
            let mut chain = vec![self.index];
            let mut current = self.entry().parent;
            while let Some(p) = current {
                chain.push(p);
                current = self.registry.models[p].parent;
            }
            chain
        };
        for &idx in lineage.iter().rev() {
            let entry = &self.registry.models[idx];
            out.extend(entry.fields.iter());
            out.extend(entry.reverse_fields.iter());
        }
        out
    }

    /// Every concrete field (own and inherited).
    pub fn concrete_fields(&self) -> Vec<&FieldDef> {
        self.fields().into_iter().filter(|f| f.is_concrete()).collect()
    }

    /// Looks a field up by name; `pk` is an alias for the primary key.
    pub fn get_field(&self, name: &str) -> OrmResult<&FieldDef> {
        let name = if name == "pk" { self.pk_name() } else { name };
        let mut current = Some(self.index);
        while let Some(idx) = current {
            let entry = &self.registry.models[idx];
            if let Some(field) = entry
                .fields
                .iter()
                .chain(&entry.reverse_fields)
                .find(|f| f.name == name)
            {
                return Ok(field);
            }
            current = entry.parent;
        }
        Err(OrmError::FieldNotFound {
            model: self.ident().to_string(),
            field: name.to_string(),
        })
    }

    /// Returns `true` if the model has a field with this name.
    pub fn has_field(&self, name: &str) -> bool {
        self.get_field(name).is_ok()
    }

    /// The model on the other side of a relation field.
    pub fn related_model(&self, field: &FieldDef) -> OrmResult<Self> {
        let target = field.field_type.related_model().ok_or_else(|| {
            OrmError::Classification(format!(
                "Field '{}.{}' is not a relation",
                self.ident(),
                field.name
            ))
        })?;
        self.registry
            .by_name
            .get(target)
            .map(|&idx| self.handle(idx))
            .ok_or_else(|| OrmError::ConfigurationError(format!("Unknown model '{target}'")))
    }

    /// Resolves a dotted path such as `author.profile.bio`.
    pub fn resolve_path(&self, path: &str) -> OrmResult<ResolvedPath> {
        let parts: Vec<&str> = path.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(OrmError::FieldNotFound {
                model: self.ident().to_string(),
                field: path.to_string(),
            });
        }
        let mut segments = Vec::with_capacity(parts.len());
        let mut model = self.clone();
        for (i, part) in parts.iter().enumerate() {
            let field = model.get_field(part)?.clone();
            let last = i + 1 == parts.len();
            let next = if last {
                None
            } else if field.is_relation() {
                Some(model.related_model(&field)?)
            } else {
                return Err(OrmError::FieldNotFound {
                    model: self.ident().to_string(),
                    field: path.to_string(),
                });
            };
            segments.push(PathSegment {
                model: model.clone(),
                field,
            });
            if let Some(next) = next {
                model = next;
            }
        }
        Ok(ResolvedPath { segments })
    }

    /// Determines the field type an expression evaluates to on this model.
    pub fn resolve_output_field(&self, expr: &Expression) -> OrmResult<FieldType> {
        match expr {
            Expression::Col(path) => {
                let resolved = self.resolve_path(path)?;
                let terminal = resolved.terminal();
                if terminal.field.is_relation() {
                    let target = terminal.model.related_model(&terminal.field)?;
                    let pk = target.get_field(target.pk_name())?;
                    Ok(scalar_type(&pk.field_type))
                } else {
                    Ok(scalar_type(&terminal.field.field_type))
                }
            }
            Expression::Value(v) => Ok(value_type(v)),
            Expression::Func { name, args } => match name.to_uppercase().as_str() {
                "LOWER" | "UPPER" | "CONCAT" => Ok(FieldType::CharField),
                "LENGTH" => Ok(FieldType::IntegerField),
                "ABS" | "COALESCE" => match args.first() {
                    Some(first) => self.resolve_output_field(first),
                    None => Err(OrmError::NotSupported(format!("{name}() without arguments"))),
                },
                other => Err(OrmError::NotSupported(format!("Unknown function {other}()"))),
            },
            Expression::Aggregate { func, field, .. } => match func {
                AggregateFunc::Count => Ok(FieldType::IntegerField),
                AggregateFunc::Avg => Ok(FieldType::FloatField),
                _ => self.resolve_output_field(field),
            },
            Expression::Case { whens, default } => {
                match whens.first().map(|w| &w.then).or(default.as_deref()) {
                    Some(branch) => self.resolve_output_field(branch),
                    None => Ok(FieldType::TextField),
                }
            }
            Expression::Subquery(sub) => sub.queryset.model().resolve_output_field(&sub.value),
            Expression::Div(..) => Ok(FieldType::FloatField),
            Expression::Add(l, r) | Expression::Sub(l, r) | Expression::Mul(l, r) => {
                let (l, r) = (self.resolve_output_field(l)?, self.resolve_output_field(r)?);
                if l == FieldType::FloatField || r == FieldType::FloatField {
                    Ok(FieldType::FloatField)
                } else {
                    Ok(l)
                }
            }
        }
    }

    /// Validates that every path a condition references exists.
    pub fn check_query(&self, q: &Q) -> OrmResult<()> {
        for path in q.fields() {
            self.resolve_path(path)?;
        }
        Ok(())
    }

    /// A fresh queryset over every row of this model.
    pub fn objects(&self) -> QuerySet {
        QuerySet::new(self.clone())
    }
}

fn scalar_type(field_type: &FieldType) -> FieldType {
    match field_type {
        FieldType::AutoField => FieldType::IntegerField,
        other => other.clone(),
    }
}

fn value_type(value: &Value) -> FieldType {
    match value {
        Value::Bool(_) => FieldType::BooleanField,
        Value::Int(_) => FieldType::IntegerField,
        Value::Float(_) => FieldType::FloatField,
        Value::Date(_) => FieldType::DateField,
        Value::DateTime(_) => FieldType::DateTimeField,
        Value::Uuid(_) => FieldType::UuidField,
        Value::Json(_) | Value::List(_) | Value::Map(_) => FieldType::JsonField,
        Value::Null | Value::String(_) | Value::Bytes(_) => FieldType::TextField,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::builder()
            .model(
                ModelDef::new("user")
                    .field(FieldDef::auto_pk("id"))
                    .field(FieldDef::new("username", FieldType::CharField).unique())
                    .field(
                        FieldDef::many_to_many("followings", "user", "follow", "follower", "following")
                            .related_name("followers"),
                    ),
            )
            .model(
                ModelDef::new("follow")
                    .field(FieldDef::auto_pk("id"))
                    .field(FieldDef::foreign_key("follower", "user").related_name("following_links"))
                    .field(FieldDef::foreign_key("following", "user").related_name("follower_links")),
            )
            .model(
                ModelDef::new("article")
                    .field(FieldDef::auto_pk("id"))
                    .field(FieldDef::new("views", FieldType::IntegerField).default(0))
                    .field(FieldDef::foreign_key("author", "user").related_name("articles")),
            )
            .model(
                ModelDef::new("admin")
                    .parent("user")
                    .field(FieldDef::new("level", FieldType::IntegerField)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_reverse_relations_are_derived() {
        let reg = registry();
        let user = reg.model("user").unwrap();
        let articles = user.get_field("articles").unwrap();
        assert_eq!(
            articles.field_type,
            FieldType::ReverseForeignKey {
                model: "article".into(),
                field: "author".into()
            }
        );
        let followers = user.get_field("followers").unwrap();
        assert!(followers.field_type.is_many());
    }

    #[test]
    fn test_default_related_name() {
        let reg = Registry::builder()
            .model(ModelDef::new("user").field(FieldDef::auto_pk("id")))
            .model(
                ModelDef::new("post")
                    .field(FieldDef::auto_pk("id"))
                    .field(FieldDef::foreign_key("owner", "user")),
            )
            .build()
            .unwrap();
        assert!(reg.model("user").unwrap().has_field("post_set"));
    }

    #[test]
    fn test_get_field_missing() {
        let reg = registry();
        let err = reg.model("user").unwrap().get_field("nope").unwrap_err();
        assert!(matches!(err, OrmError::FieldNotFound { .. }));
    }

    #[test]
    fn test_pk_alias() {
        let reg = registry();
        let user = reg.model("user").unwrap();
        assert_eq!(user.get_field("pk").unwrap().name, "id");
    }

    #[test]
    fn test_resolve_path_single_and_many() {
        let reg = registry();
        let article = reg.model("article").unwrap();
        let path = article.resolve_path("author.username").unwrap();
        assert!(path.is_single());
        assert!(path.is_traversal());
        assert_eq!(path.terminal().field.name, "username");

        let user = reg.model("user").unwrap();
        let path = user.resolve_path("articles.views").unwrap();
        assert!(!path.is_single());

        assert!(user.resolve_path("username.id").is_err());
        assert!(user.resolve_path("").is_err());
    }

    #[test]
    fn test_reverse_path() {
        let reg = registry();
        let user = reg.model("user").unwrap();
        let path = user.resolve_path("articles").unwrap();
        assert_eq!(path.reverse_path().as_deref(), Some("author"));
        assert_eq!(path.target_model().unwrap().unwrap().ident(), "article");

        let path = user.resolve_path("followers").unwrap();
        assert_eq!(path.reverse_path().as_deref(), Some("followings"));
    }

    #[test]
    fn test_inheritance() {
        let reg = registry();
        let admin = reg.model("admin").unwrap();
        let user = reg.model("user").unwrap();
        assert!(admin.is_sub_model(&user));
        assert!(!user.is_sub_model(&admin));
        assert_eq!(admin.pk_name(), "id");
        assert!(admin.has_field("username"));
        let local: Vec<&str> = admin
            .local_concrete_fields()
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(local, vec!["id", "level"]);
    }

    #[test]
    fn test_resolve_output_field() {
        let reg = registry();
        let user = reg.model("user").unwrap();
        let sum = Expression::aggregate(AggregateFunc::Sum, Expression::col("articles.views"));
        assert_eq!(user.resolve_output_field(&sum).unwrap(), FieldType::IntegerField);
        let avg = Expression::aggregate(AggregateFunc::Avg, Expression::col("articles.views"));
        assert_eq!(user.resolve_output_field(&avg).unwrap(), FieldType::FloatField);
        let lower = Expression::func("LOWER", vec![Expression::col("username")]);
        assert_eq!(user.resolve_output_field(&lower).unwrap(), FieldType::CharField);
    }

    #[test]
    fn test_check_query() {
        use crate::query::lookups::Lookup;
        let reg = registry();
        let user = reg.model("user").unwrap();
        assert!(user
            .check_query(&Q::filter("articles.views", Lookup::Gt(Value::Int(1))))
            .is_ok());
        assert!(user
            .check_query(&Q::filter("articles.missing", Lookup::IsNull(true)))
            .is_err());
    }

    #[test]
    fn test_build_rejects_unknown_target() {
        let err = Registry::builder()
            .model(
                ModelDef::new("article")
                    .field(FieldDef::auto_pk("id"))
                    .field(FieldDef::foreign_key("author", "ghost")),
            )
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_build_rejects_missing_pk() {
        let err = Registry::builder()
            .model(ModelDef::new("thing").field(FieldDef::new("name", FieldType::CharField)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("primary key"));
    }
}
