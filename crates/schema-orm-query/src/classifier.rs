//! Field classification.
//!
//! Runs once per schema when it is built. Each declared [`Field`] is checked
//! against the bound model and becomes a [`SchemaField`] with exactly one
//! [`FieldKind`]:
//!
//! - `Column`: a concrete column, or a path of single-valued hops ending in
//!   one, selected in the direct fetch;
//! - `Expression`: an annotation selected in the direct fetch;
//! - `Isolated`: resolved by a follow-up query (relation paths, querysets,
//!   functions, nested schemas);
//! - `Unmapped`: not backed by the model (defaults and computed properties).
//!
//! Every failure here is a classification error: the schema cannot be built.

use schema_orm_core::{OrmError, OrmResult};
use schema_orm_db::model::{FieldDef, FieldType, Model, ResolvedPath};
use schema_orm_db::query::Expression;
use schema_orm_db::value::Value;

use crate::field::{
    DefaultFactory, Field, FieldFunc, FieldMode, FieldSource, OperationMode, Property,
    QuerysetSource, RelatedSchema, ReturnRule,
};

/// How an isolated field is resolved.
#[derive(Debug, Clone)]
pub enum Isolation {
    /// Follows a relation path: `target` rows whose `link` path leads back to
    /// the owning rows, reading `value` from each.
    Relation {
        /// The model the path lands on.
        target: Model,
        /// Path from `target` back to the owning model.
        link: String,
        /// Path read from each target row.
        value: String,
    },
    /// Restricts a related queryset to the owning rows.
    Queryset {
        /// The queryset or its factory.
        source: QuerysetSource,
        /// Path from the queryset's model back to the owning model.
        link: String,
        /// Path read from each queryset row.
        value: String,
    },
    /// Calls a function of the owning primary keys.
    Function(FieldFunc),
}

/// The classification of a schema field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// Selected in the direct fetch under the field name.
    Column {
        /// The model path selected.
        path: String,
    },
    /// Annotated and selected in the direct fetch.
    Expression(Expression),
    /// Resolved after the direct fetch.
    Isolated(Isolation),
    /// Not read from the model.
    Unmapped,
}

/// How a relation-update-enabled field is persisted.
#[derive(Debug, Clone)]
pub(crate) enum RelationWrite {
    /// Rows of `through` link `own` (this side) to `other`.
    ManyToMany {
        through: Model,
        own: String,
        other: String,
    },
    /// Rows of `related` point at the owner through `field`.
    Reverse {
        related: Model,
        field: String,
        nullable: bool,
    },
}

/// A classified, immutable schema field.
#[derive(Debug, Clone)]
pub struct SchemaField {
    pub(crate) name: String,
    pub(crate) kind: FieldKind,
    pub(crate) mode: FieldMode,
    pub(crate) is_primary_key: bool,
    pub(crate) model_field: Option<FieldDef>,
    pub(crate) related_model: Option<Model>,
    pub(crate) related_schema: Option<RelatedSchema>,
    pub(crate) related_single: bool,
    pub(crate) fail_silently: bool,
    pub(crate) relation_update_enabled: bool,
    pub(crate) column: Option<String>,
    pub(crate) relation_write: Option<RelationWrite>,
    pub(crate) default: Option<DefaultFactory>,
    pub(crate) property: Option<Property>,
}

impl SchemaField {
    /// The field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The classification.
    pub const fn kind(&self) -> &FieldKind {
        &self.kind
    }

    /// The mode flags.
    pub const fn mode(&self) -> FieldMode {
        self.mode
    }

    /// Returns `true` for the model's primary key.
    pub const fn is_primary_key(&self) -> bool {
        self.is_primary_key
    }

    /// Returns `true` for annotation-backed fields.
    pub const fn is_expression(&self) -> bool {
        matches!(self.kind, FieldKind::Expression(_))
    }

    /// Returns `true` for fields resolved after the direct fetch.
    pub const fn is_isolated(&self) -> bool {
        matches!(self.kind, FieldKind::Isolated(_))
    }

    /// Returns `true` for fields not read from the model.
    pub const fn is_unmapped(&self) -> bool {
        matches!(self.kind, FieldKind::Unmapped)
    }

    /// The model field the declaration resolved to.
    pub const fn model_field(&self) -> Option<&FieldDef> {
        self.model_field.as_ref()
    }

    /// The model on the other side of a relation field.
    pub const fn related_model(&self) -> Option<&Model> {
        self.related_model.as_ref()
    }

    /// Returns `true` if the field carries a nested schema.
    pub const fn has_related_schema(&self) -> bool {
        self.related_schema.is_some()
    }

    /// Returns `true` for scalar relations, `false` for list relations.
    pub const fn related_single(&self) -> bool {
        self.related_single
    }

    /// Whether resolution failures are logged instead of raised.
    pub const fn fail_silently(&self) -> bool {
        self.fail_silently
    }

    /// Whether writes go through a separate relation-persistence step.
    pub const fn relation_update_enabled(&self) -> bool {
        self.relation_update_enabled
    }

    /// The create default.
    pub const fn default_factory(&self) -> Option<&DefaultFactory> {
        self.default.as_ref()
    }

    /// The property computing this field.
    pub const fn property(&self) -> Option<&Property> {
        self.property.as_ref()
    }

    /// Returns `true` if the field is part of schemas specialized for `op`.
    pub const fn participates(&self, op: OperationMode) -> bool {
        self.is_primary_key || self.mode.allows(op)
    }

    /// The value an isolated field takes when nothing resolved.
    pub(crate) fn placeholder(&self) -> Value {
        if self.related_single {
            Value::Null
        } else {
            Value::List(Vec::new())
        }
    }
}

fn conflict(model: &Model, field: &str, reason: impl std::fmt::Display) -> OrmError {
    OrmError::Classification(format!("{}.{field}: {reason}", model.ident()))
}

/// Classifies one declaration against `model`.
pub(crate) fn classify(model: &Model, decl: &Field) -> OrmResult<SchemaField> {
    let mut mode = match &decl.mode {
        Some(flags) => FieldMode::parse(flags)?,
        None => FieldMode::default(),
    };
    let mut field = SchemaField {
        name: decl.name.clone(),
        kind: FieldKind::Unmapped,
        mode,
        is_primary_key: false,
        model_field: None,
        related_model: None,
        related_schema: decl.related.clone(),
        related_single: decl.single.unwrap_or(false),
        fail_silently: decl.fail_silently,
        relation_update_enabled: false,
        column: None,
        relation_write: None,
        default: decl.default.clone(),
        property: None,
    };

    match &decl.source {
        FieldSource::Implicit => {
            if !decl.name.contains('.') && !model.has_field(&decl.name) {
                classify_unmapped(model, decl, &mut field)?;
            } else {
                classify_path(model, &decl.name, decl, &mut field)?;
            }
        }
        FieldSource::Path(path) => classify_path(model, path, decl, &mut field)?,
        FieldSource::Expression(expr) => {
            if decl.related.is_some() {
                return Err(conflict(model, &decl.name, "an expression cannot carry a schema"));
            }
            model.resolve_output_field(expr)?;
            field.kind = FieldKind::Expression(expr.clone());
            mode = mode.read_only();
        }
        FieldSource::Queryset(source) => classify_queryset(model, source, decl, &mut field)?,
        FieldSource::Function(func) => classify_function(model, func, decl, &mut field)?,
        FieldSource::Property(prop) => {
            if decl.related.is_some() {
                return Err(conflict(model, &decl.name, "a property cannot carry a schema"));
            }
            field.property = Some(prop.clone());
            mode = mode.read_only();
        }
    }

    if let Some(def) = &field.model_field {
        if field.column.is_some() && (def.auto_now || def.auto_now_add) {
            mode = mode.read_only();
            field.default.get_or_insert(DefaultFactory::Now);
        }
    }
    if field.is_primary_key && !mode.readable() {
        return Err(conflict(model, &decl.name, "a primary key must stay readable"));
    }
    if field.is_isolated() && field.column.is_none() && !field.relation_update_enabled {
        mode = mode.read_only();
    }
    field.mode = mode;
    if let Some(schema) = &field.related_schema {
        check_related_schema(model, &field, schema)?;
    }
    Ok(field)
}

fn classify_unmapped(model: &Model, decl: &Field, field: &mut SchemaField) -> OrmResult<()> {
    if decl.related.is_some() {
        return Err(OrmError::FieldNotFound {
            model: model.ident().to_string(),
            field: decl.name.clone(),
        });
    }
    field.kind = FieldKind::Unmapped;
    Ok(())
}

fn classify_path(model: &Model, path: &str, decl: &Field, field: &mut SchemaField) -> OrmResult<()> {
    let resolved = model.resolve_path(path)?;
    let terminal = resolved.terminal();
    field.model_field = Some(terminal.field.clone());
    if resolved.segments.len() == 1 {
        field.is_primary_key = terminal.field.name == model.pk_name();
    }

    let single_path = resolved.is_single();
    if decl.single == Some(true) && !single_path {
        return Err(conflict(model, &decl.name, format!("'{path}' is a to-many path")));
    }

    if terminal.field.is_concrete() && resolved.segments.len() == 1 {
        field.column = Some(terminal.field.name.clone());
    }

    if !terminal.field.is_relation() {
        if decl.related.is_some() {
            return Err(conflict(model, &decl.name, format!("'{path}' is not a relation")));
        }
        if single_path {
            field.kind = FieldKind::Column {
                path: path.to_string(),
            };
            return Ok(());
        }
        // split after the last to-many hop so the value path is single-valued
        let last_many = resolved
            .segments
            .iter()
            .rposition(|s| s.field.field_type.is_many())
            .unwrap_or(0);
        let prefix = ResolvedPath {
            segments: resolved.segments[..=last_many].to_vec(),
        };
        let target = prefix.target_model()?.ok_or_else(|| {
            conflict(model, &decl.name, format!("'{path}' has no relation prefix"))
        })?;
        let link = reverse_link(model, &decl.name, &prefix)?;
        let value = resolved.segments[last_many + 1..]
            .iter()
            .map(|s| s.field.name.as_str())
            .collect::<Vec<_>>()
            .join(".");
        field.related_model = Some(target.clone());
        field.related_single = false;
        field.kind = FieldKind::Isolated(Isolation::Relation {
            target,
            link,
            value,
        });
        return Ok(());
    }

    let target = resolved
        .target_model()?
        .ok_or_else(|| conflict(model, &decl.name, format!("'{path}' is not a relation")))?;
    field.related_model = Some(target.clone());
    field.related_single = decl.single.unwrap_or(single_path);

    if decl.related.is_none() && single_path && terminal.field.is_concrete() {
        // a forward key without a nested schema reads as its raw value
        field.kind = FieldKind::Column {
            path: path.to_string(),
        };
        return Ok(());
    }

    let link = reverse_link(model, &decl.name, &resolved)?;
    field.kind = FieldKind::Isolated(Isolation::Relation {
        value: target.pk_name().to_string(),
        target,
        link,
    });

    if resolved.segments.len() == 1 {
        enable_relation_update(model, &terminal.field, field)?;
    }
    Ok(())
}

fn reverse_link(model: &Model, name: &str, path: &ResolvedPath) -> OrmResult<String> {
    path.reverse_path()
        .ok_or_else(|| conflict(model, name, "relation path cannot be traversed backwards"))
}

fn enable_relation_update(model: &Model, def: &FieldDef, field: &mut SchemaField) -> OrmResult<()> {
    let writable = field.mode.allows(OperationMode::Update) || field.mode.allows(OperationMode::Create);
    if !writable {
        return Ok(());
    }
    let registry = model.registry();
    let write = match &def.field_type {
        FieldType::ManyToManyField {
            through,
            source_field,
            target_field,
            ..
        } => RelationWrite::ManyToMany {
            through: registry.model(through)?,
            own: source_field.clone(),
            other: target_field.clone(),
        },
        FieldType::ReverseManyToMany {
            model: declaring,
            field: forward,
        } => {
            let declaring = registry.model(declaring)?;
            match &declaring.get_field(forward)?.field_type {
                FieldType::ManyToManyField {
                    through,
                    source_field,
                    target_field,
                    ..
                } => RelationWrite::ManyToMany {
                    through: registry.model(through)?,
                    own: target_field.clone(),
                    other: source_field.clone(),
                },
                _ => {
                    return Err(conflict(
                        model,
                        &field.name,
                        format!("'{forward}' is not a many-to-many field"),
                    ))
                }
            }
        }
        FieldType::ReverseForeignKey {
            model: related,
            field: fk,
        }
        | FieldType::ReverseOneToOne {
            model: related,
            field: fk,
        } => {
            let related = registry.model(related)?;
            let nullable = related.get_field(fk)?.null;
            RelationWrite::Reverse {
                related,
                field: fk.clone(),
                nullable,
            }
        }
        _ => return Ok(()),
    };
    field.relation_write = Some(write);
    field.relation_update_enabled = true;
    Ok(())
}

fn classify_queryset(
    model: &Model,
    source: &QuerysetSource,
    decl: &Field,
    field: &mut SchemaField,
) -> OrmResult<()> {
    let target = source.queryset().model().clone();
    let link = match &decl.link {
        Some(link) => {
            target.resolve_path(link)?;
            link.clone()
        }
        None => detect_link(model, &target, &decl.name)?,
    };
    field.related_model = Some(target.clone());
    field.related_single = decl.single.unwrap_or(false);
    field.kind = FieldKind::Isolated(Isolation::Queryset {
        source: source.clone(),
        link,
        value: target.pk_name().to_string(),
    });
    Ok(())
}

/// Finds the path from `target` back to `owner` for a queryset field.
///
/// A relation of the same name on the owner wins; otherwise exactly one
/// relation on `target` must point into the owner's lineage.
fn detect_link(owner: &Model, target: &Model, name: &str) -> OrmResult<String> {
    if let Ok(def) = owner.get_field(name) {
        if def.is_relation() {
            let related = owner.related_model(def)?;
            if related.is_sub_model(target) || target.is_sub_model(&related) {
                if let Some(reverse) = def.reverse_name() {
                    return Ok(reverse.to_string());
                }
            }
        }
    }
    let lineage: Vec<String> = owner.lineage().iter().map(|m| m.ident().to_string()).collect();
    let candidates: Vec<&str> = target
        .fields()
        .into_iter()
        .filter(|f| {
            f.field_type
                .related_model()
                .is_some_and(|m| lineage.iter().any(|l| l == m))
        })
        .map(|f| f.name.as_str())
        .collect();
    match candidates.as_slice() {
        [one] => Ok((*one).to_string()),
        [] => Err(conflict(
            owner,
            name,
            format!("no relation on '{}' leads back to '{}'", target.ident(), owner.ident()),
        )),
        many => Err(conflict(
            owner,
            name,
            format!("ambiguous link back from '{}': {}", target.ident(), many.join(", ")),
        )),
    }
}

fn classify_function(
    model: &Model,
    func: &FieldFunc,
    decl: &Field,
    field: &mut SchemaField,
) -> OrmResult<()> {
    match func.return_rule() {
        ReturnRule::Scalar => {
            if decl.related.is_some() {
                return Err(conflict(
                    model,
                    &decl.name,
                    "a function returning plain values cannot carry a schema",
                ));
            }
            field.related_single = decl.single.unwrap_or(true);
        }
        ReturnRule::Related(name) => {
            field.related_model = Some(model.registry().model(name)?);
            field.related_single = decl.single.unwrap_or(false);
        }
    }
    field.kind = FieldKind::Isolated(Isolation::Function(func.clone()));
    Ok(())
}

fn check_related_schema(model: &Model, field: &SchemaField, schema: &RelatedSchema) -> OrmResult<()> {
    let Some(related) = &field.related_model else {
        return Err(conflict(model, &field.name, "a nested schema needs a related model"));
    };
    let bound = match schema {
        RelatedSchema::Fixed(schema) => schema.model().clone(),
        RelatedSchema::SelfRef => model.clone(),
        // checked when the slot is first resolved
        RelatedSchema::Slot(_) => return Ok(()),
    };
    check_binding(model, &field.name, related, &bound)
}

/// Fails unless `bound` is a sub- or super-model of `related`.
pub(crate) fn check_binding(model: &Model, name: &str, related: &Model, bound: &Model) -> OrmResult<()> {
    if bound.is_sub_model(related) || related.is_sub_model(bound) {
        Ok(())
    } else {
        Err(conflict(
            model,
            name,
            format!(
                "nested schema is bound to '{}', which is unrelated to '{}'",
                bound.ident(),
                related.ident()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema_orm_db::query::AggregateFunc;
    use schema_orm_test::fixtures;

    fn user() -> Model {
        fixtures::registry().model("user").unwrap()
    }

    #[test]
    fn test_plain_column() {
        let f = classify(&user(), &Field::new("username")).unwrap();
        assert!(matches!(f.kind, FieldKind::Column { ref path } if path == "username"));
        assert_eq!(f.column.as_deref(), Some("username"));
        assert!(f.mode.allows(OperationMode::Update));
    }

    #[test]
    fn test_primary_key_detection() {
        let f = classify(&user(), &Field::new("id")).unwrap();
        assert!(f.is_primary_key());
        let err = classify(&user(), &Field::new("id").mode("w")).unwrap_err();
        assert!(matches!(err, OrmError::Classification(_)));
    }

    #[test]
    fn test_single_valued_traversal_is_a_column() {
        let article = fixtures::registry().model("article").unwrap();
        let f = classify(&article, &Field::new("author_name").source("author.username")).unwrap();
        assert!(matches!(f.kind, FieldKind::Column { ref path } if path == "author.username"));
        assert!(f.column.is_none());
    }

    #[test]
    fn test_to_many_traversal_is_isolated() {
        let f = classify(&user(), &Field::new("titles").source("articles.title")).unwrap();
        let FieldKind::Isolated(Isolation::Relation { target, link, value }) = &f.kind else {
            panic!("expected an isolated relation");
        };
        assert_eq!(target.ident(), "article");
        assert_eq!(link, "author");
        assert_eq!(value, "title");
        assert!(!f.related_single());
        assert!(!f.mode.allows(OperationMode::Update));
    }

    #[test]
    fn test_reverse_many_to_many() {
        let f = classify(&user(), &Field::new("followers")).unwrap();
        let FieldKind::Isolated(Isolation::Relation { link, value, .. }) = &f.kind else {
            panic!("expected an isolated relation");
        };
        assert_eq!(link, "followings");
        assert_eq!(value, "id");
        assert!(f.relation_update_enabled());
        let Some(RelationWrite::ManyToMany { own, other, .. }) = &f.relation_write else {
            panic!("expected a through write");
        };
        assert_eq!((own.as_str(), other.as_str()), ("following", "follower"));
    }

    #[test]
    fn test_reverse_one_to_one_is_single() {
        let f = classify(&user(), &Field::new("profile")).unwrap();
        assert!(f.related_single());
        assert!(matches!(
            f.relation_write,
            Some(RelationWrite::Reverse { ref field, nullable: false, .. }) if field == "user"
        ));
    }

    #[test]
    fn test_read_only_relation_is_not_update_enabled() {
        let f = classify(&user(), &Field::new("articles").mode("r")).unwrap();
        assert!(!f.relation_update_enabled());
    }

    #[test]
    fn test_missing_paths() {
        let f = classify(&user(), &Field::new("nickname").default("anon")).unwrap();
        assert!(f.is_unmapped());
        let err = classify(&user(), &Field::new("nick").source("profile.nick")).unwrap_err();
        assert!(matches!(err, OrmError::FieldNotFound { .. }));
        let err = classify(&user(), &Field::new("x.y")).unwrap_err();
        assert!(matches!(err, OrmError::FieldNotFound { .. }));
    }

    #[test]
    fn test_single_on_many_path_is_rejected() {
        let err = classify(&user(), &Field::new("articles").single()).unwrap_err();
        assert!(matches!(err, OrmError::Classification(_)));
    }

    #[test]
    fn test_auto_now_is_read_only_with_default() {
        let f = classify(&user(), &Field::new("created_at")).unwrap();
        assert!(!f.mode.allows(OperationMode::Create));
        assert_eq!(f.default_factory(), Some(&DefaultFactory::Now));
    }

    #[test]
    fn test_expression_validated_and_read_only() {
        let expr = Expression::aggregate(AggregateFunc::Sum, Expression::col("articles.views"));
        let f = classify(&user(), &Field::expression("total", expr)).unwrap();
        assert!(f.is_expression());
        assert!(!f.mode.allows(OperationMode::Update));

        let bad = Expression::col("articles.nope");
        assert!(classify(&user(), &Field::expression("bad", bad)).is_err());
    }

    #[test]
    fn test_function_rules() {
        let scalar = FieldFunc::per_pk(|_| Ok(crate::field::FuncOutput::Value(1.into())));
        let f = classify(&user(), &Field::function("n", scalar.clone())).unwrap();
        assert!(f.related_single());

        let err = classify(&user(), &Field::function("n", scalar).schema_self()).unwrap_err();
        assert!(matches!(err, OrmError::Classification(_)));

        let related = FieldFunc::constant(|| Ok(crate::field::FuncOutput::Pks(vec![])))
            .returns_related("user");
        let f = classify(&user(), &Field::function("top", related).schema_self()).unwrap();
        assert!(!f.related_single());
        assert_eq!(f.related_model().unwrap().ident(), "user");
    }

    #[test]
    fn test_queryset_link_detection() {
        let registry = fixtures::registry();
        let user = registry.model("user").unwrap();
        let article = registry.model("article").unwrap();

        let f = classify(&user, &Field::queryset("popular", article.objects())).unwrap();
        assert!(matches!(
            f.kind,
            FieldKind::Isolated(Isolation::Queryset { ref link, .. }) if link == "author"
        ));

        let f = classify(&user, &Field::queryset("followers", user.objects())).unwrap();
        assert!(matches!(
            f.kind,
            FieldKind::Isolated(Isolation::Queryset { ref link, .. }) if link == "followings"
        ));

        let err = classify(&user, &Field::queryset("others", user.objects())).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));

        let f = classify(
            &user,
            &Field::queryset("others", user.objects()).link("followers"),
        )
        .unwrap();
        assert!(matches!(
            f.kind,
            FieldKind::Isolated(Isolation::Queryset { ref link, .. }) if link == "followers"
        ));
    }
}
