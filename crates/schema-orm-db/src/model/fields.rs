//! Model field definitions.
//!
//! Each [`FieldType`] variant is a column kind or a relation. Forward
//! relations (`ForeignKey`, `OneToOneField`, `ManyToManyField`) are declared
//! on models; the matching reverse variants are derived by the
//! [`Registry`](super::Registry) when it is built.

use crate::value::Value;

/// The type of a model field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Auto-incrementing integer primary key.
    AutoField,
    /// 64-bit signed integer.
    IntegerField,
    /// 64-bit floating-point number.
    FloatField,
    /// Boolean.
    BooleanField,
    /// Bounded string.
    CharField,
    /// Unbounded text.
    TextField,
    /// Date without time.
    DateField,
    /// Date and time (UTC).
    DateTimeField,
    /// UUID.
    UuidField,
    /// JSON document.
    JsonField,
    /// Many-to-one relationship; the column stores the target's primary key.
    ForeignKey {
        /// The target model name.
        to: String,
        /// The name of the reverse relation on the target.
        related_name: Option<String>,
    },
    /// One-to-one relationship (unique foreign key).
    OneToOneField {
        /// The target model name.
        to: String,
        /// The name of the reverse relation on the target.
        related_name: Option<String>,
    },
    /// Many-to-many relationship through an explicit intermediate model.
    ManyToManyField {
        /// The target model name.
        to: String,
        /// The intermediate model holding one row per link.
        through: String,
        /// Foreign key on `through` pointing at the declaring model.
        source_field: String,
        /// Foreign key on `through` pointing at the target model.
        target_field: String,
        /// The name of the reverse relation on the target.
        related_name: Option<String>,
    },
    /// Reverse side of a `ForeignKey` declared on `model` as `field`.
    ReverseForeignKey {
        /// The model declaring the foreign key.
        model: String,
        /// The foreign key field name on `model`.
        field: String,
    },
    /// Reverse side of a `OneToOneField` declared on `model` as `field`.
    ReverseOneToOne {
        /// The model declaring the one-to-one field.
        model: String,
        /// The field name on `model`.
        field: String,
    },
    /// Reverse side of a `ManyToManyField` declared on `model` as `field`.
    ReverseManyToMany {
        /// The model declaring the many-to-many field.
        model: String,
        /// The field name on `model`.
        field: String,
    },
}

impl FieldType {
    /// Returns `true` for relation variants (forward or reverse).
    pub const fn is_relation(&self) -> bool {
        matches!(
            self,
            Self::ForeignKey { .. }
                | Self::OneToOneField { .. }
                | Self::ManyToManyField { .. }
                | Self::ReverseForeignKey { .. }
                | Self::ReverseOneToOne { .. }
                | Self::ReverseManyToMany { .. }
        )
    }

    /// Returns `true` if values of this field are stored in the model's own row.
    pub const fn is_concrete(&self) -> bool {
        !matches!(
            self,
            Self::ManyToManyField { .. }
                | Self::ReverseForeignKey { .. }
                | Self::ReverseOneToOne { .. }
                | Self::ReverseManyToMany { .. }
        )
    }

    /// Returns `true` if one owning row relates to many target rows.
    pub const fn is_many(&self) -> bool {
        matches!(
            self,
            Self::ManyToManyField { .. }
                | Self::ReverseForeignKey { .. }
                | Self::ReverseManyToMany { .. }
        )
    }

    /// Returns the model on the other side of a relation.
    pub fn related_model(&self) -> Option<&str> {
        match self {
            Self::ForeignKey { to, .. }
            | Self::OneToOneField { to, .. }
            | Self::ManyToManyField { to, .. } => Some(to),
            Self::ReverseForeignKey { model, .. }
            | Self::ReverseOneToOne { model, .. }
            | Self::ReverseManyToMany { model, .. } => Some(model),
            _ => None,
        }
    }

    /// Returns `true` for types whose values are generated by the backend.
    pub const fn is_auto(&self) -> bool {
        matches!(self, Self::AutoField)
    }
}

/// Complete definition of a model field.
///
/// # Examples
///
/// ```
/// use schema_orm_db::model::{FieldDef, FieldType};
///
/// let username = FieldDef::new("username", FieldType::CharField).unique();
/// assert!(username.unique);
/// assert!(!username.null);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// The field name; also the storage key for concrete fields.
    pub name: String,
    /// The type of this field.
    pub field_type: FieldType,
    /// Whether this field is the primary key.
    pub primary_key: bool,
    /// Whether NULL is allowed.
    pub null: bool,
    /// Whether a UNIQUE constraint is applied.
    pub unique: bool,
    /// Default value for new rows.
    pub default: Option<Value>,
    /// Re-stamped with the current time on every save.
    pub auto_now: bool,
    /// Stamped with the current time when the row is created.
    pub auto_now_add: bool,
}

impl FieldDef {
    /// Creates a new `FieldDef` with non-null, non-unique defaults.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            primary_key: false,
            null: false,
            unique: false,
            default: None,
            auto_now: false,
            auto_now_add: false,
        }
    }

    /// Shorthand for an auto-incrementing `id` primary key.
    pub fn auto_pk(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::AutoField).primary_key()
    }

    /// Shorthand for a foreign key to `to`.
    pub fn foreign_key(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::ForeignKey {
                to: to.into(),
                related_name: None,
            },
        )
    }

    /// Shorthand for a one-to-one relation to `to`.
    pub fn one_to_one(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::OneToOneField {
                to: to.into(),
                related_name: None,
            },
        )
        .unique()
    }

    /// Shorthand for a many-to-many relation through an intermediate model.
    pub fn many_to_many(
        name: impl Into<String>,
        to: impl Into<String>,
        through: impl Into<String>,
        source_field: impl Into<String>,
        target_field: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            FieldType::ManyToManyField {
                to: to.into(),
                through: through.into(),
                source_field: source_field.into(),
                target_field: target_field.into(),
                related_name: None,
            },
        )
    }

    /// Marks this field as the primary key (implies unique).
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.unique = true;
        self
    }

    /// Allows NULL values.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    /// Marks this field as having a UNIQUE constraint.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets the default value for this field.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Re-stamps this field with the current time on every save.
    #[must_use]
    pub const fn auto_now(mut self) -> Self {
        self.auto_now = true;
        self
    }

    /// Stamps this field with the current time on creation.
    #[must_use]
    pub const fn auto_now_add(mut self) -> Self {
        self.auto_now_add = true;
        self
    }

    /// Sets the reverse relation name of a forward relation.
    #[must_use]
    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        match &mut self.field_type {
            FieldType::ForeignKey { related_name, .. }
            | FieldType::OneToOneField { related_name, .. }
            | FieldType::ManyToManyField { related_name, .. } => {
                *related_name = Some(name.into());
            }
            _ => {}
        }
        self
    }

    /// Returns `true` if this field represents a relation.
    pub const fn is_relation(&self) -> bool {
        self.field_type.is_relation()
    }

    /// Returns `true` if the field's value lives in the model's own row.
    pub const fn is_concrete(&self) -> bool {
        self.field_type.is_concrete()
    }

    /// Returns `true` if the backend generates this field's value.
    pub const fn is_auto_generated(&self) -> bool {
        self.field_type.is_auto() || self.auto_now || self.auto_now_add
    }

    /// Returns the name this relation goes by when traversed backwards.
    ///
    /// For forward relations this is the (registry-resolved) related name; for
    /// reverse relations it is the forward field name.
    pub fn reverse_name(&self) -> Option<&str> {
        match &self.field_type {
            FieldType::ForeignKey { related_name, .. }
            | FieldType::OneToOneField { related_name, .. }
            | FieldType::ManyToManyField { related_name, .. } => related_name.as_deref(),
            FieldType::ReverseForeignKey { field, .. }
            | FieldType::ReverseOneToOne { field, .. }
            | FieldType::ReverseManyToMany { field, .. } => Some(field),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_def_builder() {
        let f = FieldDef::new("score", FieldType::FloatField)
            .nullable()
            .default(0.0);
        assert!(f.null);
        assert_eq!(f.default, Some(Value::Float(0.0)));
        assert!(!f.is_relation());
    }

    #[test]
    fn test_primary_key_implies_unique() {
        let pk = FieldDef::auto_pk("id");
        assert!(pk.primary_key);
        assert!(pk.unique);
        assert!(pk.is_auto_generated());
    }

    #[test]
    fn test_relation_classification() {
        let fk = FieldDef::foreign_key("author", "user").related_name("articles");
        assert!(fk.is_relation());
        assert!(fk.is_concrete());
        assert!(!fk.field_type.is_many());
        assert_eq!(fk.reverse_name(), Some("articles"));
        assert_eq!(fk.field_type.related_model(), Some("user"));

        let m2m = FieldDef::many_to_many("tags", "tag", "article_tag", "article", "tag");
        assert!(!m2m.is_concrete());
        assert!(m2m.field_type.is_many());

        let rev = FieldDef::new(
            "articles",
            FieldType::ReverseForeignKey {
                model: "article".into(),
                field: "author".into(),
            },
        );
        assert_eq!(rev.reverse_name(), Some("author"));
        assert!(rev.field_type.is_many());
    }

    #[test]
    fn test_auto_now_flags() {
        let f = FieldDef::new("updated_at", FieldType::DateTimeField).auto_now();
        assert!(f.auto_now);
        assert!(f.is_auto_generated());
    }
}
