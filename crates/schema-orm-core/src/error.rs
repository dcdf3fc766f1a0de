//! Error types for schema-orm.
//!
//! [`OrmError`] is the single error enum used across the workspace. It covers
//! schema classification failures (raised once, when a schema is declared),
//! query errors raised per call, backend errors, and the wrapped errors produced
//! while resolving isolated fields or persisting relations.
//!
//! [`ErrorKind`] is a payload-free discriminant so that callers can express
//! allow-lists such as "ignore integrity errors while saving relations".

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Represents a validation error with optional field-level errors.
///
/// Validation errors can be either simple (a single message) or compound
/// (containing per-field error lists).
///
/// # Examples
///
/// ```
/// use schema_orm_core::error::ValidationError;
///
/// let err = ValidationError::new("This field is required.", "required");
///
/// let mut field_errors = std::collections::HashMap::new();
/// field_errors.insert(
///     "page".to_string(),
///     vec![ValidationError::new("Must be a positive integer.", "invalid")],
/// );
/// let err = ValidationError::with_field_errors(field_errors);
/// ```
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The primary error message.
    pub message: String,
    /// A short code identifying the type of validation failure (e.g. "required", "invalid").
    pub code: String,
    /// Additional parameters providing context for the error message.
    pub params: HashMap<String, String>,
    /// Per-field validation errors, keyed by field name.
    pub field_errors: HashMap<String, Vec<Self>>,
}

impl ValidationError {
    /// Creates a new `ValidationError` with a message and code.
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            params: HashMap::new(),
            field_errors: HashMap::new(),
        }
    }

    /// Creates a `ValidationError` containing per-field errors.
    pub fn with_field_errors(field_errors: HashMap<String, Vec<Self>>) -> Self {
        Self {
            message: String::new(),
            code: String::new(),
            params: HashMap::new(),
            field_errors,
        }
    }

    /// Creates a `ValidationError` for a single named field.
    pub fn for_field(
        field: impl Into<String>,
        message: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        let mut field_errors = HashMap::new();
        field_errors.insert(field.into(), vec![Self::new(message, code)]);
        Self::with_field_errors(field_errors)
    }

    /// Adds a parameter to this validation error.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.message.is_empty() {
            write!(f, "{}", self.message)?;
        } else if !self.field_errors.is_empty() {
            let mut first = true;
            for (field, errors) in &self.field_errors {
                for error in errors {
                    if !first {
                        write!(f, "; ")?;
                    }
                    write!(f, "{field}: {error}")?;
                    first = false;
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// The error type for every schema-orm operation.
#[derive(Error, Debug)]
pub enum OrmError {
    // ── Classification errors (schema declaration time) ──────────────

    /// A declared field references a column or relation path that does not exist.
    #[error("Field not found: {model}.{field}")]
    FieldNotFound {
        /// The model the lookup was performed on.
        model: String,
        /// The missing field name or path.
        field: String,
    },

    /// A schema field could not be classified (type conflicts, invalid bindings).
    #[error("Classification error: {0}")]
    Classification(String),

    // ── Query errors (call time) ─────────────────────────────────────

    /// An update was demanded for data that carries no primary key.
    #[error("Missing primary key: {0}")]
    MissingPrimaryKey(String),

    /// A must-update save affected zero rows and no fallback applied.
    #[error("Update failed: {0}")]
    UpdateFailed(String),

    /// A singular initialization found no matching rows.
    #[error("Empty queryset: {0}")]
    EmptyQueryset(String),

    /// Raised when a query expected exactly one result but found none.
    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    /// Raised when a query expected exactly one result but found multiple.
    #[error("Multiple objects returned when one expected: {0}")]
    MultipleObjectsReturned(String),

    // ── Backend errors ───────────────────────────────────────────────

    /// A generic database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A database integrity constraint was violated.
    #[error("Integrity error: {0}")]
    IntegrityError(String),

    /// An operational database error (connection failure, unknown alias, etc.).
    #[error("Operational error: {0}")]
    OperationalError(String),

    /// The backend cannot evaluate the requested query shape.
    #[error("Not supported: {0}")]
    NotSupported(String),

    // ── Wrapped causes ───────────────────────────────────────────────

    /// Resolving an isolated field failed.
    #[error("Failed to resolve field '{field}': {source}")]
    IsolatedField {
        /// The schema field being resolved.
        field: String,
        /// The underlying cause.
        #[source]
        source: Box<OrmError>,
    },

    /// Persisting a relation failed.
    #[error("Failed to save relation '{field}': {source}")]
    Relation {
        /// The relation field being saved.
        field: String,
        /// The underlying cause.
        #[source]
        source: Box<OrmError>,
    },

    // ── Input / configuration ────────────────────────────────────────

    /// One or more fields failed validation.
    #[error("Validation error: {0}")]
    ValidationError(ValidationError),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An error occurred during serialization or deserialization.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A caller-defined error, typically produced by an integrity error remapper.
    #[error("{0}")]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

/// A payload-free discriminant of [`OrmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FieldNotFound,
    Classification,
    MissingPrimaryKey,
    UpdateFailed,
    EmptyQueryset,
    DoesNotExist,
    MultipleObjectsReturned,
    Database,
    Integrity,
    Operational,
    NotSupported,
    IsolatedField,
    Relation,
    Validation,
    Configuration,
    Serialization,
    Io,
    Custom,
}

impl OrmError {
    /// Returns the discriminant of this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::FieldNotFound { .. } => ErrorKind::FieldNotFound,
            Self::Classification(_) => ErrorKind::Classification,
            Self::MissingPrimaryKey(_) => ErrorKind::MissingPrimaryKey,
            Self::UpdateFailed(_) => ErrorKind::UpdateFailed,
            Self::EmptyQueryset(_) => ErrorKind::EmptyQueryset,
            Self::DoesNotExist(_) => ErrorKind::DoesNotExist,
            Self::MultipleObjectsReturned(_) => ErrorKind::MultipleObjectsReturned,
            Self::DatabaseError(_) => ErrorKind::Database,
            Self::IntegrityError(_) => ErrorKind::Integrity,
            Self::OperationalError(_) => ErrorKind::Operational,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::IsolatedField { .. } => ErrorKind::IsolatedField,
            Self::Relation { .. } => ErrorKind::Relation,
            Self::ValidationError(_) => ErrorKind::Validation,
            Self::ConfigurationError(_) => ErrorKind::Configuration,
            Self::SerializationError(_) => ErrorKind::Serialization,
            Self::IoError(_) => ErrorKind::Io,
            Self::Custom(_) => ErrorKind::Custom,
        }
    }

    /// Returns the innermost error, looking through isolated-field and relation wrappers.
    pub fn root(&self) -> &Self {
        match self {
            Self::IsolatedField { source, .. } | Self::Relation { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns `true` if this error (or its root cause) is an integrity violation.
    pub fn is_integrity(&self) -> bool {
        self.root().kind() == ErrorKind::Integrity
    }

    /// Wraps this error as the cause of a failed isolated field.
    #[must_use]
    pub fn in_field(self, field: impl Into<String>) -> Self {
        Self::IsolatedField {
            field: field.into(),
            source: Box::new(self),
        }
    }

    /// Wraps this error as the cause of a failed relation write.
    #[must_use]
    pub fn in_relation(self, field: impl Into<String>) -> Self {
        Self::Relation {
            field: field.into(),
            source: Box::new(self),
        }
    }

    /// Returns the HTTP status code an API layer should use for this error.
    ///
    /// - `ValidationError`, `MissingPrimaryKey` -> 400
    /// - `DoesNotExist`, `EmptyQueryset` -> 404
    /// - `IntegrityError` -> 409
    /// - Everything else -> 500
    pub fn status_code(&self) -> u16 {
        match self.root() {
            Self::ValidationError(_) | Self::MissingPrimaryKey(_) => 400,
            Self::DoesNotExist(_) | Self::EmptyQueryset(_) => 404,
            Self::IntegrityError(_) => 409,
            _ => 500,
        }
    }
}

impl From<ValidationError> for OrmError {
    fn from(err: ValidationError) -> Self {
        Self::ValidationError(err)
    }
}

impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// A convenience type alias for `Result<T, OrmError>`.
pub type OrmResult<T> = Result<T, OrmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display_simple() {
        let err = ValidationError::new("This field is required.", "required");
        assert_eq!(err.to_string(), "This field is required.");
    }

    #[test]
    fn test_validation_error_for_field() {
        let err = ValidationError::for_field("page", "Must be positive.", "invalid");
        assert_eq!(err.to_string(), "page: Must be positive.");
    }

    #[test]
    fn test_validation_error_with_param() {
        let err = ValidationError::new("Too large.", "max_value").with_param("max", "100");
        assert_eq!(err.params.get("max").unwrap(), "100");
    }

    #[test]
    fn test_kind_and_root_look_through_wrappers() {
        let err = OrmError::IntegrityError("duplicate".into())
            .in_relation("articles")
            .in_field("author");
        assert_eq!(err.kind(), ErrorKind::IsolatedField);
        assert_eq!(err.root().kind(), ErrorKind::Integrity);
        assert!(err.is_integrity());
    }

    #[test]
    fn test_wrapped_error_display() {
        let err = OrmError::DatabaseError("boom".into()).in_field("followers");
        assert_eq!(
            err.to_string(),
            "Failed to resolve field 'followers': Database error: boom"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(OrmError::EmptyQueryset("x".into()).status_code(), 404);
        assert_eq!(OrmError::MissingPrimaryKey("x".into()).status_code(), 400);
        assert_eq!(OrmError::IntegrityError("x".into()).status_code(), 409);
        assert_eq!(OrmError::UpdateFailed("x".into()).status_code(), 500);
        assert_eq!(
            OrmError::ValidationError(ValidationError::new("x", "y")).status_code(),
            400
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: OrmError = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("file missing"));
    }
}
