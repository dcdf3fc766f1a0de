//! Settings for schema-orm.
//!
//! [`Settings`] holds the database aliases known to the embedding process, the
//! logging configuration, and [`QuerySettings`] defaults consumed by the query
//! layer (order prefix, pagination caps, isolated-field concurrency).
//! [`SETTINGS`] is an optional process-wide instance.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Database connection configuration for one alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// The backend engine name (e.g. `memory`, `postgresql`).
    pub engine: String,
    /// The database name (or file path for embedded engines).
    pub name: String,
    /// The database host.
    pub host: String,
    /// The database port.
    pub port: u16,
    /// Additional engine-specific options.
    pub options: HashMap<String, String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: "memory".to_string(),
            name: "default".to_string(),
            host: String::new(),
            port: 0,
            options: HashMap::new(),
        }
    }
}

/// Defaults applied by the query layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySettings {
    /// Prefix marking a descending order key (`-created_at`).
    pub order_prefix: String,
    /// Upper bound applied to every `limit` input, if set.
    pub max_limit: Option<usize>,
    /// Whether the async compiler resolves independent isolated fields concurrently.
    pub concurrent_isolation: bool,
    /// Default for `SaveOptions::ignore_bulk_errors`.
    pub ignore_bulk_errors: bool,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            order_prefix: "-".to_string(),
            max_limit: None,
            concurrent_isolation: true,
            ignore_bulk_errors: false,
        }
    }
}

/// The complete set of schema-orm settings.
///
/// # Examples
///
/// ```
/// use schema_orm_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert_eq!(settings.default_database, "default");
/// assert_eq!(settings.query.order_prefix, "-");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Whether debug mode is enabled (pretty logs instead of JSON).
    pub debug: bool,
    /// The log level filter (e.g. "info", "schema_orm_query=debug").
    pub log_level: String,
    /// Database configurations, keyed by alias.
    pub databases: HashMap<String, DatabaseSettings>,
    /// The alias used when a call does not name one.
    pub default_database: String,
    /// Query layer defaults.
    pub query: QuerySettings,
}

impl Default for Settings {
    fn default() -> Self {
        let mut databases = HashMap::new();
        databases.insert("default".to_string(), DatabaseSettings::default());

        Self {
            debug: true,
            log_level: "info".to_string(),
            databases,
            default_database: "default".to_string(),
            query: QuerySettings::default(),
        }
    }
}

/// A lazily-initialized, globally-accessible settings container.
///
/// Reading before configuring initializes it with [`Settings::default`].
pub struct LazySettings {
    inner: OnceLock<Settings>,
}

impl Default for LazySettings {
    fn default() -> Self {
        Self::new()
    }
}

impl LazySettings {
    /// Creates a new, unconfigured `LazySettings`.
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Configures the global settings.
    ///
    /// Returns the rejected settings if they were already configured.
    pub fn configure(&self, settings: Settings) -> Result<(), Settings> {
        self.inner.set(settings)
    }

    /// Returns the configured settings, or the defaults if none were configured.
    pub fn get(&self) -> &Settings {
        self.inner.get_or_init(Settings::default)
    }

    /// Returns `true` if settings have been configured or read.
    pub fn is_configured(&self) -> bool {
        self.inner.get().is_some()
    }
}

/// The global settings instance.
pub static SETTINGS: LazySettings = LazySettings::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let s = Settings::default();
        assert!(s.debug);
        assert_eq!(s.log_level, "info");
        assert_eq!(s.default_database, "default");
        assert_eq!(s.query.order_prefix, "-");
        assert!(s.query.max_limit.is_none());
        assert!(s.query.concurrent_isolation);
        assert!(!s.query.ignore_bulk_errors);
    }

    #[test]
    fn test_default_database() {
        let s = Settings::default();
        let db = s.databases.get("default").expect("default db should exist");
        assert_eq!(db.engine, "memory");
    }

    #[test]
    fn test_lazy_settings_configure_and_get() {
        let lazy = LazySettings::new();
        assert!(!lazy.is_configured());

        let mut settings = Settings::default();
        settings.debug = false;
        settings.query.max_limit = Some(50);

        assert!(lazy.configure(settings).is_ok());
        assert!(lazy.is_configured());
        assert!(!lazy.get().debug);
        assert_eq!(lazy.get().query.max_limit, Some(50));
    }

    #[test]
    fn test_lazy_settings_double_configure_is_rejected() {
        let lazy = LazySettings::new();
        assert!(lazy.configure(Settings::default()).is_ok());
        assert!(lazy.configure(Settings::default()).is_err());
    }

    #[test]
    fn test_lazy_settings_falls_back_to_defaults() {
        let lazy = LazySettings::new();
        assert_eq!(lazy.get().default_database, "default");
    }
}
