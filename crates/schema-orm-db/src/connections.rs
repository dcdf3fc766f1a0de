//! The database connection registry.
//!
//! [`ConnectionRegistry`] maps database aliases (as named in
//! [`Settings::databases`](schema_orm_core::Settings)) to [`Connection`]s.
//! A connection carries both the blocking and the suspension-based executor
//! of one backend, so callers pick a mode per call without re-resolving
//! the alias.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use schema_orm_db::connections::ConnectionRegistry;
//! # use schema_orm_db::executor::{AsyncExecutor, Executor};
//! # use schema_orm_db::model::Model;
//! # use schema_orm_db::query::queryset::{QuerySet, SelectColumn};
//! # use schema_orm_db::value::{Record, Value};
//! # use schema_orm_core::{OrmError, OrmResult};
//! # struct Nop;
//! # impl Executor for Nop {
//! #     fn fetch(&self, _: &QuerySet, _: &[SelectColumn]) -> OrmResult<Vec<Record>> { Ok(vec![]) }
//! #     fn count(&self, _: &QuerySet) -> OrmResult<usize> { Ok(0) }
//! #     fn insert(&self, _: &Model, _: &Record) -> OrmResult<Value> { Ok(Value::Null) }
//! #     fn insert_child(&self, _: &Model, _: &Record) -> OrmResult<()> { Ok(()) }
//! #     fn update(&self, _: &QuerySet, _: &Record) -> OrmResult<usize> { Ok(0) }
//! #     fn delete(&self, _: &QuerySet) -> OrmResult<usize> { Ok(0) }
//! #     fn begin(&self) -> OrmResult<()> { Ok(()) }
//! #     fn commit(&self) -> OrmResult<()> { Ok(()) }
//! #     fn rollback(&self) -> OrmResult<()> { Ok(()) }
//! # }
//! # #[async_trait::async_trait]
//! # impl AsyncExecutor for Nop {
//! #     async fn fetch(&self, _: &QuerySet, _: &[SelectColumn]) -> OrmResult<Vec<Record>> { Ok(vec![]) }
//! #     async fn count(&self, _: &QuerySet) -> OrmResult<usize> { Ok(0) }
//! #     async fn insert(&self, _: &Model, _: &Record) -> OrmResult<Value> { Ok(Value::Null) }
//! #     async fn insert_child(&self, _: &Model, _: &Record) -> OrmResult<()> { Ok(()) }
//! #     async fn update(&self, _: &QuerySet, _: &Record) -> OrmResult<usize> { Ok(0) }
//! #     async fn delete(&self, _: &QuerySet) -> OrmResult<usize> { Ok(0) }
//! #     async fn begin(&self) -> OrmResult<()> { Ok(()) }
//! #     async fn commit(&self) -> OrmResult<()> { Ok(()) }
//! #     async fn rollback(&self) -> OrmResult<()> { Ok(()) }
//! # }
//!
//! let connections = ConnectionRegistry::new();
//! connections.register("default", Arc::new(Nop));
//! assert!(connections.get(None).is_ok());
//! assert!(connections.get(Some("replica")).is_err());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use schema_orm_core::settings::DatabaseSettings;
use schema_orm_core::{OrmError, OrmResult, Settings};

use crate::executor::{AsyncExecutor, Executor};

/// One backend reachable under an alias, in both execution modes.
#[derive(Clone)]
pub struct Connection {
    alias: String,
    blocking: Arc<dyn Executor>,
    suspending: Arc<dyn AsyncExecutor>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("alias", &self.alias).finish()
    }
}

impl Connection {
    /// Wraps a backend implementing both executor traits.
    pub fn new<B>(alias: impl Into<String>, backend: Arc<B>) -> Self
    where
        B: Executor + AsyncExecutor + 'static,
    {
        let suspending: Arc<dyn AsyncExecutor> = backend.clone();
        Self {
            alias: alias.into(),
            blocking: backend,
            suspending,
        }
    }

    /// The alias this connection was registered under.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The blocking executor.
    pub fn executor(&self) -> &dyn Executor {
        self.blocking.as_ref()
    }

    /// The suspension-based executor.
    pub fn async_executor(&self) -> &dyn AsyncExecutor {
        self.suspending.as_ref()
    }

    /// A shared handle to the suspension-based executor, for guards that
    /// must outlive the borrow of this connection.
    pub fn async_handle(&self) -> Arc<dyn AsyncExecutor> {
        Arc::clone(&self.suspending)
    }
}

/// Maps aliases to connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
    default_alias: String,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("aliases", &self.aliases())
            .field("default_alias", &self.default_alias)
            .finish()
    }
}

impl ConnectionRegistry {
    /// Creates an empty registry whose default alias is `"default"`.
    pub fn new() -> Self {
        Self::with_default_alias("default")
    }

    /// Creates an empty registry with a custom default alias.
    pub fn with_default_alias(alias: impl Into<String>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            default_alias: alias.into(),
        }
    }

    /// Builds a registry from settings, opening every configured database
    /// through `connect`.
    ///
    /// Fails if the settings' default alias has no database entry.
    pub fn from_settings<F>(settings: &Settings, mut connect: F) -> OrmResult<Self>
    where
        F: FnMut(&str, &DatabaseSettings) -> OrmResult<Connection>,
    {
        if !settings.databases.contains_key(&settings.default_database) {
            return Err(OrmError::ConfigurationError(format!(
                "Default database '{}' is not configured",
                settings.default_database
            )));
        }
        let registry = Self::with_default_alias(settings.default_database.clone());
        for (alias, db) in &settings.databases {
            let connection = connect(alias, db)?;
            registry.insert(alias.clone(), connection);
        }
        Ok(registry)
    }

    /// Registers a backend under `alias`, replacing any previous one.
    pub fn register<B>(&self, alias: impl Into<String>, backend: Arc<B>)
    where
        B: Executor + AsyncExecutor + 'static,
    {
        let alias = alias.into();
        let connection = Connection::new(alias.clone(), backend);
        self.insert(alias, connection);
    }

    fn insert(&self, alias: String, connection: Connection) {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(alias, connection);
    }

    /// Returns the connection for `alias`, or the default one for `None`.
    pub fn get(&self, alias: Option<&str>) -> OrmResult<Connection> {
        let alias = alias.unwrap_or(&self.default_alias);
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(alias)
            .cloned()
            .ok_or_else(|| OrmError::OperationalError(format!("Unknown database alias '{alias}'")))
    }

    /// The alias used when none is given.
    pub fn default_alias(&self) -> &str {
        &self.default_alias
    }

    /// Every registered alias, sorted.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        aliases.sort();
        aliases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use crate::query::queryset::{QuerySet, SelectColumn};
    use crate::value::{Record, Value};

    struct CountingDb(usize);

    impl Executor for CountingDb {
        fn fetch(&self, _: &QuerySet, _: &[SelectColumn]) -> OrmResult<Vec<Record>> {
            Ok(Vec::new())
        }
        fn count(&self, _: &QuerySet) -> OrmResult<usize> {
            Ok(self.0)
        }
        fn insert(&self, _: &Model, _: &Record) -> OrmResult<Value> {
            Ok(Value::Null)
        }
        fn insert_child(&self, _: &Model, _: &Record) -> OrmResult<()> {
            Ok(())
        }
        fn update(&self, _: &QuerySet, _: &Record) -> OrmResult<usize> {
            Ok(0)
        }
        fn delete(&self, _: &QuerySet) -> OrmResult<usize> {
            Ok(0)
        }
        fn begin(&self) -> OrmResult<()> {
            Ok(())
        }
        fn commit(&self) -> OrmResult<()> {
            Ok(())
        }
        fn rollback(&self) -> OrmResult<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl AsyncExecutor for CountingDb {
        async fn fetch(&self, _: &QuerySet, _: &[SelectColumn]) -> OrmResult<Vec<Record>> {
            Ok(Vec::new())
        }
        async fn count(&self, _: &QuerySet) -> OrmResult<usize> {
            Ok(self.0)
        }
        async fn insert(&self, _: &Model, _: &Record) -> OrmResult<Value> {
            Ok(Value::Null)
        }
        async fn insert_child(&self, _: &Model, _: &Record) -> OrmResult<()> {
            Ok(())
        }
        async fn update(&self, _: &QuerySet, _: &Record) -> OrmResult<usize> {
            Ok(0)
        }
        async fn delete(&self, _: &QuerySet) -> OrmResult<usize> {
            Ok(0)
        }
        async fn begin(&self) -> OrmResult<()> {
            Ok(())
        }
        async fn commit(&self) -> OrmResult<()> {
            Ok(())
        }
        async fn rollback(&self) -> OrmResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_connection_shares_one_backend() {
        let backend = Arc::new(CountingDb(7));
        let connection = Connection::new("default", Arc::clone(&backend));
        assert_eq!(connection.alias(), "default");
        assert_eq!(Arc::strong_count(&backend), 3);

        let handle = connection.async_handle();
        drop(connection);
        assert_eq!(Arc::strong_count(&backend), 2);
        drop(handle);
        assert_eq!(Arc::strong_count(&backend), 1);
    }

    #[test]
    fn test_registry_resolves_default_and_named_aliases() {
        let connections = ConnectionRegistry::with_default_alias("primary");
        connections.register("primary", Arc::new(CountingDb(1)));
        connections.register("replica", Arc::new(CountingDb(2)));

        assert_eq!(connections.aliases(), ["primary", "replica"]);
        assert_eq!(connections.get(None).unwrap().alias(), "primary");
        assert_eq!(connections.get(Some("replica")).unwrap().alias(), "replica");
        assert!(connections.get(Some("missing")).is_err());
    }

    #[test]
    fn test_from_settings_requires_default_alias() {
        let mut settings = Settings::default();
        settings.default_database = "main".to_string();
        let err = ConnectionRegistry::from_settings(&settings, |alias, _| {
            Ok(Connection::new(alias, Arc::new(CountingDb(0))))
        })
        .unwrap_err();
        assert!(matches!(err, OrmError::ConfigurationError(_)));
    }
}
