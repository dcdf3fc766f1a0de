//! Per-call query context and the shared recursion guard.
//!
//! A [`QueryContext`] is created for every top-level call and threaded
//! through nested compiler invocations with [`QueryContext::derive`]. It
//! carries the database alias, the field scope, the error policy and a
//! [`RecursionGuard`]. The guard is the only state shared between the nested
//! calls of one call tree: cloning a context clones a handle to the same map,
//! so a self-referential schema converges instead of recursing forever.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;
use schema_orm_core::settings::SETTINGS;
use schema_orm_core::{OrmError, Settings};
use schema_orm_db::query::Expression;
use schema_orm_db::value::{Record, Value};

use crate::schema::SchemaId;

/// A tree of field names built from dotted paths.
///
/// `["followers.username", "id"]` becomes `{followers: {username: {}}, id: {}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope(IndexMap<String, Scope>);

impl Scope {
    /// Builds a scope from dotted paths.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut root = Self::default();
        for path in paths {
            let mut node = &mut root;
            for part in path.as_ref().split('.').filter(|p| !p.is_empty()) {
                node = node.0.entry(part.to_string()).or_default();
            }
        }
        root
    }

    /// Returns `true` if no path was given.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if `name` is a node of this level.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// The sub-scope under `name`.
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.0.get(name)
    }

    /// Returns `true` if `name` is named here with nothing below it.
    pub fn is_leaf(&self, name: &str) -> bool {
        self.0.get(name).is_some_and(Self::is_empty)
    }

    /// The names of this level.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Writes a canonical form of the tree, independent of path order.
    fn write_canonical(&self, out: &mut String) {
        let mut names: Vec<(&String, &Self)> = self.0.iter().collect();
        names.sort_by(|a, b| a.0.cmp(b.0));
        for (i, (name, child)) in names.into_iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(name);
            if !child.is_empty() {
                out.push('(');
                child.write_canonical(out);
                out.push(')');
            }
        }
    }
}

/// Identifies one family of interchangeable rows in a [`RecursionGuard`].
///
/// Rows of the same schema fetched under different field scopes carry
/// different keys, so a nested field never receives a row shaped for
/// another scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuardKey {
    schema: SchemaId,
    scope: String,
}

impl GuardKey {
    /// The key for rows of `schema` fetched without any scope.
    pub const fn unscoped(schema: SchemaId) -> Self {
        Self {
            schema,
            scope: String::new(),
        }
    }

    /// The schema the rows belong to.
    pub const fn schema(&self) -> SchemaId {
        self.schema
    }
}

/// Rows already resolved (or being resolved) in one call tree.
///
/// Entries are keyed by [`GuardKey`] and then by primary key. A row is
/// registered as a snapshot as soon as its direct fetch completes, and
/// overwritten with the finished row once its isolated fields are resolved.
/// A nested resolution that meets a key registered higher up in the tree
/// takes the recorded row instead of serializing it again.
#[derive(Clone, Default)]
pub struct RecursionGuard(Arc<Mutex<HashMap<GuardKey, IndexMap<Value, Record>>>>);

impl fmt::Debug for RecursionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.lock();
        f.debug_map()
            .entries(map.iter().map(|(key, rows)| (key, rows.len())))
            .finish()
    }
}

impl RecursionGuard {
    /// Creates an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<GuardKey, IndexMap<Value, Record>>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records finished rows, replacing any snapshot.
    pub fn register<I>(&self, key: &GuardKey, rows: I)
    where
        I: IntoIterator<Item = (Value, Record)>,
    {
        let mut map = self.lock();
        let entry = map.entry(key.clone()).or_default();
        for (pk, row) in rows {
            entry.insert(pk, row);
        }
    }

    /// Records snapshots for keys not seen yet.
    pub fn register_missing<I>(&self, key: &GuardKey, rows: I)
    where
        I: IntoIterator<Item = (Value, Record)>,
    {
        let mut map = self.lock();
        let entry = map.entry(key.clone()).or_default();
        for (pk, row) in rows {
            entry.entry(pk).or_insert(row);
        }
    }

    /// The recorded row for `pk`.
    pub fn get(&self, key: &GuardKey, pk: &Value) -> Option<Record> {
        self.lock().get(key).and_then(|rows| rows.get(pk)).cloned()
    }

    /// Returns `true` if `pk` was recorded under `key`.
    pub fn contains(&self, key: &GuardKey, pk: &Value) -> bool {
        self.lock().get(key).is_some_and(|rows| rows.contains_key(pk))
    }

    /// The keys of `pks` not recorded under `key`, in their given order.
    pub fn unresolved(&self, key: &GuardKey, pks: &[Value]) -> Vec<Value> {
        let map = self.lock();
        let known = map.get(key);
        let missing: Vec<Value> = pks
            .iter()
            .filter(|pk| !known.is_some_and(|rows| rows.contains_key(*pk)))
            .cloned()
            .collect();
        if missing.len() < pks.len() {
            tracing::debug!(
                schema = %key.schema,
                scope = %key.scope,
                hits = pks.len() - missing.len(),
                "recursion map hit"
            );
        }
        missing
    }

    /// The number of rows recorded under `key`.
    pub fn len(&self, key: &GuardKey) -> usize {
        self.lock().get(key).map_or(0, IndexMap::len)
    }
}

type ErrorMapper = dyn Fn(OrmError) -> OrmError + Send + Sync;

/// The configuration bundle of one call tree.
///
/// # Examples
///
/// ```
/// use schema_orm_query::QueryContext;
///
/// let ctx = QueryContext::new()
///     .using("replica")
///     .exclude(["email", "followers.email"])
///     .single(true);
/// assert_eq!(ctx.database(), Some("replica"));
/// assert!(!ctx.in_scope("email", false));
/// assert!(ctx.in_scope("followers", false));
/// ```
#[derive(Clone)]
pub struct QueryContext {
    using: Option<String>,
    includes: Option<Scope>,
    excludes: Option<Scope>,
    single: bool,
    force_expressions: IndexMap<String, Expression>,
    force_raise_error: bool,
    concurrent: bool,
    integrity_error: Option<Arc<ErrorMapper>>,
    recursion: RecursionGuard,
}

impl fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("using", &self.using)
            .field("includes", &self.includes)
            .field("excludes", &self.excludes)
            .field("single", &self.single)
            .field("force_expressions", &self.force_expressions.keys())
            .field("force_raise_error", &self.force_raise_error)
            .field("concurrent", &self.concurrent)
            .field("integrity_error", &self.integrity_error.is_some())
            .field("recursion", &self.recursion)
            .finish()
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryContext {
    /// A context seeded from the global settings.
    pub fn new() -> Self {
        Self::from_settings(SETTINGS.get())
    }

    /// A context seeded from `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            using: None,
            includes: None,
            excludes: None,
            single: false,
            force_expressions: IndexMap::new(),
            force_raise_error: false,
            concurrent: settings.query.concurrent_isolation,
            integrity_error: None,
            recursion: RecursionGuard::new(),
        }
    }

    /// Runs every query of the call tree on `alias`.
    #[must_use]
    pub fn using(mut self, alias: impl Into<String>) -> Self {
        self.using = Some(alias.into());
        self
    }

    /// Restricts the fetched fields to these dotted paths.
    #[must_use]
    pub fn include<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.includes = Some(Scope::from_paths(paths));
        self
    }

    /// Leaves these dotted paths out of the fetch.
    #[must_use]
    pub fn exclude<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.excludes = Some(Scope::from_paths(paths));
        self
    }

    /// Expects at most one row.
    #[must_use]
    pub const fn single(mut self, single: bool) -> Self {
        self.single = single;
        self
    }

    /// Selects an extra expression in the direct fetch of the top-level schema.
    #[must_use]
    pub fn force_expression(mut self, name: impl Into<String>, expr: Expression) -> Self {
        self.force_expressions.insert(name.into(), expr);
        self
    }

    /// Propagates every isolated-field failure, ignoring `fail_silently`.
    #[must_use]
    pub const fn force_raise_error(mut self, force: bool) -> Self {
        self.force_raise_error = force;
        self
    }

    /// Resolves independent isolated fields concurrently in async calls.
    #[must_use]
    pub const fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Remaps integrity errors raised by writes.
    #[must_use]
    pub fn integrity_error<F>(mut self, f: F) -> Self
    where
        F: Fn(OrmError) -> OrmError + Send + Sync + 'static,
    {
        self.integrity_error = Some(Arc::new(f));
        self
    }

    /// The database alias, if one was set.
    pub fn database(&self) -> Option<&str> {
        self.using.as_deref()
    }

    /// Whether at most one row is expected.
    pub const fn is_single(&self) -> bool {
        self.single
    }

    /// Extra expressions for the direct fetch.
    pub const fn force_expressions(&self) -> &IndexMap<String, Expression> {
        &self.force_expressions
    }

    /// Whether isolated-field silencing is overridden.
    pub const fn raises_errors(&self) -> bool {
        self.force_raise_error
    }

    /// Whether async isolated fields run concurrently.
    pub const fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    /// The guard shared by the call tree.
    pub const fn recursion(&self) -> &RecursionGuard {
        &self.recursion
    }

    /// The recursion-guard key for rows of `schema` fetched under this context.
    ///
    /// Two contexts yield the same key exactly when they select the same
    /// fields, so rows are only shared between fetches of the same shape.
    pub fn guard_key(&self, schema: SchemaId) -> GuardKey {
        let mut scope = String::new();
        if let Some(includes) = self.includes.as_ref().filter(|s| !s.is_empty()) {
            scope.push_str("+(");
            includes.write_canonical(&mut scope);
            scope.push(')');
        } else if let Some(excludes) = self.excludes.as_ref().filter(|s| !s.is_empty()) {
            scope.push_str("-(");
            excludes.write_canonical(&mut scope);
            scope.push(')');
        }
        if !self.force_expressions.is_empty() {
            let mut forced: Vec<&str> = self.force_expressions.keys().map(String::as_str).collect();
            forced.sort_unstable();
            scope.push_str("*(");
            scope.push_str(&forced.join(","));
            scope.push(')');
        }
        GuardKey { schema, scope }
    }

    /// The context for a nested schema under `field`.
    ///
    /// Scopes narrow to the field's children, `single` and forced
    /// expressions reset, and the recursion guard is shared.
    #[must_use]
    pub fn derive(&self, field: &str) -> Self {
        Self {
            using: self.using.clone(),
            includes: self
                .includes
                .as_ref()
                .and_then(|s| s.child(field))
                .filter(|s| !s.is_empty())
                .cloned(),
            excludes: self
                .excludes
                .as_ref()
                .and_then(|s| s.child(field))
                .filter(|s| !s.is_empty())
                .cloned(),
            single: false,
            force_expressions: IndexMap::new(),
            force_raise_error: self.force_raise_error,
            concurrent: self.concurrent,
            integrity_error: self.integrity_error.clone(),
            recursion: self.recursion.clone(),
        }
    }

    /// Returns `true` if the field takes part in this call.
    ///
    /// Includes win over excludes, an exclude only removes a field named
    /// without sub-paths, and the primary key is always in scope.
    pub fn in_scope(&self, name: &str, is_primary_key: bool) -> bool {
        if is_primary_key {
            return true;
        }
        if let Some(includes) = self.includes.as_ref().filter(|s| !s.is_empty()) {
            return includes.contains(name);
        }
        !self.excludes.as_ref().is_some_and(|s| s.is_leaf(name))
    }

    /// Applies the integrity-error policy.
    pub fn map_error(&self, err: OrmError) -> OrmError {
        match &self.integrity_error {
            Some(remap) if err.is_integrity() => remap(err),
            _ => err,
        }
    }
}
