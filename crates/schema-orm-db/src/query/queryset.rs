//! The lazy [`QuerySet`] handle.
//!
//! A `QuerySet` describes rows of one model: a filter condition, named
//! annotations, ordering, a slice window, and an optional database alias.
//! Building one never touches the database; an [`Executor`] or
//! [`AsyncExecutor`] evaluates it when a terminal method is called.
//!
//! # Examples
//!
//! ```
//! use schema_orm_db::model::{FieldDef, FieldType, ModelDef, Registry};
//! use schema_orm_db::query::lookups::{Lookup, Q};
//! use schema_orm_db::query::queryset::OrderBy;
//! use schema_orm_db::value::Value;
//!
//! let registry = Registry::builder()
//!     .model(
//!         ModelDef::new("user")
//!             .field(FieldDef::auto_pk("id"))
//!             .field(FieldDef::new("username", FieldType::CharField)),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let qs = registry
//!     .model("user")
//!     .unwrap()
//!     .objects()
//!     .filter(Q::filter("username", Lookup::StartsWith("a".into())))
//!     .order_by(vec![OrderBy::parse("-username", "-")])
//!     .slice(10, Some(20));
//! assert!(qs.is_sliced());
//! assert_eq!(qs.bounds(), (10, Some(10)));
//! ```

use indexmap::IndexMap;
use schema_orm_core::OrmResult;

use super::expressions::Expression;
use super::lookups::{Lookup, Q};
use crate::executor::{AsyncExecutor, Executor};
use crate::model::Model;
use crate::value::{Record, Value};

/// Where NULLs sort relative to other values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullsOrder {
    /// Backend default: NULLs sort as the smallest value.
    #[default]
    Default,
    /// NULLs before every other value.
    First,
    /// NULLs after every other value.
    Last,
}

/// One ORDER BY term.
#[derive(Debug, Clone)]
pub struct OrderBy {
    /// The ordering target.
    pub expr: Expression,
    /// Whether to sort descending.
    pub descending: bool,
    /// NULL placement.
    pub nulls: NullsOrder,
}

impl OrderBy {
    /// Ascending order on an expression.
    pub const fn asc(expr: Expression) -> Self {
        Self {
            expr,
            descending: false,
            nulls: NullsOrder::Default,
        }
    }

    /// Descending order on an expression.
    pub const fn desc(expr: Expression) -> Self {
        Self {
            expr,
            descending: true,
            nulls: NullsOrder::Default,
        }
    }

    /// Parses a column key where a leading `prefix` marks descending order.
    pub fn parse(key: &str, prefix: &str) -> Self {
        match key.strip_prefix(prefix).filter(|_| !prefix.is_empty()) {
            Some(rest) => Self::desc(Expression::col(rest)),
            None => Self::asc(Expression::col(key)),
        }
    }

    /// Places NULLs first.
    #[must_use]
    pub const fn nulls_first(mut self) -> Self {
        self.nulls = NullsOrder::First;
        self
    }

    /// Places NULLs last.
    #[must_use]
    pub const fn nulls_last(mut self) -> Self {
        self.nulls = NullsOrder::Last;
        self
    }
}

/// A named expression in a fetch.
#[derive(Debug, Clone)]
pub struct SelectColumn {
    /// The key the value is returned under.
    pub alias: String,
    /// The expression producing the value.
    pub expr: Expression,
}

impl SelectColumn {
    /// Selects a column (or single-valued relation path) under its own name.
    pub fn column(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            expr: Expression::Col(name.clone()),
            alias: name,
        }
    }

    /// Selects an arbitrary expression under `alias`.
    pub fn expr(alias: impl Into<String>, expr: Expression) -> Self {
        Self {
            alias: alias.into(),
            expr,
        }
    }
}

/// A lazy, composable description of model rows.
///
/// All builder methods consume `self` and return a modified queryset.
#[derive(Debug, Clone)]
pub struct QuerySet {
    model: Model,
    condition: Option<Q>,
    annotations: IndexMap<String, Expression>,
    ordering: Vec<OrderBy>,
    offset: usize,
    limit: Option<usize>,
    none: bool,
    using: Option<String>,
}

impl QuerySet {
    /// Creates a queryset over every row of `model`.
    pub fn new(model: Model) -> Self {
        Self {
            model,
            condition: None,
            annotations: IndexMap::new(),
            ordering: Vec::new(),
            offset: 0,
            limit: None,
            none: false,
            using: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    /// The model this queryset reads.
    pub const fn model(&self) -> &Model {
        &self.model
    }

    /// The combined filter condition, if any.
    pub const fn condition(&self) -> Option<&Q> {
        self.condition.as_ref()
    }

    /// Named annotations, in registration order.
    pub const fn annotations(&self) -> &IndexMap<String, Expression> {
        &self.annotations
    }

    /// ORDER BY terms.
    pub fn ordering(&self) -> &[OrderBy] {
        &self.ordering
    }

    /// The slice window as `(offset, limit)`.
    pub const fn bounds(&self) -> (usize, Option<usize>) {
        (self.offset, self.limit)
    }

    /// The database alias this queryset is pinned to.
    pub fn using_db(&self) -> Option<&str> {
        self.using.as_deref()
    }

    /// Returns `true` if an offset or limit applies.
    pub const fn is_sliced(&self) -> bool {
        self.offset > 0 || self.limit.is_some()
    }

    /// Returns `true` if this queryset can match nothing.
    pub const fn is_none(&self) -> bool {
        self.none || matches!(self.limit, Some(0))
    }

    // ── Builders ─────────────────────────────────────────────────────

    /// Adds a condition; conditions accumulate with AND.
    #[must_use]
    pub fn filter(mut self, q: Q) -> Self {
        self.condition = Some(match self.condition.take() {
            Some(existing) => existing & q,
            None => q,
        });
        self
    }

    /// Adds a negated condition.
    #[must_use]
    pub fn exclude(self, q: Q) -> Self {
        self.filter(!q)
    }

    /// Restricts to rows whose primary key is in `pks`.
    #[must_use]
    pub fn pk_in(self, pks: Vec<Value>) -> Self {
        let pk = self.model.pk_name().to_string();
        self.filter(Q::filter(pk, Lookup::In(pks)))
    }

    /// Registers a named annotation.
    #[must_use]
    pub fn annotate(mut self, name: impl Into<String>, expr: Expression) -> Self {
        self.annotations.insert(name.into(), expr);
        self
    }

    /// Replaces the ordering.
    #[must_use]
    pub fn order_by(mut self, ordering: Vec<OrderBy>) -> Self {
        self.ordering = ordering;
        self
    }

    /// Applies `[start:end]` relative to the current window.
    #[must_use]
    pub fn slice(mut self, start: usize, end: Option<usize>) -> Self {
        let remaining = self.limit.map(|l| l.saturating_sub(start));
        let requested = end.map(|e| e.saturating_sub(start));
        self.offset = self.offset.saturating_add(start);
        self.limit = match (remaining, requested) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self
    }

    /// Skips the first `n` rows.
    #[must_use]
    pub fn offset(self, n: usize) -> Self {
        self.slice(n, None)
    }

    /// Keeps at most `n` rows.
    #[must_use]
    pub fn limit(self, n: usize) -> Self {
        self.slice(0, Some(n))
    }

    /// Makes this queryset match nothing.
    #[must_use]
    pub fn none(mut self) -> Self {
        self.none = true;
        self
    }

    /// Pins this queryset to a database alias.
    #[must_use]
    pub fn using(mut self, alias: impl Into<String>) -> Self {
        self.using = Some(alias.into());
        self
    }

    /// Drops the slice window.
    #[must_use]
    pub fn without_slice(mut self) -> Self {
        self.offset = 0;
        self.limit = None;
        self
    }

    /// Drops the ordering.
    #[must_use]
    pub fn without_ordering(mut self) -> Self {
        self.ordering.clear();
        self
    }

    // ── Blocking terminals ───────────────────────────────────────────

    /// Fetches the selected columns of every matching row.
    pub fn fetch(&self, db: &dyn Executor, columns: &[SelectColumn]) -> OrmResult<Vec<Record>> {
        if self.is_none() {
            return Ok(Vec::new());
        }
        db.fetch(self, columns)
    }

    /// Fetches the named columns of every matching row.
    pub fn values(&self, db: &dyn Executor, names: &[&str]) -> OrmResult<Vec<Record>> {
        let columns: Vec<SelectColumn> = names.iter().map(|n| SelectColumn::column(*n)).collect();
        self.fetch(db, &columns)
    }

    /// Counts matching rows.
    pub fn count(&self, db: &dyn Executor) -> OrmResult<usize> {
        if self.is_none() {
            return Ok(0);
        }
        db.count(self)
    }

    /// Returns `true` if any row matches.
    pub fn exists(&self, db: &dyn Executor) -> OrmResult<bool> {
        if self.is_none() {
            return Ok(false);
        }
        db.exists(self)
    }

    /// Inserts a row into this queryset's model, returning its primary key.
    pub fn create(&self, db: &dyn Executor, values: &Record) -> OrmResult<Value> {
        db.insert(&self.model, values)
    }

    /// Updates every matching row, returning the affected-row count.
    pub fn update(&self, db: &dyn Executor, values: &Record) -> OrmResult<usize> {
        if self.is_none() {
            return Ok(0);
        }
        db.update(self, values)
    }

    /// Deletes every matching row, returning the affected-row count.
    pub fn delete(&self, db: &dyn Executor) -> OrmResult<usize> {
        if self.is_none() {
            return Ok(0);
        }
        db.delete(self)
    }

    // ── Async terminals ──────────────────────────────────────────────

    /// Async form of [`fetch`](Self::fetch).
    pub async fn afetch(
        &self,
        db: &dyn AsyncExecutor,
        columns: &[SelectColumn],
    ) -> OrmResult<Vec<Record>> {
        if self.is_none() {
            return Ok(Vec::new());
        }
        db.fetch(self, columns).await
    }

    /// Async form of [`values`](Self::values).
    pub async fn avalues(&self, db: &dyn AsyncExecutor, names: &[&str]) -> OrmResult<Vec<Record>> {
        let columns: Vec<SelectColumn> = names.iter().map(|n| SelectColumn::column(*n)).collect();
        self.afetch(db, &columns).await
    }

    /// Async form of [`count`](Self::count).
    pub async fn acount(&self, db: &dyn AsyncExecutor) -> OrmResult<usize> {
        if self.is_none() {
            return Ok(0);
        }
        db.count(self).await
    }

    /// Async form of [`exists`](Self::exists).
    pub async fn aexists(&self, db: &dyn AsyncExecutor) -> OrmResult<bool> {
        if self.is_none() {
            return Ok(false);
        }
        db.exists(self).await
    }

    /// Async form of [`create`](Self::create).
    pub async fn acreate(&self, db: &dyn AsyncExecutor, values: &Record) -> OrmResult<Value> {
        db.insert(&self.model, values).await
    }

    /// Async form of [`update`](Self::update).
    pub async fn aupdate(&self, db: &dyn AsyncExecutor, values: &Record) -> OrmResult<usize> {
        if self.is_none() {
            return Ok(0);
        }
        db.update(self, values).await
    }

    /// Async form of [`delete`](Self::delete).
    pub async fn adelete(&self, db: &dyn AsyncExecutor) -> OrmResult<usize> {
        if self.is_none() {
            return Ok(0);
        }
        db.delete(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDef, FieldType, ModelDef, Registry};

    fn user() -> Model {
        Registry::builder()
            .model(
                ModelDef::new("user")
                    .field(FieldDef::auto_pk("id"))
                    .field(FieldDef::new("username", FieldType::CharField)),
            )
            .build()
            .unwrap()
            .model("user")
            .unwrap()
    }

    #[test]
    fn test_filters_accumulate_with_and() {
        let qs = user()
            .objects()
            .filter(Q::filter("id", Lookup::Gt(Value::Int(1))))
            .exclude(Q::filter("username", Lookup::Exact(Value::from("bob"))));
        match qs.condition() {
            Some(Q::And(children)) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(children[1], Q::Not(_)));
            }
            other => panic!("Expected And, got {other:?}"),
        }
    }

    #[test]
    fn test_slice_composes() {
        let qs = user().objects().slice(10, Some(30)).slice(5, Some(50));
        assert_eq!(qs.bounds(), (15, Some(15)));

        let qs = user().objects().offset(3).limit(4);
        assert_eq!(qs.bounds(), (3, Some(4)));

        let qs = user().objects().limit(4).offset(3);
        assert_eq!(qs.bounds(), (3, Some(1)));
    }

    #[test]
    fn test_slice_saturates_at_usize_max() {
        let qs = user().objects().offset(usize::MAX).offset(5);
        assert_eq!(qs.bounds(), (usize::MAX, None));

        let qs = user().objects().slice(usize::MAX - 1, Some(usize::MAX)).offset(10);
        assert_eq!(qs.bounds(), (usize::MAX, Some(0)));
    }

    #[test]
    fn test_open_ended_offset() {
        let qs = user().objects().offset(7);
        assert!(qs.is_sliced());
        assert_eq!(qs.bounds(), (7, None));
        assert!(!qs.without_slice().is_sliced());
    }

    #[test]
    fn test_none_and_zero_limit() {
        assert!(user().objects().none().is_none());
        assert!(user().objects().limit(0).is_none());
        assert!(!user().objects().is_none());
    }

    #[test]
    fn test_pk_in_uses_pk_name() {
        let qs = user().objects().pk_in(vec![Value::Int(1)]);
        assert_eq!(qs.condition().unwrap().fields(), vec!["id"]);
    }

    #[test]
    fn test_order_by_parse() {
        let o = OrderBy::parse("-username", "-");
        assert!(o.descending);
        assert!(matches!(o.expr, Expression::Col(ref c) if c == "username"));
        let o = OrderBy::parse("username", "-").nulls_last();
        assert!(!o.descending);
        assert_eq!(o.nulls, NullsOrder::Last);
        let o = OrderBy::parse("~name", "~");
        assert!(o.descending);
    }

    #[test]
    fn test_annotate_and_without_ordering() {
        let qs = user()
            .objects()
            .annotate("n", Expression::value(1))
            .order_by(vec![OrderBy::asc(Expression::col("id"))])
            .without_ordering();
        assert!(qs.annotations().contains_key("n"));
        assert!(qs.ordering().is_empty());
    }
}
