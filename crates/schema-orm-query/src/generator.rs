//! The queryset generator.
//!
//! A [`QuerySchema`] declares which request inputs filter, order and paginate
//! a model's queryset. [`QuerySchema::bind`] validates one input record and
//! returns a [`BoundQuery`], which applies the predicates (an AND of every
//! provided filter), the ordering and the slice to a base queryset, counts
//! over the unsliced result, and turns `scope`/`exclude` inputs into a
//! [`QueryContext`].
//!
//! # Examples
//!
//! ```
//! use schema_orm_db::query::Lookup;
//! use schema_orm_db::value::{record, Value};
//! use schema_orm_query::generator::{Filter, Order, QuerySchema};
//! use schema_orm_test::fixtures;
//!
//! let article = fixtures::registry().model("article").unwrap();
//! let query = QuerySchema::builder(&article)
//!     .filter(Filter::new("author").field("author.username"))
//!     .filter(Filter::new("min_views").field("views").lookup(Lookup::Gte))
//!     .order(Order::new("order").keys(["views", "title"]).default(["-views"]))
//!     .pagination("page", "limit")
//!     .build()
//!     .unwrap();
//!
//! let bound = query
//!     .bind(&record([("author", Value::from("alice")), ("limit", Value::from(1))]))
//!     .unwrap();
//! let qs = bound.get_queryset(article.objects()).unwrap();
//! assert_eq!(qs.bounds(), (0, Some(1)));
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use schema_orm_core::settings::SETTINGS;
use schema_orm_core::{OrmError, OrmResult, ValidationError};
use schema_orm_db::executor::{AsyncExecutor, Executor};
use schema_orm_db::model::Model;
use schema_orm_db::query::{Expression, Lookup, NullsOrder, OrderBy, QuerySet, Q};
use schema_orm_db::value::{Record, Value};

use crate::compiler::rewrite_sliced;
use crate::context::QueryContext;

type PredicateFn = dyn Fn(&Value) -> OrmResult<Q> + Send + Sync;
type LookupFn = dyn Fn(Value) -> Lookup + Send + Sync;
type OrderResolverFn = dyn Fn(&str) -> OrmResult<Option<Expression>> + Send + Sync;

fn invalid(field: &str, message: impl Into<String>, code: &str) -> OrmError {
    ValidationError::for_field(field, message, code).into()
}

// ── Filters ──────────────────────────────────────────────────────────

#[derive(Clone)]
enum FilterTarget {
    Path(String),
    Expression(Expression),
}

/// One filter input.
///
/// By default the input value is compared with `Exact` against the model
/// path of the same name, or with `In` when the value is a list. A custom
/// [`query`](Self::query) callable takes precedence over the lookup.
#[derive(Clone)]
pub struct Filter {
    name: String,
    target: FilterTarget,
    lookup: Option<Arc<LookupFn>>,
    query: Option<Arc<PredicateFn>>,
    required: bool,
    fail_silently: bool,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("custom_query", &self.query.is_some())
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

impl Filter {
    /// Filters on the model path named like the input.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            target: FilterTarget::Path(name.clone()),
            name,
            lookup: None,
            query: None,
            required: false,
            fail_silently: false,
        }
    }

    /// Filters on another model path.
    #[must_use]
    pub fn field(mut self, path: impl Into<String>) -> Self {
        self.target = FilterTarget::Path(path.into());
        self
    }

    /// Filters on an expression, annotated before filtering.
    #[must_use]
    pub fn expression(mut self, expr: Expression) -> Self {
        self.target = FilterTarget::Expression(expr);
        self
    }

    /// Builds the lookup from the input value.
    #[must_use]
    pub fn lookup<F>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Lookup + Send + Sync + 'static,
    {
        self.lookup = Some(Arc::new(f));
        self
    }

    /// Builds the whole predicate from the input value.
    #[must_use]
    pub fn query<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> OrmResult<Q> + Send + Sync + 'static,
    {
        self.query = Some(Arc::new(f));
        self
    }

    /// Rejects inputs that leave this filter out.
    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Skips the predicate, with a warning, when the callable fails.
    #[must_use]
    pub const fn fail_silently(mut self) -> Self {
        self.fail_silently = true;
        self
    }

    fn annotation(&self) -> String {
        format!("__filter_{}", self.name)
    }

    fn validate(&self, model: &Model) -> OrmResult<()> {
        if self.query.is_some() {
            return Ok(());
        }
        match &self.target {
            FilterTarget::Path(path) => model.resolve_path(path).map(|_| ()),
            FilterTarget::Expression(expr) => model.resolve_output_field(expr).map(|_| ()),
        }
    }

    /// Applies this filter for `value` to `qs`.
    fn apply(&self, qs: QuerySet, value: &Value) -> OrmResult<QuerySet> {
        if let Some(query) = &self.query {
            return match query(value) {
                Ok(q) => Ok(qs.filter(q)),
                Err(err) if self.fail_silently => {
                    tracing::warn!(filter = %self.name, error = %err, "filter callable failed, skipped");
                    Ok(qs)
                }
                Err(err) => Err(err),
            };
        }
        let lookup = match &self.lookup {
            Some(f) => f(value.clone()),
            None => match value {
                Value::List(items) => Lookup::In(items.clone()),
                other => Lookup::Exact(other.clone()),
            },
        };
        Ok(match &self.target {
            FilterTarget::Path(path) => qs.filter(Q::filter(path.clone(), lookup)),
            FilterTarget::Expression(expr) => {
                let name = self.annotation();
                qs.annotate(name.clone(), expr.clone())
                    .filter(Q::filter(name, lookup))
            }
        })
    }
}

// ── Ordering ─────────────────────────────────────────────────────────

#[derive(Clone)]
enum OrderTarget {
    Path(String),
    Expression(Expression),
}

/// One order input: a key or list of keys, each optionally prefixed to
/// mean descending.
///
/// Without declared keys, any single-valued model path is accepted.
#[derive(Clone)]
pub struct Order {
    name: String,
    keys: IndexMap<String, OrderTarget>,
    nulls: HashMap<String, NullsOrder>,
    defaults: Vec<String>,
    resolver: Option<Arc<OrderResolverFn>>,
    ignore_invalids: bool,
    fail_silently: bool,
    prefix: Option<String>,
}

impl fmt::Debug for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Order")
            .field("name", &self.name)
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .field("defaults", &self.defaults)
            .field("ignore_invalids", &self.ignore_invalids)
            .finish_non_exhaustive()
    }
}

impl Order {
    /// Creates an order input.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: IndexMap::new(),
            nulls: HashMap::new(),
            defaults: Vec::new(),
            resolver: None,
            ignore_invalids: false,
            fail_silently: false,
            prefix: None,
        }
    }

    /// Accepts these model paths as keys.
    #[must_use]
    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            let key = key.into();
            self.keys.insert(key.clone(), OrderTarget::Path(key));
        }
        self
    }

    /// Accepts `key` as an alias of a model path.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>, path: impl Into<String>) -> Self {
        self.keys.insert(key.into(), OrderTarget::Path(path.into()));
        self
    }

    /// Accepts `key` as an expression, annotated before ordering.
    #[must_use]
    pub fn expression(mut self, key: impl Into<String>, expr: Expression) -> Self {
        self.keys.insert(key.into(), OrderTarget::Expression(expr));
        self
    }

    /// Resolves keys not declared with [`keys`](Self::keys) through a callable.
    #[must_use]
    pub fn resolver<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> OrmResult<Option<Expression>> + Send + Sync + 'static,
    {
        self.resolver = Some(Arc::new(f));
        self
    }

    /// Places NULLs first for `key`.
    #[must_use]
    pub fn nulls_first(mut self, key: impl Into<String>) -> Self {
        self.nulls.insert(key.into(), NullsOrder::First);
        self
    }

    /// Places NULLs last for `key`.
    #[must_use]
    pub fn nulls_last(mut self, key: impl Into<String>) -> Self {
        self.nulls.insert(key.into(), NullsOrder::Last);
        self
    }

    /// Keys used when the input leaves this order out.
    #[must_use]
    pub fn default<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.defaults = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Skips unknown keys instead of rejecting the input.
    #[must_use]
    pub const fn ignore_invalids(mut self) -> Self {
        self.ignore_invalids = true;
        self
    }

    /// Skips keys whose resolver fails, with a warning.
    #[must_use]
    pub const fn fail_silently(mut self) -> Self {
        self.fail_silently = true;
        self
    }

    /// Overrides the descending prefix.
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    fn validate(&self, model: &Model) -> OrmResult<()> {
        for target in self.keys.values() {
            match target {
                OrderTarget::Path(path) => {
                    model.resolve_path(path)?;
                }
                OrderTarget::Expression(expr) => {
                    model.resolve_output_field(expr)?;
                }
            }
        }
        Ok(())
    }

    fn annotation(key: &str) -> String {
        format!("__order_{}", key.replace('.', "__"))
    }

    /// Resolves one raw key to an annotation (if any) and an ORDER BY term.
    fn resolve(
        &self,
        model: &Model,
        raw: &str,
        default_prefix: &str,
    ) -> OrmResult<Option<(Option<(String, Expression)>, OrderBy)>> {
        let prefix = self.prefix.as_deref().unwrap_or(default_prefix);
        let (key, descending) = match raw.strip_prefix(prefix).filter(|_| !prefix.is_empty()) {
            Some(rest) => (rest, true),
            None => (raw, false),
        };
        let target = match self.keys.get(key) {
            Some(OrderTarget::Path(path)) => Some((None, Expression::col(path.clone()))),
            Some(OrderTarget::Expression(expr)) => {
                let name = Self::annotation(key);
                Some((Some((name.clone(), expr.clone())), Expression::col(name)))
            }
            None => match &self.resolver {
                Some(resolver) => match resolver(key) {
                    Ok(found) => found.map(|expr| {
                        let name = Self::annotation(key);
                        (Some((name.clone(), expr)), Expression::col(name))
                    }),
                    Err(err) if self.fail_silently => {
                        tracing::warn!(order = %self.name, key, error = %err, "order resolver failed, skipped");
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                },
                None if self.keys.is_empty() && model.resolve_path(key).is_ok_and(|p| p.is_single()) => {
                    Some((None, Expression::col(key)))
                }
                None => None,
            },
        };
        let Some((annotation, expr)) = target else {
            if self.ignore_invalids {
                tracing::debug!(order = %self.name, key, "ignoring unknown order key");
                return Ok(None);
            }
            return Err(invalid(&self.name, format!("unknown order key '{key}'"), "invalid_order"));
        };
        let mut term = if descending {
            OrderBy::desc(expr)
        } else {
            OrderBy::asc(expr)
        };
        match self.nulls.get(key) {
            Some(NullsOrder::First) => term = term.nulls_first(),
            Some(NullsOrder::Last) => term = term.nulls_last(),
            _ => {}
        }
        Ok(Some((annotation, term)))
    }
}

// ── Query schema ─────────────────────────────────────────────────────

/// Builder for [`QuerySchema`].
#[derive(Debug)]
pub struct QuerySchemaBuilder {
    model: Model,
    filters: Vec<Filter>,
    orders: Vec<Order>,
    page: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
    scope: Option<String>,
    exclude: Option<String>,
    max_limit: Option<usize>,
    order_prefix: Option<String>,
}

impl QuerySchemaBuilder {
    /// Adds a filter input.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Adds an order input.
    #[must_use]
    pub fn order(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    /// Names the page and limit inputs.
    #[must_use]
    pub fn pagination(mut self, page: impl Into<String>, limit: impl Into<String>) -> Self {
        self.page = Some(page.into());
        self.limit = Some(limit.into());
        self
    }

    /// Names the limit input.
    #[must_use]
    pub fn limit(mut self, name: impl Into<String>) -> Self {
        self.limit = Some(name.into());
        self
    }

    /// Names the offset input.
    #[must_use]
    pub fn offset(mut self, name: impl Into<String>) -> Self {
        self.offset = Some(name.into());
        self
    }

    /// Names the scope (field inclusion) input.
    #[must_use]
    pub fn scope(mut self, name: impl Into<String>) -> Self {
        self.scope = Some(name.into());
        self
    }

    /// Names the exclude input.
    #[must_use]
    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude = Some(name.into());
        self
    }

    /// Caps every limit input.
    #[must_use]
    pub const fn max_limit(mut self, max: usize) -> Self {
        self.max_limit = Some(max);
        self
    }

    /// Overrides the descending prefix for every order input.
    #[must_use]
    pub fn order_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.order_prefix = Some(prefix.into());
        self
    }

    /// Validates every declaration against the model.
    pub fn build(self) -> OrmResult<QuerySchema> {
        let mut names: Vec<&str> = Vec::new();
        let declared = self
            .filters
            .iter()
            .map(|f| f.name.as_str())
            .chain(self.orders.iter().map(|o| o.name.as_str()))
            .chain(
                [&self.page, &self.limit, &self.offset, &self.scope, &self.exclude]
                    .into_iter()
                    .flatten()
                    .map(String::as_str),
            );
        for name in declared {
            if names.contains(&name) {
                return Err(OrmError::Classification(format!(
                    "query input '{name}' is declared twice"
                )));
            }
            names.push(name);
        }
        for filter in &self.filters {
            filter.validate(&self.model)?;
        }
        for order in &self.orders {
            order.validate(&self.model)?;
        }
        tracing::debug!(model = %self.model, inputs = names.len(), "query schema built");
        Ok(QuerySchema {
            model: self.model,
            filters: self.filters,
            orders: self.orders,
            page: self.page,
            limit: self.limit,
            offset: self.offset,
            scope: self.scope,
            exclude: self.exclude,
            max_limit: self.max_limit,
            order_prefix: self.order_prefix,
        })
    }
}

/// Declares the filter, order, pagination and scope inputs of a model query.
#[derive(Debug)]
pub struct QuerySchema {
    model: Model,
    filters: Vec<Filter>,
    orders: Vec<Order>,
    page: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
    scope: Option<String>,
    exclude: Option<String>,
    max_limit: Option<usize>,
    order_prefix: Option<String>,
}

/// Reads an optional non-negative integer input.
fn read_count(input: &Record, name: Option<&String>) -> OrmResult<Option<usize>> {
    let Some(name) = name else { return Ok(None) };
    let Some(value) = input.get(name.as_str()).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let number = match value {
        Value::Int(i) => Some(*i),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match number {
        Some(n) if n >= 0 => Ok(usize::try_from(n).ok()),
        Some(_) => Err(invalid(name, "must not be negative", "min_value")),
        None => Err(invalid(name, format!("expected an integer, got {value}"), "invalid")),
    }
}

/// Reads a string or list-of-strings input.
fn read_keys(value: &Value) -> Vec<String> {
    value
        .clone()
        .into_items()
        .into_iter()
        .filter_map(|v| match v {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .flat_map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

impl QuerySchema {
    /// Starts a query schema over `model`.
    pub fn builder(model: &Model) -> QuerySchemaBuilder {
        QuerySchemaBuilder {
            model: model.clone(),
            filters: Vec::new(),
            orders: Vec::new(),
            page: None,
            limit: None,
            offset: None,
            scope: None,
            exclude: None,
            max_limit: None,
            order_prefix: None,
        }
    }

    /// The queried model.
    pub const fn model(&self) -> &Model {
        &self.model
    }

    /// Validates one input record.
    ///
    /// Fails with a validation error when a required filter is absent, a
    /// pagination input is not a non-negative integer, the page is zero, or
    /// a page is given without a limit. Oversized windows saturate at
    /// `usize::MAX` instead of overflowing.
    pub fn bind(&self, input: &Record) -> OrmResult<BoundQuery<'_>> {
        for filter in self.filters.iter().filter(|f| f.required) {
            if !input.get(filter.name.as_str()).is_some_and(|v| !v.is_null()) {
                return Err(invalid(&filter.name, "this filter is required", "required"));
            }
        }

        let page = read_count(input, self.page.as_ref())?;
        let limit = read_count(input, self.limit.as_ref())?;
        let offset = read_count(input, self.offset.as_ref())?;
        if page == Some(0) {
            let name = self.page.as_deref().unwrap_or("page");
            return Err(invalid(name, "pages start at 1", "min_value"));
        }
        let cap = self.max_limit.or(SETTINGS.get().query.max_limit);
        let limit = match (limit, cap) {
            (Some(limit), Some(cap)) => Some(limit.min(cap)),
            (limit, _) => limit,
        };
        let window = match (page, limit, offset) {
            (None, None, None) => None,
            (Some(_), None, _) => {
                let name = self.page.as_deref().unwrap_or("page");
                return Err(invalid(name, "a page needs a limit", "page_without_limit"));
            }
            (page, limit, offset) => {
                let from_page = match (page, limit) {
                    (Some(page), Some(limit)) => (page - 1).saturating_mul(limit),
                    _ => 0,
                };
                let start = offset.unwrap_or(0).max(from_page);
                Some((start, limit))
            }
        };
        Ok(BoundQuery {
            schema: self,
            input: input.clone(),
            window,
        })
    }
}

/// A query schema bound to validated input.
#[derive(Debug)]
pub struct BoundQuery<'q> {
    schema: &'q QuerySchema,
    input: Record,
    window: Option<(usize, Option<usize>)>,
}

impl BoundQuery<'_> {
    fn value(&self, name: &str) -> Option<&Value> {
        self.input.get(name).filter(|v| !v.is_null())
    }

    /// The slice as `(offset, limit)`, if any pagination input was given.
    pub const fn window(&self) -> Option<(usize, Option<usize>)> {
        self.window
    }

    /// Applies the filters and ordering, without slicing.
    pub fn get_filtered(&self, base: QuerySet) -> OrmResult<QuerySet> {
        let schema = self.schema;
        let mut qs = base;
        for filter in &schema.filters {
            if let Some(value) = self.value(&filter.name) {
                qs = filter.apply(qs, value)?;
            }
        }

        let settings = SETTINGS.get();
        let prefix = schema
            .order_prefix
            .as_deref()
            .unwrap_or(settings.query.order_prefix.as_str());
        let mut ordering = Vec::new();
        for order in &schema.orders {
            let keys = match self.value(&order.name) {
                Some(value) => read_keys(value),
                None => order.defaults.clone(),
            };
            for key in &keys {
                if let Some((annotation, term)) = order.resolve(&schema.model, key, prefix)? {
                    if let Some((name, expr)) = annotation {
                        qs = qs.annotate(name, expr);
                    }
                    ordering.push(term);
                }
            }
        }
        if !ordering.is_empty() {
            qs = qs.order_by(ordering);
        }
        Ok(qs)
    }

    /// Applies the filters, ordering and slice.
    ///
    /// Annotations aggregating over to-many relations are rewritten into
    /// correlated subqueries when a slice applies.
    pub fn get_queryset(&self, base: QuerySet) -> OrmResult<QuerySet> {
        let mut qs = self.get_filtered(base)?;
        let Some((start, limit)) = self.window else {
            return Ok(qs);
        };
        let model = qs.model().clone();
        let annotations: Vec<(String, Expression)> = qs
            .annotations()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (name, expr) in annotations {
            qs = qs.annotate(name, rewrite_sliced(&model, &expr)?);
        }
        Ok(qs.slice(start, limit.map(|l| start.saturating_add(l))))
    }

    fn counting(&self, base: QuerySet) -> OrmResult<QuerySet> {
        Ok(self.get_filtered(base)?.without_slice().without_ordering())
    }

    /// Counts the filtered rows; pagination does not apply.
    pub fn count(&self, db: &dyn Executor, base: QuerySet) -> OrmResult<usize> {
        self.counting(base)?.count(db)
    }

    /// Async form of [`count`](Self::count).
    pub async fn acount(&self, db: &dyn AsyncExecutor, base: QuerySet) -> OrmResult<usize> {
        self.counting(base)?.acount(db).await
    }

    /// A context restricted by the scope input, or else by the exclude input.
    pub fn get_context(&self) -> QueryContext {
        let read = |name: Option<&String>| {
            name.and_then(|n| self.value(n))
                .map(read_keys)
                .filter(|keys| !keys.is_empty())
        };
        let ctx = QueryContext::new();
        if let Some(scope) = read(self.schema.scope.as_ref()) {
            ctx.include(scope)
        } else if let Some(exclude) = read(self.schema.exclude.as_ref()) {
            ctx.exclude(exclude)
        } else {
            ctx
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema_orm_db::query::AggregateFunc;
    use schema_orm_db::value::record;
    use schema_orm_test::fixtures;

    fn article() -> Model {
        fixtures::registry().model("article").unwrap()
    }

    fn query() -> QuerySchema {
        QuerySchema::builder(&article())
            .filter(Filter::new("title"))
            .filter(Filter::new("author").field("author.username").required())
            .order(Order::new("order").keys(["views", "title"]).nulls_last("views").default(["-views"]))
            .pagination("page", "limit")
            .offset("offset")
            .scope("scope")
            .exclude("exclude")
            .build()
            .unwrap()
    }

    #[test]
    fn test_required_filter() {
        let err = query().bind(&Record::new()).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(query().bind(&record([("author", Value::Null)])).is_err());
    }

    #[test]
    fn test_filters_accumulate() {
        let schema = query();
        let bound = schema
            .bind(&record([
                ("author", Value::from("alice")),
                ("title", Value::List(vec!["Intro".into(), "Rust".into()])),
            ]))
            .unwrap();
        let qs = bound.get_filtered(article().objects()).unwrap();
        let fields = qs.condition().unwrap().fields();
        assert_eq!(fields, vec!["title", "author.username"]);
        assert!(!qs.is_sliced());
        let order = &qs.ordering()[0];
        assert!(order.descending);
        assert_eq!(order.nulls, NullsOrder::Last);
    }

    #[test]
    fn test_pagination_window() {
        let schema = query();
        let base = record([("author", Value::from("alice"))]);
        let window = |extra: &[(&str, Value)]| {
            let mut input = base.clone();
            for (k, v) in extra {
                input.insert((*k).to_string(), v.clone());
            }
            schema.bind(&input).map(|b| b.window())
        };
        assert_eq!(window(&[]).unwrap(), None);
        assert_eq!(
            window(&[("page", 3.into()), ("limit", 10.into())]).unwrap(),
            Some((20, Some(10)))
        );
        assert_eq!(
            window(&[("page", 2.into()), ("limit", 10.into()), ("offset", 5.into())]).unwrap(),
            Some((10, Some(10)))
        );
        assert_eq!(
            window(&[("page", 2.into()), ("limit", 10.into()), ("offset", 50.into())]).unwrap(),
            Some((50, Some(10)))
        );
        assert_eq!(window(&[("offset", "7".into())]).unwrap(), Some((7, None)));
        assert!(window(&[("page", 0.into()), ("limit", 1.into())]).is_err());
        assert!(window(&[("limit", (-1).into())]).is_err());
        assert!(window(&[("page", 2.into())]).is_err());
    }

    #[test]
    fn test_max_limit_clamps() {
        let schema = QuerySchema::builder(&article())
            .limit("limit")
            .max_limit(5)
            .build()
            .unwrap();
        let bound = schema.bind(&record([("limit", Value::from(100))])).unwrap();
        assert_eq!(bound.window(), Some((0, Some(5))));
    }

    #[test]
    fn test_unknown_order_key() {
        let schema = query();
        let input = record([("author", Value::from("a")), ("order", Value::from("-secret"))]);
        let bound = schema.bind(&input).unwrap();
        assert!(bound.get_filtered(article().objects()).is_err());

        let lenient = QuerySchema::builder(&article())
            .order(Order::new("order").keys(["views"]).ignore_invalids())
            .build()
            .unwrap();
        let bound = lenient.bind(&record([("order", Value::from("secret,-views"))])).unwrap();
        let qs = bound.get_filtered(article().objects()).unwrap();
        assert_eq!(qs.ordering().len(), 1);
    }

    #[test]
    fn test_expression_order_is_annotated() {
        let user = fixtures::registry().model("user").unwrap();
        let schema = QuerySchema::builder(&user)
            .order(Order::new("order").expression(
                "total_views",
                Expression::aggregate(AggregateFunc::Sum, Expression::col("articles.views")),
            ))
            .limit("limit")
            .build()
            .unwrap();
        let bound = schema
            .bind(&record([("order", Value::from("-total_views")), ("limit", Value::from(2))]))
            .unwrap();
        let qs = bound.get_queryset(user.objects()).unwrap();
        assert!(matches!(
            qs.annotations().get("__order_total_views"),
            Some(Expression::Subquery(_))
        ));
        assert_eq!(qs.bounds(), (0, Some(2)));
    }

    #[test]
    fn test_huge_pagination_saturates() {
        let schema = query();
        let bound = schema
            .bind(&record([
                ("author", Value::from("alice")),
                ("page", Value::from(i64::MAX)),
                ("limit", Value::from(i64::MAX)),
            ]))
            .unwrap();
        assert_eq!(bound.window().map(|(start, _)| start), Some(usize::MAX));
        let qs = bound.get_queryset(article().objects()).unwrap();
        assert_eq!(qs.bounds(), (usize::MAX, Some(0)));
        assert!(qs.is_none());
    }

    #[test]
    fn test_predicate_filter_needs_no_model_path() {
        let schema = QuerySchema::builder(&article())
            .filter(Filter::new("search").query(|v| {
                Ok(Q::filter("title", Lookup::Exact(v.clone()))
                    | Q::filter("author.username", Lookup::Exact(v.clone())))
            }))
            .build()
            .unwrap();
        let bound = schema.bind(&record([("search", Value::from("Rust"))])).unwrap();
        assert!(bound.get_filtered(article().objects()).unwrap().condition().is_some());

        assert!(QuerySchema::builder(&article())
            .filter(Filter::new("search").field("missing"))
            .build()
            .is_err());
    }

    #[test]
    fn test_failing_filter_callable() {
        let schema = QuerySchema::builder(&article())
            .filter(
                Filter::new("q")
                    .query(|_| Err(OrmError::NotSupported("search".into())))
                    .fail_silently(),
            )
            .filter(Filter::new("strict").query(|_| Err(OrmError::NotSupported("search".into()))))
            .build()
            .unwrap();
        let bound = schema.bind(&record([("q", Value::from("x"))])).unwrap();
        assert!(bound.get_filtered(article().objects()).unwrap().condition().is_none());
        let bound = schema.bind(&record([("strict", Value::from("x"))])).unwrap();
        assert!(bound.get_filtered(article().objects()).is_err());
    }

    #[test]
    fn test_build_rejects_unknown_paths_and_duplicates() {
        assert!(QuerySchema::builder(&article())
            .filter(Filter::new("nope"))
            .build()
            .is_err());
        assert!(QuerySchema::builder(&article())
            .filter(Filter::new("title"))
            .limit("title")
            .build()
            .is_err());
    }

    #[test]
    fn test_context_scope_wins() {
        let schema = query();
        let bound = schema
            .bind(&record([
                ("author", Value::from("a")),
                ("scope", Value::List(vec!["title".into(), "author.username".into()])),
                ("exclude", Value::from("title")),
            ]))
            .unwrap();
        let ctx = bound.get_context();
        assert!(ctx.in_scope("title", false));
        assert!(ctx.in_scope("author", false));
        assert!(!ctx.in_scope("views", false));

        let bound = schema
            .bind(&record([("author", Value::from("a")), ("exclude", Value::from("views"))]))
            .unwrap();
        let ctx = bound.get_context();
        assert!(!ctx.in_scope("views", false));
        assert!(ctx.in_scope("title", false));
    }
}
