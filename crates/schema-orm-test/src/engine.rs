//! Table storage and query evaluation for [`MemoryDatabase`](crate::MemoryDatabase).
//!
//! Rows are stored per model, keyed by primary key, holding only the columns
//! declared on that model (the multi-table inheritance layout). The
//! [`Evaluator`] interprets `QuerySet` descriptions directly: conditions,
//! relation paths, annotations, aggregates, correlated subqueries, ordering
//! and slicing.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use schema_orm_core::{OrmError, OrmResult};
use schema_orm_db::model::{FieldDef, FieldType, Model};
use schema_orm_db::query::{
    AggregateFunc, Expression, NullsOrder, OrderBy, QuerySet, SelectColumn, Subquery, Q,
};
use schema_orm_db::value::{Record, Value};

type Annotations = IndexMap<String, Expression>;

/// One model's table.
#[derive(Debug, Clone, Default)]
pub(crate) struct Table {
    pub(crate) rows: IndexMap<Value, Record>,
    pub(crate) last_id: i64,
}

/// Every table of the database.
#[derive(Debug, Clone, Default)]
pub(crate) struct Store {
    pub(crate) tables: HashMap<String, Table>,
}

impl Store {
    fn table(&self, model: &Model) -> Option<&Table> {
        self.tables.get(model.ident())
    }

    pub(crate) fn table_mut(&mut self, model: &Model) -> &mut Table {
        self.tables.entry(model.ident().to_string()).or_default()
    }

    /// Primary keys of every row of `model`, in insertion order.
    pub(crate) fn keys(&self, model: &Model) -> Vec<Value> {
        self.table(model)
            .map(|t| t.rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn contains(&self, model: &Model, pk: &Value) -> bool {
        self.table(model).is_some_and(|t| t.rows.contains_key(pk))
    }

    /// The model of `model`'s inheritance chain whose table stores `name`.
    pub(crate) fn column_owner(model: &Model, name: &str) -> Option<Model> {
        if name == model.pk_name() {
            return Some(model.clone());
        }
        model
            .lineage()
            .into_iter()
            .find(|m| m.own_fields().iter().any(|f| f.name == name && f.is_concrete()))
    }

    /// Reads one stored cell.
    pub(crate) fn cell(&self, model: &Model, pk: &Value, name: &str) -> Value {
        if name == "pk" || name == model.pk_name() {
            return pk.clone();
        }
        Self::column_owner(model, name)
            .and_then(|owner| self.table(&owner)?.rows.get(pk)?.get(name).cloned())
            .unwrap_or(Value::Null)
    }

    /// A full row: every concrete column across the inheritance chain.
    pub(crate) fn full_row(&self, model: &Model, pk: &Value) -> Record {
        model
            .concrete_fields()
            .into_iter()
            .map(|f| (f.name.clone(), self.cell(model, pk, &f.name)))
            .collect()
    }
}

/// Interprets read queries against a [`Store`].
pub(crate) struct Evaluator<'s> {
    store: &'s Store,
}

impl<'s> Evaluator<'s> {
    pub(crate) const fn new(store: &'s Store) -> Self {
        Self { store }
    }

    /// Primary keys matched by `qs` after filtering, ordering and slicing.
    ///
    /// With a correlation `(link, outer)`, rows are further restricted to
    /// those whose `link` path reaches `outer`; the slice applies after that
    /// restriction.
    pub(crate) fn select(
        &self,
        qs: &QuerySet,
        correlation: Option<(&str, &Value)>,
    ) -> OrmResult<Vec<Value>> {
        if qs.is_none() {
            return Ok(Vec::new());
        }
        let model = qs.model();
        let ann = qs.annotations();
        let mut pks = Vec::new();
        for pk in self.store.keys(model) {
            if let Some(q) = qs.condition() {
                if !self.matches(model, &pk, q, ann)? {
                    continue;
                }
            }
            if let Some((link, outer)) = correlation {
                if outer.is_null() {
                    continue;
                }
                let reached = self.column_values(model, &pk, link, ann)?;
                if !reached.iter().any(|v| same(v, outer)) {
                    continue;
                }
            }
            pks.push(pk);
        }

        if !qs.ordering().is_empty() {
            let mut keyed = Vec::with_capacity(pks.len());
            for pk in pks {
                let keys = qs
                    .ordering()
                    .iter()
                    .map(|o| self.eval(model, &pk, &o.expr, ann))
                    .collect::<OrmResult<Vec<_>>>()?;
                keyed.push((keys, pk));
            }
            keyed.sort_by(|(a, _), (b, _)| compare_keys(qs.ordering(), a, b));
            pks = keyed.into_iter().map(|(_, pk)| pk).collect();
        }

        let (offset, limit) = qs.bounds();
        Ok(pks
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Evaluates `columns` for every matched row.
    ///
    /// A column path crossing a to-many relation yields one output row per
    /// related value, as a join would.
    pub(crate) fn fetch(&self, qs: &QuerySet, columns: &[SelectColumn]) -> OrmResult<Vec<Record>> {
        let model = qs.model();
        if qs.is_sliced() {
            let exprs = columns
                .iter()
                .map(|c| &c.expr)
                .chain(qs.annotations().values())
                .chain(qs.ordering().iter().map(|o| &o.expr));
            for expr in exprs {
                if aggregates_many(model, expr) {
                    return Err(OrmError::NotSupported(format!(
                        "aggregate over a to-many relation on a sliced '{model}' queryset"
                    )));
                }
            }
        }

        let ann = qs.annotations();
        let mut out = Vec::new();
        for pk in self.select(qs, None)? {
            let mut rows = vec![Record::new()];
            for column in columns {
                let values = match &column.expr {
                    Expression::Col(path) => {
                        let values = self.column_values(model, &pk, path, ann)?;
                        if values.is_empty() {
                            vec![Value::Null]
                        } else {
                            values
                        }
                    }
                    expr => vec![self.eval(model, &pk, expr, ann)?],
                };
                let mut next = Vec::with_capacity(rows.len() * values.len());
                for row in &rows {
                    for value in &values {
                        let mut row = row.clone();
                        row.insert(column.alias.clone(), value.clone());
                        next.push(row);
                    }
                }
                rows = next;
            }
            out.extend(rows);
        }
        Ok(out)
    }

    /// Values reached by a path or annotation name from one row.
    fn column_values(
        &self,
        model: &Model,
        pk: &Value,
        path: &str,
        ann: &Annotations,
    ) -> OrmResult<Vec<Value>> {
        if let Some(expr) = ann.get(path) {
            return Ok(vec![self.eval(model, pk, expr, ann)?]);
        }
        self.path_values(model, pk, path)
    }

    /// Values reached by following a dotted path from one row.
    ///
    /// A relation terminal yields related primary keys. To-many hops fan
    /// out; null foreign keys end their branch.
    pub(crate) fn path_values(&self, model: &Model, pk: &Value, path: &str) -> OrmResult<Vec<Value>> {
        let parts: Vec<&str> = path.split('.').collect();
        let mut current = vec![(model.clone(), pk.clone())];
        let mut out = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            let mut next = Vec::new();
            for (m, key) in &current {
                let field = m.get_field(part)?;
                let reached = self.step(m, field, key)?;
                if last {
                    out.extend(reached);
                } else if field.is_relation() {
                    let target = m.related_model(field)?;
                    next.extend(
                        reached
                            .into_iter()
                            .filter(|v| !v.is_null())
                            .map(|v| (target.clone(), v)),
                    );
                } else {
                    return Err(OrmError::FieldNotFound {
                        model: model.ident().to_string(),
                        field: path.to_string(),
                    });
                }
            }
            current = next;
        }
        Ok(out)
    }

    fn step(&self, model: &Model, field: &FieldDef, key: &Value) -> OrmResult<Vec<Value>> {
        match &field.field_type {
            FieldType::ManyToManyField {
                through,
                source_field,
                target_field,
                ..
            } => self.through_values(model, through, source_field, target_field, key),
            FieldType::ReverseManyToMany {
                model: owner,
                field: forward,
            } => {
                let owner_model = model.registry().model(owner)?;
                match &owner_model.get_field(forward)?.field_type {
                    FieldType::ManyToManyField {
                        through,
                        source_field,
                        target_field,
                        ..
                    } => self.through_values(model, through, target_field, source_field, key),
                    _ => Err(OrmError::DatabaseError(format!(
                        "'{owner}.{forward}' is not a many-to-many field"
                    ))),
                }
            }
            FieldType::ReverseForeignKey { model: owner, field: fk }
            | FieldType::ReverseOneToOne { model: owner, field: fk } => {
                let owner_model = model.registry().model(owner)?;
                Ok(self.referencing(&owner_model, fk, key))
            }
            _ => Ok(vec![self.store.cell(model, key, &field.name)]),
        }
    }

    fn through_values(
        &self,
        model: &Model,
        through: &str,
        own: &str,
        other: &str,
        key: &Value,
    ) -> OrmResult<Vec<Value>> {
        let through = model.registry().model(through)?;
        Ok(self
            .store
            .keys(&through)
            .iter()
            .filter(|row| self.store.cell(&through, row, own) == *key)
            .map(|row| self.store.cell(&through, row, other))
            .collect())
    }

    /// Primary keys of `owner` rows whose `fk` column equals `key`.
    pub(crate) fn referencing(&self, owner: &Model, fk: &str, key: &Value) -> Vec<Value> {
        self.store
            .keys(owner)
            .into_iter()
            .filter(|row| self.store.cell(owner, row, fk) == *key)
            .collect()
    }

    fn matches(&self, model: &Model, pk: &Value, q: &Q, ann: &Annotations) -> OrmResult<bool> {
        self.matches_with(q, &|path| self.column_values(model, pk, path, ann))
    }

    /// Evaluates a condition, resolving each path through `resolve`.
    ///
    /// A lookup on a multi-valued path matches when any value matches; a
    /// path reaching nothing is tested as NULL.
    fn matches_with(
        &self,
        q: &Q,
        resolve: &dyn Fn(&str) -> OrmResult<Vec<Value>>,
    ) -> OrmResult<bool> {
        Ok(match q {
            Q::Filter { field, lookup } => {
                let values = resolve(field)?;
                if values.is_empty() {
                    lookup.matches(&Value::Null)
                } else {
                    values.iter().any(|v| lookup.matches(v))
                }
            }
            Q::And(children) => {
                for child in children {
                    if !self.matches_with(child, resolve)? {
                        return Ok(false);
                    }
                }
                true
            }
            Q::Or(children) => {
                for child in children {
                    if self.matches_with(child, resolve)? {
                        return Ok(true);
                    }
                }
                false
            }
            Q::Not(inner) => !self.matches_with(inner, resolve)?,
        })
    }

    /// Evaluates an expression for one row.
    pub(crate) fn eval(
        &self,
        model: &Model,
        pk: &Value,
        expr: &Expression,
        ann: &Annotations,
    ) -> OrmResult<Value> {
        match expr {
            Expression::Col(path) => Ok(self
                .column_values(model, pk, path, ann)?
                .into_iter()
                .next()
                .unwrap_or(Value::Null)),
            Expression::Value(v) => Ok(v.clone()),
            Expression::Func { name, args } => {
                let args = args
                    .iter()
                    .map(|a| self.eval(model, pk, a, ann))
                    .collect::<OrmResult<Vec<_>>>()?;
                scalar_func(name, args)
            }
            Expression::Aggregate {
                func,
                field,
                distinct,
                filter,
            } => {
                let values = self.related_values(model, pk, field, filter.as_deref(), ann)?;
                aggregate(*func, values, *distinct)
            }
            Expression::Case { whens, default } => {
                for when in whens {
                    if self.matches(model, pk, &when.condition, ann)? {
                        return self.eval(model, pk, &when.then, ann);
                    }
                }
                default
                    .as_deref()
                    .map_or(Ok(Value::Null), |d| self.eval(model, pk, d, ann))
            }
            Expression::Subquery(sub) => self.subquery(model, pk, sub, ann),
            Expression::Add(l, r) => arith(
                Op::Add,
                self.eval(model, pk, l, ann)?,
                self.eval(model, pk, r, ann)?,
            ),
            Expression::Sub(l, r) => arith(
                Op::Sub,
                self.eval(model, pk, l, ann)?,
                self.eval(model, pk, r, ann)?,
            ),
            Expression::Mul(l, r) => arith(
                Op::Mul,
                self.eval(model, pk, l, ann)?,
                self.eval(model, pk, r, ann)?,
            ),
            Expression::Div(l, r) => arith(
                Op::Div,
                self.eval(model, pk, l, ann)?,
                self.eval(model, pk, r, ann)?,
            ),
        }
    }

    /// The values an aggregate collects for one owning row.
    ///
    /// For a column path crossing to-many relations, the path is split after
    /// the last to-many hop; the filter is evaluated per related row, with
    /// paths under that prefix resolved against the related row.
    fn related_values(
        &self,
        model: &Model,
        pk: &Value,
        field: &Expression,
        filter: Option<&Q>,
        ann: &Annotations,
    ) -> OrmResult<Vec<Value>> {
        let split = match field {
            Expression::Col(path) if !ann.contains_key(path) => split_many(model, path)?,
            _ => None,
        };
        let Some((prefix, rest)) = split else {
            if let Some(q) = filter {
                if !self.matches(model, pk, q, ann)? {
                    return Ok(Vec::new());
                }
            }
            return Ok(vec![self.eval(model, pk, field, ann)?]);
        };

        let target = model.resolve_path(&prefix)?.target_model()?.ok_or_else(|| {
            OrmError::DatabaseError(format!("'{prefix}' is not a relation on '{model}'"))
        })?;
        let mut out = Vec::new();
        for related in self.path_values(model, pk, &prefix)? {
            if related.is_null() {
                continue;
            }
            if let Some(q) = filter {
                let resolve = |p: &str| -> OrmResult<Vec<Value>> {
                    if p == prefix {
                        Ok(vec![related.clone()])
                    } else if let Some(inner) = p
                        .strip_prefix(prefix.as_str())
                        .and_then(|s| s.strip_prefix('.'))
                    {
                        self.path_values(&target, &related, inner)
                    } else {
                        self.column_values(model, pk, p, ann)
                    }
                };
                if !self.matches_with(q, &resolve)? {
                    continue;
                }
            }
            match rest.as_deref() {
                None => out.push(related),
                Some(rest) => out.extend(self.path_values(&target, &related, rest)?),
            }
        }
        Ok(out)
    }

    fn subquery(
        &self,
        model: &Model,
        pk: &Value,
        sub: &Subquery,
        ann: &Annotations,
    ) -> OrmResult<Value> {
        let outer = self
            .column_values(model, pk, &sub.outer, ann)?
            .into_iter()
            .next()
            .unwrap_or(Value::Null);
        let rows = self.select(&sub.queryset, Some((&sub.link, &outer)))?;
        self.eval_over(sub.queryset.model(), &rows, &sub.value, sub.queryset.annotations())
    }

    /// Evaluates an expression over a set of rows: aggregates fold across
    /// the set, anything else reads the first row.
    fn eval_over(
        &self,
        model: &Model,
        rows: &[Value],
        expr: &Expression,
        ann: &Annotations,
    ) -> OrmResult<Value> {
        match expr {
            Expression::Aggregate {
                func,
                field,
                distinct,
                filter,
            } => {
                let mut values = Vec::new();
                for pk in rows {
                    values.extend(self.related_values(model, pk, field, filter.as_deref(), ann)?);
                }
                aggregate(*func, values, *distinct)
            }
            Expression::Value(v) => Ok(v.clone()),
            Expression::Func { name, args } => {
                let args = args
                    .iter()
                    .map(|a| self.eval_over(model, rows, a, ann))
                    .collect::<OrmResult<Vec<_>>>()?;
                scalar_func(name, args)
            }
            Expression::Add(l, r) => arith(
                Op::Add,
                self.eval_over(model, rows, l, ann)?,
                self.eval_over(model, rows, r, ann)?,
            ),
            Expression::Sub(l, r) => arith(
                Op::Sub,
                self.eval_over(model, rows, l, ann)?,
                self.eval_over(model, rows, r, ann)?,
            ),
            Expression::Mul(l, r) => arith(
                Op::Mul,
                self.eval_over(model, rows, l, ann)?,
                self.eval_over(model, rows, r, ann)?,
            ),
            Expression::Div(l, r) => arith(
                Op::Div,
                self.eval_over(model, rows, l, ann)?,
                self.eval_over(model, rows, r, ann)?,
            ),
            other => rows
                .first()
                .map_or(Ok(Value::Null), |pk| self.eval(model, pk, other, ann)),
        }
    }
}

fn same(a: &Value, b: &Value) -> bool {
    a.partial_cmp(b) == Some(Ordering::Equal)
}

/// Splits `path` after its last to-many hop, returning `(prefix, rest)`.
fn split_many(model: &Model, path: &str) -> OrmResult<Option<(String, Option<String>)>> {
    let resolved = model.resolve_path(path)?;
    let Some(last_many) = resolved
        .segments
        .iter()
        .rposition(|s| s.field.field_type.is_many())
    else {
        return Ok(None);
    };
    let parts: Vec<&str> = path.split('.').collect();
    let prefix = parts[..=last_many].join(".");
    let rest = (last_many + 1 < parts.len()).then(|| parts[last_many + 1..].join("."));
    Ok(Some((prefix, rest)))
}

/// Returns `true` if an aggregate outside a subquery reads a to-many path.
fn aggregates_many(model: &Model, expr: &Expression) -> bool {
    match expr {
        Expression::Aggregate { field, .. } => field
            .columns()
            .iter()
            .any(|p| model.resolve_path(p).is_ok_and(|r| !r.is_single())),
        Expression::Col(_) | Expression::Value(_) | Expression::Subquery(_) => false,
        Expression::Func { args, .. } => args.iter().any(|a| aggregates_many(model, a)),
        Expression::Case { whens, default } => {
            whens.iter().any(|w| aggregates_many(model, &w.then))
                || default.as_deref().is_some_and(|d| aggregates_many(model, d))
        }
        Expression::Add(l, r)
        | Expression::Sub(l, r)
        | Expression::Mul(l, r)
        | Expression::Div(l, r) => aggregates_many(model, l) || aggregates_many(model, r),
    }
}

fn compare_keys(ordering: &[OrderBy], a: &[Value], b: &[Value]) -> Ordering {
    for ((order, left), right) in ordering.iter().zip(a).zip(b) {
        let nulls_first = match order.nulls {
            NullsOrder::First => true,
            NullsOrder::Last => false,
            // NULL sorts as the smallest value
            NullsOrder::Default => !order.descending,
        };
        let ord = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) if nulls_first => Ordering::Less,
            (true, false) => Ordering::Greater,
            (false, true) if nulls_first => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = left.partial_cmp(right).unwrap_or(Ordering::Equal);
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn aggregate(func: AggregateFunc, values: Vec<Value>, distinct: bool) -> OrmResult<Value> {
    let mut values: Vec<Value> = values.into_iter().filter(|v| !v.is_null()).collect();
    if distinct {
        let mut seen = HashSet::new();
        values.retain(|v| seen.insert(v.clone()));
    }
    if values.is_empty() {
        return Ok(func.empty_value());
    }
    match func {
        AggregateFunc::Count => Ok(Value::Int(i64::try_from(values.len()).unwrap_or(i64::MAX))),
        AggregateFunc::Sum => sum(&values),
        AggregateFunc::Avg => {
            let total = sum(&values)?.as_f64().unwrap_or(0.0);
            Ok(Value::Float(total / values.len() as f64))
        }
        AggregateFunc::Min => Ok(values
            .into_iter()
            .reduce(|a, b| if b.partial_cmp(&a) == Some(Ordering::Less) { b } else { a })
            .unwrap_or(Value::Null)),
        AggregateFunc::Max => Ok(values
            .into_iter()
            .reduce(|a, b| if b.partial_cmp(&a) == Some(Ordering::Greater) { b } else { a })
            .unwrap_or(Value::Null)),
    }
}

fn sum(values: &[Value]) -> OrmResult<Value> {
    if values.iter().all(|v| matches!(v, Value::Int(_))) {
        return values
            .iter()
            .try_fold(0_i64, |acc, v| acc.checked_add(v.as_int().unwrap_or(0)))
            .map(Value::Int)
            .ok_or_else(|| OrmError::DatabaseError("integer overflow in SUM".to_string()));
    }
    let mut total = 0.0;
    for v in values {
        total += v
            .as_f64()
            .ok_or_else(|| OrmError::DatabaseError(format!("cannot sum non-numeric value {v}")))?;
    }
    Ok(Value::Float(total))
}

fn scalar_func(name: &str, args: Vec<Value>) -> OrmResult<Value> {
    let first = args.first().cloned().unwrap_or(Value::Null);
    match name.to_uppercase().as_str() {
        "LOWER" | "UPPER" | "LENGTH" if first.is_null() => Ok(Value::Null),
        "LOWER" => Ok(Value::String(first.to_string().to_lowercase())),
        "UPPER" => Ok(Value::String(first.to_string().to_uppercase())),
        "LENGTH" => Ok(Value::Int(
            i64::try_from(first.to_string().chars().count()).unwrap_or(i64::MAX),
        )),
        "COALESCE" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "CONCAT" => Ok(Value::String(
            args.iter()
                .filter(|v| !v.is_null())
                .map(ToString::to_string)
                .collect(),
        )),
        "ABS" => match first {
            Value::Int(i) => Ok(Value::Int(i.abs())),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            Value::Null => Ok(Value::Null),
            other => Err(OrmError::DatabaseError(format!("ABS() of non-numeric value {other}"))),
        },
        other => Err(OrmError::NotSupported(format!("Unknown function {other}()"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

fn arith(op: Op, left: Value, right: Value) -> OrmResult<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
        let result = match op {
            Op::Add => a.checked_add(*b),
            Op::Sub => a.checked_sub(*b),
            Op::Mul => a.checked_mul(*b),
            Op::Div => None,
        };
        if let Some(v) = result {
            return Ok(Value::Int(v));
        }
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Err(OrmError::DatabaseError(format!(
            "unsupported operand types: {left} and {right}"
        )));
    };
    match op {
        Op::Add => Ok(Value::Float(a + b)),
        Op::Sub => Ok(Value::Float(a - b)),
        Op::Mul => Ok(Value::Float(a * b)),
        Op::Div if b == 0.0 => Err(OrmError::DatabaseError("division by zero".to_string())),
        Op::Div => Ok(Value::Float(a / b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_ignores_nulls() {
        let values = vec![Value::Int(2), Value::Null, Value::Int(3)];
        assert_eq!(aggregate(AggregateFunc::Sum, values.clone(), false).unwrap(), Value::Int(5));
        assert_eq!(aggregate(AggregateFunc::Count, values, false).unwrap(), Value::Int(2));
        assert_eq!(aggregate(AggregateFunc::Sum, vec![], false).unwrap(), Value::Null);
        assert_eq!(aggregate(AggregateFunc::Count, vec![], false).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_aggregate_distinct_and_extremes() {
        let values = vec![Value::Int(4), Value::Int(4), Value::Int(1)];
        assert_eq!(aggregate(AggregateFunc::Count, values.clone(), true).unwrap(), Value::Int(2));
        assert_eq!(aggregate(AggregateFunc::Min, values.clone(), false).unwrap(), Value::Int(1));
        assert_eq!(aggregate(AggregateFunc::Max, values.clone(), false).unwrap(), Value::Int(4));
        assert_eq!(aggregate(AggregateFunc::Avg, values, false).unwrap(), Value::Float(3.0));
    }

    #[test]
    fn test_arith() {
        assert_eq!(arith(Op::Add, Value::Int(2), Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(arith(Op::Mul, Value::Int(2), Value::Float(1.5)).unwrap(), Value::Float(3.0));
        assert_eq!(arith(Op::Div, Value::Int(3), Value::Int(2)).unwrap(), Value::Float(1.5));
        assert_eq!(arith(Op::Sub, Value::Null, Value::Int(1)).unwrap(), Value::Null);
        assert!(arith(Op::Div, Value::Int(1), Value::Int(0)).is_err());
    }

    #[test]
    fn test_scalar_functions() {
        assert_eq!(scalar_func("lower", vec![Value::from("AbC")]).unwrap(), Value::from("abc"));
        assert_eq!(scalar_func("LENGTH", vec![Value::from("four")]).unwrap(), Value::Int(4));
        assert_eq!(
            scalar_func("COALESCE", vec![Value::Null, Value::Int(7)]).unwrap(),
            Value::Int(7)
        );
        assert_eq!(
            scalar_func("CONCAT", vec![Value::from("a"), Value::Null, Value::Int(1)]).unwrap(),
            Value::from("a1")
        );
        assert!(scalar_func("NOPE", vec![]).is_err());
    }

    #[test]
    fn test_compare_keys_nulls_placement() {
        let asc = [OrderBy::asc(Expression::col("x"))];
        assert_eq!(compare_keys(&asc, &[Value::Null], &[Value::Int(1)]), Ordering::Less);
        let desc = [OrderBy::desc(Expression::col("x"))];
        assert_eq!(compare_keys(&desc, &[Value::Null], &[Value::Int(1)]), Ordering::Greater);
        let asc_last = [OrderBy::asc(Expression::col("x")).nulls_last()];
        assert_eq!(compare_keys(&asc_last, &[Value::Null], &[Value::Int(1)]), Ordering::Greater);
        assert_eq!(compare_keys(&desc, &[Value::Int(2)], &[Value::Int(1)]), Ordering::Less);
    }
}
