//! Query expressions, aggregates, and correlated subqueries.
//!
//! [`Expression`] values are used as annotations, schema expression fields,
//! and order targets.
//!
//! # Examples
//!
//! ```
//! use schema_orm_db::query::expressions::{AggregateFunc, Expression};
//!
//! // views * 2
//! let expr = Expression::col("views") * Expression::value(2);
//!
//! // Sum("articles.views")
//! let total = Expression::aggregate(AggregateFunc::Sum, Expression::col("articles.views"));
//! assert!(total.contains_aggregate());
//! ```

use crate::query::lookups::Q;
use crate::query::queryset::QuerySet;
use crate::value::Value;
use std::ops;

/// A query expression that produces a value per row.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A column reference, possibly a dotted relation path.
    Col(String),
    /// A literal value.
    Value(Value),
    /// A scalar function call (`LOWER`, `UPPER`, `LENGTH`, `COALESCE`, `CONCAT`, `ABS`).
    Func {
        /// Function name.
        name: String,
        /// Function arguments.
        args: Vec<Expression>,
    },
    /// An aggregate over the values an expression takes across related rows.
    Aggregate {
        /// The aggregate operation.
        func: AggregateFunc,
        /// The expression being aggregated.
        field: Box<Expression>,
        /// Whether to apply DISTINCT.
        distinct: bool,
        /// Optional FILTER clause, written against the owning model.
        filter: Option<Box<Q>>,
    },
    /// A CASE ... WHEN ... THEN ... ELSE ... END expression.
    Case {
        /// The WHEN/THEN branches.
        whens: Vec<When>,
        /// The ELSE value.
        default: Option<Box<Expression>>,
    },
    /// A subquery evaluated once per outer row.
    Subquery(Box<Subquery>),
    /// Addition.
    Add(Box<Expression>, Box<Expression>),
    /// Subtraction.
    Sub(Box<Expression>, Box<Expression>),
    /// Multiplication.
    Mul(Box<Expression>, Box<Expression>),
    /// Division.
    Div(Box<Expression>, Box<Expression>),
}

/// Aggregate function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    /// COUNT.
    Count,
    /// SUM.
    Sum,
    /// AVG.
    Avg,
    /// MIN.
    Min,
    /// MAX.
    Max,
}

impl AggregateFunc {
    /// Returns the SQL function name for this aggregate.
    pub const fn sql_name(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

    /// The value an empty input set aggregates to.
    pub fn empty_value(&self) -> Value {
        match self {
            Self::Count => Value::Int(0),
            _ => Value::Null,
        }
    }
}

/// A single WHEN/THEN branch in a CASE expression.
#[derive(Debug, Clone)]
pub struct When {
    /// The condition for this branch.
    pub condition: Q,
    /// The value to return when the condition is met.
    pub then: Expression,
}

/// A correlated subquery.
///
/// For every outer row, the inner `queryset` is restricted to rows whose
/// `link` path equals the outer row's `outer` column, and `value` (usually an
/// aggregate over inner columns) is evaluated over that restricted set.
#[derive(Debug, Clone)]
pub struct Subquery {
    /// The inner queryset.
    pub queryset: QuerySet,
    /// Path on the inner model that points back to the outer row.
    pub link: String,
    /// Column on the outer row the link is compared against.
    pub outer: String,
    /// The expression evaluated over the restricted inner rows.
    pub value: Expression,
}

impl Expression {
    /// Creates a column reference expression.
    pub fn col(name: impl Into<String>) -> Self {
        Self::Col(name.into())
    }

    /// Creates a literal value expression.
    pub fn value(v: impl Into<Value>) -> Self {
        Self::Value(v.into())
    }

    /// Creates a function call expression.
    pub fn func(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Self::Func {
            name: name.into(),
            args,
        }
    }

    /// Creates an aggregate expression.
    pub fn aggregate(func: AggregateFunc, field: Expression) -> Self {
        Self::Aggregate {
            func,
            field: Box::new(field),
            distinct: false,
            filter: None,
        }
    }

    /// Creates an aggregate with DISTINCT.
    pub fn aggregate_distinct(func: AggregateFunc, field: Expression) -> Self {
        Self::Aggregate {
            func,
            field: Box::new(field),
            distinct: true,
            filter: None,
        }
    }

    /// Creates a CASE expression.
    pub fn case(whens: Vec<When>, default: Option<Expression>) -> Self {
        Self::Case {
            whens,
            default: default.map(Box::new),
        }
    }

    /// Creates a correlated subquery expression.
    pub fn subquery(
        queryset: QuerySet,
        link: impl Into<String>,
        outer: impl Into<String>,
        value: Expression,
    ) -> Self {
        Self::Subquery(Box::new(Subquery {
            queryset,
            link: link.into(),
            outer: outer.into(),
            value,
        }))
    }

    /// Returns `true` if an aggregate appears anywhere outside a subquery.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Col(_) | Self::Value(_) | Self::Subquery(_) => false,
            Self::Func { args, .. } => args.iter().any(Self::contains_aggregate),
            Self::Case { whens, default } => {
                whens.iter().any(|w| w.then.contains_aggregate())
                    || default.as_ref().is_some_and(|d| d.contains_aggregate())
            }
            Self::Add(l, r) | Self::Sub(l, r) | Self::Mul(l, r) | Self::Div(l, r) => {
                l.contains_aggregate() || r.contains_aggregate()
            }
        }
    }

    /// Returns every column path referenced outside subqueries.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Col(path) => out.push(path),
            Self::Value(_) => {}
            Self::Subquery(sub) => out.push(&sub.outer),
            Self::Func { args, .. } => {
                for arg in args {
                    arg.collect_columns(out);
                }
            }
            Self::Aggregate { field, filter, .. } => {
                field.collect_columns(out);
                if let Some(filter) = filter {
                    out.extend(filter.fields());
                }
            }
            Self::Case { whens, default } => {
                for when in whens {
                    out.extend(when.condition.fields());
                    when.then.collect_columns(out);
                }
                if let Some(default) = default {
                    default.collect_columns(out);
                }
            }
            Self::Add(l, r) | Self::Sub(l, r) | Self::Mul(l, r) | Self::Div(l, r) => {
                l.collect_columns(out);
                r.collect_columns(out);
            }
        }
    }
}

impl ops::Add for Expression {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self::Add(Box::new(self), Box::new(rhs))
    }
}

impl ops::Sub for Expression {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self::Sub(Box::new(self), Box::new(rhs))
    }
}

impl ops::Mul for Expression {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Self::Mul(Box::new(self), Box::new(rhs))
    }
}

impl ops::Div for Expression {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        Self::Div(Box::new(self), Box::new(rhs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::lookups::Lookup;

    #[test]
    fn test_col_expression() {
        let expr = Expression::col("name");
        assert!(matches!(expr, Expression::Col(ref s) if s == "name"));
    }

    #[test]
    fn test_aggregate_expression() {
        let expr = Expression::aggregate(AggregateFunc::Count, Expression::col("id"));
        if let Expression::Aggregate {
            func,
            distinct,
            filter,
            ..
        } = &expr
        {
            assert_eq!(*func, AggregateFunc::Count);
            assert!(!distinct);
            assert!(filter.is_none());
        } else {
            panic!("Expected Aggregate");
        }
    }

    #[test]
    fn test_contains_aggregate_through_arithmetic() {
        let expr = Expression::aggregate(AggregateFunc::Sum, Expression::col("articles.views"))
            + Expression::value(1);
        assert!(expr.contains_aggregate());
        assert!(!(Expression::col("a") * Expression::col("b")).contains_aggregate());
    }

    #[test]
    fn test_columns_collects_paths() {
        let when = When {
            condition: Q::filter("status", Lookup::Exact(Value::from("active"))),
            then: Expression::col("score"),
        };
        let expr = Expression::case(vec![when], Some(Expression::col("fallback")));
        assert_eq!(expr.columns(), vec!["status", "score", "fallback"]);
    }

    #[test]
    fn test_aggregate_func_sql_names() {
        assert_eq!(AggregateFunc::Count.sql_name(), "COUNT");
        assert_eq!(AggregateFunc::Sum.sql_name(), "SUM");
        assert_eq!(AggregateFunc::Avg.sql_name(), "AVG");
        assert_eq!(AggregateFunc::Count.empty_value(), Value::Int(0));
        assert_eq!(AggregateFunc::Max.empty_value(), Value::Null);
    }

    #[test]
    fn test_chained_arithmetic() {
        let expr = (Expression::col("price") * Expression::col("quantity"))
            - Expression::col("discount");
        assert!(matches!(expr, Expression::Sub(_, _)));
    }
}
