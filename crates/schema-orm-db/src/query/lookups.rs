//! Query lookups and Q objects for building filters.
//!
//! This module provides the [`Lookup`] enum for field-level comparisons and
//! the [`Q`] enum for combining filters with AND, OR, and NOT operators.
//! Field names are dotted relation paths (`author.username`); a path that
//! crosses a to-many relation matches when any related value matches.
//!
//! # Examples
//!
//! ```
//! use schema_orm_db::query::lookups::{Q, Lookup};
//! use schema_orm_db::value::Value;
//!
//! // Simple filter: username = "alice"
//! let q = Q::filter("username", Lookup::Exact(Value::from("alice")));
//!
//! // Combining with AND: username = "alice" AND age > 25
//! let combined = q & Q::filter("age", Lookup::Gt(Value::from(25)));
//!
//! // NOT: NOT(active = false)
//! let negated = !Q::filter("active", Lookup::Exact(Value::from(false)));
//! ```

use crate::value::Value;
use std::ops;

/// A field-level lookup operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Exact match (`field = value`). `Exact(Null)` behaves like `IsNull(true)`.
    Exact(Value),
    /// Case-insensitive exact match.
    IExact(Value),
    /// Substring match.
    Contains(String),
    /// Case-insensitive substring match.
    IContains(String),
    /// Membership test (`field IN (values...)`).
    In(Vec<Value>),
    /// Greater than.
    Gt(Value),
    /// Greater than or equal.
    Gte(Value),
    /// Less than.
    Lt(Value),
    /// Less than or equal.
    Lte(Value),
    /// Prefix match.
    StartsWith(String),
    /// Case-insensitive prefix match.
    IStartsWith(String),
    /// Suffix match.
    EndsWith(String),
    /// Case-insensitive suffix match.
    IEndsWith(String),
    /// Inclusive range test.
    Range(Value, Value),
    /// NULL test (`field IS NULL` or `field IS NOT NULL`).
    IsNull(bool),
}

impl Lookup {
    /// Evaluates this lookup against a single value.
    ///
    /// Comparisons against `NULL` are false, as in SQL, except for
    /// `IsNull` and `Exact(Null)`.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::IsNull(expected) => value.is_null() == *expected,
            Self::Exact(Value::Null) => value.is_null(),
            _ if value.is_null() => false,
            Self::Exact(v) => value.partial_cmp(v) == Some(std::cmp::Ordering::Equal),
            Self::IExact(v) => match (value.as_str(), v.as_str()) {
                (Some(a), Some(b)) => a.to_lowercase() == b.to_lowercase(),
                _ => value == v,
            },
            Self::Contains(s) => text(value).is_some_and(|t| t.contains(s.as_str())),
            Self::IContains(s) => {
                text(value).is_some_and(|t| t.to_lowercase().contains(&s.to_lowercase()))
            }
            Self::In(values) => values
                .iter()
                .any(|v| value.partial_cmp(v) == Some(std::cmp::Ordering::Equal)),
            Self::Gt(v) => value.partial_cmp(v) == Some(std::cmp::Ordering::Greater),
            Self::Gte(v) => matches!(
                value.partial_cmp(v),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            ),
            Self::Lt(v) => value.partial_cmp(v) == Some(std::cmp::Ordering::Less),
            Self::Lte(v) => matches!(
                value.partial_cmp(v),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            ),
            Self::StartsWith(s) => text(value).is_some_and(|t| t.starts_with(s.as_str())),
            Self::IStartsWith(s) => {
                text(value).is_some_and(|t| t.to_lowercase().starts_with(&s.to_lowercase()))
            }
            Self::EndsWith(s) => text(value).is_some_and(|t| t.ends_with(s.as_str())),
            Self::IEndsWith(s) => {
                text(value).is_some_and(|t| t.to_lowercase().ends_with(&s.to_lowercase()))
            }
            Self::Range(low, high) => {
                Self::Gte(low.clone()).matches(value) && Self::Lte(high.clone()).matches(value)
            }
        }
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// A composable query filter.
///
/// `Q` objects can be combined using `&` (AND), `|` (OR), and `!` (NOT).
#[derive(Debug, Clone, PartialEq)]
pub enum Q {
    /// A single field lookup.
    Filter {
        /// The field name or dotted relation path.
        field: String,
        /// The lookup operation.
        lookup: Lookup,
    },
    /// Logical AND of multiple conditions.
    And(Vec<Q>),
    /// Logical OR of multiple conditions.
    Or(Vec<Q>),
    /// Logical negation of a condition.
    Not(Box<Q>),
}

impl Q {
    /// Creates a new filter Q object.
    pub fn filter(field: impl Into<String>, lookup: Lookup) -> Self {
        Self::Filter {
            field: field.into(),
            lookup,
        }
    }

    /// A condition that matches every row (an empty AND).
    pub const fn all() -> Self {
        Self::And(Vec::new())
    }

    /// Returns `true` if this is an empty AND/OR.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(children) | Self::Or(children) => children.is_empty(),
            _ => false,
        }
    }

    /// Returns every field path referenced by this condition.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Filter { field, .. } => out.push(field),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_fields(out);
                }
            }
            Self::Not(inner) => inner.collect_fields(out),
        }
    }

    /// Rewrites every field path by prefixing it with `prefix.`.
    ///
    /// Used to re-anchor a condition written against a related model onto
    /// the owning model.
    #[must_use]
    pub fn prefixed(self, prefix: &str) -> Self {
        match self {
            Self::Filter { field, lookup } => Self::Filter {
                field: format!("{prefix}.{field}"),
                lookup,
            },
            Self::And(children) => {
                Self::And(children.into_iter().map(|c| c.prefixed(prefix)).collect())
            }
            Self::Or(children) => {
                Self::Or(children.into_iter().map(|c| c.prefixed(prefix)).collect())
            }
            Self::Not(inner) => Self::Not(Box::new(inner.prefixed(prefix))),
        }
    }
}

impl ops::BitAnd for Q {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            // Flatten nested ANDs
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (other, Self::And(mut right)) => {
                right.insert(0, other);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }
}

impl ops::BitOr for Q {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            // Flatten nested ORs
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (other, Self::Or(mut right)) => {
                right.insert(0, other);
                Self::Or(right)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }
}

impl ops::Not for Q {
    type Output = Self;

    fn not(self) -> Self::Output {
        // Double negation cancellation
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_filter() {
        let q = Q::filter("name", Lookup::Exact(Value::from("Alice")));
        match &q {
            Q::Filter { field, lookup } => {
                assert_eq!(field, "name");
                assert_eq!(*lookup, Lookup::Exact(Value::String("Alice".to_string())));
            }
            _ => panic!("Expected Filter"),
        }
    }

    #[test]
    fn test_and_flattening() {
        let q1 = Q::filter("a", Lookup::Exact(Value::from(1)));
        let q2 = Q::filter("b", Lookup::Exact(Value::from(2)));
        let q3 = Q::filter("c", Lookup::Exact(Value::from(3)));
        let combined = (q1 & q2) & q3;
        match &combined {
            Q::And(children) => assert_eq!(children.len(), 3),
            _ => panic!("Expected And with 3 children"),
        }
    }

    #[test]
    fn test_or_flattening() {
        let q1 = Q::filter("a", Lookup::Exact(Value::from(1)));
        let q2 = Q::filter("b", Lookup::Exact(Value::from(2)));
        let q3 = Q::filter("c", Lookup::Exact(Value::from(3)));
        let combined = (q1 | q2) | q3;
        match &combined {
            Q::Or(children) => assert_eq!(children.len(), 3),
            _ => panic!("Expected Or with 3 children"),
        }
    }

    #[test]
    fn test_double_negation() {
        let q = Q::filter("active", Lookup::Exact(Value::from(true)));
        let double_neg = !!q.clone();
        assert_eq!(double_neg, q);
    }

    #[test]
    fn test_and_with_empty_all() {
        let q = Q::all() & Q::filter("a", Lookup::IsNull(true));
        match &q {
            Q::And(children) => assert_eq!(children.len(), 1),
            _ => panic!("Expected And"),
        }
        assert!(Q::all().is_empty());
    }

    #[test]
    fn test_fields_and_prefixed() {
        let q = Q::filter("a", Lookup::IsNull(true)) | !Q::filter("b.c", Lookup::Gt(Value::Int(1)));
        assert_eq!(q.fields(), vec!["a", "b.c"]);
        let prefixed = q.prefixed("author");
        assert_eq!(prefixed.fields(), vec!["author.a", "author.b.c"]);
    }

    #[test]
    fn test_lookup_matches_comparisons() {
        assert!(Lookup::Exact(Value::Int(3)).matches(&Value::Int(3)));
        assert!(Lookup::Exact(Value::Int(3)).matches(&Value::Float(3.0)));
        assert!(Lookup::Gt(Value::Int(3)).matches(&Value::Int(4)));
        assert!(!Lookup::Gt(Value::Int(3)).matches(&Value::Null));
        assert!(Lookup::Lte(Value::Int(3)).matches(&Value::Int(3)));
        assert!(Lookup::Range(Value::Int(1), Value::Int(5)).matches(&Value::Int(5)));
        assert!(Lookup::In(vec![Value::Int(1), Value::Int(2)]).matches(&Value::Int(2)));
        assert!(!Lookup::In(vec![]).matches(&Value::Int(2)));
    }

    #[test]
    fn test_lookup_matches_text_and_null() {
        assert!(Lookup::IContains("LIC".into()).matches(&Value::from("alice")));
        assert!(Lookup::StartsWith("al".into()).matches(&Value::from("alice")));
        assert!(Lookup::IEndsWith("CE".into()).matches(&Value::from("alice")));
        assert!(Lookup::IExact(Value::from("ALICE")).matches(&Value::from("alice")));
        assert!(Lookup::IsNull(true).matches(&Value::Null));
        assert!(Lookup::Exact(Value::Null).matches(&Value::Null));
        assert!(!Lookup::IsNull(true).matches(&Value::Int(0)));
    }
}
