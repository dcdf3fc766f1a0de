//! Query building: lookups, expressions and the lazy [`QuerySet`].

pub mod expressions;
pub mod lookups;
pub mod queryset;

pub use expressions::{AggregateFunc, Expression, Subquery, When};
pub use lookups::{Lookup, Q};
pub use queryset::{NullsOrder, OrderBy, QuerySet, SelectColumn};
