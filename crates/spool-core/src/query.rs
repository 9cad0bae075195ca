//! Record query model: predicates, sort clauses and count limits.
//!
//! A [`Query`] is built fresh for every select and never persisted. All of
//! its parts are closed, typed values; [`Storage`](crate::Storage)
//! compiles them into a plan over its tables without ever turning a
//! caller value into query text.
//!
//! ```ignore
//! use spool_core::query::{Predicate, Query, Sort};
//!
//! let query = Query::new()
//!     .filter(Predicate::of_type("clicks"))
//!     .sort_by(Sort::priority_desc())
//!     .sort_by(Sort::id_asc())
//!     .limit(100);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::RecordId;

/// A single record filter. Multiple predicates are combined with AND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Records whose kind equals the given value
    OfType(String),
    /// Records whose id is in the list; an empty list matches nothing
    WithIds(Vec<RecordId>),
    /// Records created strictly more than `max_age` ago
    WithAge(Duration),
}

impl Predicate {
    pub fn of_type(kind: impl Into<String>) -> Self {
        Predicate::OfType(kind.into())
    }

    pub fn with_ids(ids: impl IntoIterator<Item = RecordId>) -> Self {
        Predicate::WithIds(ids.into_iter().collect())
    }

    pub fn with_age(max_age: Duration) -> Self {
        Predicate::WithAge(max_age)
    }
}

/// Column a sort clause orders by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Id,
    Priority,
}

/// Direction of a sort clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// One sort clause; a query applies its clauses in sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sort {
    pub field: SortField,
    pub order: SortOrder,
}

impl Sort {
    pub fn new(field: SortField, order: SortOrder) -> Self {
        Self { field, order }
    }

    pub fn id_asc() -> Self {
        Self::new(SortField::Id, SortOrder::Ascending)
    }

    pub fn id_desc() -> Self {
        Self::new(SortField::Id, SortOrder::Descending)
    }

    pub fn priority_desc() -> Self {
        Self::new(SortField::Priority, SortOrder::Descending)
    }
}

/// Predicates, sort clauses and an optional count limit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub predicates: Vec<Predicate>,
    pub sort: Vec<Sort>,
    pub limit: Option<usize>,
}

impl Query {
    /// An unconstrained query: every record, storage order, no limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a predicate (AND-ed with the existing ones)
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// Append a sort clause after the existing ones
    pub fn sort_by(mut self, sort: Sort) -> Self {
        self.sort.push(sort);
        self
    }

    /// Replace the sort clauses
    pub fn with_sort(mut self, sort: impl IntoIterator<Item = Sort>) -> Self {
        self.sort = sort.into_iter().collect();
        self
    }

    /// Return at most `count` records
    pub fn limit(mut self, count: usize) -> Self {
        self.limit = Some(count);
        self
    }
}
