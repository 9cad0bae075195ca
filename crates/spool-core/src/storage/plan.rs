//! Query compilation.
//!
//! A [`Query`](crate::query::Query) is turned into an access path over the
//! redb tables plus residual filters that are checked against decoded rows.
//! Predicate values stay typed from end to end; the only "tokens" a plan
//! carries are the closed sort enums.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::query::{Predicate, Sort, SortField, SortOrder};
use crate::storage::StorageOptions;
use crate::types::Record;

/// Where candidate ids come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Access {
    /// Every row, in id order
    Scan,
    /// Ids listed under one kind in the index
    Kind(String),
    /// Point lookups
    Ids(BTreeSet<u64>),
    /// Provably empty (e.g. an empty id list)
    Nothing,
}

/// Filter applied to rows produced by the access path
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Residual {
    Kind(String),
    CreatedBefore(i64),
}

impl Residual {
    fn matches(&self, record: &Record) -> bool {
        match self {
            Residual::Kind(kind) => record.kind == *kind,
            Residual::CreatedBefore(cutoff) => record.created_at < *cutoff,
        }
    }
}

/// Resolved output order
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RowOrder {
    /// Id order; rows can be streamed and cut off at the limit
    Id(SortOrder),
    /// General clause list; rows are collected, sorted, then cut
    Clauses(Vec<Sort>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueryPlan {
    pub access: Access,
    pub residual: Vec<Residual>,
    pub order: RowOrder,
    pub limit: Option<usize>,
}

impl QueryPlan {
    /// Compile predicates, sort clauses and limit. `now` is unix millis and
    /// anchors every age predicate in the plan.
    pub fn compile(
        predicates: &[Predicate],
        sort: &[Sort],
        limit: Option<usize>,
        options: &StorageOptions,
        now: i64,
    ) -> Self {
        let mut access = Access::Scan;
        let mut residual = Vec::new();

        for predicate in predicates {
            match predicate {
                Predicate::OfType(kind) => match access {
                    Access::Scan => access = Access::Kind(kind.clone()),
                    _ => residual.push(Residual::Kind(kind.clone())),
                },
                Predicate::WithIds(ids) => {
                    let ids: BTreeSet<u64> = ids.iter().map(|id| id.0).collect();
                    access = match access {
                        Access::Nothing => Access::Nothing,
                        _ if ids.is_empty() => Access::Nothing,
                        Access::Scan => Access::Ids(ids),
                        Access::Kind(kind) => {
                            residual.push(Residual::Kind(kind));
                            Access::Ids(ids)
                        }
                        Access::Ids(existing) => {
                            let both: BTreeSet<u64> = existing.intersection(&ids).copied().collect();
                            if both.is_empty() {
                                Access::Nothing
                            } else {
                                Access::Ids(both)
                            }
                        }
                    };
                }
                Predicate::WithAge(max_age) => {
                    let age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
                    residual.push(Residual::CreatedBefore(now.saturating_sub(age)));
                }
            }
        }

        Self {
            access,
            residual,
            order: resolve_order(sort, options),
            limit,
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.residual.iter().all(|r| r.matches(record))
    }

    /// True when rows come out of the access path already in final order
    pub fn streams(&self) -> bool {
        matches!(self.order, RowOrder::Id(_))
    }

    /// Sort collected rows by the plan's clauses. Ties fall back to id
    /// ascending, which is storage order.
    pub fn sort(&self, rows: &mut [Record]) {
        if let RowOrder::Clauses(clauses) = &self.order {
            rows.sort_by(|a, b| compare(clauses, a, b));
        }
    }
}

fn resolve_order(sort: &[Sort], options: &StorageOptions) -> RowOrder {
    if let Some(order) = options.id_order {
        return RowOrder::Id(order);
    }
    match sort.first() {
        None => RowOrder::Id(SortOrder::Ascending),
        // Ids are unique, so clauses after an id clause never matter
        Some(Sort {
            field: SortField::Id,
            order,
        }) => RowOrder::Id(*order),
        Some(_) => RowOrder::Clauses(sort.to_vec()),
    }
}

fn compare(clauses: &[Sort], a: &Record, b: &Record) -> Ordering {
    for clause in clauses {
        let ord = match clause.field {
            SortField::Id => a.id.cmp(&b.id),
            SortField::Priority => a.priority.cmp(&b.priority),
        };
        let ord = match clause.order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.id.cmp(&b.id)
}
