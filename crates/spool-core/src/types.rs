//! Core types for Spool

use serde::{Deserialize, Serialize};

/// Identifier of a stored record
///
/// Assigned by [`Storage`](crate::Storage) on insert from a persisted
/// sequence. Ids grow monotonically and are never reused, even after the
/// record they named has been deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub u64);

impl RecordId {
    /// Get the raw sequence value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rec_{}", self.0)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A buffered log event as stored on disk
///
/// Records are immutable once written and only disappear through an
/// explicit delete (delivery acknowledgement, purge, truncate, clear).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Storage-assigned id
    pub id: RecordId,
    /// Log category; each buffered output is scoped to exactly one kind
    pub kind: String,
    /// Opaque serialized event
    pub payload: String,
    /// Unix timestamp in milliseconds at insert time
    pub created_at: i64,
    /// Ordering hint, higher is more urgent
    pub priority: i32,
}

/// An ordered set of records produced by a select
///
/// Read-only once produced. The payload view is what a sink receives and
/// the id list is what gets deleted once the sink acknowledges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordBatch {
    records: Vec<Record>,
}

impl RecordBatch {
    pub(crate) fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Number of records in the batch
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the select matched nothing
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in select order
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Iterate the records in select order
    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// All payloads, in select order
    pub fn payloads(&self) -> Vec<String> {
        self.records.iter().map(|r| r.payload.clone()).collect()
    }

    /// All record ids, in select order
    pub fn ids(&self) -> Vec<RecordId> {
        self.records.iter().map(|r| r.id).collect()
    }
}

impl IntoIterator for RecordBatch {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a RecordBatch {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Current wall-clock time as unix milliseconds
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
