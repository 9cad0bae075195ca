//! Record operations: insert, select, delete, truncate, purge.

use std::time::Duration;

use redb::{
    AccessGuard, ReadableMultimapTable, ReadableTable, ReadableTableMetadata, StorageError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::SpoolError;
use crate::query::{Predicate, Query, SortOrder};
use crate::storage::plan::{Access, RowOrder};
use crate::types::{now_millis, Record, RecordBatch, RecordId};

use super::{QueryPlan, Storage, LAST_RECORD_ID_KEY, META_TABLE, RECORDS_BY_KIND, RECORDS_TABLE};

/// On-disk row. Columns added after the first layout carry defaults.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRow {
    kind: String,
    payload: String,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    priority: i32,
}

pub(super) fn encode_row(
    kind: &str,
    payload: &str,
    created_at: i64,
    priority: i32,
) -> Result<Vec<u8>, SpoolError> {
    let row = StoredRow {
        kind: kind.to_string(),
        payload: payload.to_string(),
        created_at,
        priority,
    };
    serde_json::to_vec(&row).map_err(|e| SpoolError::Serialization(e.to_string()))
}

pub(super) fn decode_row(id: u64, bytes: &[u8]) -> Result<Record, SpoolError> {
    let row: StoredRow = serde_json::from_slice(bytes)
        .map_err(|e| SpoolError::Serialization(format!("record {}: {}", id, e)))?;
    Ok(Record {
        id: RecordId(id),
        kind: row.kind,
        payload: row.payload,
        created_at: row.created_at,
        priority: row.priority,
    })
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Writes
    // ═══════════════════════════════════════════════════════════════════════

    /// Append a record with priority 0.
    pub fn insert(&self, kind: &str, payload: &str) -> Result<RecordId, SpoolError> {
        self.insert_with_priority(kind, payload, 0)
    }

    /// Append a record. The id comes from the persisted sequence and the
    /// creation time from the wall clock.
    pub fn insert_with_priority(
        &self,
        kind: &str,
        payload: &str,
        priority: i32,
    ) -> Result<RecordId, SpoolError> {
        self.insert_at(kind, payload, priority, now_millis())
    }

    pub(crate) fn insert_at(
        &self,
        kind: &str,
        payload: &str,
        priority: i32,
        created_at: i64,
    ) -> Result<RecordId, SpoolError> {
        let data = encode_row(kind, payload, created_at, priority)?;

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let id = {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let id = meta.get(LAST_RECORD_ID_KEY)?.map(|v| v.value()).unwrap_or(0) + 1;
            meta.insert(LAST_RECORD_ID_KEY, id)?;

            let mut rows = write_txn.open_table(RECORDS_TABLE)?;
            rows.insert(id, data.as_slice())?;

            let mut by_kind = write_txn.open_multimap_table(RECORDS_BY_KIND)?;
            by_kind.insert(kind, id)?;
            id
        };
        write_txn.commit()?;
        Ok(RecordId(id))
    }

    /// Delete every record matching all predicates.
    ///
    /// Returns the number of records removed. An empty predicate list
    /// deletes nothing (use [`clear`](Self::clear) to empty the store), and
    /// so does an empty id list.
    pub fn delete(&self, predicates: &[Predicate]) -> Result<usize, SpoolError> {
        if predicates.is_empty() {
            return Ok(0);
        }
        let plan = QueryPlan::compile(predicates, &[], None, &Default::default(), now_millis());
        if plan.access == Access::Nothing {
            return Ok(0);
        }

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let removed = {
            let mut rows = write_txn.open_table(RECORDS_TABLE)?;
            let mut by_kind = write_txn.open_multimap_table(RECORDS_BY_KIND)?;
            let doomed = collect(&rows, &by_kind, &plan)?;
            for record in &doomed {
                rows.remove(record.id.0)?;
                by_kind.remove(record.kind.as_str(), record.id.0)?;
            }
            doomed.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            debug!(removed, "Deleted records");
        }
        Ok(removed)
    }

    /// Delete exactly the records of a previously selected batch.
    pub fn delete_batch(&self, batch: &RecordBatch) -> Result<usize, SpoolError> {
        self.delete(&[Predicate::WithIds(batch.ids())])
    }

    /// Delete records of `kind` created strictly more than `max_age` ago.
    pub fn purge(&self, kind: &str, max_age: Duration) -> Result<usize, SpoolError> {
        self.delete(&[Predicate::of_type(kind), Predicate::with_age(max_age)])
    }

    /// Keep at most `max_records` records, dropping the lowest ids first.
    ///
    /// Returns the number of records dropped.
    pub fn truncate(&self, max_records: usize) -> Result<usize, SpoolError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let dropped = {
            let mut rows = write_txn.open_table(RECORDS_TABLE)?;
            let count = rows.len()? as usize;
            if count <= max_records {
                return Ok(0);
            }
            let excess = count - max_records;

            let mut doomed = Vec::with_capacity(excess);
            for entry in rows.iter()?.take(excess) {
                let (key, value) = entry?;
                doomed.push(decode_row(key.value(), value.value())?);
            }

            let mut by_kind = write_txn.open_multimap_table(RECORDS_BY_KIND)?;
            for record in &doomed {
                rows.remove(record.id.0)?;
                by_kind.remove(record.kind.as_str(), record.id.0)?;
            }
            doomed.len()
        };
        write_txn.commit()?;

        info!(dropped, max_records, "Truncated buffered records");
        Ok(dropped)
    }

    /// Delete every record. The id sequence is kept, so ids are never
    /// handed out twice.
    pub fn clear(&self) -> Result<usize, SpoolError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let cleared = {
            let rows = write_txn.open_table(RECORDS_TABLE)?;
            rows.len()? as usize
        };
        write_txn.delete_table(RECORDS_TABLE)?;
        write_txn.delete_multimap_table(RECORDS_BY_KIND)?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
            let _ = write_txn.open_multimap_table(RECORDS_BY_KIND)?;
        }
        write_txn.commit()?;

        debug!(cleared, "Cleared storage");
        Ok(cleared)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Reads
    // ═══════════════════════════════════════════════════════════════════════

    /// Records matching all predicates of `query`, ordered by its sort
    /// clauses and cut to its limit.
    pub fn select(&self, query: &Query) -> Result<RecordBatch, SpoolError> {
        let plan = QueryPlan::compile(
            &query.predicates,
            &query.sort,
            query.limit,
            self.options(),
            now_millis(),
        );

        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let rows = read_txn.open_table(RECORDS_TABLE)?;
        let by_kind = read_txn.open_multimap_table(RECORDS_BY_KIND)?;

        Ok(RecordBatch::new(collect(&rows, &by_kind, &plan)?))
    }

    /// Every record in storage order.
    pub fn select_all(&self) -> Result<RecordBatch, SpoolError> {
        self.select(&Query::new())
    }

    /// Total number of stored records.
    pub fn count(&self) -> Result<usize, SpoolError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let rows = read_txn.open_table(RECORDS_TABLE)?;
        Ok(rows.len()? as usize)
    }

    /// Number of records matching all predicates.
    pub fn count_matching(&self, predicates: &[Predicate]) -> Result<usize, SpoolError> {
        if let [Predicate::OfType(kind)] = predicates {
            let db = self.db_handle();
            let db_guard = db.read();
            let read_txn = db_guard.begin_read()?;
            let by_kind = read_txn.open_multimap_table(RECORDS_BY_KIND)?;
            return Ok(by_kind.get(kind.as_str())?.len() as usize);
        }
        let query = Query {
            predicates: predicates.to_vec(),
            ..Query::default()
        };
        Ok(self.select(&query)?.len())
    }

    /// Distinct kinds currently buffered, with their record counts.
    pub fn kinds(&self) -> Result<Vec<(String, usize)>, SpoolError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let by_kind = read_txn.open_multimap_table(RECORDS_BY_KIND)?;

        let mut kinds = Vec::new();
        for entry in by_kind.iter()? {
            let (key, values) = entry?;
            let count = values.len() as usize;
            if count > 0 {
                kinds.push((key.value().to_string(), count));
            }
        }
        Ok(kinds)
    }
}

/// Run a plan against the record table and kind index.
fn collect<T, M>(rows: &T, by_kind: &M, plan: &QueryPlan) -> Result<Vec<Record>, SpoolError>
where
    T: ReadableTable<u64, &'static [u8]>,
    M: ReadableMultimapTable<&'static str, u64>,
{
    let mut out = Vec::new();
    if plan.limit == Some(0) {
        return Ok(out);
    }
    let descending = matches!(plan.order, RowOrder::Id(SortOrder::Descending));

    match &plan.access {
        Access::Nothing => {}
        Access::Scan => {
            if descending {
                scan(rows.iter()?.rev(), plan, &mut out)?;
            } else {
                scan(rows.iter()?, plan, &mut out)?;
            }
        }
        Access::Kind(kind) => {
            let mut ids = Vec::new();
            for id in by_kind.get(kind.as_str())? {
                ids.push(id?.value());
            }
            if descending {
                ids.reverse();
            }
            lookup(rows, ids, plan, &mut out)?;
        }
        Access::Ids(ids) => {
            if descending {
                lookup(rows, ids.iter().rev().copied(), plan, &mut out)?;
            } else {
                lookup(rows, ids.iter().copied(), plan, &mut out)?;
            }
        }
    }

    if !plan.streams() {
        plan.sort(&mut out);
        if let Some(limit) = plan.limit {
            out.truncate(limit);
        }
    }
    Ok(out)
}

type Entry<'a> = Result<(AccessGuard<'a, u64>, AccessGuard<'a, &'static [u8]>), StorageError>;

fn scan<'a>(
    entries: impl Iterator<Item = Entry<'a>>,
    plan: &QueryPlan,
    out: &mut Vec<Record>,
) -> Result<(), SpoolError> {
    for entry in entries {
        let (key, value) = entry?;
        if accept(plan, decode_row(key.value(), value.value())?, out) {
            break;
        }
    }
    Ok(())
}

fn lookup<T>(
    rows: &T,
    ids: impl IntoIterator<Item = u64>,
    plan: &QueryPlan,
    out: &mut Vec<Record>,
) -> Result<(), SpoolError>
where
    T: ReadableTable<u64, &'static [u8]>,
{
    for id in ids {
        let record = match rows.get(id)? {
            Some(value) => decode_row(id, value.value())?,
            None => continue,
        };
        if accept(plan, record, out) {
            break;
        }
    }
    Ok(())
}

/// Keep `record` if it passes the residual filters. Returns true once a
/// streaming plan has reached its limit.
fn accept(plan: &QueryPlan, record: Record, out: &mut Vec<Record>) -> bool {
    if plan.matches(&record) {
        out.push(record);
    }
    plan.streams() && plan.limit.is_some_and(|limit| out.len() >= limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Sort, SortOrder};
    use crate::storage::StorageOptions;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path).unwrap();
        (storage, temp_dir)
    }

    fn payloads(batch: &RecordBatch) -> Vec<&str> {
        batch.iter().map(|r| r.payload.as_str()).collect()
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let (storage, _temp) = create_test_storage();

        let a = storage.insert("clicks", "a").unwrap();
        let b = storage.insert("clicks", "b").unwrap();
        let c = storage.insert("views", "c").unwrap();

        assert!(a < b && b < c);
        assert_eq!(storage.count().unwrap(), 3);
    }

    #[test]
    fn test_ids_are_not_reused_after_delete_or_clear() {
        let (storage, _temp) = create_test_storage();

        let first = storage.insert("clicks", "a").unwrap();
        storage.delete(&[Predicate::with_ids([first])]).unwrap();
        let second = storage.insert("clicks", "b").unwrap();
        assert!(second > first);

        storage.clear().unwrap();
        let third = storage.insert("clicks", "c").unwrap();
        assert!(third > second);
    }

    #[test]
    fn test_select_filters_by_kind() {
        let (storage, _temp) = create_test_storage();

        storage.insert("clicks", "c1").unwrap();
        storage.insert("views", "v1").unwrap();
        storage.insert("clicks", "c2").unwrap();

        let batch = storage
            .select(&Query::new().filter(Predicate::of_type("clicks")))
            .unwrap();
        assert_eq!(payloads(&batch), vec!["c1", "c2"]);
        assert!(batch.iter().all(|r| r.kind == "clicks"));
    }

    #[test]
    fn test_select_priority_descending_with_limit() {
        let (storage, _temp) = create_test_storage();

        storage.insert_with_priority("events", "p1", 1).unwrap();
        storage.insert_with_priority("events", "p5", 5).unwrap();
        storage.insert_with_priority("events", "p3", 3).unwrap();

        let batch = storage
            .select(
                &Query::new()
                    .filter(Predicate::of_type("events"))
                    .sort_by(Sort::priority_desc())
                    .limit(2),
            )
            .unwrap();
        assert_eq!(payloads(&batch), vec!["p5", "p3"]);
    }

    #[test]
    fn test_select_id_descending_streams_from_the_end() {
        let (storage, _temp) = create_test_storage();
        for p in ["a", "b", "c", "d"] {
            storage.insert("events", p).unwrap();
        }

        let newest = storage
            .select(&Query::new().sort_by(Sort::id_desc()).limit(2))
            .unwrap();
        assert_eq!(payloads(&newest), vec!["d", "c"]);

        let by_kind = storage
            .select(
                &Query::new()
                    .filter(Predicate::of_type("events"))
                    .sort_by(Sort::id_desc())
                    .limit(3),
            )
            .unwrap();
        assert_eq!(payloads(&by_kind), vec!["d", "c", "b"]);
    }

    #[test]
    fn test_select_with_storage_order_override() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::with_options(
            temp_dir.path().join("test.redb"),
            StorageOptions {
                id_order: Some(SortOrder::Descending),
            },
        )
        .unwrap();

        storage.insert_with_priority("events", "low", 1).unwrap();
        storage.insert_with_priority("events", "high", 9).unwrap();

        let batch = storage
            .select(&Query::new().sort_by(Sort::priority_desc()))
            .unwrap();
        assert_eq!(payloads(&batch), vec!["high", "low"]);

        storage.insert_with_priority("events", "newest", 0).unwrap();
        let batch = storage
            .select(&Query::new().sort_by(Sort::priority_desc()))
            .unwrap();
        assert_eq!(payloads(&batch), vec!["newest", "high", "low"]);
    }

    #[test]
    fn test_select_with_ids_and_kind() {
        let (storage, _temp) = create_test_storage();

        let a = storage.insert("clicks", "a").unwrap();
        let b = storage.insert("views", "b").unwrap();
        let _c = storage.insert("clicks", "c").unwrap();

        let batch = storage
            .select(
                &Query::new()
                    .filter(Predicate::of_type("clicks"))
                    .filter(Predicate::with_ids([a, b])),
            )
            .unwrap();
        assert_eq!(payloads(&batch), vec!["a"]);
    }

    #[test]
    fn test_select_ignores_unknown_ids() {
        let (storage, _temp) = create_test_storage();
        let a = storage.insert("clicks", "a").unwrap();

        let batch = storage
            .select(&Query::new().filter(Predicate::with_ids([a, RecordId(999)])))
            .unwrap();
        assert_eq!(batch.ids(), vec![a]);
    }

    #[test]
    fn test_hostile_kind_values_are_plain_data() {
        let (storage, _temp) = create_test_storage();
        let nasty = "x' OR '1'='1";

        storage.insert("clicks", "safe").unwrap();
        storage.insert(nasty, "nasty").unwrap();

        let batch = storage
            .select(&Query::new().filter(Predicate::of_type(nasty)))
            .unwrap();
        assert_eq!(payloads(&batch), vec!["nasty"]);

        assert_eq!(storage.delete(&[Predicate::of_type(nasty)]).unwrap(), 1);
        assert_eq!(storage.count().unwrap(), 1);
    }

    #[test]
    fn test_delete_with_empty_ids_is_noop() {
        let (storage, _temp) = create_test_storage();
        storage.insert("clicks", "a").unwrap();

        let removed = storage
            .delete(&[Predicate::with_ids(Vec::<RecordId>::new())])
            .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(storage.count().unwrap(), 1);

        assert_eq!(storage.delete(&[]).unwrap(), 0);
        assert_eq!(storage.count().unwrap(), 1);
    }

    #[test]
    fn test_delete_batch_removes_only_batch() {
        let (storage, _temp) = create_test_storage();
        for p in ["a", "b", "c"] {
            storage.insert("clicks", p).unwrap();
        }

        let batch = storage
            .select(&Query::new().filter(Predicate::of_type("clicks")).limit(2))
            .unwrap();
        assert_eq!(storage.delete_batch(&batch).unwrap(), 2);

        let rest = storage.select_all().unwrap();
        assert_eq!(payloads(&rest), vec!["c"]);
        assert_eq!(storage.count_matching(&[Predicate::of_type("clicks")]).unwrap(), 1);
    }

    #[test]
    fn test_truncate_keeps_most_recent() {
        let (storage, _temp) = create_test_storage();
        for p in ["a", "b", "c", "d", "e"] {
            storage.insert(if p < "c" { "old" } else { "new" }, p).unwrap();
        }

        assert_eq!(storage.truncate(3).unwrap(), 2);
        assert_eq!(payloads(&storage.select_all().unwrap()), vec!["c", "d", "e"]);
        assert_eq!(storage.count_matching(&[Predicate::of_type("old")]).unwrap(), 0);

        // Under the limit: nothing happens
        assert_eq!(storage.truncate(10).unwrap(), 0);
        assert_eq!(storage.count().unwrap(), 3);
    }

    #[test]
    fn test_purge_only_old_records_of_kind() {
        let (storage, _temp) = create_test_storage();
        let now = now_millis();

        storage.insert_at("clicks", "stale", 0, now - 60_000).unwrap();
        storage.insert_at("views", "stale-other", 0, now - 60_000).unwrap();
        storage.insert_at("clicks", "fresh", 0, now).unwrap();

        let purged = storage.purge("clicks", Duration::from_secs(30)).unwrap();
        assert_eq!(purged, 1);

        let left = storage.select_all().unwrap();
        assert_eq!(payloads(&left), vec!["stale-other", "fresh"]);
    }

    #[test]
    fn test_clear_empties_storage() {
        let (storage, _temp) = create_test_storage();
        storage.insert("clicks", "a").unwrap();
        storage.insert("views", "b").unwrap();

        assert_eq!(storage.clear().unwrap(), 2);
        assert_eq!(storage.count().unwrap(), 0);
        assert!(storage.kinds().unwrap().is_empty());
    }

    #[test]
    fn test_kinds_reports_counts() {
        let (storage, _temp) = create_test_storage();
        storage.insert("clicks", "a").unwrap();
        storage.insert("clicks", "b").unwrap();
        storage.insert("views", "c").unwrap();

        let kinds = storage.kinds().unwrap();
        assert_eq!(
            kinds,
            vec![("clicks".to_string(), 2), ("views".to_string(), 1)]
        );
    }

    #[test]
    fn test_records_persist_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");

        {
            let storage = Storage::new(&db_path).unwrap();
            storage.insert_with_priority("clicks", "kept", 7).unwrap();
        }

        {
            let storage = Storage::new(&db_path).unwrap();
            let batch = storage.select_all().unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(batch.records()[0].payload, "kept");
            assert_eq!(batch.records()[0].priority, 7);
        }
    }
}
