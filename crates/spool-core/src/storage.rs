//! Persistent record storage using redb.
//!
//! Every buffered log event lives in one append-only `records` table keyed
//! by a storage-assigned id. A multimap index from kind to id serves the
//! per-output selects, and a small `meta` table carries the schema version
//! and the id sequence.
//!
//! ## Tables
//!
//! ```text
//! records          u64  -> JSON row {kind, payload, created_at, priority}
//! records_by_kind  &str => u64   (multimap, ids ascending per kind)
//! meta             &str -> u64   (schema_version, last_record_id)
//! ```
//!
//! Row columns added after the first layout (`created_at`, `priority`)
//! decode with defaults. The only rewrite on upgrade stamps rows that have
//! no creation time with the upgrade time, so age-based purges do not treat
//! all of them as ancient.
//!
//! ## Locking
//!
//! Each `Storage` value carries one coarse, non-blocking lock flag shared
//! by its clones. [`Storage::share`] opens another engine instance over the
//! same database with its own flag, which is how every buffered output
//! gets a lock of its own. [`Storage::locks_held`] counts the flags held
//! across every instance of one database.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{
    Database, MultimapTableDefinition, ReadableTable, ReadableTableMetadata, TableDefinition,
};
use tracing::{debug, info};

use crate::error::SpoolError;
use crate::query::SortOrder;
use crate::types::now_millis;

mod plan;
mod records;

pub(crate) use plan::QueryPlan;

/// Record rows (key: record id, value: JSON-encoded row)
pub(crate) const RECORDS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("records");

/// Secondary index for kind lookups (key: kind, values: record ids)
pub(crate) const RECORDS_BY_KIND: MultimapTableDefinition<&str, u64> =
    MultimapTableDefinition::new("records_by_kind");

/// Bookkeeping counters
pub(crate) const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const SCHEMA_VERSION_KEY: &str = "schema_version";
pub(crate) const LAST_RECORD_ID_KEY: &str = "last_record_id";

/// Layout written by this build. Version 1 had no kind index.
pub const SCHEMA_VERSION: u64 = 2;

const DATABASE_FILE_NAME: &str = "spool.redb";

/// Engine-wide options fixed at open time
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Force every select to order by id in this direction, ignoring the
    /// query's own sort clauses
    pub id_order: Option<SortOrder>,
}

/// Storage layer using redb for durable record buffering
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
    lock: Arc<AtomicBool>,
    held: Arc<AtomicUsize>,
    options: StorageOptions,
}

impl Storage {
    /// Get a reference to the shared database handle
    pub(crate) fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }

    pub(crate) fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Database file name, namespaced so that separate processes never
    /// share a file (`"worker.spool.redb"`, or `"spool.redb"` without a
    /// namespace).
    pub fn file_name(namespace: Option<&str>) -> String {
        match namespace.map(str::trim) {
            Some(ns) if !ns.is_empty() => format!("{}.{}", ns, DATABASE_FILE_NAME),
            _ => DATABASE_FILE_NAME.to_string(),
        }
    }
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    /// - Bring an older layout forward to [`SCHEMA_VERSION`]
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SpoolError> {
        Self::with_options(path, StorageOptions::default())
    }

    /// Same as [`Storage::new`] with explicit engine options.
    pub fn with_options(path: impl AsRef<Path>, options: StorageOptions) -> Result<Self, SpoolError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RECORDS_TABLE)?;
            let _ = write_txn.open_multimap_table(RECORDS_BY_KIND)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        migrate(&db)?;

        info!(?path, "Opened spool storage");

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            lock: Arc::new(AtomicBool::new(false)),
            held: Arc::new(AtomicUsize::new(0)),
            options,
        })
    }

    /// Another engine instance over the same database with its own lock.
    ///
    /// A redb file can only be opened once per process, so outputs that
    /// need independent locks share the handle rather than reopening.
    pub fn share(&self) -> Self {
        Self {
            db: self.db.clone(),
            lock: Arc::new(AtomicBool::new(false)),
            held: self.held.clone(),
            options: self.options.clone(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lock
    // ═══════════════════════════════════════════════════════════════════════

    /// Take the lock if it is free. Never blocks.
    pub fn try_lock(&self) -> bool {
        let acquired = self
            .lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if acquired {
            self.held.fetch_add(1, Ordering::AcqRel);
        }
        acquired
    }

    /// Release the lock unconditionally.
    ///
    /// Only the holder of a successful [`try_lock`](Self::try_lock) in the
    /// same cycle may call this.
    pub fn unlock(&self) {
        if self.lock.swap(false, Ordering::AcqRel) {
            self.held.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Acquire)
    }

    /// Locks currently held by this instance and every instance shared
    /// from the same open database
    pub fn locks_held(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    /// Stored layout version
    pub fn schema_version(&self) -> Result<u64, SpoolError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let meta = read_txn.open_table(META_TABLE)?;
        Ok(meta
            .get(SCHEMA_VERSION_KEY)?
            .map(|v| v.value())
            .unwrap_or(SCHEMA_VERSION))
    }
}

/// Bring the on-disk layout up to [`SCHEMA_VERSION`].
///
/// Upgrades are additive only: missing row columns decode with defaults,
/// and a version 1 file needs its kind index and id sequence built plus a
/// creation time for every row.
fn migrate(db: &Database) -> Result<(), SpoolError> {
    let write_txn = db.begin_write()?;
    {
        let mut meta = write_txn.open_table(META_TABLE)?;
        let stored = meta.get(SCHEMA_VERSION_KEY)?.map(|v| v.value());

        let mut rows = write_txn.open_table(RECORDS_TABLE)?;
        let found = match stored {
            Some(version) => version,
            None if rows.is_empty()? => SCHEMA_VERSION,
            None => 1,
        };

        if found > SCHEMA_VERSION {
            return Err(SpoolError::UnsupportedSchema {
                found,
                supported: SCHEMA_VERSION,
            });
        }

        if found < 2 {
            let mut by_kind = write_txn.open_multimap_table(RECORDS_BY_KIND)?;
            let mut last_id = 0;
            let mut rebuilt = 0usize;
            let mut unstamped = Vec::new();
            for entry in rows.iter()? {
                let (key, value) = entry?;
                let id = key.value();
                let row = records::decode_row(id, value.value())?;
                by_kind.insert(row.kind.as_str(), id)?;
                last_id = last_id.max(id);
                rebuilt += 1;
                if row.created_at == 0 {
                    unstamped.push(row);
                }
            }

            let upgraded_at = now_millis();
            for row in &unstamped {
                let data =
                    records::encode_row(&row.kind, &row.payload, upgraded_at, row.priority)?;
                rows.insert(row.id.as_u64(), data.as_slice())?;
            }
            let sequence = meta.get(LAST_RECORD_ID_KEY)?.map(|v| v.value()).unwrap_or(0);
            meta.insert(LAST_RECORD_ID_KEY, sequence.max(last_id))?;
            debug!(
                from = found,
                rebuilt,
                stamped = unstamped.len(),
                "Rebuilt kind index during upgrade"
            );
        }

        if stored != Some(SCHEMA_VERSION) {
            meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION)?;
        }
    }
    write_txn.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_storage_can_be_created() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
    }

    #[test]
    fn test_storage_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_try_lock_is_exclusive() {
        let (storage, _temp) = create_test_storage();

        assert!(storage.try_lock());
        assert!(!storage.try_lock());
        assert!(storage.is_locked());

        storage.unlock();
        assert!(!storage.is_locked());
        assert!(storage.try_lock());
    }

    #[test]
    fn test_clones_share_lock_but_shared_instances_do_not() {
        let (storage, _temp) = create_test_storage();
        let clone = storage.clone();
        let other = storage.share();

        assert!(storage.try_lock());
        assert!(!clone.try_lock());
        assert!(other.try_lock());

        other.unlock();
        assert!(storage.is_locked());
    }

    #[test]
    fn test_locks_held_counts_across_shared_instances() {
        let (storage, _temp) = create_test_storage();
        let other = storage.share();
        assert_eq!(storage.locks_held(), 0);

        assert!(storage.try_lock());
        assert!(other.try_lock());
        assert_eq!(other.locks_held(), 2);

        // A second unlock of a free flag does not underflow the count
        other.unlock();
        other.unlock();
        assert_eq!(storage.locks_held(), 1);

        storage.unlock();
        assert_eq!(other.locks_held(), 0);
    }

    #[test]
    fn test_fresh_database_records_current_schema() {
        let (storage, _temp) = create_test_storage();
        assert_eq!(storage.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_file_name_namespacing() {
        assert_eq!(Storage::file_name(None), "spool.redb");
        assert_eq!(Storage::file_name(Some("")), "spool.redb");
        assert_eq!(Storage::file_name(Some("worker")), "worker.spool.redb");
    }

    #[test]
    fn test_upgrade_from_unindexed_layout() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("legacy.redb");

        // Version 1 layout: rows without created_at/priority, no index, no meta
        {
            let db = Database::create(&db_path).unwrap();
            let write_txn = db.begin_write().unwrap();
            {
                let mut table = write_txn.open_table(RECORDS_TABLE).unwrap();
                table
                    .insert(1u64, br#"{"kind":"clicks","payload":"a"}"#.as_slice())
                    .unwrap();
                table
                    .insert(4u64, br#"{"kind":"views","payload":"b"}"#.as_slice())
                    .unwrap();
            }
            write_txn.commit().unwrap();
        }

        let storage = Storage::new(&db_path).unwrap();
        assert_eq!(storage.schema_version().unwrap(), SCHEMA_VERSION);

        let clicks = storage
            .select(&crate::query::Query::new().filter(crate::query::Predicate::of_type("clicks")))
            .unwrap();
        assert_eq!(clicks.payloads(), vec!["a".to_string()]);
        assert_eq!(clicks.records()[0].priority, 0);
        assert!(clicks.records()[0].created_at > 0);

        // Legacy rows count as created at upgrade time, not at the epoch
        assert_eq!(
            storage
                .purge("clicks", std::time::Duration::from_secs(3600))
                .unwrap(),
            0
        );
        assert_eq!(storage.count().unwrap(), 2);

        // The sequence continues past the highest legacy id
        let id = storage.insert("clicks", "c").unwrap();
        assert_eq!(id.as_u64(), 5);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("future.redb");

        {
            let db = Database::create(&db_path).unwrap();
            let write_txn = db.begin_write().unwrap();
            {
                let mut meta = write_txn.open_table(META_TABLE).unwrap();
                meta.insert(SCHEMA_VERSION_KEY, SCHEMA_VERSION + 1).unwrap();
            }
            write_txn.commit().unwrap();
        }

        let result = Storage::new(&db_path);
        assert!(matches!(
            result,
            Err(SpoolError::UnsupportedSchema { .. })
        ));
    }
}
