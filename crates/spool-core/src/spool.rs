//! The logger instance: one database, one worker, many outputs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::OutputConfig;
use crate::delivery::{Filter, Sink};
use crate::error::{SpoolError, SpoolResult};
use crate::executor::WorkQueue;
use crate::output::{BufferedOutput, OutputParts};
use crate::storage::{Storage, StorageOptions};

#[derive(Debug, Clone, Default)]
pub struct SpoolOptions {
    pub storage: StorageOptions,
    /// Keep at most this many records across all kinds; the oldest are
    /// dropped after each producer insert. While any output has a batch in
    /// flight the cap is not enforced, so in-flight batches are never cut;
    /// the next insert after delivery catches up.
    pub max_buffered_records: Option<usize>,
}

/// Owns the storage file and the serial worker shared by every output.
///
/// Must be opened inside a tokio runtime, which drives the flush timers.
pub struct Spool {
    storage: Storage,
    queue: WorkQueue,
    options: SpoolOptions,
    outputs: Mutex<HashMap<String, BufferedOutput>>,
}

impl Spool {
    pub fn open(path: impl AsRef<Path>) -> SpoolResult<Self> {
        Self::open_with(path, SpoolOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: SpoolOptions) -> SpoolResult<Self> {
        let queue = WorkQueue::new()?;
        let storage = Storage::with_options(path, options.storage.clone())?;

        Ok(Self {
            storage,
            queue,
            options,
            outputs: Mutex::new(HashMap::new()),
        })
    }

    /// Register an output for `kind`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the config does not validate, `DuplicateOutput` if
    /// the kind already has an output.
    pub fn register(
        &self,
        kind: impl Into<String>,
        config: OutputConfig,
        sink: impl Sink,
    ) -> SpoolResult<BufferedOutput> {
        self.register_with_filters(kind, config, sink, Vec::new())
    }

    /// Register an output whose payloads pass through `filters`, in order,
    /// before they are persisted.
    pub fn register_with_filters(
        &self,
        kind: impl Into<String>,
        config: OutputConfig,
        sink: impl Sink,
        filters: Vec<Arc<dyn Filter>>,
    ) -> SpoolResult<BufferedOutput> {
        let kind = kind.into();
        config.validate()?;

        let mut outputs = self.outputs.lock();
        if outputs.contains_key(&kind) {
            return Err(SpoolError::DuplicateOutput(kind));
        }

        let output = BufferedOutput::new(OutputParts {
            kind: kind.clone(),
            config,
            storage: self.storage.share(),
            sink: Arc::new(sink),
            filters,
            queue: self.queue.clone(),
            max_buffered_records: self.options.max_buffered_records,
        });
        outputs.insert(kind, output.clone());
        Ok(output)
    }

    pub fn output(&self, kind: &str) -> Option<BufferedOutput> {
        self.outputs.lock().get(kind).cloned()
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.outputs.lock().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Enqueue a flush cycle on every output.
    pub fn flush_all(&self) {
        for output in self.outputs.lock().values() {
            output.flush();
        }
    }

    /// Drop the oldest records so that at most `max_records` remain.
    /// Runs on the worker, after everything already enqueued.
    pub async fn truncate(&self, max_records: usize) -> SpoolResult<usize> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let storage = self.storage.clone();
        self.queue.execute(move || {
            let _ = tx.send(storage.truncate(max_records));
        })?;
        rx.await.map_err(|_| SpoolError::Shutdown)?
    }

    /// Storage instance not tied to any output's lock
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Wait until every job enqueued so far has run.
    pub async fn sync(&self) -> SpoolResult<()> {
        self.queue.barrier().await
    }

    /// Finish queued work and stop the worker. Buffered records stay on
    /// disk for the next open; in-flight deliveries that settle afterwards
    /// are redelivered then.
    pub async fn shutdown(&self) {
        let outputs: Vec<BufferedOutput> = self.outputs.lock().drain().map(|(_, o)| o).collect();
        self.queue.shutdown().await;
        drop(outputs);
        info!("Spool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Completion;
    use tempfile::TempDir;

    fn accept_all(_payloads: Vec<String>, done: Completion) {
        done.success();
    }

    fn create_test_spool() -> (Spool, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let spool = Spool::open(temp_dir.path().join("spool.redb")).unwrap();
        (spool, temp_dir)
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_kind() {
        let (spool, _temp) = create_test_spool();

        spool
            .register("clicks", OutputConfig::default(), accept_all)
            .unwrap();
        let result = spool.register("clicks", OutputConfig::default(), accept_all);

        assert!(matches!(result, Err(SpoolError::DuplicateOutput(k)) if k == "clicks"));
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_config() {
        let (spool, _temp) = create_test_spool();
        let config = OutputConfig::default().with_batch_size(0);

        let result = spool.register("clicks", config, accept_all);
        assert!(matches!(result, Err(SpoolError::InvalidConfig(_))));
        assert!(spool.output("clicks").is_none());
    }

    #[tokio::test]
    async fn test_outputs_have_independent_locks() {
        let (spool, _temp) = create_test_spool();
        let clicks = spool
            .register("clicks", OutputConfig::default(), accept_all)
            .unwrap();
        let views = spool
            .register("views", OutputConfig::default(), accept_all)
            .unwrap();

        assert!(clicks.storage().try_lock());
        assert!(views.storage().try_lock());
        assert!(!spool.storage().is_locked());
        assert_eq!(spool.kinds(), vec!["clicks".to_string(), "views".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_all_drains_every_kind() {
        let (spool, _temp) = create_test_spool();
        let clicks = spool
            .register("clicks", OutputConfig::default(), accept_all)
            .unwrap();
        let views = spool
            .register("views", OutputConfig::default(), accept_all)
            .unwrap();

        clicks.receive("c1");
        views.receive("v1");
        spool.flush_all();
        spool.sync().await.unwrap();
        spool.sync().await.unwrap();

        assert_eq!(spool.storage().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_truncate_runs_after_queued_inserts() {
        let (spool, _temp) = create_test_spool();
        let clicks = spool
            .register("clicks", OutputConfig::default(), accept_all)
            .unwrap();

        for i in 0..5 {
            clicks.receive(format!("e{}", i));
        }
        let dropped = spool.truncate(2).await.unwrap();

        assert_eq!(dropped, 3);
        let left = spool.storage().select_all().unwrap();
        assert_eq!(left.payloads(), vec!["e3".to_string(), "e4".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_records_for_next_open() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("spool.redb");

        {
            let spool = Spool::open(&path).unwrap();
            let clicks = spool
                .register("clicks", OutputConfig::default(), accept_all)
                .unwrap();
            clicks.receive("kept");
            spool.shutdown().await;

            clicks.receive("dropped after shutdown");
        }

        let spool = Spool::open(&path).unwrap();
        let left = spool.storage().select_all().unwrap();
        assert_eq!(left.payloads(), vec!["kept".to_string()]);
    }
}
