//! Buffered output: one log kind, one storage lock, one sink.
//!
//! Producers call [`BufferedOutput::receive`], which enqueues the insert on
//! the spool's worker. The insert arms the flush timer once it has landed,
//! so it always observes the outcome of any cycle queued before it. When
//! the timer fires the worker runs one flush cycle:
//!
//! ```text
//! lock ──busy──► retry_later
//!   │
//! purge (if configured)
//!   │
//! select {OfType(kind), sort, limit batch_size}
//!   │
//!   ├── empty ──► reset, unlock
//!   │
//! deliver ──► Completion (any thread) ──► worker
//!                 ├── success ──► reset, delete batch, unlock, re-arm if more
//!                 └── failure ──► retry_later, unlock
//! ```
//!
//! The lock stays held from select until the completion has been handled,
//! so a batch is never read twice by overlapping cycles.

use std::sync::{Arc, Weak};

use tracing::{debug, error, info, warn};

use crate::config::OutputConfig;
use crate::delivery::{Completion, DeliveryOutcome, Filter, Sink};
use crate::executor::WorkQueue;
use crate::query::{Predicate, Query};
use crate::scheduler::RetryableTask;
use crate::storage::Storage;
use crate::types::RecordBatch;

/// Handle to a registered output. Clones share the same state.
#[derive(Clone)]
pub struct BufferedOutput {
    inner: Arc<OutputInner>,
}

struct OutputInner {
    kind: String,
    config: OutputConfig,
    storage: Storage,
    sink: Arc<dyn Sink>,
    filters: Vec<Arc<dyn Filter>>,
    queue: WorkQueue,
    flush_task: RetryableTask,
    max_buffered_records: Option<usize>,
}

pub(crate) struct OutputParts {
    pub kind: String,
    pub config: OutputConfig,
    pub storage: Storage,
    pub sink: Arc<dyn Sink>,
    pub filters: Vec<Arc<dyn Filter>>,
    pub queue: WorkQueue,
    pub max_buffered_records: Option<usize>,
}

impl BufferedOutput {
    /// Build an output. `parts.storage` must be an instance of its own
    /// (see [`Storage::share`]); the config must already be validated.
    pub(crate) fn new(parts: OutputParts) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<OutputInner>| {
            let weak = weak.clone();
            let flush_task = RetryableTask::new(
                format!("flush:{}", parts.kind),
                parts.queue.clone(),
                parts.config.flush_interval,
                parts.config.max_retry_attempts,
                move || {
                    if let Some(inner) = weak.upgrade() {
                        BufferedOutput { inner }.flush_sync();
                    }
                },
            );

            OutputInner {
                kind: parts.kind,
                config: parts.config,
                storage: parts.storage,
                sink: parts.sink,
                filters: parts.filters,
                queue: parts.queue,
                flush_task,
                max_buffered_records: parts.max_buffered_records,
            }
        });

        info!(kind = %inner.kind, "Registered buffered output");
        Self { inner }
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn config(&self) -> &OutputConfig {
        &self.inner.config
    }

    /// This output's storage instance (its lock is this output's lock)
    pub fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    /// Failed attempts counted in the current flush cycle
    pub fn attempts(&self) -> u32 {
        self.inner.flush_task.attempts()
    }

    /// Whether a flush cycle is armed or retrying
    pub fn is_pending(&self) -> bool {
        self.inner.flush_task.is_pending()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Producer side
    // ═══════════════════════════════════════════════════════════════════════

    /// Buffer a payload with priority 0. Never blocks, never fails.
    pub fn receive(&self, payload: impl Into<String>) {
        self.receive_with_priority(payload, 0);
    }

    /// Buffer a payload. Never blocks, never fails; an insert that cannot
    /// be performed is logged and dropped.
    pub fn receive_with_priority(&self, payload: impl Into<String>, priority: i32) {
        let payload = payload.into();
        let inner = self.inner.clone();

        if let Err(e) = self.inner.queue.execute(move || inner.store(payload, priority)) {
            warn!(kind = %self.inner.kind, error = %e, "Dropping log event: queue unavailable");
        }
    }

    /// Run a flush cycle now instead of waiting for the timer.
    pub fn flush(&self) {
        let output = self.clone();
        if let Err(e) = self.inner.queue.execute(move || output.flush_sync()) {
            warn!(kind = %self.inner.kind, error = %e, "Cannot enqueue flush");
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Flush cycle (runs on the worker)
    // ═══════════════════════════════════════════════════════════════════════

    fn batch_query(&self) -> Query {
        Query::new()
            .filter(Predicate::of_type(self.inner.kind.as_str()))
            .with_sort(self.inner.config.sort.iter().copied())
            .limit(self.inner.config.batch_size)
    }

    fn flush_sync(&self) {
        let inner = &self.inner;

        if !inner.storage.try_lock() {
            debug!(kind = %inner.kind, "Storage busy, retrying later");
            inner.flush_task.retry_later();
            return;
        }

        if let Some(max_age) = inner.config.purge_age {
            match inner.storage.purge(&inner.kind, max_age) {
                Ok(0) => {}
                Ok(purged) => info!(kind = %inner.kind, purged, "Purged aged records"),
                Err(e) => return self.abort_cycle("purge", &e),
            }
        }

        let batch = match inner.storage.select(&self.batch_query()) {
            Ok(batch) => batch,
            Err(e) => return self.abort_cycle("select", &e),
        };

        if batch.is_empty() {
            debug!(kind = %inner.kind, "Nothing to flush");
            inner.flush_task.reset();
            inner.storage.unlock();
            return;
        }

        debug!(
            kind = %inner.kind,
            batch_len = batch.len(),
            attempt = inner.flush_task.attempts(),
            "Delivering batch"
        );

        let payloads = batch.payloads();
        let output = self.clone();
        let done = Completion::new(move |outcome| output.complete_later(batch, outcome));
        inner.sink.deliver(payloads, done);
    }

    fn abort_cycle(&self, stage: &str, e: &crate::error::SpoolError) {
        error!(kind = %self.inner.kind, stage, error = %e, "Storage failure in flush cycle");
        self.inner.flush_task.retry_later();
        self.inner.storage.unlock();
    }

    /// Hop back onto the worker; completions may arrive from any thread.
    fn complete_later(self, batch: RecordBatch, outcome: DeliveryOutcome) {
        let queue = self.inner.queue.clone();
        let kind = self.inner.kind.clone();
        if queue.execute(move || self.complete(batch, outcome)).is_err() {
            warn!(%kind, "Delivery completed after shutdown; batch stays buffered");
        }
    }

    fn complete(&self, batch: RecordBatch, outcome: DeliveryOutcome) {
        let inner = &self.inner;

        match outcome {
            DeliveryOutcome::Success => {
                inner.flush_task.reset();
                let deleted = inner.storage.delete_batch(&batch);
                inner.storage.unlock();

                match deleted {
                    Ok(deleted) => {
                        debug!(kind = %inner.kind, deleted, "Batch delivered");
                        self.continue_draining();
                    }
                    Err(e) => {
                        error!(kind = %inner.kind, error = %e, "Delivered batch could not be deleted");
                        inner.flush_task.retry_later();
                    }
                }
            }
            DeliveryOutcome::Failure(reason) => {
                warn!(
                    kind = %inner.kind,
                    batch_len = batch.len(),
                    attempt = inner.flush_task.attempts() + 1,
                    %reason,
                    "Delivery failed"
                );
                inner.flush_task.retry_later();
                inner.storage.unlock();
            }
        }
    }

    fn continue_draining(&self) {
        let inner = &self.inner;
        match inner
            .storage
            .count_matching(&[Predicate::of_type(inner.kind.as_str())])
        {
            Ok(0) => {}
            Ok(remaining) => {
                debug!(kind = %inner.kind, remaining, "More records buffered, re-arming");
                inner.flush_task.try_to_start();
            }
            Err(e) => warn!(kind = %inner.kind, error = %e, "Cannot count remaining records"),
        }
    }
}

impl OutputInner {
    /// Producer insert, on the worker. Arms the flush timer after the
    /// record is stored.
    fn store(&self, payload: String, priority: i32) {
        let mut payload = payload;
        for filter in &self.filters {
            match filter.apply(payload) {
                Some(next) => payload = next,
                None => {
                    debug!(kind = %self.kind, "Log event dropped by filter");
                    return;
                }
            }
        }

        match self
            .storage
            .insert_with_priority(&self.kind, &payload, priority)
        {
            Ok(record_id) => debug!(kind = %self.kind, %record_id, "Buffered log event"),
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "Dropping log event: insert failed");
                return;
            }
        }

        if let Some(max) = self.max_buffered_records {
            self.enforce_cap(max);
        }

        self.flush_task.try_to_start();
    }

    /// Drop the oldest records beyond `max`, unless a batch of any output
    /// is in flight; a later insert catches up.
    fn enforce_cap(&self, max: usize) {
        let held = self.storage.locks_held();
        if held > 0 {
            debug!(kind = %self.kind, held, "Batch in flight, deferring truncate");
            return;
        }

        match self.storage.truncate(max) {
            Ok(0) => {}
            Ok(dropped) => warn!(kind = %self.kind, dropped, max, "Buffer full, dropped oldest records"),
            Err(e) => warn!(kind = %self.kind, error = %e, "Truncate failed"),
        }
    }
}
