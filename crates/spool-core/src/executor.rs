//! Serial work queue shared by every output of one spool.
//!
//! Producers never touch storage themselves: they enqueue a job here and
//! return. A single named OS thread drains the queue in submission order,
//! so all storage mutations, flush cycles and delivery completions are
//! serialized. Delays are timed on the tokio runtime the queue was created
//! on and the job is enqueued when the timer fires.
//!
//! ```text
//! producer ──execute──┐
//! timer ─────fire─────┼──► mpsc ──► spool-worker thread ──► job()
//! sink ──completion───┘
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle as ThreadHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::SpoolError;

/// A unit of work run on the worker thread
pub type Job = Box<dyn FnOnce() + Send + 'static>;

const WORKER_THREAD_NAME: &str = "spool-worker";

/// Handle to the serial executor. Clones share the same worker.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<ThreadHandle<()>>>,
    runtime: Handle,
}

impl WorkQueue {
    /// Start a worker, timing delays on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SpoolError::Runtime` when called outside a tokio runtime.
    pub fn new() -> Result<Self, SpoolError> {
        let runtime = Handle::try_current().map_err(|e| SpoolError::Runtime(e.to_string()))?;
        Self::with_runtime(runtime)
    }

    /// Start a worker, timing delays on the given runtime.
    pub fn with_runtime(runtime: Handle) -> Result<Self, SpoolError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let context = runtime.clone();

        let worker = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                // Jobs (and sinks called from them) may spawn onto the runtime
                let _guard = context.enter();
                while let Some(job) = rx.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Job panicked on the spool worker");
                    }
                }
                debug!("Work queue closed, worker exiting");
            })?;

        info!("Started spool worker");

        Ok(Self {
            inner: Arc::new(QueueInner {
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
                runtime,
            }),
        })
    }

    /// Enqueue a job. Never blocks.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> Result<(), SpoolError> {
        self.send(Box::new(job))
    }

    fn send(&self, job: Job) -> Result<(), SpoolError> {
        let tx = self.inner.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| SpoolError::Shutdown),
            None => Err(SpoolError::Shutdown),
        }
    }

    /// Enqueue a job once `delay` has elapsed.
    ///
    /// The returned handle can abort the timer before it fires. A timer that
    /// fires after [`shutdown`](Self::shutdown) drops its job.
    pub fn schedule(
        &self,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) -> Result<JoinHandle<()>, SpoolError> {
        let weak = match self.inner.tx.lock().as_ref() {
            Some(tx) => tx.downgrade(),
            None => return Err(SpoolError::Shutdown),
        };
        let job: Job = Box::new(job);

        Ok(self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            match weak.upgrade() {
                Some(tx) => {
                    let _ = tx.send(job);
                }
                None => debug!("Timer fired after shutdown, dropping job"),
            }
        }))
    }

    /// Resolves once every job enqueued before this call has run.
    pub async fn barrier(&self) -> Result<(), SpoolError> {
        let (tx, rx) = oneshot::channel();
        self.execute(move || {
            let _ = tx.send(());
        })?;
        rx.await.map_err(|_| SpoolError::Shutdown)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    /// Stop accepting jobs, let the worker finish what is queued, and wait
    /// for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.tx.lock().take();

        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            let joined = tokio::task::spawn_blocking(move || worker.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                error!("Spool worker did not exit cleanly");
            }
            info!("Spool worker stopped");
        }
    }
}
