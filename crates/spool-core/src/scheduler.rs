//! Delayed, retrying flush trigger.
//!
//! A [`RetryableTask`] owns at most one armed timer. `try_to_start` arms it
//! unless a cycle is already pending; `retry_later` re-arms it after a failed
//! cycle until the attempt budget runs out; `reset` ends the cycle.
//!
//! ```text
//!            try_to_start          timer fires
//!   idle ───────────────► pending ────────────► work()
//!    ▲                      ▲  │                  │
//!    │ reset / exhausted    │  └── retry_later ◄──┘ (failure)
//!    └──────────────────────┴──────── reset ◄─────┘ (success)
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::executor::WorkQueue;

/// Work run on the queue when the timer fires
pub type TaskFn = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct TaskState {
    attempts: u32,
    pending: bool,
    timer: Option<JoinHandle<()>>,
}

/// A timer that runs its work on a [`WorkQueue`] and retries with a fixed
/// interval up to `max_attempts` times per cycle.
#[derive(Clone)]
pub struct RetryableTask {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    name: String,
    work: TaskFn,
    interval: Duration,
    max_attempts: u32,
    queue: WorkQueue,
    state: Mutex<TaskState>,
}

impl RetryableTask {
    pub fn new(
        name: impl Into<String>,
        queue: WorkQueue,
        interval: Duration,
        max_attempts: u32,
        work: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                name: name.into(),
                work: Arc::new(work),
                interval,
                max_attempts,
                queue,
                state: Mutex::new(TaskState::default()),
            }),
        }
    }

    /// Arm the timer unless a cycle is already pending.
    ///
    /// Returns whether a new cycle was started.
    pub fn try_to_start(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.pending {
            return false;
        }
        state.pending = true;
        self.arm(&mut state);
        true
    }

    /// Count a failed attempt and re-arm while the budget allows.
    ///
    /// Once `max_attempts` failures have been counted the cycle ends and
    /// the counter goes back to zero; nothing fires again until the next
    /// [`try_to_start`](Self::try_to_start).
    pub fn retry_later(&self) {
        let mut state = self.inner.state.lock();
        state.attempts += 1;

        if state.attempts < self.inner.max_attempts {
            debug!(
                task = %self.inner.name,
                attempt = state.attempts,
                max_attempts = self.inner.max_attempts,
                "Retrying later"
            );
            state.pending = true;
            self.arm(&mut state);
        } else {
            warn!(
                task = %self.inner.name,
                attempts = state.attempts,
                "Giving up until new work arrives"
            );
            Self::idle(&mut state);
        }
    }

    /// End the current cycle: clear attempts and pending, drop any timer.
    pub fn reset(&self) {
        Self::idle(&mut self.inner.state.lock());
    }

    /// Failed attempts counted in the current cycle
    pub fn attempts(&self) -> u32 {
        self.inner.state.lock().attempts
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn max_attempts(&self) -> u32 {
        self.inner.max_attempts
    }

    fn idle(state: &mut TaskState) {
        state.attempts = 0;
        state.pending = false;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    fn arm(&self, state: &mut TaskState) {
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }

        let work = self.inner.work.clone();
        match self.inner.queue.schedule(self.inner.interval, move || work()) {
            Ok(timer) => state.timer = Some(timer),
            Err(e) => {
                debug!(task = %self.inner.name, error = %e, "Cannot arm timer");
                state.pending = false;
            }
        }
    }
}

impl Drop for TaskInner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}
