//! Capabilities supplied by the application: where batches go ([`Sink`])
//! and what gets persisted in the first place ([`Filter`]).

use std::fmt;

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    Failure(String),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success)
    }
}

type Callback = Box<dyn FnOnce(DeliveryOutcome) + Send + 'static>;

/// Single-shot completion token handed to [`Sink::deliver`].
///
/// Consuming it reports the outcome exactly once. Dropping it without a
/// result reports a failure, so a sink that forgets to answer (or panics)
/// never wedges its output.
///
/// It is `Send`: a sink may move it into a spawned task and settle it from
/// any thread.
pub struct Completion {
    callback: Option<Callback>,
}

impl Completion {
    pub(crate) fn new(callback: impl FnOnce(DeliveryOutcome) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(callback)),
        }
    }

    pub fn success(mut self) {
        self.fire(DeliveryOutcome::Success);
    }

    pub fn fail(mut self, reason: impl Into<String>) {
        self.fire(DeliveryOutcome::Failure(reason.into()));
    }

    /// Report `Ok` as success and `Err` as failure with its message
    pub fn settle<E: fmt::Display>(self, result: Result<(), E>) {
        match result {
            Ok(()) => self.success(),
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn fire(&mut self, outcome: DeliveryOutcome) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.fire(DeliveryOutcome::Failure(
            "completion dropped without a result".into(),
        ));
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("settled", &self.callback.is_none())
            .finish()
    }
}

/// Destination for delivered batches.
///
/// `deliver` is called on the spool worker and must not block it: hand the
/// payloads to another thread or task and settle `done` from there. The
/// core imposes no timeout. A sink that never settles keeps its output's
/// lock held until `done` is dropped, so sinks talking to the network
/// should bound their own calls.
pub trait Sink: Send + Sync + 'static {
    fn deliver(&self, payloads: Vec<String>, done: Completion);
}

impl<F> Sink for F
where
    F: Fn(Vec<String>, Completion) + Send + Sync + 'static,
{
    fn deliver(&self, payloads: Vec<String>, done: Completion) {
        self(payloads, done)
    }
}

/// Rewrites or drops a payload before it is persisted. Returning `None`
/// drops it.
pub trait Filter: Send + Sync + 'static {
    fn apply(&self, payload: String) -> Option<String>;
}

impl<F> Filter for F
where
    F: Fn(String) -> Option<String> + Send + Sync + 'static,
{
    fn apply(&self, payload: String) -> Option<String> {
        self(payload)
    }
}
