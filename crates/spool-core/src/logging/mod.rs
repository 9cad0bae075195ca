//! Feed `tracing` events into a buffered output.
//!
//! [`SpoolLayer`] renders every event it sees as one JSON object
//! ([`LogEntry`]) and hands it to a [`BufferedOutput`](crate::BufferedOutput),
//! with a priority derived from the event level. The output persists it and
//! delivers it in batches like any other payload.
//!
//! ```ignore
//! use spool_core::logging::SpoolLayer;
//! use tracing_subscriber::prelude::*;
//!
//! let output = spool.register("app_logs", OutputConfig::default(), sink)?;
//!
//! tracing_subscriber::registry()
//!     .with(SpoolLayer::new(output))
//!     .with(tracing_subscriber::fmt::layer())
//!     .init();
//! ```
//!
//! Events emitted by this crate itself are skipped so that a failing
//! output cannot feed on its own diagnostics.

pub mod entry;
pub mod layer;

pub use entry::LogEntry;
pub use layer::SpoolLayer;
