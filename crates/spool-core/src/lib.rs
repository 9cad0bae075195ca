//! Spool Core Library
//!
//! Durable, batched log delivery: buffer events on disk, hand them to a
//! sink in batches, retry on failure.
//!
//! ## Overview
//!
//! Applications hand log events to a [`BufferedOutput`]. The event is
//! persisted to a local redb file on a background worker and the call
//! returns immediately. Each output flushes on an interval: it locks its
//! storage, selects a bounded, sorted batch of its kind, and passes the
//! payloads to a [`Sink`]. Records are deleted only after the sink confirms
//! delivery, so a crash or an unreachable backend never loses buffered
//! data; at worst a batch is delivered twice.
//!
//! ## Core Principles
//!
//! - **Never block producers**: `receive` only enqueues
//! - **At-least-once**: delete after acknowledgement, never before
//! - **One batch in flight per output**: a coarse, non-blocking storage lock
//! - **Bounded retries**: a failing sink exhausts its attempts and waits for
//!   new traffic instead of spinning
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use spool_core::{Completion, OutputConfig, Sort, Spool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let spool = Spool::open("~/.spool/data/spool.redb")?;
//!
//!     let config = OutputConfig::default()
//!         .with_flush_interval(Duration::from_secs(5))
//!         .with_batch_size(50)
//!         .with_sort([Sort::priority_desc()]);
//!
//!     let clicks = spool.register("clicks", config, |batch: Vec<String>, done: Completion| {
//!         tokio::spawn(async move {
//!             let result = upload(batch).await;
//!             done.settle(result);
//!         });
//!     })?;
//!
//!     clicks.receive(r#"{"button":"buy"}"#);
//!     clicks.receive_with_priority(r#"{"button":"cancel"}"#, 5);
//!
//!     spool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod executor;
pub mod logging;
pub mod output;
pub mod query;
pub mod scheduler;
pub mod spool;
pub mod storage;
pub mod types;

// Re-exports
pub use config::OutputConfig;
pub use delivery::{Completion, DeliveryOutcome, Filter, Sink};
pub use error::{SpoolError, SpoolResult};
pub use executor::WorkQueue;
pub use logging::{LogEntry, SpoolLayer};
pub use output::BufferedOutput;
pub use query::{Predicate, Query, Sort, SortField, SortOrder};
pub use scheduler::RetryableTask;
pub use spool::{Spool, SpoolOptions};
pub use storage::{Storage, StorageOptions, SCHEMA_VERSION};
pub use types::*;
