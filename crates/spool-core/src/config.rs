//! Per-output configuration.
//!
//! Fixed when an output is registered; nothing here can change mid-cycle.
//! Durations serialize as whole milliseconds:
//!
//! ```json
//! {
//!   "flush_interval": 120000,
//!   "batch_size": 100,
//!   "max_retry_attempts": 5,
//!   "purge_age": null,
//!   "sort": [{ "field": "id", "order": "ascending" }]
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SpoolError;
use crate::query::Sort;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(120_000);
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Delay between a trigger and the flush cycle it arms
    #[serde(with = "millis")]
    pub flush_interval: Duration,
    /// Records per delivery
    pub batch_size: usize,
    /// Failed attempts per cycle before the cycle is abandoned
    pub max_retry_attempts: u32,
    /// Records older than this are purged before each select. `None`
    /// disables purging; in JSON so do `null` and any negative value.
    #[serde(with = "millis::option")]
    pub purge_age: Option<Duration>,
    pub sort: Vec<Sort>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            purge_age: None,
            sort: vec![Sort::id_asc()],
        }
    }
}

impl OutputConfig {
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_purge_age(mut self, age: Duration) -> Self {
        self.purge_age = Some(age);
        self
    }

    pub fn with_sort(mut self, sort: impl IntoIterator<Item = Sort>) -> Self {
        self.sort = sort.into_iter().collect();
        self
    }

    /// Reject values that would make an output spin or never deliver.
    pub fn validate(&self) -> Result<(), SpoolError> {
        if self.flush_interval.is_zero() {
            return Err(SpoolError::InvalidConfig(
                "flush_interval must be positive".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(SpoolError::InvalidConfig(
                "batch_size must be positive".into(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(SpoolError::InvalidConfig(
                "max_retry_attempts must be positive".into(),
            ));
        }
        if self.purge_age.is_some_and(|age| age.is_zero()) {
            return Err(SpoolError::InvalidConfig(
                "purge_age must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            // Negative values (the historical `-1`) mean disabled
            let ms = Option::<i64>::deserialize(deserializer)?;
            Ok(ms
                .and_then(|ms| u64::try_from(ms).ok())
                .map(Duration::from_millis))
        }
    }
}
