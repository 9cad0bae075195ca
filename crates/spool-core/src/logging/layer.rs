//! `tracing_subscriber::Layer` that buffers events through a spool output.

use std::fmt::Write as FmtWrite;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use super::entry::{level_priority, LogEntry};
use crate::output::BufferedOutput;

const OWN_TARGET: &str = env!("CARGO_CRATE_NAME");

/// Renders events as [`LogEntry`] JSON and hands them to a
/// [`BufferedOutput`].
pub struct SpoolLayer {
    output: BufferedOutput,
    prioritize: bool,
}

impl SpoolLayer {
    pub fn new(output: BufferedOutput) -> Self {
        Self {
            output,
            prioritize: true,
        }
    }

    /// Buffer every event with priority 0 instead of one derived from its
    /// level.
    pub fn without_priorities(mut self) -> Self {
        self.prioritize = false;
        self
    }

    pub fn output(&self) -> &BufferedOutput {
        &self.output
    }
}

impl<S> Layer<S> for SpoolLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let target = metadata.target();
        if target.starts_with(OWN_TARGET) {
            return;
        }

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut entry = LogEntry::new(
            metadata.level(),
            target,
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            entry = entry.with_fields(serde_json::Value::Object(visitor.fields));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }

        let Ok(line) = entry.to_json_line() else {
            return;
        };
        let priority = if self.prioritize {
            level_priority(metadata.level())
        } else {
            0
        };
        self.output.receive_with_priority(line, priority);
    }
}

/// Collects the message and structured fields of an event.
#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);

        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, serde_json::Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, serde_json::Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, serde_json::Value::String(value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputConfig;
    use crate::delivery::Completion;
    use crate::query::{Query, Sort};
    use crate::spool::Spool;
    use tempfile::TempDir;
    use tracing_subscriber::prelude::*;

    fn hold(_payloads: Vec<String>, _done: Completion) {}

    #[tokio::test]
    async fn test_layer_buffers_events_as_json() {
        let temp = TempDir::new().unwrap();
        let spool = Spool::open(temp.path().join("spool.redb")).unwrap();
        let output = spool
            .register("app_logs", OutputConfig::default(), hold)
            .unwrap();

        let subscriber = tracing_subscriber::registry().with(SpoolLayer::new(output.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "app", "Order placed");
            tracing::error!(target: "app", code = 42, "Payment declined");
        });
        spool.sync().await.unwrap();

        let stored = output
            .storage()
            .select(&Query::new().sort_by(Sort::priority_desc()))
            .unwrap();
        assert_eq!(stored.len(), 2);

        let first = LogEntry::from_json_line(&stored.records()[0].payload).unwrap();
        assert_eq!(first.level, "error");
        assert_eq!(first.msg, "Payment declined");
        assert_eq!(first.fields.unwrap()["code"], 42);
        assert_eq!(stored.records()[0].priority, 4);

        let second = LogEntry::from_json_line(&stored.records()[1].payload).unwrap();
        assert_eq!(second.msg, "Order placed");
    }

    #[tokio::test]
    async fn test_layer_skips_own_events() {
        let temp = TempDir::new().unwrap();
        let spool = Spool::open(temp.path().join("spool.redb")).unwrap();
        let output = spool
            .register("app_logs", OutputConfig::default(), hold)
            .unwrap();

        let subscriber = tracing_subscriber::registry()
            .with(SpoolLayer::new(output.clone()).without_priorities());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "spool_core::output", "internal");
            tracing::warn!(target: "app", "external");
        });
        spool.sync().await.unwrap();

        let stored = output.storage().select_all().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored.records()[0].priority, 0);
    }
}
