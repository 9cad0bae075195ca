//! JSON shape of a captured tracing event.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Level;

/// One tracing event, self-contained so it can be delivered on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// RFC 3339 timestamp with milliseconds, UTC
    pub ts: String,

    /// trace, debug, info, warn or error
    pub level: String,

    /// Module path / target of the event
    pub target: String,

    pub msg: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, root first, joined with " > "
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogEntry {
    pub fn new(level: &Level, target: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.as_str().to_lowercase(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Buffer priority for an event level; more severe events sort first
/// under a priority-descending output.
pub fn level_priority(level: &Level) -> i32 {
    match *level {
        Level::ERROR => 4,
        Level::WARN => 3,
        Level::INFO => 2,
        Level::DEBUG => 1,
        Level::TRACE => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serialization() {
        let entry = LogEntry::new(&Level::INFO, "app::checkout", "Order placed");

        let json = entry.to_json_line().unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(json.contains("\"msg\":\"Order placed\""));
        assert!(!json.contains("\"fields\""));
        assert!(!json.contains('\n'));

        let parsed = LogEntry::from_json_line(&json).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_entry_with_fields_and_span() {
        let entry = LogEntry::new(&Level::WARN, "app", "Slow request")
            .with_fields(serde_json::json!({ "elapsed_ms": 812 }))
            .with_span("request > db");

        let json = entry.to_json_line().unwrap();
        assert!(json.contains("\"elapsed_ms\":812"));
        assert!(json.contains("\"span\":\"request > db\""));
    }

    #[test]
    fn test_level_priority_orders_by_severity() {
        assert!(level_priority(&Level::ERROR) > level_priority(&Level::WARN));
        assert!(level_priority(&Level::WARN) > level_priority(&Level::INFO));
        assert!(level_priority(&Level::DEBUG) > level_priority(&Level::TRACE));
    }
}
