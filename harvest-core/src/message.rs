use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// A record exactly as the audit-log API returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent(Value);

impl RawEvent {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Top-level string field, used for best-effort diagnostics on records that may be broken.
    pub fn text_field(&self, name: &str) -> Option<String> {
        self.0.get(name)?.as_str().map(str::to_string)
    }
}

impl From<Value> for RawEvent {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// One page of a window walk. A missing continuation means the window is exhausted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub events: Vec<RawEvent>,
    pub continuation: Option<String>,
}

impl Page {
    pub fn new(events: Vec<RawEvent>, continuation: Option<String>) -> Self {
        Self {
            events,
            continuation,
        }
    }
}

/// Source-independent record handed to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    /// Source identifier, carried for logging and sink output.
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Every top-level field of the source record, ordered by name.
    pub fields: Map<String, Value>,
}

impl NormalizedEvent {
    /// The document written by sinks: the source fields plus `@timestamp`.
    pub fn to_document(&self) -> Value {
        let mut doc = self.fields.clone();
        doc.insert(
            "@timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );
        Value::Object(doc)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn text_field_ignores_non_strings() {
        let raw = RawEvent::from(json!({"uuid": "abc", "count": 3}));
        assert_eq!(raw.text_field("uuid"), Some("abc".to_string()));
        assert_eq!(raw.text_field("count"), None);
        assert_eq!(raw.text_field("missing"), None);
        assert_eq!(RawEvent::from(json!([1, 2])).text_field("uuid"), None);
    }

    #[test]
    fn document_carries_timestamp() {
        let mut fields = Map::new();
        fields.insert("eventType".into(), json!("user.session.start"));
        let event = NormalizedEvent {
            id: Some("abc".into()),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            fields,
        };
        assert_eq!(
            event.to_document(),
            json!({
                "@timestamp": "2024-05-01T10:00:00+00:00",
                "eventType": "user.session.start",
            })
        );
    }
}
