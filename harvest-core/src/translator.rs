use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::message::{NormalizedEvent, RawEvent};

const DEFAULT_TIMESTAMP_FIELD: &str = "published";
const DEFAULT_ID_FIELD: &str = "uuid";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("required field {0} is missing")]
    MissingField(String),

    #[error("field {field} must be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },

    #[error("field {field} is not an RFC3339 timestamp - {reason}")]
    InvalidTimestamp { field: String, reason: String },
}

/// Converts a source record into a [NormalizedEvent]. Only the timestamp and the identifier are
/// interpreted; every other field is carried over as is.
#[derive(Debug, Clone)]
pub struct EventTranslator {
    timestamp_field: String,
    id_field: String,
}

impl Default for EventTranslator {
    fn default() -> Self {
        Self::new(DEFAULT_TIMESTAMP_FIELD, DEFAULT_ID_FIELD)
    }
}

impl EventTranslator {
    pub fn new(timestamp_field: impl Into<String>, id_field: impl Into<String>) -> Self {
        Self {
            timestamp_field: timestamp_field.into(),
            id_field: id_field.into(),
        }
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn translate(&self, raw: RawEvent) -> Result<NormalizedEvent, DecodeError> {
        let Value::Object(fields) = raw.into_value() else {
            return Err(DecodeError::NotAnObject);
        };

        let timestamp = match fields.get(&self.timestamp_field) {
            None | Some(Value::Null) => {
                return Err(DecodeError::MissingField(self.timestamp_field.clone()));
            }
            Some(Value::String(ts)) => DateTime::parse_from_rfc3339(ts)
                .map_err(|e| DecodeError::InvalidTimestamp {
                    field: self.timestamp_field.clone(),
                    reason: e.to_string(),
                })?
                .with_timezone(&Utc),
            Some(_) => {
                return Err(DecodeError::WrongType {
                    field: self.timestamp_field.clone(),
                    expected: "an RFC3339 string",
                });
            }
        };

        let id = match fields.get(&self.id_field) {
            None | Some(Value::Null) => {
                return Err(DecodeError::MissingField(self.id_field.clone()));
            }
            Some(Value::String(id)) => id.clone(),
            Some(_) => {
                return Err(DecodeError::WrongType {
                    field: self.id_field.clone(),
                    expected: "a string",
                });
            }
        };

        Ok(NormalizedEvent {
            id: Some(id),
            timestamp,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn translates_okta_event() {
        let raw = RawEvent::from(json!({
            "uuid": "f0a1",
            "published": "2024-05-01T10:00:00.123Z",
            "eventType": "user.session.start",
            "actor": {"id": "00u1", "type": "User"},
        }));
        let event = EventTranslator::default().translate(raw).unwrap();

        assert_eq!(event.id.as_deref(), Some("f0a1"));
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
                + chrono::Duration::milliseconds(123)
        );
        assert_eq!(event.fields.len(), 4);
        assert_eq!(event.fields["actor"], json!({"id": "00u1", "type": "User"}));
    }

    #[test]
    fn field_order_is_deterministic() {
        let translator = EventTranslator::default();
        let a = translator
            .translate(RawEvent::from(json!({
                "uuid": "1", "published": "2024-05-01T10:00:00Z", "b": 1, "a": 2
            })))
            .unwrap();
        let keys: Vec<_> = a.fields.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a", "b", "published", "uuid"]);
    }

    #[test]
    fn normalizes_offsets_to_utc() {
        let event = EventTranslator::default()
            .translate(RawEvent::from(
                json!({"uuid": "1", "published": "2024-05-01T12:00:00+02:00"}),
            ))
            .unwrap();
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn rejects_broken_records() {
        let translator = EventTranslator::default();
        let cases = [
            (json!("text"), DecodeError::NotAnObject),
            (
                json!({"uuid": "1"}),
                DecodeError::MissingField("published".into()),
            ),
            (
                json!({"published": "2024-05-01T10:00:00Z"}),
                DecodeError::MissingField("uuid".into()),
            ),
            (
                json!({"uuid": "1", "published": 1714557600}),
                DecodeError::WrongType {
                    field: "published".into(),
                    expected: "an RFC3339 string",
                },
            ),
            (
                json!({"uuid": 7, "published": "2024-05-01T10:00:00Z"}),
                DecodeError::WrongType {
                    field: "uuid".into(),
                    expected: "a string",
                },
            ),
        ];
        for (raw, expected) in cases {
            assert_eq!(translator.translate(RawEvent::from(raw)).unwrap_err(), expected);
        }

        assert!(matches!(
            translator.translate(RawEvent::from(
                json!({"uuid": "1", "published": "yesterday"})
            )),
            Err(DecodeError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn custom_field_names() {
        let translator = EventTranslator::new("time", "id");
        let event = translator
            .translate(RawEvent::from(json!({"id": "x", "time": "2024-05-01T10:00:00Z"})))
            .unwrap();
        assert_eq!(event.id.as_deref(), Some("x"));
        assert_eq!(translator.id_field(), "id");
    }
}
