//! Serde shapes for the ingestion API and the script stdin payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::events::{Event, NewEvent};

/// An event as submitted over HTTP. Only `name` is required; `timestamp`
/// defaults to the server's receive time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default = "default_data")]
    pub data: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

fn default_data() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl WireEvent {
    pub fn into_new_event(self, received_at: DateTime<Utc>) -> NewEvent {
        NewEvent {
            name: self.name,
            source: self.source,
            data: self.data,
            timestamp: self.timestamp.unwrap_or(received_at),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub events: Vec<WireEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub received: usize,
}

/// JSON written to a triggered script's stdin. `None` when the run was
/// purely schedule-driven, in which case stdin is left empty.
pub fn script_payload(events: &[Event]) -> anyhow::Result<Option<String>> {
    if events.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(events)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_event_defaults_are_filled() {
        let event: WireEvent = serde_json::from_value(json!({"name": "ping"})).unwrap();
        assert_eq!(event.name, "ping");
        assert!(event.source.is_none());
        assert_eq!(event.data, json!({}));
        assert!(event.timestamp.is_none());

        let received_at = Utc::now();
        let new_event = event.into_new_event(received_at);
        assert_eq!(new_event.timestamp, received_at);
    }

    #[test]
    fn wire_event_keeps_explicit_fields() {
        let event: WireEvent = serde_json::from_value(json!({
            "name": "message_created",
            "source": "slack",
            "data": {"text": "hi"},
            "timestamp": "2026-03-01T12:00:00Z"
        }))
        .unwrap();
        let new_event = event.into_new_event(Utc::now());
        assert_eq!(new_event.source.as_deref(), Some("slack"));
        assert_eq!(new_event.data, json!({"text": "hi"}));
        assert_eq!(
            new_event.timestamp.to_rfc3339(),
            "2026-03-01T12:00:00+00:00"
        );
    }

    #[test]
    fn script_payload_is_none_without_events() {
        assert!(script_payload(&[]).unwrap().is_none());
    }

    #[test]
    fn script_payload_serializes_event_list() {
        let events = vec![Event {
            id: 7,
            name: "note_created".to_string(),
            source: Some("obsidian".to_string()),
            data: json!({"title": "t"}),
            timestamp: Utc::now(),
        }];
        let payload = script_payload(&events).unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed[0]["id"], 7);
        assert_eq!(parsed[0]["name"], "note_created");
        assert_eq!(parsed[0]["source"], "obsidian");
    }
}
