//! SSE events as exchanged with the runner's log endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event in a runner's log stream. The runner emits these as
/// line-delimited JSON; synthetic `ping` and `shutdown` events are produced
/// by the relay itself and carry no id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl LogEvent {
    /// Synthetic keepalive.
    pub fn ping() -> Self {
        Self {
            id: 0,
            event: "ping".to_string(),
            data: Value::Null,
        }
    }

    /// Synthetic end-of-stream marker.
    pub fn shutdown(message: &str) -> Self {
        Self {
            id: 0,
            event: "shutdown".to_string(),
            data: Value::String(message.to_string()),
        }
    }

    /// A numbered log line from the legacy stream.
    pub fn message(id: u64, line: String) -> Self {
        Self {
            id,
            event: "message".to_string(),
            data: Value::String(line),
        }
    }

    /// Decode one line of runner output.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    fn data_string(&self) -> String {
        match &self.data {
            Value::Null => String::new(),
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }

    /// The wire frame: `id:` and `event:` lines when present, always a
    /// `data:` line, then a blank line.
    pub fn to_frame(&self) -> String {
        let mut frame = String::new();
        if self.id != 0 {
            frame.push_str(&format!("id: {}\n", self.id));
        }
        if !self.event.is_empty() {
            frame.push_str(&format!("event: {}\n", self.event));
        }
        frame.push_str(&format!("data: {}\n\n", self.data_string()));
        frame
    }

    /// The axum representation of this event.
    pub fn into_sse(self) -> axum::response::sse::Event {
        let mut event = axum::response::sse::Event::default();
        if self.id != 0 {
            event = event.id(self.id.to_string());
        }
        if !self.event.is_empty() {
            event = event.event(&self.event);
        }
        event.data(self.data_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_runner_event_lines() {
        let event =
            LogEvent::parse(r#"{"id": 3, "event": "message", "data": {"msg": "hello"}}"#).unwrap();
        assert_eq!(event.id, 3);
        assert_eq!(event.event, "message");
        assert_eq!(event.data["msg"], "hello");
    }

    #[test]
    fn malformed_lines_are_errors() {
        assert!(LogEvent::parse("not json at all").is_err());
    }

    #[test]
    fn frame_carries_id_event_and_data() {
        let event = LogEvent::message(5, "hello".to_string());
        assert_eq!(event.to_frame(), "id: 5\nevent: message\ndata: hello\n\n");
    }

    #[test]
    fn ping_frame_has_no_id() {
        assert_eq!(LogEvent::ping().to_frame(), "event: ping\ndata: \n\n");
    }

    #[test]
    fn structured_data_is_reserialized() {
        let event = LogEvent {
            id: 1,
            event: "message".to_string(),
            data: serde_json::json!({ "level": "info" }),
        };
        assert_eq!(
            event.to_frame(),
            "id: 1\nevent: message\ndata: {\"level\":\"info\"}\n\n"
        );
    }
}
