//! JSON output for the command stream
//!
//! Every response and stream-level event is written to stdout as one JSON
//! object per line, so the daemon can be driven by scripts. Logs go to
//! stderr and never mix with this channel.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use crate::dispatch::CommandResponse;

/// Get current timestamp as f64 seconds since UNIX epoch with consistent precision
pub fn current_timestamp() -> f64 {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    // Round to 6 decimal places for consistent formatting
    (timestamp * 1_000_000.0).round() / 1_000_000.0
}

/// Result of one dispatched command
#[derive(Debug, Clone, Serialize)]
pub struct ResponseEvent<'a> {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    #[serde(flatten)]
    pub response: &'a CommandResponse,
}

/// Input that never reached the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub error: String,
    /// Offending input line, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Ready,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub event: LifecycleKind,
    pub message: String,
}

impl<'a> ResponseEvent<'a> {
    pub fn new(response: &'a CommandResponse) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "response",
            response,
        }
    }
}

impl ErrorEvent {
    pub fn new(error: &str, line: Option<&str>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            error: error.to_string(),
            line: line.map(str::to_string),
        }
    }
}

impl LifecycleEvent {
    pub fn new(event: LifecycleKind, message: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "lifecycle".to_string(),
            event,
            message: message.to_string(),
        }
    }
}

/// Serialize an event to a single line
pub fn to_json_line<T: Serialize>(event: &T) -> Option<String> {
    serde_json::to_string(event).ok()
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Some(json) = to_json_line(event) {
        println!("{}", json);
    }
}

/// Convenience functions for outputting specific event types
pub mod output {
    use super::*;

    pub fn response(response: &CommandResponse) {
        output_event(&ResponseEvent::new(response));
    }

    pub fn error(error: &str, line: Option<&str>) {
        output_event(&ErrorEvent::new(error, line));
    }

    pub fn ready(message: &str) {
        output_event(&LifecycleEvent::new(LifecycleKind::Ready, message));
    }

    pub fn shutdown(message: &str) {
        output_event(&LifecycleEvent::new(LifecycleKind::Shutdown, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_response_event_is_flat() {
        let response = CommandResponse {
            method: "move".to_string(),
            success: false,
            message: "Robot not connected".to_string(),
            duration_ms: 3,
            error_kind: Some("illegal_state".to_string()),
            data: None,
        };
        let line = to_json_line(&ResponseEvent::new(&response)).unwrap();
        assert!(!line.contains('\n'));

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["method"], "move");
        assert_eq!(value["error_kind"], "illegal_state");
        assert!(value["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_error_event_omits_missing_line() {
        let value: Value = serde_json::from_str(&to_json_line(&ErrorEvent::new("bad", None)).unwrap()).unwrap();
        assert_eq!(value["type"], "error");
        assert!(value.get("line").is_none());

        let event = ErrorEvent::new("unknown method 'fly'", Some("@fly"));
        assert_eq!(event.line.as_deref(), Some("@fly"));
    }

    #[test]
    fn test_lifecycle_event_kind() {
        let value: Value =
            serde_json::from_str(&to_json_line(&LifecycleEvent::new(LifecycleKind::Shutdown, "bye")).unwrap()).unwrap();
        assert_eq!(value["event"], "shutdown");
    }
}
