use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One observed log line, in the shape it travels over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Source identifier the line is shipped under
    pub service_name: String,
    pub hostname: String,
    pub file_path: String,
    pub line: String,
    /// Observation time on the tailer
    pub timestamp: DateTime<Utc>,
    /// 1-based, strictly increasing per file within one watch session
    pub line_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Map<String, Value>>,
}

impl LogEvent {
    pub fn new(
        service_name: impl Into<String>,
        hostname: impl Into<String>,
        file_path: impl Into<String>,
        line: impl Into<String>,
        line_number: u64,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            hostname: hostname.into(),
            file_path: file_path.into(),
            line: line.into(),
            timestamp: Utc::now(),
            line_number,
            parsed: None,
        }
    }
}

/// Parse a raw line as a JSON object. Anything else (plain text, arrays,
/// scalars) yields `None`.
pub fn parse_structured(line: &str) -> Option<Map<String, Value>> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
