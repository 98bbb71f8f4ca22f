//! Transcript parsing: turn JSONL records into paired tool calls.
//!
//! Two transcript dialects are understood. Calls arrive as `toolCall` or
//! `tool_use` content blocks in assistant messages; results arrive either as a
//! whole message with role `toolResult` or as `tool_result` content blocks.
//! Records may be the message itself or wrap it under `message`.

use std::collections::HashMap;

use chrono::DateTime;
use serde_json::{json, Map, Value};

use pulse_core::types::RawToolCall;

/// Tool name used when a result has no matching call.
pub const UNKNOWN_TOOL: &str = "unknown";

/// A call that has been seen but not yet answered.
#[derive(Debug, Clone)]
struct PendingCall {
    tool: String,
    params: Map<String, Value>,
    timestamp: Option<i64>,
    line: usize,
}

/// A reconstructed call/result pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairedCall {
    pub call_id: String,
    pub call: RawToolCall,
    /// Line on which the call was registered, when it was seen at all.
    pub call_line: Option<usize>,
}

/// Pairs calls with results across the lines of one transcript.
pub struct CallPairer {
    session_key: String,
    pending: HashMap<String, PendingCall>,
}

impl CallPairer {
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            pending: HashMap::new(),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Number of calls still waiting for a result.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed one parsed record. Returns the pairs it completed, in order.
    pub fn push(&mut self, record: &Value, line: usize) -> Vec<PairedCall> {
        let message = record.get("message").filter(|m| m.is_object()).unwrap_or(record);
        let timestamp = message
            .get("timestamp")
            .or_else(|| record.get("timestamp"))
            .and_then(parse_timestamp);

        let role = message
            .get("role")
            .or_else(|| record.get("role"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut paired = Vec::new();

        if role == "toolResult" || role == "tool" {
            if let Some(id) = str_field(message, &["toolCallId", "tool_call_id", "id"]) {
                let is_error = bool_field(message, &["isError", "is_error"]);
                let result = result_value(is_error, message.get("content"), message.get("details"));
                paired.push(self.complete(&id, result, timestamp));
            }
            return paired;
        }

        let Some(blocks) = message.get("content").and_then(Value::as_array) else {
            return paired;
        };

        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("toolCall") | Some("tool_use") => {
                    let Some(id) = str_field(block, &["id", "toolCallId"]) else {
                        continue;
                    };
                    let tool = str_field(block, &["name", "toolName"])
                        .unwrap_or_else(|| UNKNOWN_TOOL.to_string());
                    let params = ["arguments", "input", "params"]
                        .iter()
                        .find_map(|k| block.get(*k).and_then(Value::as_object))
                        .cloned()
                        .unwrap_or_default();
                    self.pending.insert(
                        id,
                        PendingCall {
                            tool,
                            params,
                            timestamp,
                            line,
                        },
                    );
                }
                Some("tool_result") => {
                    let Some(id) = str_field(block, &["tool_use_id", "toolCallId", "id"]) else {
                        continue;
                    };
                    let is_error = bool_field(block, &["is_error", "isError"]);
                    let result = result_value(is_error, block.get("content"), block.get("details"));
                    paired.push(self.complete(&id, result, timestamp));
                }
                _ => {}
            }
        }
        paired
    }

    fn complete(&mut self, id: &str, result: Value, timestamp: Option<i64>) -> PairedCall {
        let pending = self.pending.remove(id);
        let (tool, params, call_ts, call_line) = match pending {
            Some(p) => (p.tool, p.params, p.timestamp, Some(p.line)),
            None => (UNKNOWN_TOOL.to_string(), Map::new(), None, None),
        };

        let duration = match (call_ts, timestamp) {
            (Some(start), Some(end)) if end >= start => Some((end - start) as f64),
            _ => None,
        };

        PairedCall {
            call_id: id.to_string(),
            call: RawToolCall {
                tool,
                params,
                result: Some(result),
                duration,
                session_key: Some(self.session_key.clone()),
                timestamp: timestamp.or(call_ts),
            },
            call_line,
        }
    }
}

/// Accept RFC 3339 strings and epoch numbers (milliseconds, or seconds when
/// too small to be milliseconds).
pub fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis())
            .or_else(|| s.parse::<i64>().ok().map(normalize_epoch)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(normalize_epoch),
        _ => None,
    }
}

fn normalize_epoch(raw: i64) -> i64 {
    // Anything below 1e11 cannot be a millisecond timestamp after 1973.
    if raw.abs() < 100_000_000_000 {
        raw * 1000
    } else {
        raw
    }
}

/// Flatten content blocks to their text.
fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str).or_else(|| b.as_str()))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}

/// Build the result object the classifier inspects for status.
fn result_value(is_error: bool, content: Option<&Value>, details: Option<&Value>) -> Value {
    let mut map = Map::new();
    let text = content.and_then(content_text);
    if let Some(text) = &text {
        map.insert("output".to_string(), json!(text));
    }
    if let Some(details) = details.filter(|d| d.is_object()) {
        map.insert("details".to_string(), details.clone());
    }
    if is_error {
        map.insert(
            "error".to_string(),
            json!(text.unwrap_or_else(|| "tool reported an error".to_string())),
        );
    }
    Value::Object(map)
}

fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn bool_field(value: &Value, keys: &[&str]) -> bool {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_bool))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::types::ActivityStatus;
    use pulse_core::classify::infer_status;

    #[test]
    fn test_tool_call_then_tool_result_message() {
        let mut pairer = CallPairer::new("sess-1");
        let call = json!({
            "type": "message",
            "timestamp": "2025-01-15T10:00:00.000Z",
            "message": {
                "role": "assistant",
                "content": [
                    { "type": "text", "text": "running" },
                    { "type": "toolCall", "id": "c1", "name": "exec", "arguments": { "command": "ls" } }
                ]
            }
        });
        assert!(pairer.push(&call, 0).is_empty());
        assert_eq!(pairer.pending(), 1);

        let result = json!({
            "type": "message",
            "timestamp": "2025-01-15T10:00:01.500Z",
            "message": {
                "role": "toolResult",
                "toolCallId": "c1",
                "toolName": "exec",
                "content": [{ "type": "text", "text": "a.txt" }],
                "details": { "exitCode": 0 }
            }
        });
        let pairs = pairer.push(&result, 1);
        assert_eq!(pairs.len(), 1);
        let pair = &pairs[0];
        assert_eq!(pair.call_id, "c1");
        assert_eq!(pair.call_line, Some(0));
        assert_eq!(pair.call.tool, "exec");
        assert_eq!(pair.call.params["command"], "ls");
        assert_eq!(pair.call.session_key.as_deref(), Some("sess-1"));
        assert_eq!(pair.call.timestamp, Some(1_736_935_201_500));
        assert_eq!(pair.call.duration, Some(1_500.0));
        assert_eq!(infer_status(pair.call.result.as_ref()), ActivityStatus::Success);
        assert_eq!(pairer.pending(), 0);
    }

    #[test]
    fn test_tool_use_and_tool_result_blocks() {
        let mut pairer = CallPairer::new("s");
        pairer.push(
            &json!({
                "type": "assistant",
                "timestamp": 1_700_000_000_000_i64,
                "message": { "role": "assistant", "content": [
                    { "type": "tool_use", "id": "tu_1", "name": "Bash", "input": { "command": "false" } }
                ]}
            }),
            4,
        );
        let pairs = pairer.push(
            &json!({
                "type": "user",
                "timestamp": 1_700_000_000_250_i64,
                "message": { "role": "user", "content": [
                    { "type": "tool_result", "tool_use_id": "tu_1", "content": "exit 1", "is_error": true }
                ]}
            }),
            5,
        );
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].call.tool, "Bash");
        assert_eq!(pairs[0].call_line, Some(4));
        assert_eq!(pairs[0].call.duration, Some(250.0));
        assert_eq!(infer_status(pairs[0].call.result.as_ref()), ActivityStatus::Error);
    }

    #[test]
    fn test_unmatched_result_becomes_unknown() {
        let mut pairer = CallPairer::new("s");
        let pairs = pairer.push(
            &json!({ "role": "toolResult", "toolCallId": "orphan", "timestamp": 5, "content": "x" }),
            0,
        );
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].call.tool, UNKNOWN_TOOL);
        assert!(pairs[0].call.params.is_empty());
        assert_eq!(pairs[0].call_line, None);
        assert_eq!(pairs[0].call.timestamp, Some(5_000));
    }

    #[test]
    fn test_records_without_tools_are_ignored() {
        let mut pairer = CallPairer::new("s");
        assert!(pairer.push(&json!({ "type": "session", "id": "abc" }), 0).is_empty());
        assert!(pairer
            .push(&json!({ "message": { "role": "user", "content": "hello" } }), 1)
            .is_empty());
        assert_eq!(pairer.pending(), 0);
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(
            parse_timestamp(&json!("2025-01-15T10:00:00Z")),
            Some(1_736_935_200_000)
        );
        assert_eq!(
            parse_timestamp(&json!("2025-01-15T11:00:00+01:00")),
            Some(1_736_935_200_000)
        );
        assert_eq!(parse_timestamp(&json!(1_736_935_200_000_i64)), Some(1_736_935_200_000));
        assert_eq!(parse_timestamp(&json!(1_736_935_200)), Some(1_736_935_200_000));
        assert_eq!(parse_timestamp(&json!(1_736_935_200.5)), Some(1_736_935_200_000));
        assert_eq!(parse_timestamp(&json!("yesterday")), None);
        assert_eq!(parse_timestamp(&json!(null)), None);
    }
}
