//! CLI output processing
//!
//! Turns raw stdout into a normalized turn result. Handles a single JSON
//! object, newline-delimited stream-json events, and plain text.

use crate::error::{ProcessError, ProcessErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool invocation reported by the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl Usage {
    fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let field = |name: &str| obj.get(name).and_then(Value::as_u64).unwrap_or(0);
        Some(Self {
            input_tokens: field("input_tokens"),
            output_tokens: field("output_tokens"),
            cache_creation_input_tokens: field("cache_creation_input_tokens"),
            cache_read_input_tokens: field("cache_read_input_tokens"),
        })
    }

    fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_use: Vec<ToolUse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResult {
    pub success: bool,
    pub is_streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: StreamMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Error phrasing found in CLI output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ProcessErrorKind,
}

const NO_RESPONSE: &str = "No valid response from Claude";

/// Process one turn's stdout.
///
/// `Ok` carries the normalized result (which may itself be `success: false`
/// when the CLI produced nothing usable); `Err` is a parse failure.
pub fn process_output(
    raw: &str,
    session_id: &str,
    request_id: Option<&str>,
) -> Result<TurnResult, ProcessError> {
    let trimmed = raw.trim();

    let mut result = if let Ok(event @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        tracing::debug!("Session {}: single JSON response", session_id);
        process_single_response(&event)?
    } else {
        let events = parse_event_lines(trimmed);
        if events.is_empty() {
            process_plain_text(raw)
        } else {
            tracing::debug!("Session {}: folding {} stream events", session_id, events.len());
            process_streaming_response(&events)?
        }
    };

    result.request_id = request_id.map(str::to_string);
    Ok(result)
}

/// JSON objects found one per line; anything else is skipped
fn parse_event_lines(text: &str) -> Vec<Value> {
    let mut events = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<Value>(line) {
            Ok(event @ Value::Object(_)) => events.push(event),
            _ => tracing::debug!("Skipping non-JSON output line: {}", line),
        }
    }
    events
}

/// A whole reply as one object succeeds unless it reports an error itself
fn process_single_response(event: &Value) -> Result<TurnResult, ProcessError> {
    let mut fold = StreamFold::default();
    fold.absorb(event)?;
    Ok(fold.finish(false))
}

fn process_plain_text(raw: &str) -> TurnResult {
    let text = clean_text(raw);
    if text.is_empty() {
        TurnResult {
            success: false,
            is_streaming: false,
            claude_session_id: None,
            response: String::new(),
            error: Some(NO_RESPONSE.to_string()),
            metadata: StreamMetadata::default(),
            request_id: None,
        }
    } else {
        TurnResult {
            success: true,
            is_streaming: false,
            claude_session_id: None,
            response: text,
            error: None,
            metadata: StreamMetadata::default(),
            request_id: None,
        }
    }
}

/// Strip ANSI escapes and carriage returns, then trim
pub fn clean_text(raw: &str) -> String {
    strip_ansi_escapes::strip_str(raw).replace('\r', "").trim().to_string()
}

#[derive(Default)]
struct StreamFold {
    delta_text: String,
    block_text: String,
    result_text: Option<String>,
    session_id: Option<String>,
    metadata: StreamMetadata,
    final_usage: Option<Usage>,
    error: Option<String>,
}

impl StreamFold {
    fn absorb(&mut self, event: &Value) -> Result<(), ProcessError> {
        let obj = event
            .as_object()
            .ok_or_else(|| ProcessError::parse_failure("stream event is not a JSON object"))?;

        if let Some(id) = obj.get("session_id").and_then(Value::as_str) {
            self.session_id = Some(id.to_string());
        }

        // Partial-message mode wraps raw API events
        if let Some(inner) = obj.get("event").filter(|v| v.is_object()) {
            return self.absorb(inner);
        }

        if let Some(model) = obj.get("model").and_then(Value::as_str) {
            self.metadata.model = Some(model.to_string());
        }

        match obj.get("type").and_then(Value::as_str).unwrap_or_default() {
            "content_block_delta" => {
                if let Some(delta) = obj.get("delta") {
                    self.absorb_delta(delta);
                }
            }
            "text_delta" => {
                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                    self.delta_text.push_str(text);
                }
            }
            "content_block_start" => {
                if let Some(block) = obj.get("content_block") {
                    self.absorb_block(block);
                }
            }
            "message_start" | "assistant" => {
                if let Some(message) = obj.get("message") {
                    self.absorb_message(message);
                }
            }
            "message_delta" => {
                if let Some(reason) = obj
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    self.metadata.stop_reason = Some(reason.to_string());
                }
                if let Some(usage) = obj.get("usage").and_then(Usage::from_value) {
                    self.metadata.usage.add(&usage);
                }
            }
            "result" => {
                if let Some(text) = obj.get("result").and_then(Value::as_str) {
                    self.result_text = Some(text.to_string());
                }
                if let Some(usage) = obj.get("usage").and_then(Usage::from_value) {
                    self.final_usage = Some(usage);
                }
                let is_error = obj.get("is_error").and_then(Value::as_bool).unwrap_or(false)
                    || obj
                        .get("subtype")
                        .and_then(Value::as_str)
                        .map(|s| s.starts_with("error"))
                        .unwrap_or(false);
                if is_error {
                    let message = self
                        .result_text
                        .clone()
                        .or_else(|| obj.get("subtype").and_then(Value::as_str).map(str::to_string))
                        .unwrap_or_else(|| "Claude reported an error".to_string());
                    self.error = Some(message);
                }
            }
            "error" => {
                let message = obj
                    .get("error")
                    .and_then(|e| e.get("message").or(Some(e)))
                    .map(|m| m.as_str().map(str::to_string).unwrap_or_else(|| m.to_string()))
                    .unwrap_or_else(|| "Claude reported an error".to_string());
                self.error = Some(message);
            }
            _ => {}
        }

        if let Some(content) = obj.get("content").and_then(Value::as_str) {
            self.delta_text.push_str(content);
        }
        Ok(())
    }

    fn absorb_delta(&mut self, delta: &Value) {
        match delta.get("type").and_then(Value::as_str) {
            Some("text_delta") | None => {
                if let Some(text) = delta.get("text").and_then(Value::as_str) {
                    self.delta_text.push_str(text);
                }
            }
            _ => {}
        }
    }

    fn absorb_message(&mut self, message: &Value) {
        if let Some(model) = message.get("model").and_then(Value::as_str) {
            self.metadata.model = Some(model.to_string());
        }
        if let Some(usage) = message.get("usage").and_then(Usage::from_value) {
            self.metadata.usage.add(&usage);
        }
        if let Some(reason) = message.get("stop_reason").and_then(Value::as_str) {
            self.metadata.stop_reason = Some(reason.to_string());
        }
        if let Some(blocks) = message.get("content").and_then(Value::as_array) {
            for block in blocks {
                self.absorb_block(block);
            }
        }
    }

    fn absorb_block(&mut self, block: &Value) {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    self.block_text.push_str(text);
                }
            }
            Some("tool_use") => {
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let id = block.get("id").and_then(Value::as_str).map(str::to_string);
                if id.is_some() && self.metadata.tool_use.iter().any(|t| t.id == id) {
                    return;
                }
                self.metadata.tool_use.push(ToolUse {
                    id,
                    name,
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                });
            }
            _ => {}
        }
    }

    fn finish(mut self, require_text: bool) -> TurnResult {
        if let Some(total) = self.final_usage.take() {
            self.metadata.usage = total;
        }
        // Deltas and full message blocks describe the same text; prefer the
        // incremental stream, then whole blocks, then the final result field.
        let response = if !self.delta_text.is_empty() {
            self.delta_text
        } else if !self.block_text.is_empty() {
            self.block_text
        } else {
            self.result_text.unwrap_or_default()
        };

        let error = self.error.or_else(|| {
            (require_text && response.trim().is_empty()).then(|| NO_RESPONSE.to_string())
        });
        TurnResult {
            success: error.is_none(),
            is_streaming: true,
            claude_session_id: self.session_id,
            response,
            error,
            metadata: self.metadata,
            request_id: None,
        }
    }
}

/// Fold stream-json events into a single result
pub fn process_streaming_response(events: &[Value]) -> Result<TurnResult, ProcessError> {
    let mut fold = StreamFold::default();
    for event in events {
        fold.absorb(event)?;
    }
    Ok(fold.finish(true))
}

const ERROR_MARKERS: &[&str] = &[
    "error:",
    "failed:",
    "exception:",
    "rate_limit_error",
    "session expired",
    "session not found",
];

/// Find the first line that reads like a failure and classify it
pub fn extract_error(text: &str) -> Option<ExtractedError> {
    let cleaned = clean_text(text);
    cleaned
        .lines()
        .map(str::trim)
        .find(|line| {
            let lower = line.to_lowercase();
            ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .map(|line| ExtractedError {
            message: line.to_string(),
            kind: classify_error(line),
        })
}

pub fn classify_error(message: &str) -> ProcessErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("rate_limit") || lower.contains("rate limit") || lower.contains("429") {
        ProcessErrorKind::RateLimit
    } else if lower.contains("session expired")
        || lower.contains("session not found")
        || lower.contains("no conversation found")
    {
        ProcessErrorKind::SessionExpired
    } else if lower.contains("permission denied")
        || lower.contains("unauthorized")
        || lower.contains("eacces")
    {
        ProcessErrorKind::PermissionDenied
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ProcessErrorKind::Timeout
    } else {
        ProcessErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_cleaned() {
        let result = process_output("\x1b[32mHello\x1b[0m there\r\n", "s1", Some("r1")).unwrap();
        assert!(result.success);
        assert!(!result.is_streaming);
        assert_eq!(result.response, "Hello there");
        assert_eq!(result.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn empty_plain_text_is_unsuccessful() {
        let result = process_output(" \x1b[0m\r\n ", "s1", None).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("No valid response from Claude"));
    }

    #[test]
    fn single_json_object_is_one_event() {
        let raw = r#"{"type":"result","subtype":"success","result":"Done.","session_id":"abc-123"}"#;
        let result = process_output(raw, "s1", None).unwrap();
        assert!(result.success);
        assert!(result.is_streaming);
        assert_eq!(result.claude_session_id.as_deref(), Some("abc-123"));
        assert_eq!(result.response, "Done.");
    }

    #[test]
    fn stream_events_fold_in_order() {
        let raw = [
            r#"{"type":"system","subtype":"init","session_id":"first","model":"claude-sonnet"}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}},"session_id":"first"}"#,
            r#"{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}},"session_id":"first"}"#,
            r#"{"type":"assistant","message":{"model":"claude-opus","content":[{"type":"text","text":"Hello"},{"type":"tool_use","id":"t1","name":"Read","input":{"path":"a.rs"}}],"usage":{"input_tokens":10,"output_tokens":3}},"session_id":"second"}"#,
            r#"{"type":"result","subtype":"success","result":"Hello","usage":{"input_tokens":12,"output_tokens":5},"session_id":"second"}"#,
        ]
        .join("\n");

        let result = process_output(&raw, "s1", None).unwrap();
        assert!(result.success);
        assert!(result.is_streaming);
        assert_eq!(result.response, "Hello");
        assert_eq!(result.claude_session_id.as_deref(), Some("second"));
        assert_eq!(result.metadata.model.as_deref(), Some("claude-opus"));
        assert_eq!(result.metadata.usage.input_tokens, 12);
        assert_eq!(result.metadata.usage.output_tokens, 5);
        assert_eq!(result.metadata.tool_use.len(), 1);
        assert_eq!(result.metadata.tool_use[0].name, "Read");
    }

    #[test]
    fn content_fragments_and_stop_reason() {
        let raw = [
            r#"{"content":"part one, "}"#,
            r#"{"type":"text_delta","text":"part two"}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}"#,
        ]
        .join("\n");
        let result = process_output(&raw, "s1", None).unwrap();
        assert_eq!(result.response, "part one, part two");
        assert_eq!(result.metadata.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(result.metadata.usage.output_tokens, 4);
    }

    #[test]
    fn error_result_is_unsuccessful() {
        let raw = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"API Error: rate_limit_error","session_id":"x"}"#;
        let result = process_output(raw, "s1", None).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("API Error: rate_limit_error"));
    }

    #[test]
    fn truncated_stream_line_is_skipped() {
        let raw = [
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Partial"}]},"session_id":"a"}"#,
            r#"{"type":"resu"#,
        ]
        .join("\n");
        let result = process_output(&raw, "s1", None).unwrap();
        assert!(result.success);
        assert_eq!(result.response, "Partial");
        assert_eq!(result.claude_session_id.as_deref(), Some("a"));
    }

    #[test]
    fn stream_without_text_is_unsuccessful() {
        let raw = "{\"type\":\"system\",\"session_id\":\"a\"}\n{\"type\":\"assis";
        let result = process_output(raw, "s1", None).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("No valid response from Claude"));
    }

    #[test]
    fn braces_in_plain_text_stay_plain_text() {
        let raw = "Here is the fix:\n{\n  let x = 1;\n}\nDone.";
        let result = process_output(raw, "s1", None).unwrap();
        assert!(result.success);
        assert!(!result.is_streaming);
        assert_eq!(result.response, raw);
    }

    #[test]
    fn single_object_without_text_still_succeeds() {
        let raw = r#"{"type":"system","subtype":"init","session_id":"abc"}"#;
        let result = process_output(raw, "s1", None).unwrap();
        assert!(result.success);
        assert!(result.is_streaming);
        assert_eq!(result.error, None);
        assert_eq!(result.claude_session_id.as_deref(), Some("abc"));
        assert_eq!(result.response, "");
    }

    #[test]
    fn single_error_object_is_unsuccessful() {
        let raw = r#"{"type":"error","error":{"message":"Overloaded"}}"#;
        let result = process_output(raw, "s1", None).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Overloaded"));
    }

    #[test]
    fn extract_and_classify_errors() {
        let rate = extract_error("working...\nError: rate_limit_error: slow down").unwrap();
        assert_eq!(rate.kind, ProcessErrorKind::RateLimit);
        assert_eq!(rate.message, "Error: rate_limit_error: slow down");

        let expired = extract_error("Session not found for id 42").unwrap();
        assert_eq!(expired.kind, ProcessErrorKind::SessionExpired);

        let denied = extract_error("FAILED: permission denied opening file").unwrap();
        assert_eq!(denied.kind, ProcessErrorKind::PermissionDenied);

        let timeout = extract_error("Exception: request timed out").unwrap();
        assert_eq!(timeout.kind, ProcessErrorKind::Timeout);

        let other = extract_error("error: something odd").unwrap();
        assert_eq!(other.kind, ProcessErrorKind::Unknown);

        assert!(extract_error("all good here").is_none());
    }
}
