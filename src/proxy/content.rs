//! Normalization of tool-call result envelopes.
//!
//! Providers wrap results in a content list whose items may be text,
//! structured objects, images, or resources. Consumers get one plain
//! value back:
//!
//! - a single text item becomes a string, or the parsed value when the
//!   text is valid JSON
//! - a single `{"object": ...}` item becomes the object itself
//! - any other single item passes through unchanged
//! - multiple items merge into a `multi_content` value carrying the
//!   normalized items and a text summary
//! - an empty content list becomes the empty string
//! - an envelope without a content list passes through unchanged

use serde_json::{json, Value};

use crate::errors::ProxyError;

/// Normalizes a tool-call `result` envelope.
///
/// # Errors
///
/// Returns [`ProxyError::Call`] when the envelope carries the error flag.
pub fn extract_content(result: &Value) -> Result<Value, ProxyError> {
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(ProxyError::Call {
            message: error_message(result),
        });
    }

    let Some(content) = result.get("content").and_then(Value::as_array) else {
        return Ok(result.clone());
    };

    match content.len() {
        0 => Ok(Value::String(String::new())),
        1 => Ok(extract_item(&content[0])),
        _ => {
            let items: Vec<Value> = content.iter().map(extract_item).collect();
            let texts: Vec<&str> = content
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect();
            Ok(json!({
                "type": "multi_content",
                "items": items,
                "text_summary": texts.join("\n"),
            }))
        }
    }
}

fn extract_item(item: &Value) -> Value {
    if let Some(object) = item.get("object") {
        return object.clone();
    }
    if item.get("type").and_then(Value::as_str) == Some("text") {
        let text = item.get("text").and_then(Value::as_str).unwrap_or_default();
        return serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
    }
    item.clone()
}

fn error_message(result: &Value) -> String {
    if let Some(message) = result.get("error").and_then(Value::as_str) {
        return message.to_string();
    }
    let texts: Vec<&str> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|content| {
            content
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if texts.is_empty() {
        "tool reported an error".to_string()
    } else {
        texts.join("\n")
    }
}
