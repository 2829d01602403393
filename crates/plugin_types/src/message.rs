//! Chat Messages
//!
//! The inbound/outbound message record and the `[json]...[/json]` block
//! extraction applied before a message is dispatched.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─────────────────────────────────────────────────────────────────────────────
// Message
// ─────────────────────────────────────────────────────────────────────────────

/// A chat message as delivered by the server
///
/// Messages are treated as immutable once received. The derived JSON fields
/// (`json_array`, `json_block`) are filled by [`Message::enriched`], which
/// returns a new value rather than editing the received one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, deserialize_with = "null_as_default")]
    pub sender_id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub sender_name: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub channel_id: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,

    /// Plugin selectors, in the order the sender listed them
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,

    /// Structured payload attached by the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_data: Option<Map<String, Value>>,

    /// Server timestamp (ISO-8601), if provided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Values of `json_data`, in insertion order
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub json_array: Vec<Value>,

    /// The parsed `[json]...[/json]` block from `content`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_block: Option<Value>,
}

/// Explicit `null` reads as the field's default
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Message {
    /// Create a plain text message
    pub fn new(
        sender_id: impl Into<String>,
        channel_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            channel_id: channel_id.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    /// Builder: set the sender display name
    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    /// Builder: set the tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: attach structured data
    pub fn with_json_data(mut self, data: Map<String, Value>) -> Self {
        self.json_data = Some(data);
        self
    }

    /// Decode a message from a transport payload
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Return a copy with the derived JSON fields filled in
    pub fn enriched(&self) -> Self {
        let mut message = self.clone();
        message.json_array = self
            .json_data
            .as_ref()
            .map(|data| data.values().cloned().collect())
            .unwrap_or_default();
        message.json_block = extract_json_block(&self.content);
        message
    }

    /// First value of the attached structured data, if any
    pub fn first_json_value(&self) -> Option<&Value> {
        self.json_data.as_ref().and_then(|data| data.values().next())
    }

    /// Whether this message selects plugins
    pub fn has_tags(&self) -> bool {
        !self.tags.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON Block Extraction
// ─────────────────────────────────────────────────────────────────────────────

static JSON_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\[json\](.*?)\[/json\]").expect("json block pattern"));

/// Extract and parse the first `[json]...[/json]` block in `content`
///
/// Missing markers and malformed JSON both yield `None`.
pub fn extract_json_block(content: &str) -> Option<Value> {
    let captures = JSON_BLOCK.captures(content)?;
    let body = captures.get(1)?.as_str().trim();

    match serde_json::from_str(body) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!("Ignoring malformed [json] block: {}", e);
            None
        }
    }
}

/// Wrap a value in `[json]` markers for embedding in message content
pub fn wrap_json_block(value: &Value) -> String {
    format!("[json]{}[/json]", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_simple_block() {
        let value = extract_json_block(r#"please run [json]{"a":1}[/json] now"#);
        assert_eq!(value, Some(json!({"a": 1})));
    }

    #[test]
    fn test_extract_multiline_block() {
        let content = "start\n[json]\n{\n  \"task\": \"prep\",\n  \"n\": [1, 2]\n}\n[/json]\nend";
        assert_eq!(
            extract_json_block(content),
            Some(json!({"task": "prep", "n": [1, 2]}))
        );
    }

    #[test]
    fn test_extract_is_non_greedy() {
        let content = r#"[json]{"a":1}[/json] and [json]{"b":2}[/json]"#;
        assert_eq!(extract_json_block(content), Some(json!({"a": 1})));
    }

    #[test]
    fn test_missing_or_mismatched_markers() {
        assert_eq!(extract_json_block("no markers here"), None);
        assert_eq!(extract_json_block(r#"[json]{"a":1}"#), None);
        assert_eq!(extract_json_block(r#"{"a":1}[/json]"#), None);
    }

    #[test]
    fn test_malformed_json_is_none() {
        assert_eq!(extract_json_block("[json]{not json}[/json]"), None);
    }

    #[test]
    fn test_wrap_then_extract() {
        let value = json!({"action": "start_task"});
        let content = format!("bot-b start processing for {}", wrap_json_block(&value));
        assert_eq!(extract_json_block(&content), Some(value));
    }

    #[test]
    fn test_decode_wire_payload() {
        let message = Message::from_value(json!({
            "senderId": "other",
            "senderName": "Other",
            "channelId": "general",
            "content": "hi",
            "tags": ["echo"],
            "jsonData": {"first": {"x": 1}, "second": 2}
        }))
        .unwrap();

        assert_eq!(message.sender_id, "other");
        assert_eq!(message.tags, vec!["echo".to_string()]);
        assert!(message.has_tags());
        assert_eq!(message.first_json_value(), Some(&json!({"x": 1})));
    }

    #[test]
    fn test_decode_without_optional_fields() {
        let message = Message::from_value(json!({"senderId": "u1", "content": "hello"})).unwrap();
        assert!(message.tags.is_empty());
        assert!(message.json_data.is_none());
        assert!(!message.has_tags());
    }

    #[test]
    fn test_decode_null_fields_as_empty() {
        let message = Message::from_value(json!({
            "senderId": "u1",
            "senderName": null,
            "channelId": "general",
            "content": "hello",
            "tags": null,
            "jsonData": null
        }))
        .unwrap();

        assert!(message.tags.is_empty());
        assert!(!message.has_tags());
        assert_eq!(message.sender_name, "");
        assert!(message.json_data.is_none());
    }

    #[test]
    fn test_enriched_keeps_original() {
        let mut data = Map::new();
        data.insert("z".into(), json!(1));
        data.insert("a".into(), json!(2));

        let original = Message::new("u1", "general", r#"[json]{"k":true}[/json]"#)
            .with_json_data(data);
        let enriched = original.enriched();

        assert_eq!(enriched.json_array, vec![json!(1), json!(2)]);
        assert_eq!(enriched.json_block, Some(json!({"k": true})));
        assert!(original.json_array.is_empty());
        assert!(original.json_block.is_none());
    }
}
