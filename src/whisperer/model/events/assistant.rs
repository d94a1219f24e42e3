//! Assistant response event
//!
//! Streaming response content from the assistant. The same wire event is also
//! used by the upstream to carry tool-call fragments, distinguished by the
//! presence of `toolUseId` and `name`.

use serde::{Deserialize, Serialize};

use super::tool_use::ToolUseEvent;

/// Assistant response event
///
/// Only the fields the pipeline consumes are modelled; everything else the
/// upstream sends lands in `extra` so deserialization never fails on new
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseEvent {
    /// Response content fragment
    #[serde(default)]
    pub content: String,

    /// Tool call id, present when this event carries a tool fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,

    /// Tool name, present alongside `tool_use_id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool input fragment (byte-sliced JSON)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    /// Whether this is the final fragment of the tool call
    #[serde(default)]
    pub stop: bool,

    /// Captures unused fields for forward compatibility
    #[serde(flatten, skip_serializing)]
    #[allow(dead_code)]
    extra: serde_json::Value,
}

impl AssistantResponseEvent {
    /// Plain text event
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Reinterpret as a tool-use fragment when the tool fields are present
    pub fn as_tool_use(&self) -> Option<ToolUseEvent> {
        match (&self.tool_use_id, &self.name) {
            (Some(id), Some(name)) => Some(ToolUseEvent {
                name: name.clone(),
                tool_use_id: id.clone(),
                input: self.input.clone().unwrap_or_default(),
                stop: self.stop,
                fragment_index: None,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for AssistantResponseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_simple() {
        let event: AssistantResponseEvent =
            serde_json::from_str(r#"{"content":"Hello, world!"}"#).unwrap();
        assert_eq!(event.content, "Hello, world!");
        assert!(event.as_tool_use().is_none());
    }

    #[test]
    fn test_deserialize_with_extra_fields() {
        let json = r#"{
            "content": "Done",
            "conversationId": "conv-123",
            "messageStatus": "COMPLETED"
        }"#;
        let event: AssistantResponseEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.content, "Done");
    }

    #[test]
    fn test_as_tool_use() {
        let json = r#"{"toolUseId":"tooluse_X","name":"Bash","input":"{\"co","stop":false}"#;
        let event: AssistantResponseEvent = serde_json::from_str(json).unwrap();
        let tool = event.as_tool_use().unwrap();
        assert_eq!(tool.tool_use_id, "tooluse_X");
        assert_eq!(tool.name, "Bash");
        assert_eq!(tool.input, "{\"co");
        assert!(!tool.stop);
    }
}
