//! Tool use event
//!
//! Streaming fragments of a tool invocation's JSON arguments.

use serde::Deserialize;

/// Tool use event
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseEvent {
    /// Tool name
    pub name: String,
    /// Tool call id
    pub tool_use_id: String,
    /// Tool input data (JSON string, may be a partial byte slice)
    #[serde(default)]
    pub input: String,
    /// Whether this is the last fragment
    #[serde(default)]
    pub stop: bool,
    /// Optional fragment ordering index; gaps are tolerated downstream
    #[serde(default)]
    pub fragment_index: Option<u32>,
}

impl std::fmt::Display for ToolUseEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.stop { "complete" } else { "partial" };
        write!(
            f,
            "ToolUse[{}] (id={}, {}): {}",
            self.name, self.tool_use_id, state, self.input
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_defaults() {
        let event: ToolUseEvent =
            serde_json::from_str(r#"{"name":"Bash","toolUseId":"t1"}"#).unwrap();
        assert_eq!(event.input, "");
        assert!(!event.stop);
        assert!(event.fragment_index.is_none());
    }

    #[test]
    fn test_deserialize_with_index() {
        let event: ToolUseEvent = serde_json::from_str(
            r#"{"name":"Bash","toolUseId":"t1","input":"x","fragmentIndex":3}"#,
        )
        .unwrap();
        assert_eq!(event.fragment_index, Some(3));
    }
}
