//! Upstream request body types
//!
//! The response-generation endpoint consumes a conversation-state document:
//! the current user message plus the alternating user/assistant history,
//! with tool specifications and tool results attached to the user messages.

use serde::Serialize;

/// Top-level request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WhispererRequest {
    pub conversation_state: ConversationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub chat_trigger_type: String,
    pub conversation_id: String,
    pub current_message: CurrentMessage,
    pub history: Vec<HistoryMessage>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentMessage {
    pub user_input_message: UserInputMessage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessage {
    pub content: String,
    pub model_id: String,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_input_message_context: Option<UserInputMessageContext>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputMessageContext {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl UserInputMessageContext {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.tool_results.is_empty()
    }
}

/// One history entry: a user or an assistant message
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryMessage {
    #[serde(rename = "userInputMessage")]
    User(UserInputMessage),
    #[serde(rename = "assistantResponseMessage")]
    Assistant(AssistantResponseMessage),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantResponseMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<ToolUseEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseEntry {
    pub tool_use_id: String,
    pub name: String,
    pub input: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_use_id: String,
    pub status: String,
    pub content: Vec<ToolResultContent>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultContent {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub tool_specification: ToolSpecification,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpecification {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputSchema {
    pub json: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization_shape() {
        let request = WhispererRequest {
            conversation_state: ConversationState {
                chat_trigger_type: "MANUAL".to_string(),
                conversation_id: "c-1".to_string(),
                current_message: CurrentMessage {
                    user_input_message: UserInputMessage {
                        content: "hello".to_string(),
                        model_id: "model-x".to_string(),
                        origin: "AI_EDITOR".to_string(),
                        user_input_message_context: None,
                    },
                },
                history: vec![HistoryMessage::Assistant(AssistantResponseMessage {
                    content: "hi".to_string(),
                    tool_uses: vec![],
                })],
            },
            profile_arn: None,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["conversationState"]["chatTriggerType"], "MANUAL");
        assert_eq!(
            value["conversationState"]["currentMessage"]["userInputMessage"]["content"],
            "hello"
        );
        assert_eq!(
            value["conversationState"]["history"][0]["assistantResponseMessage"]["content"],
            "hi"
        );
        assert!(value.get("profileArn").is_none());
    }

    #[test]
    fn test_tool_entry_serialization() {
        let entry = ToolEntry {
            tool_specification: ToolSpecification {
                name: "Bash".to_string(),
                description: "run a command".to_string(),
                input_schema: InputSchema {
                    json: json!({"type": "object"}),
                },
            },
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["toolSpecification"]["name"], "Bash");
        assert_eq!(value["toolSpecification"]["inputSchema"]["json"]["type"], "object");
    }
}
