//! Anthropic → upstream request conversion
//!
//! Converts a `MessagesRequest` into the conversation-state document the
//! upstream response endpoint expects. Request-shape transformation is a
//! collaborator of the streaming core: it runs once per request, before any
//! bytes flow.

use uuid::Uuid;

use crate::whisperer::model::requests::{
    AssistantResponseMessage, ConversationState, CurrentMessage, HistoryMessage, InputSchema,
    ToolEntry, ToolResult, ToolResultContent, ToolSpecification, ToolUseEntry, UserInputMessage,
    UserInputMessageContext, WhispererRequest,
};

use super::types::{ContentBlock, MessagesRequest};

/// Map an Anthropic model name onto an upstream model id
pub fn map_model(model: &str) -> Option<String> {
    let model_lower = model.to_lowercase();

    if model_lower.contains("sonnet") {
        if model_lower.contains("4-5") || model_lower.contains("4.5") {
            Some("CLAUDE_SONNET_4_5_20250929_V1_0".to_string())
        } else {
            Some("claude-sonnet-4.5".to_string())
        }
    } else if model_lower.contains("opus") {
        Some("claude-opus-4.5".to_string())
    } else if model_lower.contains("haiku") {
        Some("claude-haiku-4.5".to_string())
    } else {
        None
    }
}

/// Conversion result
#[derive(Debug)]
pub struct ConversionResult {
    pub conversation_state: ConversationState,
}

/// Conversion error
#[derive(Debug)]
pub enum ConversionError {
    UnsupportedModel(String),
    EmptyMessages,
}

impl std::fmt::Display for ConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversionError::UnsupportedModel(model) => write!(f, "model not supported: {}", model),
            ConversionError::EmptyMessages => write!(f, "message list is empty"),
        }
    }
}

impl std::error::Error for ConversionError {}

/// Convert an Anthropic request into the upstream request body
pub fn convert_request(req: &MessagesRequest) -> Result<ConversionResult, ConversionError> {
    let model_id =
        map_model(&req.model).ok_or_else(|| ConversionError::UnsupportedModel(req.model.clone()))?;

    if req.messages.is_empty() {
        return Err(ConversionError::EmptyMessages);
    }

    let (current, history_slice) = req
        .messages
        .split_last()
        .expect("messages checked non-empty");

    let mut history = Vec::new();
    for message in history_slice {
        match message.role.as_str() {
            "assistant" => history.push(HistoryMessage::Assistant(AssistantResponseMessage {
                content: content_text(&message.content),
                tool_uses: extract_tool_uses(&message.content),
            })),
            _ => {
                let tool_results = extract_tool_results(&message.content);
                let context = UserInputMessageContext {
                    tools: Vec::new(),
                    tool_results,
                };
                history.push(HistoryMessage::User(UserInputMessage {
                    content: content_text(&message.content),
                    model_id: model_id.clone(),
                    origin: "AI_EDITOR".to_string(),
                    user_input_message_context: (!context.is_empty()).then_some(context),
                }));
            }
        }
    }

    // System prompt travels at the head of the current message content
    let mut content = req
        .system
        .as_ref()
        .map(|msgs| {
            msgs.iter()
                .map(|m| m.text.as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    if !content.is_empty() {
        content.push_str("\n\n");
    }
    content.push_str(&content_text(&current.content));
    if content.is_empty() {
        content.push_str("Continue");
    }

    let tools = req
        .tools
        .as_ref()
        .map(|tools| {
            tools
                .iter()
                .map(|tool| ToolEntry {
                    tool_specification: ToolSpecification {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        input_schema: InputSchema {
                            json: serde_json::to_value(&tool.input_schema)
                                .unwrap_or(serde_json::Value::Null),
                        },
                    },
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let context = UserInputMessageContext {
        tools,
        tool_results: extract_tool_results(&current.content),
    };

    let conversation_state = ConversationState {
        chat_trigger_type: "MANUAL".to_string(),
        conversation_id: Uuid::new_v4().to_string(),
        current_message: CurrentMessage {
            user_input_message: UserInputMessage {
                content,
                model_id,
                origin: "AI_EDITOR".to_string(),
                user_input_message_context: (!context.is_empty()).then_some(context),
            },
        },
        history,
    };

    Ok(ConversionResult { conversation_state })
}

/// Build the serialized upstream request body
pub fn build_request_body(
    conversation_state: ConversationState,
    profile_arn: Option<String>,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&WhispererRequest {
        conversation_state,
        profile_arn,
    })
}

/// Parse a message's content blocks, tolerating the plain-string form
fn content_blocks(content: &serde_json::Value) -> Vec<ContentBlock> {
    match content {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// Flatten message content into plain text
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(_) => content_blocks(content)
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Tool invocations recorded in an assistant message
fn extract_tool_uses(content: &serde_json::Value) -> Vec<ToolUseEntry> {
    content_blocks(content)
        .into_iter()
        .filter(|block| block.block_type == "tool_use")
        .filter_map(|block| {
            Some(ToolUseEntry {
                tool_use_id: block.id?,
                name: block.name?,
                input: block.input.unwrap_or(serde_json::json!({})),
            })
        })
        .collect()
}

/// Tool results carried by a user message
fn extract_tool_results(content: &serde_json::Value) -> Vec<ToolResult> {
    content_blocks(content)
        .into_iter()
        .filter(|block| block.block_type == "tool_result")
        .filter_map(|block| {
            let text = match &block.content {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(value) => content_text(value),
                None => String::new(),
            };
            Some(ToolResult {
                tool_use_id: block.tool_use_id?,
                status: if block.is_error.unwrap_or(false) {
                    "error".to_string()
                } else {
                    "success".to_string()
                },
                content: vec![ToolResultContent { text }],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::types::Message;
    use serde_json::json;

    fn request(messages: Vec<Message>) -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4-5-20250929",
            "max_tokens": 100,
            "messages": serde_json::to_value(&messages).unwrap()
        }))
        .unwrap()
    }

    fn user(content: serde_json::Value) -> Message {
        Message {
            role: "user".to_string(),
            content,
        }
    }

    fn assistant(content: serde_json::Value) -> Message {
        Message {
            role: "assistant".to_string(),
            content,
        }
    }

    #[test]
    fn test_map_model() {
        assert_eq!(
            map_model("claude-sonnet-4-5-20250929").as_deref(),
            Some("CLAUDE_SONNET_4_5_20250929_V1_0")
        );
        assert!(map_model("claude-opus-4-5-20251101").is_some());
        assert!(map_model("claude-haiku-4-5-20251001").is_some());
        assert!(map_model("gpt-4o").is_none());
    }

    #[test]
    fn test_unsupported_model() {
        let mut req = request(vec![user(json!("hi"))]);
        req.model = "gpt-4o".to_string();
        assert!(matches!(
            convert_request(&req),
            Err(ConversionError::UnsupportedModel(_))
        ));
    }

    #[test]
    fn test_empty_messages() {
        let req = request(vec![]);
        assert!(matches!(
            convert_request(&req),
            Err(ConversionError::EmptyMessages)
        ));
    }

    #[test]
    fn test_simple_conversion() {
        let req = request(vec![user(json!("hello there"))]);
        let result = convert_request(&req).unwrap();
        assert_eq!(
            result.conversation_state.current_message.user_input_message.content,
            "hello there"
        );
        assert!(result.conversation_state.history.is_empty());
    }

    #[test]
    fn test_history_and_current_split() {
        let req = request(vec![
            user(json!("question")),
            assistant(json!("answer")),
            user(json!("follow-up")),
        ]);
        let result = convert_request(&req).unwrap();
        assert_eq!(result.conversation_state.history.len(), 2);
        assert_eq!(
            result.conversation_state.current_message.user_input_message.content,
            "follow-up"
        );
    }

    #[test]
    fn test_system_prefixed_to_current() {
        let mut req = request(vec![user(json!("hi"))]);
        req.system = Some(vec![crate::anthropic::types::SystemMessage {
            text: "be terse".to_string(),
        }]);
        let result = convert_request(&req).unwrap();
        let content = &result.conversation_state.current_message.user_input_message.content;
        assert!(content.starts_with("be terse"));
        assert!(content.ends_with("hi"));
    }

    #[test]
    fn test_tool_use_and_result_mapping() {
        let req = request(vec![
            user(json!("run ls")),
            assistant(json!([
                {"type": "text", "text": "running"},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {"command": "ls"}}
            ])),
            user(json!([
                {"type": "tool_result", "tool_use_id": "t1", "content": "file.txt"}
            ])),
        ]);
        let result = convert_request(&req).unwrap();

        let HistoryMessage::Assistant(assistant_msg) = &result.conversation_state.history[1] else {
            panic!("expected assistant history entry");
        };
        assert_eq!(assistant_msg.tool_uses.len(), 1);
        assert_eq!(assistant_msg.tool_uses[0].name, "Bash");

        let context = result
            .conversation_state
            .current_message
            .user_input_message
            .user_input_message_context
            .as_ref()
            .unwrap();
        assert_eq!(context.tool_results.len(), 1);
        assert_eq!(context.tool_results[0].tool_use_id, "t1");
        assert_eq!(context.tool_results[0].status, "success");
    }

    #[test]
    fn test_tools_passed_through() {
        let mut req = request(vec![user(json!("hi"))]);
        req.tools = Some(vec![serde_json::from_value(json!({
            "name": "Bash",
            "description": "run a command",
            "input_schema": {"type": "object"}
        }))
        .unwrap()]);

        let result = convert_request(&req).unwrap();
        let context = result
            .conversation_state
            .current_message
            .user_input_message
            .user_input_message_context
            .unwrap();
        assert_eq!(context.tools.len(), 1);
        assert_eq!(context.tools[0].tool_specification.name, "Bash");
    }
}
