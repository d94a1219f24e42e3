//! Event base definitions
//!
//! Event type enum and the unified event structure the translator
//! dispatches on.

use crate::whisperer::parser::error::{ParseError, ParseResult};
use crate::whisperer::parser::frame::Frame;

/// Event type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Assistant response event (text or embedded tool call)
    AssistantResponse,
    /// Tool use event
    ToolUse,
    /// Whole-shot completion
    Completion,
    /// Incremental completion chunk
    CompletionChunk,
    /// Session lifecycle start
    SessionStart,
    /// Session lifecycle end
    SessionEnd,
    /// Unknown event type
    Unknown,
}

impl EventType {
    pub fn from_str(s: &str) -> Self {
        match s {
            "assistantResponseEvent" => Self::AssistantResponse,
            "toolUseEvent" => Self::ToolUse,
            "completion" => Self::Completion,
            "completion_chunk" => Self::CompletionChunk,
            "session_start" => Self::SessionStart,
            "session_end" => Self::SessionEnd,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssistantResponse => "assistantResponseEvent",
            Self::ToolUse => "toolUseEvent",
            Self::Completion => "completion",
            Self::CompletionChunk => "completion_chunk",
            Self::SessionStart => "session_start",
            Self::SessionEnd => "session_end",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Unified event enum
#[derive(Debug, Clone)]
pub enum Event {
    /// Assistant text content
    AssistantResponse(super::AssistantResponseEvent),
    /// Tool call fragment (from either event shape that carries one)
    ToolUse(super::ToolUseEvent),
    /// Whole-shot completion
    Completion(super::CompletionEvent),
    /// Incremental completion chunk
    CompletionChunk(super::CompletionChunkEvent),
    /// Session lifecycle (passed through opaquely)
    Session {
        start: bool,
        payload: serde_json::Value,
    },
    /// Unknown event (ignored)
    Unknown,
    /// Server error
    Error {
        error_code: String,
        error_message: String,
    },
    /// Server exception
    Exception {
        exception_type: String,
        message: String,
    },
}

/// Strip the stray `event` / `vent` prefixes some upstream frames prepend to
/// their JSON payload. The prefix is removed only when the remainder parses.
pub fn normalize_payload(payload: &[u8]) -> &[u8] {
    for prefix in [b"event" as &[u8], b"vent" as &[u8]] {
        if let Some(rest) = payload.strip_prefix(prefix) {
            if serde_json::from_slice::<serde_json::Value>(rest).is_ok() {
                return rest;
            }
        }
    }
    payload
}

impl Event {
    /// Parse an event from a decoded frame
    pub fn from_frame(frame: Frame) -> ParseResult<Self> {
        let message_type = frame.message_type().unwrap_or("event");

        match message_type {
            "event" => Self::parse_event(frame),
            "error" => Self::parse_error(frame),
            "exception" => Self::parse_exception(frame),
            other => Err(ParseError::InvalidMessageType(other.to_string())),
        }
    }

    fn parse_event(frame: Frame) -> ParseResult<Self> {
        let event_type = EventType::from_str(frame.event_type().unwrap_or("unknown"));
        let payload = normalize_payload(&frame.payload);

        match event_type {
            EventType::AssistantResponse => {
                let event: super::AssistantResponseEvent = serde_json::from_slice(payload)?;
                // assistantResponseEvent doubles as a tool-call carrier when
                // it names a tool use id
                if let Some(tool_use) = event.as_tool_use() {
                    Ok(Self::ToolUse(tool_use))
                } else {
                    Ok(Self::AssistantResponse(event))
                }
            }
            EventType::ToolUse => {
                let event: super::ToolUseEvent = serde_json::from_slice(payload)?;
                Ok(Self::ToolUse(event))
            }
            EventType::Completion => {
                let event: super::CompletionEvent = serde_json::from_slice(payload)?;
                Ok(Self::Completion(event))
            }
            EventType::CompletionChunk => {
                let event: super::CompletionChunkEvent = serde_json::from_slice(payload)?;
                Ok(Self::CompletionChunk(event))
            }
            EventType::SessionStart | EventType::SessionEnd => Ok(Self::Session {
                start: event_type == EventType::SessionStart,
                payload: serde_json::from_slice(payload).unwrap_or(serde_json::Value::Null),
            }),
            EventType::Unknown => Ok(Self::Unknown),
        }
    }

    fn parse_error(frame: Frame) -> ParseResult<Self> {
        let error_code = frame
            .headers
            .error_code()
            .unwrap_or("UnknownError")
            .to_string();
        let error_message = frame.payload_as_str();

        Ok(Self::Error {
            error_code,
            error_message,
        })
    }

    fn parse_exception(frame: Frame) -> ParseResult<Self> {
        let exception_type = frame
            .headers
            .exception_type()
            .unwrap_or("UnknownException")
            .to_string();
        let message = frame.payload_as_str();

        Ok(Self::Exception {
            exception_type,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whisperer::parser::frame::{encode_event_frame, encode_frame, parse_frame_exact};

    #[test]
    fn test_event_type_from_str() {
        assert_eq!(
            EventType::from_str("assistantResponseEvent"),
            EventType::AssistantResponse
        );
        assert_eq!(EventType::from_str("toolUseEvent"), EventType::ToolUse);
        assert_eq!(EventType::from_str("completion"), EventType::Completion);
        assert_eq!(
            EventType::from_str("completion_chunk"),
            EventType::CompletionChunk
        );
        assert_eq!(EventType::from_str("nope"), EventType::Unknown);
    }

    #[test]
    fn test_normalize_payload_strips_prefix() {
        assert_eq!(normalize_payload(br#"event{"a":1}"#), br#"{"a":1}"#);
        assert_eq!(normalize_payload(br#"vent{"a":1}"#), br#"{"a":1}"#);
        // Not valid JSON after the prefix: left untouched
        assert_eq!(normalize_payload(b"eventual"), b"eventual");
        assert_eq!(normalize_payload(br#"{"a":1}"#), br#"{"a":1}"#);
    }

    #[test]
    fn test_event_from_text_frame() {
        let data = encode_event_frame("assistantResponseEvent", br#"{"content":"hi"}"#);
        let frame = parse_frame_exact(&data).unwrap();
        match Event::from_frame(frame).unwrap() {
            Event::AssistantResponse(e) => assert_eq!(e.content, "hi"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_from_prefixed_payload() {
        let data = encode_event_frame("assistantResponseEvent", br#"vent{"content":"hi"}"#);
        let frame = parse_frame_exact(&data).unwrap();
        assert!(matches!(
            Event::from_frame(frame).unwrap(),
            Event::AssistantResponse(_)
        ));
    }

    #[test]
    fn test_assistant_frame_with_tool_fields_becomes_tool_use() {
        let data = encode_event_frame(
            "assistantResponseEvent",
            br#"{"toolUseId":"t1","name":"Bash","input":"{\"c\":1}","stop":true}"#,
        );
        let frame = parse_frame_exact(&data).unwrap();
        match Event::from_frame(frame).unwrap() {
            Event::ToolUse(e) => {
                assert_eq!(e.tool_use_id, "t1");
                assert_eq!(e.name, "Bash");
                assert!(e.stop);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_error_frame() {
        let data = encode_frame(
            &[(":message-type", "error"), (":error-code", "Throttled")],
            b"slow down",
        );
        let frame = parse_frame_exact(&data).unwrap();
        match Event::from_frame(frame).unwrap() {
            Event::Error {
                error_code,
                error_message,
            } => {
                assert_eq!(error_code, "Throttled");
                assert_eq!(error_message, "slow down");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_exception_frame() {
        let data = encode_frame(
            &[
                (":message-type", "exception"),
                (":exception-type", "ContentLengthExceededException"),
            ],
            b"too long",
        );
        let frame = parse_frame_exact(&data).unwrap();
        assert!(matches!(
            Event::from_frame(frame).unwrap(),
            Event::Exception { .. }
        ));
    }

    #[test]
    fn test_session_frames() {
        let data = encode_event_frame("session_start", br#"{"sessionId":"s1"}"#);
        let frame = parse_frame_exact(&data).unwrap();
        assert!(matches!(
            Event::from_frame(frame).unwrap(),
            Event::Session { start: true, .. }
        ));
    }
}
