//! Streaming response translation
//!
//! Maps decoded upstream events onto the downstream SSE schema. One
//! `StreamContext` lives per request and owns the SSE ordering state machine
//! and the tool lifecycle manager; the text channel, inline tool-call
//! extraction and token accounting live here.

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::whisperer::model::events::{Event, ToolUseEvent};

use super::lifecycle::ToolLifecycleManager;
use super::sse::{SseEvent, SseStateManager, TEXT_BLOCK_INDEX};

/// Inline tool-call markers some models emit inside plain text
const INLINE_TOOL_OPEN: &str = "<tool_use>";
const INLINE_TOOL_CLOSE: &str = "</tool_use>";

/// Strip invisible control characters (below 0x20 except tab/newline/CR)
pub fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|&c| !(c < '\u{20}' && c != '\t' && c != '\n' && c != '\r'))
        .collect()
}

/// Longest suffix of `buffer` that is a proper prefix of `tag`.
///
/// Used to hold back a possibly-incomplete inline tag across chunk
/// boundaries. The tag is ASCII, so the cut always lands on a char boundary.
fn partial_tag_suffix_len(buffer: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buffer.len());
    for k in (1..=max).rev() {
        if buffer.is_char_boundary(buffer.len() - k) && buffer[buffer.len() - k..] == tag[..k] {
            return k;
        }
    }
    0
}

/// Stream processing context (one per request)
pub struct StreamContext {
    pub state: SseStateManager,
    pub tools: ToolLifecycleManager,
    model: String,
    message_id: String,
    input_tokens: i32,
    output_tokens: i32,
    /// Index of the currently open text block, when one exists
    text_block_index: Option<i32>,
    /// Whether index 0 has been used by the first text block
    first_text_block_used: bool,
    /// Text held back while scanning for inline tool-call tags
    inline_buffer: String,
}

impl StreamContext {
    pub fn new(model: impl Into<String>, input_tokens: i32, incremental_tool_events: bool) -> Self {
        Self {
            state: SseStateManager::new(),
            tools: ToolLifecycleManager::new(incremental_tool_events),
            model: model.into(),
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            input_tokens,
            output_tokens: 0,
            text_block_index: None,
            first_text_block_used: false,
            inline_buffer: String::new(),
        }
    }

    pub fn output_tokens(&self) -> i32 {
        self.output_tokens
    }

    /// message_start payload
    fn create_message_start(&self) -> serde_json::Value {
        json!({
            "type": "message_start",
            "message": {
                "id": self.message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": self.model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {
                    "input_tokens": self.input_tokens,
                    "output_tokens": 1
                }
            }
        })
    }

    /// Initial event sequence. The text block is created lazily on first
    /// text, so a response that opens with a tool call starts at index 1
    /// with no empty text block in front.
    pub fn generate_initial_events(&mut self) -> Vec<SseEvent> {
        let msg_start = self.create_message_start();
        self.state
            .handle_message_start(msg_start)
            .into_iter()
            .collect()
    }

    /// Translate one decoded upstream event into SSE events
    pub fn process_event(&mut self, event: &Event) -> Vec<SseEvent> {
        match event {
            Event::AssistantResponse(resp) => self.process_text(&resp.content),
            Event::ToolUse(tool_use) => self.process_tool_use(tool_use),
            Event::Completion(completion) => {
                let mut events = self.process_text(&completion.completion);
                events.extend(self.stop_text_block());
                if let Some(reason) = &completion.finish_reason {
                    self.state.set_stop_reason(map_finish_reason(reason));
                }
                events
            }
            Event::CompletionChunk(chunk) => {
                let mut events = self.process_text(&chunk.delta);
                if let Some(reason) = &chunk.finish_reason {
                    events.extend(self.stop_text_block());
                    self.state.set_stop_reason(map_finish_reason(reason));
                }
                events
            }
            Event::Session { start, payload } => {
                tracing::debug!(start = start, payload = %payload, "session lifecycle event");
                Vec::new()
            }
            Event::Error {
                error_code,
                error_message,
            } => {
                tracing::error!(code = %error_code, "upstream error event: {}", error_message);
                let mut body = SseEvent::error("api_error", error_message, None);
                body.data["error"]["code"] = json!(error_code);
                vec![body]
            }
            Event::Exception {
                exception_type,
                message,
            } => {
                tracing::warn!(exception = %exception_type, "upstream exception: {}", message);
                if exception_type == "ContentLengthExceededException" {
                    self.state.set_stop_reason("max_tokens");
                }
                vec![SseEvent::error(exception_type, message, None)]
            }
            Event::Unknown => Vec::new(),
        }
    }

    /// Handle assistant text, extracting inline tool-call encodings.
    ///
    /// Text is buffered only as far as needed to decide whether a
    /// `<tool_use>` tag is forming across chunk boundaries.
    fn process_text(&mut self, content: &str) -> Vec<SseEvent> {
        if content.is_empty() {
            return Vec::new();
        }

        self.output_tokens += estimate_tokens(content);
        let cleaned = strip_control_chars(content);
        self.inline_buffer.push_str(&cleaned);

        let mut events = Vec::new();
        loop {
            let Some(open) = self.inline_buffer.find(INLINE_TOOL_OPEN) else {
                // No tag; emit everything except a possibly-forming tag tail
                let keep = partial_tag_suffix_len(&self.inline_buffer, INLINE_TOOL_OPEN);
                let emit_to = self.inline_buffer.len() - keep;
                if emit_to > 0 {
                    let text: String = self.inline_buffer.drain(..emit_to).collect();
                    events.extend(self.create_text_delta_events(&text));
                }
                break;
            };

            let Some(close) = self.inline_buffer[open..].find(INLINE_TOOL_CLOSE) else {
                // Opening tag seen, closing tag not yet; flush the prefix
                if open > 0 {
                    let text: String = self.inline_buffer.drain(..open).collect();
                    events.extend(self.create_text_delta_events(&text));
                }
                break;
            };

            let close = open + close;
            if open > 0 {
                let text = self.inline_buffer[..open].to_string();
                events.extend(self.create_text_delta_events(&text));
            }
            let inner = self.inline_buffer[open + INLINE_TOOL_OPEN.len()..close].to_string();
            self.inline_buffer
                .drain(..close + INLINE_TOOL_CLOSE.len());

            events.extend(self.emit_inline_tool(&inner));
        }

        events
    }

    /// Synthesise a tool block from an inline `<tool_use>` body
    fn emit_inline_tool(&mut self, inner: &str) -> Vec<SseEvent> {
        let name = extract_tag(inner, "tool_name");
        let parameters = extract_tag(inner, "parameters");

        let Some(name) = name else {
            // Malformed encoding; surface it as plain text rather than drop it
            let raw = format!("{}{}{}", INLINE_TOOL_OPEN, inner, INLINE_TOOL_CLOSE);
            return self.create_text_delta_events(&raw);
        };

        let event = ToolUseEvent {
            name: name.trim().to_string(),
            tool_use_id: format!("tooluse_{}", Uuid::new_v4().simple()),
            input: parameters.unwrap_or_default().trim().to_string(),
            stop: true,
            fragment_index: None,
        };
        let output_tokens = self.output_tokens;
        self.tools.on_fragment(&mut self.state, &event, output_tokens)
    }

    /// Handle a tool-call fragment from the upstream
    fn process_tool_use(&mut self, tool_use: &ToolUseEvent) -> Vec<SseEvent> {
        let mut events = Vec::new();

        // A pending inline scan cannot complete once a real tool call starts
        if !self.inline_buffer.is_empty() {
            let buffered = std::mem::take(&mut self.inline_buffer);
            events.extend(self.create_text_delta_events(&buffered));
        }

        self.output_tokens += (tool_use.input.len() as i32 + 3) / 4;
        let output_tokens = self.output_tokens;
        events.extend(self.tools.on_fragment(&mut self.state, tool_use, output_tokens));
        events
    }

    /// Emit a text delta, opening a text block as needed.
    ///
    /// The first text block takes the reserved index 0. If a tool call
    /// auto-closed it, later text opens a fresh block at the next dense
    /// index so deltas are never written into a stopped block.
    fn create_text_delta_events(&mut self, text: &str) -> Vec<SseEvent> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut events = Vec::new();

        if let Some(index) = self.text_block_index {
            if !self.state.is_block_open_of_type(index, "text") {
                self.text_block_index = None;
            }
        }

        let index = match self.text_block_index {
            Some(index) => index,
            None => {
                let index = if !self.first_text_block_used {
                    self.first_text_block_used = true;
                    TEXT_BLOCK_INDEX
                } else {
                    self.state.next_block_index()
                };
                self.text_block_index = Some(index);
                events.extend(self.state.handle_content_block_start(
                    index,
                    "text",
                    json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": { "type": "text", "text": "" }
                    }),
                ));
                index
            }
        };

        if let Some(delta) = self.state.handle_content_block_delta(
            index,
            json!({
                "type": "content_block_delta",
                "index": index,
                "delta": { "type": "text_delta", "text": text }
            }),
        ) {
            events.push(delta);
        }

        events
    }

    /// Stop the open text block, if any
    fn stop_text_block(&mut self) -> Vec<SseEvent> {
        let Some(index) = self.text_block_index.take() else {
            return Vec::new();
        };
        self.state.handle_content_block_stop(index).into_iter().collect()
    }

    /// Expire idle fragment buffers; expired tools are reported as errored
    pub fn expire_tools(&mut self, expiry: Duration) -> Vec<SseEvent> {
        let output_tokens = self.output_tokens;
        self.tools.expire(&mut self.state, expiry, output_tokens)
    }

    /// Final event sequence: flush held-back text, close open blocks,
    /// message_delta and message_stop.
    pub fn finalize(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();

        if !self.inline_buffer.is_empty() {
            let buffered = std::mem::take(&mut self.inline_buffer);
            events.extend(self.create_text_delta_events(&buffered));
        }

        events.extend(
            self.state
                .generate_final_events(self.input_tokens, self.output_tokens),
        );
        events
    }
}

/// Extract the body of `<tag>…</tag>` from `text`
fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].to_string())
}

/// Map an upstream finish reason onto the downstream stop_reason vocabulary
fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "length" | "max_tokens" => "max_tokens",
        _ => "end_turn",
    }
}

/// Cheap token estimate: CJK runs about 1.5 chars/token, the rest about 4
pub fn estimate_tokens(text: &str) -> i32 {
    let mut cjk_count = 0i32;
    let mut other_count = 0i32;
    for c in text.chars() {
        if ('\u{4E00}'..='\u{9FFF}').contains(&c) {
            cjk_count += 1;
        } else {
            other_count += 1;
        }
    }
    ((cjk_count * 2 + 2) / 3 + (other_count + 3) / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whisperer::model::events::AssistantResponseEvent;

    fn text_event(content: &str) -> Event {
        Event::AssistantResponse(AssistantResponseEvent::text(content))
    }

    fn tool_event(id: &str, name: &str, input: &str, stop: bool) -> Event {
        Event::ToolUse(ToolUseEvent {
            name: name.to_string(),
            tool_use_id: id.to_string(),
            input: input.to_string(),
            stop,
            fragment_index: None,
        })
    }

    fn names(events: &[SseEvent]) -> Vec<String> {
        events.iter().map(|e| e.event.clone()).collect()
    }

    #[test]
    fn test_mixed_text_and_tool_ordering() {
        // "Hello", then tool `tooluse_X`/Bash split into two fragments:
        // the stream must read start(0,text), delta(0), stop(0),
        // start(1,tool), [deltas], stop(1), message_delta(tool_use),
        // message_stop.
        let mut ctx = StreamContext::new("test-model", 1, true);
        let mut all = ctx.generate_initial_events();

        all.extend(ctx.process_event(&text_event("Hello")));
        all.extend(ctx.process_event(&tool_event("tooluse_X", "Bash", "{\"comm", false)));
        all.extend(ctx.process_event(&tool_event("tooluse_X", "Bash", "and\":\"ls\"}", true)));
        all.extend(ctx.finalize());

        let expected = [
            "message_start",
            "content_block_start",  // text, index 0
            "content_block_delta",  // "Hello"
            "content_block_stop",   // index 0 (auto-closed by tool start)
            "content_block_start",  // tool, index 1
            "content_block_delta",  // input_json_delta
            "content_block_delta",
            "content_block_stop",   // index 1
            "message_delta",
            "message_stop",
        ];
        assert_eq!(names(&all), expected);

        assert_eq!(all[1].data["index"], 0);
        assert_eq!(all[1].data["content_block"]["type"], "text");
        assert_eq!(all[2].data["delta"]["text"], "Hello");
        assert_eq!(all[4].data["index"], 1);
        assert_eq!(all[4].data["content_block"]["id"], "tooluse_X");
        assert_eq!(all[4].data["content_block"]["name"], "Bash");
        assert_eq!(all[8].data["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn test_first_tool_without_text_takes_index_one() {
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();
        let events = ctx.process_event(&tool_event("t1", "Bash", "{}", true));
        assert_eq!(events[0].event, "content_block_start");
        assert_eq!(events[0].data["index"], 1);
    }

    #[test]
    fn test_text_after_tool_opens_fresh_block() {
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();

        ctx.process_event(&text_event("before"));
        ctx.process_event(&tool_event("t1", "Bash", "{}", true));
        let events = ctx.process_event(&text_event("after"));

        assert_eq!(events[0].event, "content_block_start");
        let new_index = events[0].data["index"].as_i64().unwrap();
        assert!(new_index > 1, "text after tool must not reuse a closed index");
    }

    #[test]
    fn test_control_chars_removed_from_text() {
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();
        let events = ctx.process_event(&text_event("he\u{1}llo\u{7}"));
        let delta = events.iter().find(|e| e.event == "content_block_delta").unwrap();
        assert_eq!(delta.data["delta"]["text"], "hello");
    }

    #[test]
    fn test_inline_tool_extraction_single_chunk() {
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();

        let content = "I'll run it.<tool_use><tool_name>Bash</tool_name><parameters>{\"command\":\"ls\"}</parameters></tool_use>";
        let mut all = ctx.process_event(&text_event(content));
        all.extend(ctx.finalize());

        let text_delta = all
            .iter()
            .find(|e| e.event == "content_block_delta" && e.data["delta"]["type"] == "text_delta")
            .unwrap();
        assert_eq!(text_delta.data["delta"]["text"], "I'll run it.");

        let tool_start = all
            .iter()
            .find(|e| {
                e.event == "content_block_start" && e.data["content_block"]["type"] == "tool_use"
            })
            .unwrap();
        assert_eq!(tool_start.data["content_block"]["name"], "Bash");

        // Text precedes the tool block
        let text_pos = all.iter().position(|e| std::ptr::eq(e, text_delta)).unwrap();
        let tool_pos = all.iter().position(|e| std::ptr::eq(e, tool_start)).unwrap();
        assert!(text_pos < tool_pos);

        let args = ctx.tools.in_order().next().unwrap().arguments.clone().unwrap();
        assert_eq!(args, r#"{"command":"ls"}"#);
    }

    #[test]
    fn test_inline_tool_split_across_chunks() {
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();

        let mut all = Vec::new();
        all.extend(ctx.process_event(&text_event("run<tool_")));
        all.extend(ctx.process_event(&text_event("use><tool_name>Bash</tool_name>")));
        all.extend(ctx.process_event(&text_event("<parameters>{}</parameters></tool_use>done")));
        all.extend(ctx.finalize());

        assert!(all.iter().any(|e| {
            e.event == "content_block_start" && e.data["content_block"]["type"] == "tool_use"
        }));
        // Neither tag half leaked into the text channel
        for e in &all {
            if e.event == "content_block_delta" && e.data["delta"]["type"] == "text_delta" {
                let text = e.data["delta"]["text"].as_str().unwrap();
                assert!(!text.contains("tool_use"), "tag leaked: {:?}", text);
            }
        }
    }

    #[test]
    fn test_angle_bracket_text_not_swallowed() {
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();

        let mut all = Vec::new();
        all.extend(ctx.process_event(&text_event("a < b and <tools are nice")));
        all.extend(ctx.finalize());

        let text: String = all
            .iter()
            .filter(|e| e.event == "content_block_delta")
            .filter_map(|e| e.data["delta"]["text"].as_str().map(str::to_string))
            .collect();
        assert_eq!(text, "a < b and <tools are nice");
    }

    #[test]
    fn test_completion_whole_shot() {
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();

        let event = Event::Completion(crate::whisperer::model::events::CompletionEvent {
            completion: "all of it".to_string(),
            finish_reason: Some("stop".to_string()),
        });
        let events = ctx.process_event(&event);
        assert_eq!(
            names(&events),
            ["content_block_start", "content_block_delta", "content_block_stop"]
        );
    }

    #[test]
    fn test_completion_chunks() {
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();

        let chunk = |delta: &str, reason: Option<&str>| {
            Event::CompletionChunk(crate::whisperer::model::events::CompletionChunkEvent {
                delta: delta.to_string(),
                finish_reason: reason.map(str::to_string),
            })
        };

        let events = ctx.process_event(&chunk("hel", None));
        assert_eq!(names(&events), ["content_block_start", "content_block_delta"]);

        let events = ctx.process_event(&chunk("lo", Some("length")));
        assert_eq!(names(&events), ["content_block_delta", "content_block_stop"]);
        assert_eq!(ctx.state.stop_reason(), "max_tokens");
    }

    #[test]
    fn test_upstream_error_event() {
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();

        let events = ctx.process_event(&Event::Error {
            error_code: "Throttled".to_string(),
            error_message: "slow down".to_string(),
        });
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "error");
        assert_eq!(events[0].data["error"]["code"], "Throttled");
    }

    #[test]
    fn test_exception_sets_max_tokens() {
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();

        let events = ctx.process_event(&Event::Exception {
            exception_type: "ContentLengthExceededException".to_string(),
            message: "too long".to_string(),
        });
        assert_eq!(events[0].event, "error");
        assert_eq!(ctx.state.stop_reason(), "max_tokens");
    }

    #[test]
    fn test_fresh_context_per_request() {
        // A cancelled request's indices never leak: a new context allocates
        // from scratch.
        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();
        ctx.process_event(&tool_event("t1", "Bash", "{", false));
        drop(ctx);

        let mut ctx = StreamContext::new("m", 1, false);
        ctx.generate_initial_events();
        let events = ctx.process_event(&tool_event("t2", "Bash", "{}", true));
        assert_eq!(events[0].data["index"], 1);
    }

    #[test]
    fn test_estimate_tokens() {
        assert!(estimate_tokens("Hello") > 0);
        assert!(estimate_tokens("你好") > 0);
        assert!(estimate_tokens("") > 0);
    }
}
