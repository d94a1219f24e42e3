//! SSE event type and ordering state machine
//!
//! Guards the event sequence the gateway emits so it always satisfies the
//! downstream contract:
//! 1. `message_start` appears at most once, before everything else
//! 2. a content block must start, then delta, then stop
//! 3. `message_delta` appears at most once, after all `content_block_stop`
//! 4. `message_stop` is last

use std::collections::HashMap;

use serde_json::json;

/// Content-block index reserved for the text channel
pub const TEXT_BLOCK_INDEX: i32 = 0;

/// SSE event
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: String,
    pub data: serde_json::Value,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Format as an SSE wire string
    pub fn to_sse_string(&self) -> String {
        format!(
            "event: {}\ndata: {}\n\n",
            self.event,
            serde_json::to_string(&self.data).unwrap_or_default()
        )
    }

    /// Build an `error` event
    pub fn error(error_type: &str, message: &str, tool_call_id: Option<&str>) -> Self {
        let mut body = json!({
            "type": error_type,
            "message": message,
        });
        if let Some(id) = tool_call_id {
            body["tool_call_id"] = json!(id);
        }
        Self::new("error", json!({ "type": "error", "error": body }))
    }
}

/// Content block state
#[derive(Debug, Clone)]
struct BlockState {
    block_type: String,
    started: bool,
    stopped: bool,
}

impl BlockState {
    fn new(block_type: impl Into<String>) -> Self {
        Self {
            block_type: block_type.into(),
            started: false,
            stopped: false,
        }
    }
}

/// SSE state manager
///
/// Index 0 is reserved for the text channel; tool blocks are allocated
/// densely from 1 in insertion order.
#[derive(Debug)]
pub struct SseStateManager {
    message_started: bool,
    message_delta_sent: bool,
    message_ended: bool,
    active_blocks: HashMap<i32, BlockState>,
    /// Next tool block index
    next_block_index: i32,
    stop_reason: Option<String>,
    has_tool_use: bool,
}

impl Default for SseStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SseStateManager {
    pub fn new() -> Self {
        Self {
            message_started: false,
            message_delta_sent: false,
            message_ended: false,
            active_blocks: HashMap::new(),
            next_block_index: TEXT_BLOCK_INDEX + 1,
            stop_reason: None,
            has_tool_use: false,
        }
    }

    /// Allocate the next tool block index (monotonic, starts at 1)
    pub fn next_block_index(&mut self) -> i32 {
        let index = self.next_block_index;
        self.next_block_index += 1;
        index
    }

    /// Whether the block at `index` is open and of the expected type
    pub fn is_block_open_of_type(&self, index: i32, expected_type: &str) -> bool {
        self.active_blocks
            .get(&index)
            .is_some_and(|b| b.started && !b.stopped && b.block_type == expected_type)
    }

    /// Whether any block is started and not yet stopped
    pub fn has_open_blocks(&self) -> bool {
        self.active_blocks.values().any(|b| b.started && !b.stopped)
    }

    pub fn set_has_tool_use(&mut self, has: bool) {
        self.has_tool_use = has;
    }

    pub fn has_tool_use(&self) -> bool {
        self.has_tool_use
    }

    pub fn set_stop_reason(&mut self, reason: impl Into<String>) {
        self.stop_reason = Some(reason.into());
    }

    /// Final stop_reason: explicit override > tool_use > end_turn
    pub fn stop_reason(&self) -> String {
        if let Some(ref reason) = self.stop_reason {
            reason.clone()
        } else if self.has_tool_use {
            "tool_use".to_string()
        } else {
            "end_turn".to_string()
        }
    }

    /// Handle message_start; duplicates are dropped
    pub fn handle_message_start(&mut self, data: serde_json::Value) -> Option<SseEvent> {
        if self.message_started {
            tracing::debug!("skipping duplicate message_start");
            return None;
        }
        self.message_started = true;
        Some(SseEvent::new("message_start", data))
    }

    /// Handle content_block_start.
    ///
    /// Starting a tool block auto-closes any open text block first, so text
    /// deltas never interleave with the tool block.
    pub fn handle_content_block_start(
        &mut self,
        index: i32,
        block_type: &str,
        data: serde_json::Value,
    ) -> Vec<SseEvent> {
        let mut events = Vec::new();

        if block_type == "tool_use" {
            self.has_tool_use = true;
            for (block_index, block) in self.active_blocks.iter_mut() {
                if block.block_type == "text" && block.started && !block.stopped {
                    events.push(SseEvent::new(
                        "content_block_stop",
                        json!({ "type": "content_block_stop", "index": block_index }),
                    ));
                    block.stopped = true;
                }
            }
        }

        if let Some(block) = self.active_blocks.get_mut(&index) {
            if block.started {
                tracing::debug!("block {} already started, skipping duplicate start", index);
                return events;
            }
            block.started = true;
        } else {
            let mut block = BlockState::new(block_type);
            block.started = true;
            self.active_blocks.insert(index, block);
        }

        events.push(SseEvent::new("content_block_start", data));
        events
    }

    /// Handle content_block_delta; deltas outside an open block are dropped
    pub fn handle_content_block_delta(
        &mut self,
        index: i32,
        data: serde_json::Value,
    ) -> Option<SseEvent> {
        match self.active_blocks.get(&index) {
            Some(block) if block.started && !block.stopped => {
                Some(SseEvent::new("content_block_delta", data))
            }
            Some(block) => {
                tracing::warn!(
                    "block {} not open for delta: started={}, stopped={}",
                    index,
                    block.started,
                    block.stopped
                );
                None
            }
            None => {
                tracing::warn!("delta for unknown block {}", index);
                None
            }
        }
    }

    /// Handle content_block_stop; duplicates are dropped
    pub fn handle_content_block_stop(&mut self, index: i32) -> Option<SseEvent> {
        let block = self.active_blocks.get_mut(&index)?;
        if block.stopped {
            tracing::debug!("block {} already stopped, skipping duplicate stop", index);
            return None;
        }
        block.stopped = true;
        Some(SseEvent::new(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": index }),
        ))
    }

    /// Emit message_delta once, outside the usual final sequence.
    ///
    /// Used when the last active tool closes and the stop reason is already
    /// known; `generate_final_events` will not emit a second one.
    pub fn handle_message_delta(&mut self, output_tokens: i32) -> Option<SseEvent> {
        if self.message_delta_sent {
            return None;
        }
        self.message_delta_sent = true;
        Some(SseEvent::new(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": self.stop_reason(),
                    "stop_sequence": null
                },
                "usage": { "output_tokens": output_tokens }
            }),
        ))
    }

    /// Generate the final event sequence: close open blocks, message_delta
    /// (if not yet sent), message_stop.
    pub fn generate_final_events(&mut self, input_tokens: i32, output_tokens: i32) -> Vec<SseEvent> {
        let mut events = Vec::new();

        let mut open: Vec<i32> = self
            .active_blocks
            .iter()
            .filter(|(_, b)| b.started && !b.stopped)
            .map(|(i, _)| *i)
            .collect();
        open.sort_unstable();
        for index in open {
            if let Some(block) = self.active_blocks.get_mut(&index) {
                events.push(SseEvent::new(
                    "content_block_stop",
                    json!({ "type": "content_block_stop", "index": index }),
                ));
                block.stopped = true;
            }
        }

        if !self.message_delta_sent {
            self.message_delta_sent = true;
            events.push(SseEvent::new(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {
                        "stop_reason": self.stop_reason(),
                        "stop_sequence": null
                    },
                    "usage": {
                        "input_tokens": input_tokens,
                        "output_tokens": output_tokens
                    }
                }),
            ));
        }

        if !self.message_ended {
            self.message_ended = true;
            events.push(SseEvent::new("message_stop", json!({ "type": "message_stop" })));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_event_format() {
        let event = SseEvent::new("message_start", json!({"type": "message_start"}));
        let s = event.to_sse_string();
        assert!(s.starts_with("event: message_start\n"));
        assert!(s.contains("data: "));
        assert!(s.ends_with("\n\n"));
    }

    #[test]
    fn test_error_event_shape() {
        let event = SseEvent::error("tool_error", "boom", Some("t1"));
        assert_eq!(event.event, "error");
        assert_eq!(event.data["error"]["type"], "tool_error");
        assert_eq!(event.data["error"]["tool_call_id"], "t1");
    }

    #[test]
    fn test_message_start_once() {
        let mut sm = SseStateManager::new();
        assert!(sm.handle_message_start(json!({})).is_some());
        assert!(sm.handle_message_start(json!({})).is_none());
    }

    #[test]
    fn test_block_lifecycle() {
        let mut sm = SseStateManager::new();
        assert_eq!(sm.handle_content_block_start(0, "text", json!({})).len(), 1);
        assert!(sm.handle_content_block_delta(0, json!({})).is_some());
        assert!(sm.handle_content_block_stop(0).is_some());
        assert!(sm.handle_content_block_stop(0).is_none());
        assert!(sm.handle_content_block_delta(0, json!({})).is_none());
    }

    #[test]
    fn test_tool_indices_start_at_one() {
        let mut sm = SseStateManager::new();
        assert_eq!(sm.next_block_index(), 1);
        assert_eq!(sm.next_block_index(), 2);
    }

    #[test]
    fn test_tool_start_closes_open_text_block() {
        let mut sm = SseStateManager::new();
        sm.handle_content_block_start(TEXT_BLOCK_INDEX, "text", json!({}));

        let events = sm.handle_content_block_start(1, "tool_use", json!({}));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "content_block_stop");
        assert_eq!(events[0].data["index"], TEXT_BLOCK_INDEX);
        assert_eq!(events[1].event, "content_block_start");
    }

    #[test]
    fn test_final_events_close_blocks_and_stop_once() {
        let mut sm = SseStateManager::new();
        sm.handle_content_block_start(0, "text", json!({}));

        let events = sm.generate_final_events(10, 20);
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, ["content_block_stop", "message_delta", "message_stop"]);

        // A second call produces nothing
        assert!(sm.generate_final_events(10, 20).is_empty());
    }

    #[test]
    fn test_stop_reason_precedence() {
        let mut sm = SseStateManager::new();
        assert_eq!(sm.stop_reason(), "end_turn");
        sm.set_has_tool_use(true);
        assert_eq!(sm.stop_reason(), "tool_use");
        sm.set_stop_reason("max_tokens");
        assert_eq!(sm.stop_reason(), "max_tokens");
    }

    #[test]
    fn test_early_message_delta_suppresses_final_one() {
        let mut sm = SseStateManager::new();
        sm.set_has_tool_use(true);
        assert!(sm.handle_message_delta(5).is_some());
        assert!(sm.handle_message_delta(5).is_none());

        let events = sm.generate_final_events(1, 5);
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, ["message_stop"]);
    }
}
