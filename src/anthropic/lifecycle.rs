//! Tool invocation lifecycle
//!
//! Tracks every concurrent tool call of one request through
//! Started → Collecting → Completed/Error, owns the fragment aggregator, and
//! emits the tool-related slice of the SSE sequence. All state is
//! per-request; a fresh manager is built for every stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;

use crate::whisperer::aggregator::{AggregateError, FragmentAggregator};
use crate::whisperer::model::events::ToolUseEvent;

use super::sse::{SseEvent, SseStateManager};

/// Tool invocation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolState {
    /// Block created, no input seen
    Started,
    /// At least one fragment received
    Collecting,
    /// Final fragment observed and flushed
    Completed,
    /// Aggregation or validation failed
    Error,
}

/// One tracked tool invocation
#[derive(Debug)]
pub struct ToolInvocation {
    pub tool_use_id: String,
    pub name: String,
    pub state: ToolState,
    /// Stable content-block index (dense, allocated from 1)
    pub block_index: i32,
    pub started_at: Instant,
    /// Aggregated arguments, attached after finalisation
    pub arguments: Option<String>,
    pub error: Option<String>,
}

impl ToolInvocation {
    fn is_active(&self) -> bool {
        matches!(self.state, ToolState::Started | ToolState::Collecting)
    }
}

/// Per-request tool lifecycle manager
pub struct ToolLifecycleManager {
    tools: HashMap<String, ToolInvocation>,
    /// Insertion order of tool-use ids
    order: Vec<String>,
    aggregator: FragmentAggregator,
    /// Final arguments handed over by the aggregator's completion sink.
    /// The sink runs on the same request task and must not block.
    final_args: Arc<Mutex<HashMap<String, String>>>,
    /// Emit partial `input_json_delta` events per fragment when set
    incremental: bool,
}

impl ToolLifecycleManager {
    pub fn new(incremental: bool) -> Self {
        let final_args: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
        let sink_args = final_args.clone();
        let aggregator = FragmentAggregator::new().with_completion_sink(Box::new(
            move |tool_use_id, full_json| {
                sink_args
                    .lock()
                    .insert(tool_use_id.to_string(), full_json.to_string());
            },
        ));

        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            aggregator,
            final_args,
            incremental,
        }
    }

    /// Whether any tool is still Started/Collecting
    pub fn has_active_tools(&self) -> bool {
        self.tools.values().any(|t| t.is_active())
    }

    /// Whether at least one tool completed successfully
    pub fn any_completed(&self) -> bool {
        self.tools.values().any(|t| t.state == ToolState::Completed)
    }

    pub fn get(&self, tool_use_id: &str) -> Option<&ToolInvocation> {
        self.tools.get(tool_use_id)
    }

    /// Tool invocations in insertion order
    pub fn in_order(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.order.iter().filter_map(|id| self.tools.get(id))
    }

    /// Register a tool invocation and emit its `content_block_start`.
    ///
    /// Re-using a known id updates the arguments but never re-emits the
    /// start event or allocates a new index.
    pub fn on_request(
        &mut self,
        sm: &mut SseStateManager,
        tool_use_id: &str,
        name: &str,
        initial_args: Option<&serde_json::Value>,
    ) -> Vec<SseEvent> {
        if let Some(tool) = self.tools.get_mut(tool_use_id) {
            if let Some(args) = initial_args {
                tool.arguments = Some(args.to_string());
            }
            return Vec::new();
        }

        let block_index = sm.next_block_index();
        self.tools.insert(
            tool_use_id.to_string(),
            ToolInvocation {
                tool_use_id: tool_use_id.to_string(),
                name: name.to_string(),
                state: ToolState::Started,
                block_index,
                started_at: Instant::now(),
                arguments: initial_args.map(|v| v.to_string()),
                error: None,
            },
        );
        self.order.push(tool_use_id.to_string());

        sm.handle_content_block_start(
            block_index,
            "tool_use",
            json!({
                "type": "content_block_start",
                "index": block_index,
                "content_block": {
                    "type": "tool_use",
                    "id": tool_use_id,
                    "name": name,
                    "input": initial_args.cloned().unwrap_or_else(|| json!({}))
                }
            }),
        )
    }

    /// Feed one upstream tool fragment through the aggregator.
    ///
    /// Emits `content_block_start` for a first-seen id, a partial
    /// `input_json_delta` when incremental delivery is enabled, and the
    /// closing sequence when the fragment is final.
    pub fn on_fragment(
        &mut self,
        sm: &mut SseStateManager,
        event: &ToolUseEvent,
        output_tokens: i32,
    ) -> Vec<SseEvent> {
        let mut events = self.on_request(sm, &event.tool_use_id, &event.name, None);

        match self.aggregator.process(
            &event.tool_use_id,
            &event.name,
            event.input.as_bytes(),
            event.stop,
            event.fragment_index,
        ) {
            Ok(_) => {}
            Err(AggregateError::Overflow { cap, .. }) => {
                events.extend(self.on_error(
                    sm,
                    &event.tool_use_id,
                    &format!("tool input exceeded {} bytes", cap),
                    output_tokens,
                ));
                return events;
            }
        }

        if let Some(tool) = self.tools.get_mut(&event.tool_use_id) {
            if tool.state == ToolState::Started {
                tool.state = ToolState::Collecting;
            }
        }

        if self.incremental && !event.input.is_empty() {
            let index = self.tools[&event.tool_use_id].block_index;
            if let Some(delta) = sm.handle_content_block_delta(
                index,
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {
                        "type": "input_json_delta",
                        "partial_json": event.input
                    }
                }),
            ) {
                events.push(delta);
            }
        }

        if event.stop {
            events.extend(self.on_final(sm, &event.tool_use_id, output_tokens));
        }

        events
    }

    /// Close a tool block.
    ///
    /// An unknown id is emergency-registered so the stream still carries a
    /// well-paired start+stop. When this was the last active tool, the
    /// `message_delta { stop_reason: "tool_use" }` follows immediately.
    pub fn on_final(
        &mut self,
        sm: &mut SseStateManager,
        tool_use_id: &str,
        output_tokens: i32,
    ) -> Vec<SseEvent> {
        let mut events = Vec::new();

        if !self.tools.contains_key(tool_use_id) {
            tracing::warn!(
                tool_use_id = tool_use_id,
                "final fragment for unknown tool, emergency-registering"
            );
            events.extend(self.on_request(sm, tool_use_id, "unknown", None));
        }

        let final_args = self.final_args.lock().remove(tool_use_id);
        let tool = self
            .tools
            .get_mut(tool_use_id)
            .expect("registered above");

        if tool.state == ToolState::Completed || tool.state == ToolState::Error {
            return events;
        }
        tool.state = ToolState::Completed;
        if final_args.is_some() {
            tool.arguments = final_args;
        }
        let index = tool.block_index;

        if let Some(stop) = sm.handle_content_block_stop(index) {
            events.push(stop);
        }

        if !self.has_active_tools() {
            sm.set_has_tool_use(true);
            if let Some(delta) = sm.handle_message_delta(output_tokens) {
                events.push(delta);
            }
        }

        events
    }

    /// Transition a tool to Error and emit the error sequence.
    pub fn on_error(
        &mut self,
        sm: &mut SseStateManager,
        tool_use_id: &str,
        reason: &str,
        output_tokens: i32,
    ) -> Vec<SseEvent> {
        let mut events = Vec::new();

        if !self.tools.contains_key(tool_use_id) {
            events.extend(self.on_request(sm, tool_use_id, "unknown", None));
        }

        let tool = self
            .tools
            .get_mut(tool_use_id)
            .expect("registered above");
        if !tool.is_active() {
            return events;
        }
        tool.state = ToolState::Error;
        tool.error = Some(reason.to_string());
        let index = tool.block_index;

        tracing::warn!(
            tool_use_id = tool_use_id,
            reason = reason,
            elapsed = ?tool.started_at.elapsed(),
            "tool errored"
        );

        events.push(SseEvent::error("tool_error", reason, Some(tool_use_id)));
        if let Some(stop) = sm.handle_content_block_stop(index) {
            events.push(stop);
        }

        if !self.has_active_tools() {
            sm.set_stop_reason("tool_error");
            if let Some(delta) = sm.handle_message_delta(output_tokens) {
                events.push(delta);
            }
        }

        events
    }

    /// Expire fragment buffers idle for longer than `expiry`; each expired
    /// tool is reported as errored.
    pub fn expire(
        &mut self,
        sm: &mut SseStateManager,
        expiry: Duration,
        output_tokens: i32,
    ) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for expired in self.aggregator.cleanup(expiry) {
            events.extend(self.on_error(
                sm,
                &expired.tool_use_id,
                "tool input timed out",
                output_tokens,
            ));
        }
        events
    }

    /// Drop all per-request state
    pub fn reset(&mut self) {
        self.tools.clear();
        self.order.clear();
        self.aggregator.reset();
        self.final_args.lock().clear();
    }
}
