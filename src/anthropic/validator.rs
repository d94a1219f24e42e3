//! Emitted-stream validation
//!
//! A set of independent stateful rules evaluated, in order, on every SSE
//! event the gateway emits. Violations at Error severity or above flip the
//! request to failed status but never abort the stream; delivery stays
//! best-effort.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::sse::SseEvent;

/// Violation severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One detected violation
#[derive(Debug, Clone)]
pub struct Violation {
    pub rule: &'static str,
    pub severity: Severity,
    pub message: String,
}

impl Violation {
    fn new(rule: &'static str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            rule,
            severity,
            message: message.into(),
        }
    }
}

/// A stateful per-request validation rule
pub trait ValidationRule: Send {
    fn name(&self) -> &'static str;
    fn check(&mut self, event: &SseEvent) -> Vec<Violation>;
}

fn event_index(event: &SseEvent) -> Option<i64> {
    event.data.get("index").and_then(|v| v.as_i64())
}

/// message_start / message_stop pairing
#[derive(Default)]
struct MessageLifecycleRule {
    started: bool,
    stopped: bool,
}

impl ValidationRule for MessageLifecycleRule {
    fn name(&self) -> &'static str {
        "message_lifecycle"
    }

    fn check(&mut self, event: &SseEvent) -> Vec<Violation> {
        let mut violations = Vec::new();

        if self.stopped && event.event != "ping" {
            violations.push(Violation::new(
                self.name(),
                Severity::Error,
                format!("event {} after message_stop", event.event),
            ));
        }

        match event.event.as_str() {
            "message_start" => {
                if self.started {
                    violations.push(Violation::new(
                        self.name(),
                        Severity::Error,
                        "duplicate message_start",
                    ));
                }
                self.started = true;
            }
            "message_stop" => {
                if !self.started {
                    violations.push(Violation::new(
                        self.name(),
                        Severity::Error,
                        "message_stop without message_start",
                    ));
                }
                self.stopped = true;
            }
            _ => {
                if !self.started && event.event != "ping" {
                    violations.push(Violation::new(
                        self.name(),
                        Severity::Warning,
                        format!("event {} before message_start", event.event),
                    ));
                }
            }
        }

        violations
    }
}

/// content_block start/delta/stop integrity
#[derive(Default)]
struct BlockIntegrityRule {
    started: HashSet<i64>,
    stopped: HashSet<i64>,
}

impl ValidationRule for BlockIntegrityRule {
    fn name(&self) -> &'static str {
        "block_integrity"
    }

    fn check(&mut self, event: &SseEvent) -> Vec<Violation> {
        let mut violations = Vec::new();

        match event.event.as_str() {
            "content_block_start" => {
                let Some(index) = event_index(event) else {
                    return vec![Violation::new(self.name(), Severity::Error, "start without index")];
                };
                if !self.started.insert(index) {
                    violations.push(Violation::new(
                        self.name(),
                        Severity::Error,
                        format!("duplicate content_block_start for index {}", index),
                    ));
                }
            }
            "content_block_delta" => {
                let Some(index) = event_index(event) else {
                    return vec![Violation::new(self.name(), Severity::Error, "delta without index")];
                };
                if !self.started.contains(&index) {
                    violations.push(Violation::new(
                        self.name(),
                        Severity::Error,
                        format!("delta before start for index {}", index),
                    ));
                }
                if self.stopped.contains(&index) {
                    violations.push(Violation::new(
                        self.name(),
                        Severity::Error,
                        format!("delta after stop for index {}", index),
                    ));
                }
            }
            "content_block_stop" => {
                let Some(index) = event_index(event) else {
                    return vec![Violation::new(self.name(), Severity::Error, "stop without index")];
                };
                if !self.started.contains(&index) {
                    violations.push(Violation::new(
                        self.name(),
                        Severity::Error,
                        format!("stop before start for index {}", index),
                    ));
                }
                if !self.stopped.insert(index) {
                    violations.push(Violation::new(
                        self.name(),
                        Severity::Error,
                        format!("duplicate content_block_stop for index {}", index),
                    ));
                }
            }
            "message_stop" => {
                for index in self.started.difference(&self.stopped) {
                    violations.push(Violation::new(
                        self.name(),
                        Severity::Error,
                        format!("block {} never stopped", index),
                    ));
                }
            }
            _ => {}
        }

        violations
    }
}

/// Every tool_use block must reach a content_block_stop
#[derive(Default)]
struct ToolFlowRule {
    tool_blocks: HashMap<i64, bool>,
}

impl ValidationRule for ToolFlowRule {
    fn name(&self) -> &'static str {
        "tool_flow"
    }

    fn check(&mut self, event: &SseEvent) -> Vec<Violation> {
        match event.event.as_str() {
            "content_block_start" => {
                if event.data["content_block"]["type"] == "tool_use" {
                    if let Some(index) = event_index(event) {
                        self.tool_blocks.insert(index, false);
                    }
                }
                Vec::new()
            }
            "content_block_stop" => {
                if let Some(index) = event_index(event) {
                    if let Some(stopped) = self.tool_blocks.get_mut(&index) {
                        *stopped = true;
                    }
                }
                Vec::new()
            }
            "message_stop" => self
                .tool_blocks
                .iter()
                .filter(|&(_, &stopped)| !stopped)
                .map(|(index, _)| {
                    Violation::new(
                        self.name(),
                        Severity::Error,
                        format!("tool_use block {} has no content_block_stop", index),
                    )
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Inter-event gap exceeding the configured threshold
struct StreamingTimeoutRule {
    threshold: Duration,
    last_event: Option<Instant>,
}

impl StreamingTimeoutRule {
    fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_event: None,
        }
    }
}

impl ValidationRule for StreamingTimeoutRule {
    fn name(&self) -> &'static str {
        "streaming_timeout"
    }

    fn check(&mut self, _event: &SseEvent) -> Vec<Violation> {
        let now = Instant::now();
        let gap = self.last_event.map(|t| now.duration_since(t));
        self.last_event = Some(now);

        match gap {
            Some(gap) if gap > self.threshold => vec![Violation::new(
                self.name(),
                Severity::Warning,
                format!("inter-event gap of {:?} exceeded {:?}", gap, self.threshold),
            )],
            _ => Vec::new(),
        }
    }
}

/// Duplicate-event detection via (event-name, stable-fields) fingerprints.
///
/// Only structurally-unique events are fingerprinted; deltas may repeat
/// identical content legitimately.
struct DuplicateEventRule {
    window: Duration,
    seen: VecDeque<(String, Instant)>,
}

impl DuplicateEventRule {
    fn new(window: Duration) -> Self {
        Self {
            window,
            seen: VecDeque::new(),
        }
    }

    fn fingerprint(event: &SseEvent) -> Option<String> {
        match event.event.as_str() {
            "content_block_start" | "content_block_stop" => {
                Some(format!("{}:{}", event.event, event_index(event).unwrap_or(-1)))
            }
            "message_start" | "message_delta" | "message_stop" => Some(event.event.clone()),
            _ => None,
        }
    }
}

impl ValidationRule for DuplicateEventRule {
    fn name(&self) -> &'static str {
        "duplicate_event"
    }

    fn check(&mut self, event: &SseEvent) -> Vec<Violation> {
        let Some(fingerprint) = Self::fingerprint(event) else {
            return Vec::new();
        };

        let now = Instant::now();
        while let Some((_, t)) = self.seen.front() {
            if now.duration_since(*t) > self.window {
                self.seen.pop_front();
            } else {
                break;
            }
        }

        let duplicate = self.seen.iter().any(|(f, _)| *f == fingerprint);
        self.seen.push_back((fingerprint.clone(), now));

        if duplicate {
            vec![Violation::new(
                self.name(),
                Severity::Warning,
                format!("duplicate event fingerprint {}", fingerprint),
            )]
        } else {
            Vec::new()
        }
    }
}

/// Per-request validator running every rule in order
pub struct ResponseValidator {
    rules: Vec<Box<dyn ValidationRule>>,
    failed: bool,
    violation_count: usize,
}

/// Default duplicate-detection window
const DUPLICATE_WINDOW: Duration = Duration::from_secs(2);

impl ResponseValidator {
    pub fn new(timeout_threshold: Duration) -> Self {
        Self {
            rules: vec![
                Box::new(MessageLifecycleRule::default()),
                Box::new(BlockIntegrityRule::default()),
                Box::new(ToolFlowRule::default()),
                Box::new(StreamingTimeoutRule::new(timeout_threshold)),
                Box::new(DuplicateEventRule::new(DUPLICATE_WINDOW)),
            ],
            failed: false,
            violation_count: 0,
        }
    }

    /// Evaluate one emitted event against every rule.
    ///
    /// Violations are logged; Error and above mark the request failed.
    pub fn observe(&mut self, event: &SseEvent) -> Vec<Violation> {
        let mut violations = Vec::new();
        for rule in &mut self.rules {
            violations.extend(rule.check(event));
        }

        for violation in &violations {
            self.violation_count += 1;
            match violation.severity {
                Severity::Info => {
                    tracing::debug!(rule = violation.rule, "{}", violation.message)
                }
                Severity::Warning => {
                    tracing::warn!(rule = violation.rule, "{}", violation.message)
                }
                Severity::Error | Severity::Critical => {
                    tracing::error!(rule = violation.rule, "{}", violation.message);
                    self.failed = true;
                }
            }
        }

        violations
    }

    /// Whether any Error/Critical violation was observed
    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn violation_count(&self) -> usize {
        self.violation_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> ResponseValidator {
        ResponseValidator::new(Duration::from_secs(60))
    }

    fn start(index: i64, block_type: &str) -> SseEvent {
        SseEvent::new(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": index,
                "content_block": { "type": block_type }
            }),
        )
    }

    fn delta(index: i64) -> SseEvent {
        SseEvent::new(
            "content_block_delta",
            json!({ "type": "content_block_delta", "index": index, "delta": {} }),
        )
    }

    fn stop(index: i64) -> SseEvent {
        SseEvent::new(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": index }),
        )
    }

    fn message_start() -> SseEvent {
        SseEvent::new("message_start", json!({ "type": "message_start" }))
    }

    fn message_stop() -> SseEvent {
        SseEvent::new("message_stop", json!({ "type": "message_stop" }))
    }

    #[test]
    fn test_well_formed_stream_passes() {
        let mut v = validator();
        for event in [
            message_start(),
            start(0, "text"),
            delta(0),
            stop(0),
            start(1, "tool_use"),
            delta(1),
            stop(1),
            message_stop(),
        ] {
            assert!(v.observe(&event).is_empty(), "unexpected violation");
        }
        assert!(!v.failed());
    }

    #[test]
    fn test_duplicate_message_start() {
        let mut v = validator();
        v.observe(&message_start());
        let violations = v.observe(&message_start());
        assert!(violations.iter().any(|x| x.rule == "message_lifecycle"));
        assert!(v.failed());
    }

    #[test]
    fn test_delta_before_start() {
        let mut v = validator();
        v.observe(&message_start());
        let violations = v.observe(&delta(3));
        assert!(violations.iter().any(|x| x.rule == "block_integrity"));
        assert!(v.failed());
    }

    #[test]
    fn test_delta_after_stop() {
        let mut v = validator();
        v.observe(&message_start());
        v.observe(&start(0, "text"));
        v.observe(&stop(0));
        let violations = v.observe(&delta(0));
        assert!(violations.iter().any(|x| x.severity == Severity::Error));
    }

    #[test]
    fn test_unstopped_tool_block_flagged_at_message_stop() {
        let mut v = validator();
        v.observe(&message_start());
        v.observe(&start(1, "tool_use"));
        let violations = v.observe(&message_stop());
        assert!(violations.iter().any(|x| x.rule == "tool_flow"));
        assert!(violations.iter().any(|x| x.rule == "block_integrity"));
    }

    #[test]
    fn test_duplicate_stop_fingerprint() {
        let mut v = validator();
        v.observe(&message_start());
        v.observe(&start(0, "text"));
        v.observe(&stop(0));
        let violations = v.observe(&stop(0));
        assert!(violations.iter().any(|x| x.rule == "duplicate_event"));
        assert!(violations.iter().any(|x| x.rule == "block_integrity"));
    }

    #[test]
    fn test_repeated_identical_deltas_allowed() {
        let mut v = validator();
        v.observe(&message_start());
        v.observe(&start(0, "text"));
        v.observe(&delta(0));
        let violations = v.observe(&delta(0));
        assert!(violations.is_empty());
    }

    #[test]
    fn test_timeout_warns_but_does_not_fail() {
        let mut v = ResponseValidator::new(Duration::ZERO);
        v.observe(&message_start());
        std::thread::sleep(Duration::from_millis(5));
        let violations = v.observe(&start(0, "text"));
        assert!(violations.iter().any(|x| x.rule == "streaming_timeout"));
        assert!(!v.failed());
    }

    #[test]
    fn test_events_after_message_stop() {
        let mut v = validator();
        v.observe(&message_start());
        v.observe(&message_stop());
        let violations = v.observe(&delta(0));
        assert!(violations.iter().any(|x| x.rule == "message_lifecycle"));
    }
}
