//! Tool-call fragment aggregation
//!
//! The upstream slices a tool call's JSON argument string into arbitrarily
//! small byte fragments, including cuts in the middle of a multi-byte UTF-8
//! code unit. This module reassembles the fragments per tool-use id and
//! produces a well-formed JSON document at finalisation.
//!
//! Partial JSON is never parsed before the final fragment arrives; repairs
//! are bounded and only happen once, at finalisation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

/// Per-tool accumulation cap (10 MiB)
pub const DEFAULT_MAX_FRAGMENT_BYTES: usize = 10 * 1024 * 1024;

/// Callback invoked with `(tool_use_id, full_json)` after finalisation
pub type CompletionSink = Box<dyn FnMut(&str, &str) + Send>;

/// Aggregation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    /// The per-tool byte cap was exceeded; the tool must transition to Error
    Overflow { tool_use_id: String, cap: usize },
}

impl std::error::Error for AggregateError {}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow { tool_use_id, cap } => {
                write!(f, "fragment buffer for {} exceeded {} bytes", tool_use_id, cap)
            }
        }
    }
}

/// Identity of a buffer dropped by `cleanup`
#[derive(Debug, Clone)]
pub struct ExpiredTool {
    pub tool_use_id: String,
    pub tool_name: String,
}

/// Per-tool fragment accumulator.
///
/// `data` always ends on a UTF-8 code-point boundary; an incomplete trailing
/// code unit lives in `carry` until the next fragment completes it.
struct FragmentBuffer {
    tool_name: String,
    data: Vec<u8>,
    carry: Vec<u8>,
    /// Fragments keyed by explicit sequence index, when the upstream
    /// provides one. Ordered concatenation happens at finalisation.
    indexed: BTreeMap<u32, Vec<u8>>,
    last_update: Instant,
}

impl FragmentBuffer {
    fn new(tool_name: &str) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            data: Vec::new(),
            carry: Vec::new(),
            indexed: BTreeMap::new(),
            last_update: Instant::now(),
        }
    }

    fn total_bytes(&self) -> usize {
        self.data.len()
            + self.carry.len()
            + self.indexed.values().map(|v| v.len()).sum::<usize>()
    }

    /// Append a fragment, keeping `data` on a code-point boundary
    fn append(&mut self, fragment: &[u8]) {
        self.data.append(&mut self.carry);
        self.data.extend_from_slice(fragment);

        let tail = incomplete_tail_len(&self.data);
        if tail > 0 {
            let at = self.data.len() - tail;
            self.carry = self.data.split_off(at);
        }
    }

    /// Assemble the full byte sequence for finalisation
    fn assemble(mut self) -> Vec<u8> {
        if self.indexed.is_empty() {
            self.data.extend_from_slice(&self.carry);
            return self.data;
        }
        // Concatenate by index; absent indices contribute nothing
        let mut out: Vec<u8> = Vec::new();
        for (_, frag) in std::mem::take(&mut self.indexed) {
            out.extend_from_slice(&frag);
        }
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.carry);
        out
    }
}

/// Reconstructs complete JSON documents from byte-sliced tool-call fragments.
pub struct FragmentAggregator {
    buffers: HashMap<String, FragmentBuffer>,
    max_fragment_bytes: usize,
    on_complete: Option<CompletionSink>,
}

impl Default for FragmentAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl FragmentAggregator {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            max_fragment_bytes: DEFAULT_MAX_FRAGMENT_BYTES,
            on_complete: None,
        }
    }

    pub fn with_max_fragment_bytes(mut self, cap: usize) -> Self {
        self.max_fragment_bytes = cap;
        self
    }

    /// Register the finalisation callback.
    ///
    /// The callback must not block: it runs on the request task and only
    /// mutates state owned by the same task.
    pub fn with_completion_sink(mut self, sink: CompletionSink) -> Self {
        self.on_complete = Some(sink);
        self
    }

    /// Number of tools currently accumulating
    pub fn active_count(&self) -> usize {
        self.buffers.len()
    }

    /// Whether any fragment has been seen for `tool_use_id`
    pub fn contains(&self, tool_use_id: &str) -> bool {
        self.buffers.contains_key(tool_use_id)
    }

    /// Process one fragment.
    ///
    /// Returns `Ok(None)` while accumulating and `Ok(Some(full_json))` once
    /// `is_final` is set. The returned document is guaranteed to be valid
    /// UTF-8 and well-formed JSON.
    pub fn process(
        &mut self,
        tool_use_id: &str,
        tool_name: &str,
        fragment: &[u8],
        is_final: bool,
        sequence_index: Option<u32>,
    ) -> Result<Option<String>, AggregateError> {
        let over_cap = {
            let buffer = self
                .buffers
                .entry(tool_use_id.to_string())
                .or_insert_with(|| FragmentBuffer::new(tool_name));
            buffer.last_update = Instant::now();
            buffer.total_bytes() + fragment.len() > self.max_fragment_bytes
        };
        if over_cap {
            self.buffers.remove(tool_use_id);
            return Err(AggregateError::Overflow {
                tool_use_id: tool_use_id.to_string(),
                cap: self.max_fragment_bytes,
            });
        }

        let buffer = self
            .buffers
            .get_mut(tool_use_id)
            .expect("buffer inserted above");
        match sequence_index {
            Some(index) => {
                buffer
                    .indexed
                    .entry(index)
                    .or_default()
                    .extend_from_slice(fragment);
            }
            None => buffer.append(fragment),
        }

        if !is_final {
            return Ok(None);
        }

        let buffer = self
            .buffers
            .remove(tool_use_id)
            .expect("buffer inserted above");
        let tool_name = buffer.tool_name.clone();
        let full_json = finalize_json(buffer.assemble(), &tool_name);

        if let Some(sink) = self.on_complete.as_mut() {
            sink(tool_use_id, &full_json);
        }

        Ok(Some(full_json))
    }

    /// Drop buffers with no update for longer than `expiry`.
    ///
    /// Returns the dropped identities; each is reported downstream as an
    /// errored tool call.
    pub fn cleanup(&mut self, expiry: Duration) -> Vec<ExpiredTool> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, b)| now.duration_since(b.last_update) > expiry)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                self.buffers.remove(&id).map(|b| ExpiredTool {
                    tool_use_id: id,
                    tool_name: b.tool_name,
                })
            })
            .collect()
    }

    /// Discard all in-flight buffers
    pub fn reset(&mut self) {
        self.buffers.clear();
    }
}

/// Length of the incomplete UTF-8 code unit at the end of `buf`, if any.
///
/// Walks back at most 4 bytes looking for a lead byte; when the sequence the
/// lead announces is not yet complete, its bytes so far form the carry.
fn incomplete_tail_len(buf: &[u8]) -> usize {
    let last = match buf.last() {
        Some(&b) => b,
        None => return 0,
    };
    if last < 0x80 {
        return 0;
    }

    for back in 1..=buf.len().min(4) {
        let b = buf[buf.len() - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue; // continuation byte, keep walking
        }
        let need = match b {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            // Invalid lead; leave it for lossy conversion at finalisation
            _ => return 0,
        };
        return if back < need { back } else { 0 };
    }
    0
}

/// Turn the assembled bytes into a well-formed JSON document.
fn finalize_json(raw: Vec<u8>, tool_name: &str) -> String {
    let text = String::from_utf8_lossy(&raw);

    // Strip C0 controls (except whitespace) and replacement characters
    let cleaned: String = text
        .chars()
        .filter(|&c| {
            !(c < '\u{20}' && c != '\t' && c != '\n' && c != '\r') && c != '\u{FFFD}'
        })
        .collect();

    let mut candidate = cleaned.trim().to_string();
    if candidate.is_empty() {
        return empty_arguments(tool_name);
    }
    if !candidate.starts_with('{') {
        candidate.insert(0, '{');
    }
    if !candidate.ends_with('}') {
        candidate.push('}');
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&candidate) {
        return serde_json::to_string(&value).unwrap_or(candidate);
    }

    if let Some(repaired) = repair_json(&candidate) {
        return repaired;
    }

    tracing::warn!(
        tool_name = tool_name,
        "tool arguments unrecoverable, substituting empty arguments"
    );
    empty_arguments(tool_name)
}

/// Bounded JSON repair: drop a dangling trailing key, balance quotes, trim a
/// dangling comma, then balance braces and brackets by counting. Returns the
/// canonical serialisation when the repaired text parses.
fn repair_json(input: &str) -> Option<String> {
    let base = input.trim_end_matches('}').trim_end();
    let mut s = drop_trailing_key(base).unwrap_or_else(|| base.to_string());

    // Close an unterminated string
    if count_unescaped_quotes(&s) % 2 == 1 {
        s.push('"');
    }

    // A trailing comma never received its next member
    while s.ends_with(',') || s.ends_with(char::is_whitespace) {
        s.pop();
    }

    // Rebalance containers, outside of string context
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => stack.push(c),
            '}' if !in_string => {
                if stack.last() == Some(&'{') {
                    stack.pop();
                }
            }
            ']' if !in_string => {
                if stack.last() == Some(&'[') {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    while let Some(open) = stack.pop() {
        s.push(if open == '{' { '}' } else { ']' });
    }
    if !s.ends_with('}') {
        s.push('}');
    }

    let value: serde_json::Value = serde_json::from_str(&s).ok()?;
    serde_json::to_string(&value).ok()
}

/// Remove a trailing `"key":` (or `,"key":`) that never received a value
fn drop_trailing_key(input: &str) -> Option<String> {
    let trimmed = input.trim_end();
    let without_colon = trimmed.strip_suffix(':')?.trim_end();
    let key_end = without_colon.strip_suffix('"')?;

    // Scan back to the key's opening quote, honouring escapes
    let bytes = key_end.as_bytes();
    let mut i = bytes.len();
    while i > 0 {
        i -= 1;
        if bytes[i] == b'"' && (i == 0 || bytes[i - 1] != b'\\') {
            let mut head = key_end[..i].trim_end().to_string();
            if head.ends_with(',') {
                head.pop();
            }
            return Some(head);
        }
    }
    None
}

fn count_unescaped_quotes(s: &str) -> usize {
    let mut count = 0;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => count += 1,
            _ => {}
        }
    }
    count
}

/// Per-tool empty-arguments document used when repair fails.
///
/// Known string-keyed shapes get their required keys as empty strings;
/// everything else falls back to a bare object.
fn empty_arguments(tool_name: &str) -> String {
    let lower = tool_name.to_ascii_lowercase();
    if lower.contains("write") {
        r#"{"path":"","content":""}"#.to_string()
    } else if lower == "bash" || lower.contains("command") {
        r#"{"command":""}"#.to_string()
    } else {
        "{}".to_string()
    }
}
