//! Plain completion events
//!
//! The upstream occasionally answers in a legacy completion shape: either one
//! whole-shot `completion` event, or a run of `completion_chunk` events whose
//! last chunk carries a finish reason.

use serde::Deserialize;

/// Whole-shot completion event
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionEvent {
    /// Full completion text
    #[serde(default, alias = "content")]
    pub completion: String,
    /// Finish reason, when the upstream reports one
    #[serde(default, alias = "finishReason")]
    pub finish_reason: Option<String>,
}

/// Incremental completion chunk
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionChunkEvent {
    /// Text delta
    #[serde(default, alias = "completion", alias = "content")]
    pub delta: String,
    /// Present on the terminating chunk
    #[serde(default, alias = "finishReason")]
    pub finish_reason: Option<String>,
}
