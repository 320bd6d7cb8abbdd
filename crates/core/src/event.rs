// crates/core/src/event.rs
//! Event model and the ingest-message wire format.
//!
//! Every event carries a content-hash id derived from
//! `(file, kind, timestamp, text)`. The id is the de-duplication key: replay
//! of a transcript produces byte-identical ids, so an at-least-once reader
//! stays idempotent at the store boundary.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Number of hex characters kept from the SHA-1 digest.
const EVENT_ID_LEN: usize = 16;

/// Semantic kind of an extracted transcript event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserMessage,
    AssistantMessage,
    ReasoningSummary,
    ToolCall,
    ToolOutput,
    ToolGate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AssistantMessage => "assistant_message",
            Self::ReasoningSummary => "reasoning_summary",
            Self::ToolCall => "tool_call",
            Self::ToolOutput => "tool_output",
            Self::ToolGate => "tool_gate",
        }
    }
}

/// One semantically meaningful event extracted from a transcript line.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    /// Raw timestamp string from the transcript line, when present.
    pub ts: Option<String>,
    pub kind: EventKind,
    pub text: String,
    pub thread_id: String,
    pub file: String,
    pub line: u64,
    pub replay: bool,
}

/// Stable content-hash id for an event.
pub fn event_id(file: &Path, kind: EventKind, ts: Option<&str>, text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(file.to_string_lossy().as_bytes());
    hasher.update(b":");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(ts.unwrap_or("").as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..EVENT_ID_LEN].to_string()
}

/// Stable id for a synthetic approval-gate status event.
///
/// Keyed by `(file, "tool_gate", "approval", call_id, phase)` so replays of
/// the same gate transition never duplicate a status event.
pub fn gate_event_id(file: &Path, call_id: &str, phase: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(file.to_string_lossy().as_bytes());
    hasher.update(b":tool_gate:approval:");
    hasher.update(call_id.as_bytes());
    hasher.update(b":");
    hasher.update(phase.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..EVENT_ID_LEN].to_string()
}

/// Write operation against the external event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestOp {
    /// Insert; a no-op if the id already exists.
    Add,
    /// Patch an existing id; ignored by the store if no prior add exists.
    Update,
}

/// The sole write interface to the external event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestMessage {
    pub op: IngestOp,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<EventKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zh: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translate_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub replay: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_tool: Option<String>,
}

impl IngestMessage {
    /// `add` message for a freshly extracted event.
    pub fn add(event: &Event) -> Self {
        Self {
            op: IngestOp::Add,
            id: event.id.clone(),
            ts: event.ts.clone(),
            kind: Some(event.kind),
            text: Some(event.text.clone()),
            zh: None,
            translate_error: None,
            thread_id: Some(event.thread_id.clone()),
            file: Some(event.file.clone()),
            line: Some(event.line),
            replay: event.replay,
            gate_status: None,
            gate_call_id: None,
            gate_tool: None,
        }
    }

    /// `update` message carrying a translation result (or failure) for a
    /// previously added id. The original text is never resent: the store
    /// keeps what it has.
    pub fn translation(id: &str, zh: Option<String>, error: Option<String>) -> Self {
        Self {
            op: IngestOp::Update,
            id: id.to_string(),
            ts: None,
            kind: None,
            text: None,
            zh,
            translate_error: error,
            thread_id: None,
            file: None,
            line: None,
            replay: false,
            gate_status: None,
            gate_call_id: None,
            gate_tool: None,
        }
    }
}

/// Consumer boundary for ingest messages.
///
/// The store behind this trait is an external collaborator; the watcher only
/// ever calls `emit`. Implementations must be cheap and non-blocking — slow
/// consumers buffer internally.
pub trait EventSink: Send + Sync {
    fn emit(&self, msg: IngestMessage);
}
