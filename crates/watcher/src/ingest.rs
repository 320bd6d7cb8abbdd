// crates/watcher/src/ingest.rs
//! Rollout line ingestion: JSON lines in, typed events out.
//!
//! A transcript line is `{"timestamp": ..., "type": "response_item" |
//! "event_msg" | "session_meta", "payload": {...}}`. Payload shape determines
//! the extracted kind. Partial writes are expected at the tail of an actively
//! written file, so anything unparseable is skipped without noise.
//!
//! Extraction is a pure function; the ingestor wraps it with content-hash
//! de-duplication so replay overlap never produces a second `add`.

use std::path::Path;

use memchr::memmem;
use serde_json::Value;

use codex_view_core::event::{event_id, Event, EventKind};

use crate::cursor::PolledLine;

/// Bound on the dedupe set. On overflow the whole set is cleared — coarse,
/// but predictable, and replays after a clear still converge because the
/// store treats duplicate adds as no-ops.
const DEDUPE_CAPACITY: usize = 8192;

/// A tool invocation extracted for the approval tracker.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool: String,
    /// Raw JSON arguments string as written by the agent.
    pub arguments: String,
    pub ts: Option<String>,
}

/// A tool result extracted for the approval tracker.
#[derive(Debug, Clone)]
pub struct ToolOutputRecord {
    pub call_id: String,
    pub output: String,
    pub ts: Option<String>,
}

/// First-line session metadata.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub thread_id: Option<String>,
    pub cwd: Option<String>,
}

/// Everything one line yields before de-duplication.
#[derive(Debug, Default)]
pub struct ParsedLine {
    pub events: Vec<(EventKind, String)>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_outputs: Vec<ToolOutputRecord>,
    pub session_meta: Option<SessionMeta>,
    pub ts: Option<String>,
}

/// De-duplicated ingestion result for one line.
#[derive(Debug, Default)]
pub struct IngestedLine {
    pub events: Vec<Event>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub tool_outputs: Vec<ToolOutputRecord>,
    pub session_meta: Option<SessionMeta>,
}

/// Pre-compiled substring finders, so lines without interesting keys skip
/// JSON deserialization entirely.
struct LineFinders {
    response_item: memmem::Finder<'static>,
    event_msg: memmem::Finder<'static>,
    session_meta: memmem::Finder<'static>,
}

impl LineFinders {
    fn new() -> Self {
        Self {
            response_item: memmem::Finder::new(b"\"response_item\""),
            event_msg: memmem::Finder::new(b"\"event_msg\""),
            session_meta: memmem::Finder::new(b"\"session_meta\""),
        }
    }

    fn interesting(&self, line: &[u8]) -> bool {
        self.response_item.find(line).is_some()
            || self.event_msg.find(line).is_some()
            || self.session_meta.find(line).is_some()
    }
}

/// Bounded id set with full clear on overflow.
#[derive(Debug, Default)]
struct DedupeSet {
    set: std::collections::HashSet<String>,
}

impl DedupeSet {
    /// Returns true when the id was not seen before.
    fn admit(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.set.len() >= DEDUPE_CAPACITY {
            self.set.clear();
        }
        self.set.insert(id.to_string())
    }
}

/// Stateful line ingestor: parse, assign ids, de-duplicate.
pub struct RolloutLineIngestor {
    finders: LineFinders,
    dedupe: DedupeSet,
}

impl Default for RolloutLineIngestor {
    fn default() -> Self {
        Self::new()
    }
}

impl RolloutLineIngestor {
    pub fn new() -> Self {
        Self { finders: LineFinders::new(), dedupe: DedupeSet::default() }
    }

    /// Ingest one polled line from `file`.
    pub fn ingest(&mut self, file: &Path, thread_id: &str, polled: &PolledLine) -> IngestedLine {
        let parsed = match parse_rollout_line(&polled.text, &self.finders) {
            Some(parsed) => parsed,
            None => return IngestedLine::default(),
        };

        let mut out = IngestedLine {
            events: Vec::new(),
            tool_calls: parsed.tool_calls,
            tool_outputs: parsed.tool_outputs,
            session_meta: parsed.session_meta,
        };

        let file_str = file.to_string_lossy().to_string();
        for (kind, text) in parsed.events {
            let id = event_id(file, kind, parsed.ts.as_deref(), &text);
            if !self.dedupe.admit(&id) {
                continue;
            }
            out.events.push(Event {
                id,
                ts: parsed.ts.clone(),
                kind,
                text,
                thread_id: thread_id.to_string(),
                file: file_str.clone(),
                line: polled.line_number,
                replay: polled.replay,
            });
        }
        out
    }

    /// Shared dedupe admission for synthetic gate events.
    pub fn admit_gate(&mut self, id: &str) -> bool {
        self.dedupe.admit(id)
    }
}

fn parse_rollout_line(line: &str, finders: &LineFinders) -> Option<ParsedLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !finders.interesting(trimmed.as_bytes()) {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let record_type = value.get("type")?.as_str()?;
    let ts = value
        .get("timestamp")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let payload = value.get("payload")?;

    let mut parsed = ParsedLine { ts, ..ParsedLine::default() };
    match record_type {
        "session_meta" => parsed.session_meta = Some(parse_session_meta(payload)),
        "response_item" => parse_response_item(payload, &mut parsed),
        "event_msg" => parse_event_msg(payload, &mut parsed),
        _ => return None,
    }

    if parsed.events.is_empty() && parsed.session_meta.is_none() {
        return None;
    }
    Some(parsed)
}

fn parse_session_meta(payload: &Value) -> SessionMeta {
    SessionMeta {
        thread_id: payload
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_ascii_lowercase()),
        cwd: payload.get("cwd").and_then(|v| v.as_str()).map(str::to_string),
    }
}

fn parse_response_item(payload: &Value, parsed: &mut ParsedLine) {
    let Some(payload_type) = payload.get("type").and_then(|v| v.as_str()) else {
        return;
    };
    match payload_type {
        "message" => {
            let role = payload.get("role").and_then(|v| v.as_str());
            let kind = match role {
                Some("user") => EventKind::UserMessage,
                Some("assistant") => EventKind::AssistantMessage,
                _ => return,
            };
            let text = content_text(payload.get("content"));
            if !text.is_empty() {
                parsed.events.push((kind, text));
            }
        }
        "reasoning" => {
            let text = summary_text(payload.get("summary"));
            if !text.is_empty() {
                parsed.events.push((EventKind::ReasoningSummary, text));
            }
        }
        "function_call" => {
            let Some(call_id) = payload.get("call_id").and_then(|v| v.as_str()) else {
                return;
            };
            let tool = payload
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let arguments = match payload.get("arguments") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            parsed
                .events
                .push((EventKind::ToolCall, format!("{tool} {arguments}").trim().to_string()));
            parsed.tool_calls.push(ToolCallRecord {
                call_id: call_id.to_string(),
                tool,
                arguments,
                ts: parsed.ts.clone(),
            });
        }
        "function_call_output" => {
            let Some(call_id) = payload.get("call_id").and_then(|v| v.as_str()) else {
                return;
            };
            let output = match payload.get("output") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            parsed.events.push((EventKind::ToolOutput, output.clone()));
            parsed.tool_outputs.push(ToolOutputRecord {
                call_id: call_id.to_string(),
                output,
                ts: parsed.ts.clone(),
            });
        }
        _ => {}
    }
}

fn parse_event_msg(payload: &Value, parsed: &mut ParsedLine) {
    let Some(event_type) = payload.get("type").and_then(|v| v.as_str()) else {
        return;
    };
    let message = payload
        .get("message")
        .or_else(|| payload.get("text"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    match event_type {
        "user_message" if !message.is_empty() => {
            parsed.events.push((EventKind::UserMessage, message.to_string()));
        }
        "agent_message" if !message.is_empty() => {
            parsed.events.push((EventKind::AssistantMessage, message.to_string()));
        }
        "agent_reasoning" if !message.is_empty() => {
            parsed.events.push((EventKind::ReasoningSummary, message.to_string()));
        }
        _ => {}
    }
}

/// Join the text items of a message `content` array.
fn content_text(content: Option<&Value>) -> String {
    let Some(items) = content.and_then(|v| v.as_array()) else {
        return String::new();
    };
    let mut parts: Vec<&str> = Vec::new();
    for item in items {
        let item_type = item.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if matches!(item_type, "input_text" | "output_text" | "text") {
            if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    parts.push(text);
                }
            }
        }
    }
    parts.join("\n")
}

/// Join the `summary_text` items of a reasoning `summary` array.
fn summary_text(summary: Option<&Value>) -> String {
    let Some(items) = summary.and_then(|v| v.as_array()) else {
        return String::new();
    };
    let mut parts: Vec<&str> = Vec::new();
    for item in items {
        if let Some(text) = item.get("text").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                parts.push(text);
            }
        }
    }
    parts.join("\n")
}
