//! Secondary approval signal from the companion interactive-UI log.
//!
//! The agent's TUI writes explicit `waiting for tool gate` / `tool gate
//! released` lines. This tailer is fully independent of the transcript-based
//! tracker: it parses the log directly (after stripping terminal color
//! codes) and synthesizes the same class of gate events.
//!
//! On startup the tail of the log is scanned synthetically so a wait that
//! straddles the attach boundary is still reported — unless it is old enough
//! to be a leftover from a crashed prior run.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use codex_view_core::tail::tail_lines;
use codex_view_core::time::split_log_timestamp;

use crate::approval::{GateEvent, GateStatus};

/// A wait older than this at startup is treated as stale from a crashed
/// prior run and suppressed.
const STALE_WAIT_AGE: Duration = Duration::from_secs(90);
/// Mirror of the transcript tracker's base delay: a live wait is held back
/// before a UI event is synthesized, absorbing instantly-approved gates.
const WAIT_HOLDBACK: Duration = Duration::from_millis(1250);
/// How many log lines the startup synthetic scan examines.
const STARTUP_SCAN_LINES: usize = 200;
/// Bytes consumed per poll.
const MAX_READ_BYTES: u64 = 256 * 1024;

/// Recognized companion-log message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TuiMessage {
    ToolCall { tool: String, args: String },
    Waiting,
    Released,
}

/// Strip ANSI CSI/SGR escape sequences.
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        // ESC [ ... final-byte
        if chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        }
    }
    out
}

/// Parse one log line into `(timestamp, message)`.
///
/// Line shape: `<ISO8601 timestamp>  INFO <message>`, possibly wrapped in
/// color codes. Anything else returns `None`.
pub fn parse_tui_line(line: &str) -> Option<(DateTime<Utc>, TuiMessage)> {
    let clean = strip_ansi(line);
    let (ts, rest) = split_log_timestamp(&clean)?;
    let msg = rest.strip_prefix("INFO")?.trim();

    if msg == "waiting for tool gate" {
        return Some((ts, TuiMessage::Waiting));
    }
    if msg == "tool gate released" {
        return Some((ts, TuiMessage::Released));
    }
    if let Some(call) = msg.strip_prefix("ToolCall:") {
        let call = call.trim();
        let (tool, args) = match call.split_once(char::is_whitespace) {
            Some((tool, args)) => (tool.to_string(), args.trim().to_string()),
            None => (call.to_string(), String::new()),
        };
        if !tool.is_empty() {
            return Some((ts, TuiMessage::ToolCall { tool, args }));
        }
    }
    None
}

/// Synthetic call id for a UI-log wait, keyed by its timestamp so the
/// waiting/released pair shares one identity across polls.
fn wait_call_id(ts: DateTime<Utc>) -> String {
    format!("tui-{}", ts.timestamp_millis())
}

#[derive(Debug)]
struct WaitState {
    ts: DateTime<Utc>,
    ts_raw: String,
    observed_at: Instant,
    emitted: bool,
}

/// Tailer state machine over the companion UI log.
#[derive(Debug)]
pub struct TuiGateTailer {
    path: PathBuf,
    offset: u64,
    initialized: bool,
    last_tool_call: Option<(String, String)>,
    waiting: Option<WaitState>,
}

impl TuiGateTailer {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0, initialized: false, last_tool_call: None, waiting: None }
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.is_some()
    }

    /// One tick: consume appended log lines, then re-check the holdback.
    /// Called every loop tick even when the log has not grown.
    pub fn poll(&mut self, mono_now: Instant, wall_now: DateTime<Utc>) -> Vec<GateEvent> {
        let mut events = Vec::new();

        if !self.initialized {
            self.initialize(mono_now, wall_now);
        } else {
            for line in self.read_appended() {
                if let Some((ts, msg)) = parse_tui_line(&line) {
                    self.apply(ts, msg, mono_now, &mut events);
                }
            }
        }

        // Holdback: a wait is only surfaced once it has lasted long enough
        // to be a real human pause rather than an instant auto-approval.
        let mut due: Option<(String, String)> = None;
        if let Some(wait) = &mut self.waiting {
            if !wait.emitted {
                let mono_elapsed = mono_now.saturating_duration_since(wait.observed_at);
                let wall_elapsed = (wall_now - wait.ts).to_std().unwrap_or(Duration::ZERO);
                if mono_elapsed.max(wall_elapsed) >= WAIT_HOLDBACK {
                    wait.emitted = true;
                    due = Some((wait_call_id(wait.ts), wait.ts_raw.clone()));
                }
            }
        }
        if let Some((call_id, ts_raw)) = due {
            events.push(self.make_event(call_id, GateStatus::Waiting, ts_raw));
        }

        events
    }

    fn initialize(&mut self, mono_now: Instant, wall_now: DateTime<Utc>) {
        self.initialized = true;
        let len = match std::fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(_) => return,
        };
        self.offset = len;

        // Synthetic scan of the tail: rebuild the waiting/tool-call state
        // without emitting anything for already-resolved gates.
        let lines = tail_lines(&self.path, STARTUP_SCAN_LINES).unwrap_or_default();
        for line in lines {
            if let Some((ts, msg)) = parse_tui_line(&line) {
                match msg {
                    TuiMessage::ToolCall { tool, args } => {
                        self.last_tool_call = Some((tool, args));
                    }
                    TuiMessage::Waiting => {
                        self.waiting = Some(WaitState {
                            ts,
                            ts_raw: ts.to_rfc3339(),
                            observed_at: mono_now,
                            emitted: false,
                        });
                    }
                    TuiMessage::Released => {
                        self.waiting = None;
                    }
                }
            }
        }

        if let Some(wait) = &self.waiting {
            let age = (wall_now - wait.ts).to_std().unwrap_or(Duration::ZERO);
            if age > STALE_WAIT_AGE {
                debug!(
                    path = %self.path.display(),
                    age_secs = age.as_secs(),
                    "suppressing stale tool-gate wait from prior run"
                );
                self.waiting = None;
            }
        }
    }

    fn apply(
        &mut self,
        ts: DateTime<Utc>,
        msg: TuiMessage,
        mono_now: Instant,
        events: &mut Vec<GateEvent>,
    ) {
        match msg {
            TuiMessage::ToolCall { tool, args } => {
                trace!(tool = %tool, "tui tool call");
                self.last_tool_call = Some((tool, args));
            }
            TuiMessage::Waiting => {
                if self.waiting.is_none() {
                    self.waiting = Some(WaitState {
                        ts,
                        ts_raw: ts.to_rfc3339(),
                        observed_at: mono_now,
                        emitted: false,
                    });
                }
            }
            TuiMessage::Released => {
                if let Some(wait) = self.waiting.take() {
                    if wait.emitted {
                        events.push(self.make_event(
                            wait_call_id(wait.ts),
                            GateStatus::Released,
                            ts.to_rfc3339(),
                        ));
                    }
                }
            }
        }
    }

    fn make_event(&self, call_id: String, status: GateStatus, ts_raw: String) -> GateEvent {
        let tool = self
            .last_tool_call
            .as_ref()
            .map(|(tool, _)| tool.clone())
            .unwrap_or_else(|| "unknown".to_string());
        GateEvent {
            file: self.path.clone(),
            thread_id: String::new(),
            call_id,
            tool,
            status,
            ts: Some(ts_raw),
        }
    }

    fn read_appended(&mut self) -> Vec<String> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let len = match file.metadata() {
            Ok(m) => m.len(),
            Err(_) => return Vec::new(),
        };
        if len < self.offset {
            self.offset = 0;
        }
        if len == self.offset {
            return Vec::new();
        }
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }
        let to_read = (len - self.offset).min(MAX_READ_BYTES);
        let mut buf = vec![0u8; to_read as usize];
        if file.read_exact(&mut buf).is_err() {
            return Vec::new();
        }
        let consumed = match buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => return Vec::new(),
        };
        self.offset += consumed as u64;
        String::from_utf8_lossy(&buf[..consumed])
            .split('\n')
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}
