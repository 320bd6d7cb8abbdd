// crates/watcher/src/approval.rs
//! Approval-gate detection from paired tool-call / tool-output records.
//!
//! A tool call that requires escalated permissions blocks the agent's
//! terminal until a human approves it. Nothing in the transcript says
//! "blocked" explicitly, so this tracker infers it from timing: a pending
//! escalated call with no output after its delay is reported as waiting.
//!
//! The delay is runtime-aware. Commands whose typical execution time is
//! known (learned from previous auto-approved runs) get a longer grace
//! period, so a merely-slow command is not misreported as blocked.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use codex_view_core::time::parse_event_timestamp;

use crate::ingest::{ToolCallRecord, ToolOutputRecord};

/// Minimum wait before the first "waiting" signal for an unknown command.
pub const BASE_WAIT_DELAY: Duration = Duration::from_millis(1250);
/// Slack added on top of a learned runtime.
const RUNTIME_CUSHION: Duration = Duration::from_millis(900);
/// Smoothing factor: a new sample carries 35% of the weight.
const EMA_ALPHA: f64 = 0.35;
/// Wall times above this are treated as outliers and not learned.
const MAX_LEARNED_SECS: f64 = 600.0;

/// Hash key for one (tool, command) pair.
pub fn cmd_key(tool: &str, command: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    tool.hash(&mut hasher);
    command.hash(&mut hasher);
    hasher.finish()
}

/// Exponential moving average of command wall times, process-lifetime state.
/// Grows only with distinct (tool, command) pairs; no eviction.
#[derive(Debug, Default)]
pub struct RuntimeEma {
    averages: HashMap<u64, f64>,
}

impl RuntimeEma {
    pub fn observe(&mut self, key: u64, secs: f64) {
        let entry = self.averages.entry(key).or_insert(secs);
        *entry = *entry * (1.0 - EMA_ALPHA) + secs * EMA_ALPHA;
    }

    pub fn expected(&self, key: u64) -> Option<Duration> {
        self.averages.get(&key).map(|&s| Duration::from_secs_f64(s))
    }

    pub fn len(&self) -> usize {
        self.averages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.averages.is_empty()
    }
}

/// Whether parsed tool arguments ask for escalated permissions.
pub fn requires_escalation(arguments: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(arguments) else {
        return false;
    };
    if value
        .get("with_escalated_permissions")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return true;
    }
    value
        .get("sandbox_permissions")
        .and_then(|v| v.as_str())
        .map(|s| s == "require_escalated")
        .unwrap_or(false)
}

/// Extract the command string from tool arguments (array or string form).
pub fn command_from_arguments(arguments: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(arguments) else {
        return String::new();
    };
    match value.get("command") {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// How a tool output resolved its call.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputVerdict {
    Rejected,
    Aborted,
    Released,
    Executed { exit_code: Option<i64>, wall_time: Option<f64> },
}

/// Classify a tool output. Structured metadata wins; otherwise the leading
/// text decides. Pure function.
pub fn classify_output(output: &str) -> OutputVerdict {
    let mut text = output.trim();
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if let Some(meta) = value.get("metadata") {
            return OutputVerdict::Executed {
                exit_code: meta.get("exit_code").and_then(|v| v.as_i64()),
                wall_time: meta.get("duration_seconds").and_then(|v| v.as_f64()),
            };
        }
        if let Some(inner) = value.get("output").and_then(|v| v.as_str()) {
            return classify_output(inner);
        }
        text = "";
    }

    let lowered = text.to_ascii_lowercase();
    let first_line = lowered.lines().next().unwrap_or("");
    if first_line.starts_with("rejected")
        || first_line.starts_with("approval denied")
        || first_line.starts_with("user declined")
    {
        OutputVerdict::Rejected
    } else if first_line.starts_with("aborted") || first_line.starts_with("interrupted") {
        OutputVerdict::Aborted
    } else if first_line.starts_with("released") {
        OutputVerdict::Released
    } else {
        OutputVerdict::Executed { exit_code: None, wall_time: None }
    }
}

/// Gate transition phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStatus {
    Waiting,
    Released,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Released => "released",
        }
    }
}

/// A synthetic gate status transition to be emitted as a `tool_gate` event.
#[derive(Debug, Clone)]
pub struct GateEvent {
    pub file: PathBuf,
    pub thread_id: String,
    pub call_id: String,
    pub tool: String,
    pub status: GateStatus,
    pub ts: Option<String>,
}

/// One outstanding escalated call.
#[derive(Debug)]
struct PendingApproval {
    file: PathBuf,
    thread_id: String,
    tool: String,
    ts: Option<DateTime<Utc>>,
    ts_raw: Option<String>,
    seen_at: Instant,
    wait_emitted: bool,
    cmd_key: u64,
    delay: Duration,
}

/// The transcript-driven approval state machine.
#[derive(Debug, Default)]
pub struct ApprovalGateTracker {
    pending: HashMap<String, PendingApproval>,
    ema: RuntimeEma,
}

impl ApprovalGateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Feed a tool call. Non-escalated calls are ignored.
    pub fn on_tool_call(
        &mut self,
        file: &Path,
        thread_id: &str,
        record: &ToolCallRecord,
        mono_now: Instant,
    ) {
        if !requires_escalation(&record.arguments) {
            return;
        }
        let command = command_from_arguments(&record.arguments);
        let key = cmd_key(&record.tool, &command);
        let delay = match self.ema.expected(key) {
            Some(expected) => BASE_WAIT_DELAY.max(expected + RUNTIME_CUSHION),
            None => BASE_WAIT_DELAY,
        };
        debug!(
            call_id = %record.call_id,
            tool = %record.tool,
            delay_ms = delay.as_millis() as u64,
            "tracking escalated tool call"
        );
        // Call ids are unique per session; a duplicate id supersedes.
        self.pending.insert(
            record.call_id.clone(),
            PendingApproval {
                file: file.to_path_buf(),
                thread_id: thread_id.to_string(),
                tool: record.tool.clone(),
                ts: record.ts.as_deref().and_then(parse_event_timestamp),
                ts_raw: record.ts.clone(),
                seen_at: mono_now,
                wait_emitted: false,
                cmd_key: key,
                delay,
            },
        );
    }

    /// Feed a tool output. Resolves the matching pending call, learns the
    /// runtime, and yields a released event when a waiting signal had already
    /// been emitted for this call.
    pub fn on_tool_output(&mut self, record: &ToolOutputRecord) -> Option<GateEvent> {
        let pending = self.pending.remove(&record.call_id)?;
        let verdict = classify_output(&record.output);
        if let OutputVerdict::Executed { wall_time: Some(secs), .. } = verdict {
            if secs <= MAX_LEARNED_SECS {
                self.ema.observe(pending.cmd_key, secs);
            }
        }
        if pending.wait_emitted {
            return Some(GateEvent {
                file: pending.file,
                thread_id: pending.thread_id,
                call_id: record.call_id.clone(),
                tool: pending.tool,
                status: GateStatus::Released,
                ts: record.ts.clone(),
            });
        }
        None
    }

    /// Timing pass, called every loop tick independent of new lines.
    ///
    /// Elapsed time is the larger of monotonic-since-observation and
    /// wall-clock-since-event-timestamp, so an approval already stale when a
    /// restarted watcher first sees it is reported immediately.
    pub fn poll(&mut self, mono_now: Instant, wall_now: DateTime<Utc>) -> Vec<GateEvent> {
        let mut events = Vec::new();
        for (call_id, pending) in self.pending.iter_mut() {
            if pending.wait_emitted {
                continue;
            }
            let mono_elapsed = mono_now.saturating_duration_since(pending.seen_at);
            let wall_elapsed = pending
                .ts
                .and_then(|ts| (wall_now - ts).to_std().ok())
                .unwrap_or(Duration::ZERO);
            if mono_elapsed.max(wall_elapsed) >= pending.delay {
                pending.wait_emitted = true;
                events.push(GateEvent {
                    file: pending.file.clone(),
                    thread_id: pending.thread_id.clone(),
                    call_id: call_id.clone(),
                    tool: pending.tool.clone(),
                    status: GateStatus::Waiting,
                    ts: pending.ts_raw.clone(),
                });
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ESCALATED: &str = r#"{"command":["rm","-rf","build"],"with_escalated_permissions":true}"#;

    fn call(call_id: &str, arguments: &str) -> ToolCallRecord {
        ToolCallRecord {
            call_id: call_id.to_string(),
            tool: "shell".into(),
            arguments: arguments.to_string(),
            ts: None,
        }
    }

    fn output(call_id: &str, output: &str) -> ToolOutputRecord {
        ToolOutputRecord { call_id: call_id.to_string(), output: output.to_string(), ts: None }
    }

    fn executed(secs: f64) -> String {
        format!(r#"{{"output":"ok","metadata":{{"exit_code":0,"duration_seconds":{secs}}}}}"#)
    }

    #[test]
    fn escalation_detection() {
        assert!(requires_escalation(ESCALATED));
        assert!(requires_escalation(r#"{"sandbox_permissions":"require_escalated"}"#));
        assert!(!requires_escalation(r#"{"command":["ls"]}"#));
        assert!(!requires_escalation("not json"));
    }

    #[test]
    fn command_extraction_handles_both_shapes() {
        assert_eq!(command_from_arguments(ESCALATED), "rm -rf build");
        assert_eq!(command_from_arguments(r#"{"command":"make all"}"#), "make all");
        assert_eq!(command_from_arguments(r#"{}"#), "");
    }

    #[test]
    fn classify_structured_and_text_outputs() {
        assert_eq!(
            classify_output(&executed(2.5)),
            OutputVerdict::Executed { exit_code: Some(0), wall_time: Some(2.5) }
        );
        assert_eq!(classify_output("rejected by user"), OutputVerdict::Rejected);
        assert_eq!(classify_output("Aborted: interrupt"), OutputVerdict::Aborted);
        assert_eq!(classify_output("released"), OutputVerdict::Released);
        assert_eq!(
            classify_output("plain command output"),
            OutputVerdict::Executed { exit_code: None, wall_time: None }
        );
        // Nested text verdict inside a JSON wrapper.
        assert_eq!(
            classify_output(r#"{"output":"rejected by the operator"}"#),
            OutputVerdict::Rejected
        );
    }

    #[test]
    fn unknown_command_waits_exactly_once_after_base_delay() {
        let mut tracker = ApprovalGateTracker::new();
        let t0 = Instant::now();
        let wall = Utc::now();
        tracker.on_tool_call(Path::new("/s/r.jsonl"), "t1", &call("c1", ESCALATED), t0);

        assert!(tracker.poll(t0 + Duration::from_millis(1000), wall).is_empty());
        let events = tracker.poll(t0 + Duration::from_millis(1300), wall);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, GateStatus::Waiting);
        assert_eq!(events[0].call_id, "c1");
        // Already emitted: polling again stays quiet.
        assert!(tracker.poll(t0 + Duration::from_secs(60), wall).is_empty());
    }

    #[test]
    fn learned_runtime_suppresses_false_wait() {
        let mut tracker = ApprovalGateTracker::new();
        let t0 = Instant::now();
        let wall = Utc::now();

        // First run: auto-approved, finished in 3.0s.
        tracker.on_tool_call(Path::new("/s/r.jsonl"), "t1", &call("c1", ESCALATED), t0);
        assert!(tracker.on_tool_output(&output("c1", &executed(3.0))).is_none());

        // Second identical command, observed 2.3s after its call: inside
        // runtime + cushion, so no waiting signal.
        let t1 = t0 + Duration::from_secs(10);
        tracker.on_tool_call(Path::new("/s/r.jsonl"), "t1", &call("c2", ESCALATED), t1);
        assert!(tracker
            .poll(t1 + Duration::from_millis(2300), wall)
            .is_empty());

        // But past the learned delay it still fires.
        let events = tracker.poll(t1 + Duration::from_millis(4000), wall);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn resolved_after_wait_yields_released() {
        let mut tracker = ApprovalGateTracker::new();
        let t0 = Instant::now();
        let wall = Utc::now();
        tracker.on_tool_call(Path::new("/s/r.jsonl"), "t1", &call("c1", ESCALATED), t0);
        assert_eq!(tracker.poll(t0 + Duration::from_secs(5), wall).len(), 1);

        let released = tracker.on_tool_output(&output("c1", &executed(5.0))).unwrap();
        assert_eq!(released.status, GateStatus::Released);
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn resolved_before_wait_stays_silent() {
        let mut tracker = ApprovalGateTracker::new();
        let t0 = Instant::now();
        tracker.on_tool_call(Path::new("/s/r.jsonl"), "t1", &call("c1", ESCALATED), t0);
        assert!(tracker.on_tool_output(&output("c1", "rejected by user")).is_none());
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn stale_pre_restart_approval_fires_immediately() {
        let mut tracker = ApprovalGateTracker::new();
        let t0 = Instant::now();
        let wall = Utc::now();
        let old_ts = (wall - chrono::Duration::seconds(30)).to_rfc3339();
        let record = ToolCallRecord {
            call_id: "c1".into(),
            tool: "shell".into(),
            arguments: ESCALATED.into(),
            ts: Some(old_ts),
        };
        tracker.on_tool_call(Path::new("/s/r.jsonl"), "t1", &record, t0);

        // Monotonic elapsed is ~zero, but the event timestamp is 30s old.
        let events = tracker.poll(t0, wall);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, GateStatus::Waiting);
    }

    #[test]
    fn overlong_runtimes_are_not_learned() {
        let mut tracker = ApprovalGateTracker::new();
        let t0 = Instant::now();
        tracker.on_tool_call(Path::new("/s/r.jsonl"), "t1", &call("c1", ESCALATED), t0);
        tracker.on_tool_output(&output("c1", &executed(3600.0)));
        assert!(tracker.ema.is_empty());
    }

    #[test]
    fn ema_smoothing_weights_new_samples() {
        let mut ema = RuntimeEma::default();
        let key = cmd_key("shell", "make");
        ema.observe(key, 10.0);
        assert_eq!(ema.expected(key).unwrap(), Duration::from_secs_f64(10.0));
        ema.observe(key, 0.0);
        // 10 * 0.65 + 0 * 0.35 = 6.5
        assert_eq!(ema.expected(key).unwrap(), Duration::from_secs_f64(6.5));
    }

    #[test]
    fn non_escalated_calls_are_ignored() {
        let mut tracker = ApprovalGateTracker::new();
        let t0 = Instant::now();
        tracker.on_tool_call(
            Path::new("/s/r.jsonl"),
            "t1",
            &call("c1", r#"{"command":["ls"]}"#),
            t0,
        );
        assert_eq!(tracker.pending_count(), 0);
    }
}
