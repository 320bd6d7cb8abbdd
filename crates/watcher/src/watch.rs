// crates/watcher/src/watch.rs
//! The rollout watcher: owns scanning, follow planning, cursors, ingestion,
//! gate tracking, and the translation hand-off.
//!
//! One cooperative poll loop drives everything. Blocking work (process
//! scans, directory scans, cursor reads) runs under `spawn_blocking`; the
//! loop never blocks on network I/O. The only state shared with other tasks
//! is the runtime follow configuration behind one mutex plus a status
//! snapshot the loop republishes each tick.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use codex_view_core::event::{gate_event_id, Event, EventKind, EventSink, IngestMessage};
use codex_view_core::paths::{scan_recent, RolloutFile};
use codex_view_translate::pump::{DoneCallback, PumpStats, TranslationPump};
use codex_view_translate::translator::Translator;

use crate::approval::{ApprovalGateTracker, GateEvent};
use crate::cursor::{FileCursor, PolledLine};
use crate::ingest::RolloutLineIngestor;
use crate::picker::{pick_auto, resolve_pin, FollowMode, FollowPick, PickerConfig, SelectionMode};
use crate::scanner::{scan_processes, ProcessScanOutcome};
use crate::targets::{build_plan, FollowExcludes, FollowSyncPlan};
use crate::tui_gate::TuiGateTailer;

/// Static watcher configuration. Everything the control surface can change
/// at runtime lives in [`FollowControl`] instead.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub sessions_root: PathBuf,
    /// Process-name pattern for the scanner (full match).
    pub process_pattern: String,
    pub process_follow: bool,
    /// Stay idle instead of falling back to directory scans while no
    /// matching process is detected.
    pub only_follow_when_detected: bool,
    pub max_sessions: usize,
    pub replay_last_lines: usize,
    pub poll_interval: Duration,
    pub file_scan_interval: Duration,
    /// Companion interactive-UI log to tail for the secondary gate signal.
    pub tui_log: Option<PathBuf>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            sessions_root: codex_view_core::paths::default_sessions_root()
                .unwrap_or_else(|| PathBuf::from(".codex/sessions")),
            process_pattern: "codex".to_string(),
            process_follow: true,
            only_follow_when_detected: false,
            max_sessions: 3,
            replay_last_lines: 0,
            poll_interval: Duration::from_millis(500),
            file_scan_interval: Duration::from_secs(2),
            tui_log: None,
        }
    }
}

/// Whether extracted content is translated automatically or only on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslateMode {
    Auto,
    Manual,
}

/// Runtime follow configuration: the single piece of state written by
/// external control calls and read by the poll loop.
#[derive(Debug, Clone)]
struct FollowControl {
    selection: SelectionMode,
    pinned_thread: Option<String>,
    pinned_file: Option<PathBuf>,
    excludes: FollowExcludes,
    max_sessions: usize,
    replay_last_lines: usize,
    poll_interval: Duration,
    file_scan_interval: Duration,
    translate_mode: TranslateMode,
    /// Forces target re-application on the next tick even when the computed
    /// list is unchanged.
    dirty: bool,
}

/// Structured status snapshot, republished every tick.
#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub follow_mode: &'static str,
    pub selection: SelectionMode,
    pub picked_file: Option<String>,
    pub thread_id: Option<String>,
    pub process_detected: bool,
    pub process_pids: Vec<u32>,
    pub active_files: Vec<String>,
    pub pending_approvals: usize,
    pub tui_gate_waiting: bool,
    pub translate_mode: TranslateMode,
    pub session_cwd: Option<String>,
    pub last_error: Option<String>,
    pub pump: PumpStats,
}

impl Default for WatcherStatus {
    fn default() -> Self {
        Self {
            follow_mode: FollowMode::Idle.as_str(),
            selection: SelectionMode::Auto,
            picked_file: None,
            thread_id: None,
            process_detected: false,
            process_pids: Vec::new(),
            active_files: Vec::new(),
            pending_approvals: 0,
            tui_gate_waiting: false,
            translate_mode: TranslateMode::Auto,
            session_cwd: None,
            last_error: None,
            pump: PumpStats::default(),
        }
    }
}

/// State owned exclusively by the poll loop. Never shared; moved in and out
/// of `spawn_blocking` closures wholesale.
struct LoopState {
    cursors: HashMap<PathBuf, FileCursor>,
    ingestor: RolloutLineIngestor,
    approval: ApprovalGateTracker,
    tui: Option<TuiGateTailer>,
    last_plan_paths: Vec<PathBuf>,
    follow_mode: FollowMode,
    picked: Option<PathBuf>,
    primary_thread: Option<String>,
    process_detected: bool,
    process_pids: Vec<u32>,
    session_cwd: Option<String>,
    last_error: Option<String>,
}

impl LoopState {
    fn new(tui_log: Option<PathBuf>) -> Self {
        Self {
            cursors: HashMap::new(),
            ingestor: RolloutLineIngestor::new(),
            approval: ApprovalGateTracker::new(),
            tui: tui_log.map(TuiGateTailer::new),
            last_plan_paths: Vec::new(),
            follow_mode: FollowMode::Idle,
            picked: None,
            primary_thread: None,
            process_detected: false,
            process_pids: Vec::new(),
            session_cwd: None,
            last_error: None,
        }
    }
}

/// Done-callback that forwards translation outcomes to the event store as
/// `update` messages.
pub fn translation_done_callback(sink: Arc<dyn EventSink>) -> DoneCallback {
    Arc::new(move |outcome| {
        sink.emit(IngestMessage::translation(
            &outcome.id,
            outcome.text.clone(),
            outcome.error.clone(),
        ));
    })
}

/// The orchestrator.
pub struct RolloutWatcher {
    config: WatcherConfig,
    control: Mutex<FollowControl>,
    status: Mutex<WatcherStatus>,
    sink: Arc<dyn EventSink>,
    pump: Arc<TranslationPump>,
}

impl RolloutWatcher {
    pub fn new(
        config: WatcherConfig,
        sink: Arc<dyn EventSink>,
        pump: Arc<TranslationPump>,
    ) -> Arc<Self> {
        let control = FollowControl {
            selection: SelectionMode::Auto,
            pinned_thread: None,
            pinned_file: None,
            excludes: FollowExcludes::default(),
            max_sessions: config.max_sessions,
            replay_last_lines: config.replay_last_lines,
            poll_interval: config.poll_interval,
            file_scan_interval: config.file_scan_interval,
            translate_mode: TranslateMode::Auto,
            dirty: true,
        };
        Arc::new(Self {
            config,
            control: Mutex::new(control),
            status: Mutex::new(WatcherStatus::default()),
            sink,
            pump,
        })
    }

    fn control(&self) -> MutexGuard<'_, FollowControl> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Runtime control surface
    // =========================================================================

    /// Change the selection mode and pin target.
    pub fn set_follow(
        &self,
        selection: SelectionMode,
        thread_id: Option<String>,
        file: Option<PathBuf>,
    ) {
        let mut ctl = self.control();
        ctl.selection = selection;
        ctl.pinned_thread = thread_id;
        ctl.pinned_file = file;
        ctl.dirty = true;
    }

    /// Replace the exclusion sets.
    pub fn set_follow_excludes(&self, thread_ids: Vec<String>, files: Vec<PathBuf>) {
        let mut ctl = self.control();
        ctl.excludes = FollowExcludes {
            thread_ids: thread_ids.into_iter().collect(),
            files: files.into_iter().collect(),
        };
        ctl.dirty = true;
    }

    /// Swap the translation backend; safe between calls.
    pub fn set_translator(&self, translator: Option<Arc<dyn Translator>>) {
        self.pump.set_translator(translator);
    }

    pub fn set_translate_mode(&self, mode: TranslateMode) {
        self.control().translate_mode = mode;
    }

    pub fn set_watch_max_sessions(&self, n: usize) {
        let mut ctl = self.control();
        ctl.max_sessions = n.max(1);
        ctl.dirty = true;
    }

    pub fn set_replay_last_lines(&self, n: usize) {
        self.control().replay_last_lines = n;
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.control().poll_interval = interval.max(Duration::from_millis(10));
    }

    pub fn set_file_scan_interval(&self, interval: Duration) {
        self.control().file_scan_interval = interval.max(Duration::from_millis(10));
    }

    /// Force a (re)translation of one id, bypassing the seen-set. Returns
    /// whether the job was queued (or coalesced onto an in-flight one).
    pub fn retranslate(
        &self,
        id: &str,
        text: &str,
        thread_key: &str,
        fallback: Option<String>,
    ) -> bool {
        self.pump.enqueue(id, text, thread_key, false, true, fallback)
    }

    /// Current status snapshot.
    pub fn status(&self) -> WatcherStatus {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    // =========================================================================
    // Poll loop
    // =========================================================================

    /// Run until cancelled. Single consumer of all loop-owned state.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            root = %self.config.sessions_root.display(),
            pattern = %self.config.process_pattern,
            "rollout watcher started"
        );
        let mut state = LoopState::new(self.config.tui_log.clone());
        let mut last_scan: Option<Instant> = None;

        loop {
            let (poll_interval, scan_interval, dirty) = {
                let ctl = self.control();
                (ctl.poll_interval, ctl.file_scan_interval, ctl.dirty)
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }

            let scan_due = dirty || last_scan.map_or(true, |t| t.elapsed() >= scan_interval);
            if scan_due {
                last_scan = Some(Instant::now());
                self.retarget(&mut state).await;
            }

            self.poll_cursors(&mut state).await;
            self.poll_gates(&mut state);
            self.publish_status(&state);
        }
        info!("rollout watcher stopped");
    }

    /// Recompute the follow pick and plan; apply cursor transitions only
    /// when the target list changed or a resync was forced.
    async fn retarget(&self, state: &mut LoopState) {
        let (snapshot, forced) = {
            let mut ctl = self.control();
            let forced = ctl.dirty;
            ctl.dirty = false;
            (ctl.clone(), forced)
        };
        let config = self.config.clone();

        let computed = tokio::task::spawn_blocking(move || {
            compute_pick(&config, &snapshot)
        })
        .await;

        let (pick, backfill, selection, excludes, max_sessions) = match computed {
            Ok(v) => v,
            Err(join_err) => {
                error!(error = %join_err, "follow scan task panicked");
                state.last_error = Some(join_err.to_string());
                return;
            }
        };

        state.follow_mode = pick.mode;
        state.picked = pick.picked.as_ref().map(|f| f.path.clone());
        state.primary_thread = pick.thread_id.clone();
        state.process_detected = pick.process_detected;
        state.process_pids = pick.process_pids.clone();

        let plan = build_plan(&pick, selection, &excludes, max_sessions, &backfill);
        let paths = plan.target_paths();
        if paths != state.last_plan_paths || forced {
            apply_targets(state, &plan);
            state.last_plan_paths = paths;
        }
    }

    /// Read all active cursors under `spawn_blocking`, then ingest on the
    /// loop task.
    async fn poll_cursors(&self, state: &mut LoopState) {
        if state.cursors.is_empty() {
            return;
        }
        let replay_last = self.control().replay_last_lines;

        let mut cursors = std::mem::take(&mut state.cursors);
        let read = tokio::task::spawn_blocking(move || {
            let mut polled: Vec<(PathBuf, String, Vec<PolledLine>)> = Vec::new();
            let mut last_error = None;
            for cursor in cursors.values_mut().filter(|c| c.active) {
                match cursor.poll(replay_last) {
                    Ok(lines) if !lines.is_empty() => {
                        polled.push((cursor.path.clone(), cursor.thread_id.clone(), lines));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        // Transient by policy: the file may reappear, the
                        // loop continues next tick.
                        last_error = Some(err.to_string());
                    }
                }
            }
            (cursors, polled, last_error)
        })
        .await;

        match read {
            Ok((cursors, polled, last_error)) => {
                state.cursors = cursors;
                if let Some(err) = last_error {
                    warn!(error = %err, "cursor poll failed");
                    state.last_error = Some(err);
                }
                let translate_auto = self.control().translate_mode == TranslateMode::Auto;
                for (path, thread_id, lines) in polled {
                    self.ingest_lines(state, &path, &thread_id, lines, translate_auto);
                }
            }
            Err(join_err) => {
                error!(error = %join_err, "cursor poll task panicked");
                state.last_error = Some(join_err.to_string());
            }
        }
    }

    fn ingest_lines(
        &self,
        state: &mut LoopState,
        path: &Path,
        thread_id: &str,
        lines: Vec<PolledLine>,
        translate_auto: bool,
    ) {
        let mono_now = Instant::now();
        for line in lines {
            let out = state.ingestor.ingest(path, thread_id, &line);

            if let Some(meta) = out.session_meta {
                if meta.cwd.is_some() {
                    state.session_cwd = meta.cwd;
                }
            }
            for call in &out.tool_calls {
                state.approval.on_tool_call(path, thread_id, call, mono_now);
            }
            for event in &out.events {
                self.sink.emit(IngestMessage::add(event));
                if translate_auto
                    && matches!(
                        event.kind,
                        EventKind::AssistantMessage | EventKind::ReasoningSummary
                    )
                {
                    // Replayed history is batchable backlog; live events get
                    // the low-latency queue.
                    self.pump.enqueue(
                        &event.id,
                        &event.text,
                        &event.thread_id,
                        event.replay,
                        false,
                        None,
                    );
                }
            }
            for output in &out.tool_outputs {
                if let Some(gate) = state.approval.on_tool_output(output) {
                    self.emit_gate(state, gate);
                }
            }
        }
    }

    fn poll_gates(&self, state: &mut LoopState) {
        let mono_now = Instant::now();
        let wall_now = Utc::now();

        let due = state.approval.poll(mono_now, wall_now);
        for gate in due {
            self.emit_gate(state, gate);
        }

        let tui_due = state
            .tui
            .as_mut()
            .map(|tui| tui.poll(mono_now, wall_now))
            .unwrap_or_default();
        for gate in tui_due {
            self.emit_gate(state, gate);
        }
    }

    /// Emit a synthetic `tool_gate` event through the shared dedupe cache.
    fn emit_gate(&self, state: &mut LoopState, gate: GateEvent) {
        let id = gate_event_id(&gate.file, &gate.call_id, gate.status.as_str());
        if !state.ingestor.admit_gate(&id) {
            return;
        }
        // The UI-log tailer has no thread context of its own; attribute its
        // gates to the primary followed thread.
        let thread_id = if gate.thread_id.is_empty() {
            state.primary_thread.clone().unwrap_or_default()
        } else {
            gate.thread_id.clone()
        };
        let event = Event {
            id,
            ts: gate.ts.clone().or_else(|| Some(Utc::now().to_rfc3339())),
            kind: EventKind::ToolGate,
            text: format!("{} approval {}", gate.tool, gate.status.as_str()),
            thread_id,
            file: gate.file.to_string_lossy().to_string(),
            line: 0,
            replay: false,
        };
        debug!(call_id = %gate.call_id, status = gate.status.as_str(), "tool gate");
        let mut msg = IngestMessage::add(&event);
        msg.gate_status = Some(gate.status.as_str().to_string());
        msg.gate_call_id = Some(gate.call_id);
        msg.gate_tool = Some(gate.tool);
        self.sink.emit(msg);
    }

    fn publish_status(&self, state: &LoopState) {
        let (selection, translate_mode) = {
            let ctl = self.control();
            (ctl.selection, ctl.translate_mode)
        };
        let status = WatcherStatus {
            follow_mode: state.follow_mode.as_str(),
            selection,
            picked_file: state.picked.as_ref().map(|p| p.to_string_lossy().to_string()),
            thread_id: state.primary_thread.clone(),
            process_detected: state.process_detected,
            process_pids: state.process_pids.clone(),
            active_files: state
                .cursors
                .values()
                .filter(|c| c.active)
                .map(|c| c.path.to_string_lossy().to_string())
                .collect(),
            pending_approvals: state.approval.pending_count(),
            tui_gate_waiting: state.tui.as_ref().map(|t| t.is_waiting()).unwrap_or(false),
            translate_mode,
            session_cwd: state.session_cwd.clone(),
            last_error: state.last_error.clone(),
            pump: self.pump.stats(),
        };
        *self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }
}

type ComputedPick = (FollowPick, Vec<RolloutFile>, SelectionMode, FollowExcludes, usize);

/// One blocking scan pass: process discovery plus directory scans, resolved
/// into a pick and the backfill candidate list.
fn compute_pick(config: &WatcherConfig, ctl: &FollowControl) -> ComputedPick {
    let max_sessions = ctl.max_sessions.max(1);

    match ctl.selection {
        SelectionMode::Pin => {
            let mut pick = resolve_pin(
                &config.sessions_root,
                ctl.pinned_file.as_deref(),
                ctl.pinned_thread.as_deref(),
            );
            // Process-opened files still ride along with a pin.
            if config.process_follow && !pick.mode.is_idle() {
                let scan =
                    scan_processes(&config.process_pattern, &config.sessions_root, max_sessions);
                if scan.pattern_ok && !scan.pids.is_empty() {
                    pick.process_detected = true;
                    pick.process_pids = scan.pids;
                    pick.process_files = scan.files;
                }
            }
            return (pick, Vec::new(), ctl.selection, ctl.excludes.clone(), max_sessions);
        }
        SelectionMode::Auto => {
            let scan = if config.process_follow {
                scan_processes(&config.process_pattern, &config.sessions_root, max_sessions)
            } else {
                ProcessScanOutcome::default()
            };
            // Request extra candidates so exclusions do not starve the set.
            let recent = scan_recent(&config.sessions_root, 3 * max_sessions);
            let picker_cfg = PickerConfig {
                process_follow: config.process_follow,
                pattern: config.process_pattern.clone(),
                only_follow_when_detected: config.only_follow_when_detected,
            };
            let pick = pick_auto(&picker_cfg, &scan, &recent);
            (pick, recent, ctl.selection, ctl.excludes.clone(), max_sessions)
        }
    }
}

/// Apply a new plan to the cursor map: deactivate dropped files (offsets are
/// kept for reselection), create or reactivate targets.
fn apply_targets(state: &mut LoopState, plan: &FollowSyncPlan) {
    let target_paths: Vec<&PathBuf> = plan.targets.iter().map(|f| &f.path).collect();

    for cursor in state.cursors.values_mut() {
        if cursor.active && !target_paths.contains(&&cursor.path) {
            debug!(path = %cursor.path.display(), "cursor deactivated");
            cursor.active = false;
        }
    }

    for file in &plan.targets {
        match state.cursors.get_mut(&file.path) {
            Some(cursor) => {
                if !cursor.active {
                    debug!(path = %cursor.path.display(), "cursor reactivated");
                    cursor.active = true;
                }
            }
            None => {
                debug!(path = %file.path.display(), thread = %file.thread_id, "cursor created");
                state
                    .cursors
                    .insert(file.path.clone(), FileCursor::new(file.path.clone(), file.thread_id.clone()));
            }
        }
    }
}
