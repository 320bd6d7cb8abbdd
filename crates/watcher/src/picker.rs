// crates/watcher/src/picker.rs
//! Follow-mode resolution: which transcript file is "primary" right now.
//!
//! The decision is a strict priority chain over a snapshot of inputs and
//! produces an immutable [`FollowPick`]; it never mutates watcher state.
//! Exactly one mode is reachable for any input combination.

use std::path::{Path, PathBuf};

use serde::Serialize;

use codex_view_core::paths::{find_by_thread_id, is_rollout_path, RolloutFile};

use crate::scanner::ProcessScanOutcome;

/// How the operator asked the watcher to choose files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Follow whatever looks most alive.
    Auto,
    /// Follow one operator-chosen thread or file.
    Pin,
}

/// Outcome state of one selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowMode {
    /// Auto selection with process-follow disabled: newest file wins.
    Legacy,
    /// Following files the detected process is actively writing.
    Process,
    /// Process-follow wanted but unusable; directory scan stands in.
    Fallback,
    /// Pinned target resolved.
    Pinned,
    /// Pinned target could not be resolved; follow nothing.
    PinnedMissing,
    /// No matching process and configured to wait for one.
    Idle,
    /// Process pattern unusable and configured to wait.
    WaitCodex,
    /// Process detected but it has not opened a transcript yet.
    WaitRollout,
}

impl FollowMode {
    /// Idle-class modes follow nothing at all.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle | Self::WaitCodex | Self::PinnedMissing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Process => "process",
            Self::Fallback => "fallback",
            Self::Pinned => "pinned",
            Self::PinnedMissing => "pinned_missing",
            Self::Idle => "idle",
            Self::WaitCodex => "wait_codex",
            Self::WaitRollout => "wait_rollout",
        }
    }
}

/// Static picker configuration.
#[derive(Debug, Clone)]
pub struct PickerConfig {
    pub process_follow: bool,
    /// Process-name pattern handed to the scanner.
    pub pattern: String,
    /// When true, never fall back to directory scans while no process is
    /// detected — stay idle instead.
    pub only_follow_when_detected: bool,
}

/// A snapshot decision: recomputed every scan tick, immutable.
#[derive(Debug, Clone)]
pub struct FollowPick {
    pub picked: Option<RolloutFile>,
    pub thread_id: Option<String>,
    pub mode: FollowMode,
    pub process_detected: bool,
    pub process_pids: Vec<u32>,
    pub process_files: Vec<RolloutFile>,
}

impl FollowPick {
    fn idle(mode: FollowMode) -> Self {
        Self {
            picked: None,
            thread_id: None,
            mode,
            process_detected: false,
            process_pids: Vec::new(),
            process_files: Vec::new(),
        }
    }

    fn of(mode: FollowMode, picked: Option<RolloutFile>) -> Self {
        let thread_id = picked.as_ref().map(|f| f.thread_id.clone());
        Self {
            picked,
            thread_id,
            mode,
            process_detected: false,
            process_pids: Vec::new(),
            process_files: Vec::new(),
        }
    }
}

/// Resolve a pinned selection.
///
/// A pinned file wins when it is a rollout transcript inside the sessions
/// root; otherwise the pinned thread id is looked up in the directory tree.
/// Neither resolving leaves the watcher deliberately idle.
pub fn resolve_pin(
    sessions_root: &Path,
    pinned_file: Option<&Path>,
    pinned_thread: Option<&str>,
) -> FollowPick {
    if let Some(path) = pinned_file {
        if is_rollout_path(path, sessions_root) {
            if let Some(file) = RolloutFile::from_path(PathBuf::from(path)) {
                return FollowPick::of(FollowMode::Pinned, Some(file));
            }
        }
    }
    if let Some(thread_id) = pinned_thread {
        if let Some(file) = find_by_thread_id(sessions_root, thread_id) {
            return FollowPick::of(FollowMode::Pinned, Some(file));
        }
    }
    FollowPick::idle(FollowMode::PinnedMissing)
}

/// Resolve an auto selection from a process-scan snapshot plus the
/// newest-first directory scan (`recent`).
pub fn pick_auto(
    cfg: &PickerConfig,
    scan: &ProcessScanOutcome,
    recent: &[RolloutFile],
) -> FollowPick {
    if !cfg.process_follow {
        return FollowPick::of(FollowMode::Legacy, recent.first().cloned());
    }

    if !scan.pattern_ok {
        if cfg.only_follow_when_detected {
            return FollowPick::idle(FollowMode::WaitCodex);
        }
        return FollowPick::of(FollowMode::Fallback, recent.first().cloned());
    }

    if scan.pids.is_empty() {
        if cfg.only_follow_when_detected {
            return FollowPick::idle(FollowMode::Idle);
        }
        return FollowPick::of(FollowMode::Fallback, recent.first().cloned());
    }

    if !scan.files.is_empty() {
        let picked = scan.files.first().cloned();
        let thread_id = picked.as_ref().map(|f| f.thread_id.clone());
        return FollowPick {
            picked,
            thread_id,
            mode: FollowMode::Process,
            process_detected: true,
            process_pids: scan.pids.clone(),
            process_files: scan.files.clone(),
        };
    }

    // Process just started and has not opened its transcript yet: best-effort
    // directory pick while the process state stays marked detected.
    let picked = recent.first().cloned();
    let thread_id = picked.as_ref().map(|f| f.thread_id.clone());
    FollowPick {
        picked,
        thread_id,
        mode: FollowMode::WaitRollout,
        process_detected: true,
        process_pids: scan.pids.clone(),
        process_files: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::SystemTime;

    fn file(name: &str) -> RolloutFile {
        RolloutFile {
            path: PathBuf::from(format!("/sessions/2026/08/01/{name}")),
            thread_id: name.to_string(),
            modified: SystemTime::UNIX_EPOCH,
        }
    }

    fn cfg(process_follow: bool, only_when_detected: bool) -> PickerConfig {
        PickerConfig {
            process_follow,
            pattern: "codex".into(),
            only_follow_when_detected: only_when_detected,
        }
    }

    fn scan(pattern_ok: bool, pids: Vec<u32>, files: Vec<RolloutFile>) -> ProcessScanOutcome {
        ProcessScanOutcome { pattern_ok, pids, files }
    }

    #[test]
    fn disabled_process_follow_is_legacy() {
        let pick = pick_auto(&cfg(false, false), &scan(true, vec![1], vec![]), &[file("a")]);
        assert_eq!(pick.mode, FollowMode::Legacy);
        assert_eq!(pick.thread_id.as_deref(), Some("a"));
    }

    #[test]
    fn bad_pattern_degrades_by_config() {
        let strict = pick_auto(&cfg(true, true), &scan(false, vec![], vec![]), &[file("a")]);
        assert_eq!(strict.mode, FollowMode::WaitCodex);
        assert!(strict.picked.is_none());

        let lax = pick_auto(&cfg(true, false), &scan(false, vec![], vec![]), &[file("a")]);
        assert_eq!(lax.mode, FollowMode::Fallback);
        assert_eq!(lax.thread_id.as_deref(), Some("a"));
    }

    #[test]
    fn no_process_degrades_by_config() {
        let strict = pick_auto(&cfg(true, true), &scan(true, vec![], vec![]), &[file("a")]);
        assert_eq!(strict.mode, FollowMode::Idle);

        let lax = pick_auto(&cfg(true, false), &scan(true, vec![], vec![]), &[file("a")]);
        assert_eq!(lax.mode, FollowMode::Fallback);
    }

    #[test]
    fn detected_process_with_files_wins() {
        let pick = pick_auto(
            &cfg(true, true),
            &scan(true, vec![7, 8], vec![file("proc-a"), file("proc-b")]),
            &[file("scan-x")],
        );
        assert_eq!(pick.mode, FollowMode::Process);
        assert!(pick.process_detected);
        assert_eq!(pick.thread_id.as_deref(), Some("proc-a"));
        assert_eq!(pick.process_files.len(), 2);
        assert_eq!(pick.process_pids, vec![7, 8]);
    }

    #[test]
    fn detected_process_without_files_waits_for_rollout() {
        let pick = pick_auto(&cfg(true, true), &scan(true, vec![7], vec![]), &[file("scan-x")]);
        assert_eq!(pick.mode, FollowMode::WaitRollout);
        assert!(pick.process_detected);
        // Best-effort pick from the directory scan while waiting.
        assert_eq!(pick.thread_id.as_deref(), Some("scan-x"));
    }

    /// Every input combination resolves to exactly one mode, and each mode is
    /// reachable by exactly one path through the chain.
    #[test]
    fn follow_mode_exclusivity_table() {
        let recent = [file("r")];
        let cases: Vec<(PickerConfig, ProcessScanOutcome, FollowMode)> = vec![
            (cfg(false, false), scan(true, vec![1], vec![file("p")]), FollowMode::Legacy),
            (cfg(false, true), scan(false, vec![], vec![]), FollowMode::Legacy),
            (cfg(true, true), scan(false, vec![], vec![]), FollowMode::WaitCodex),
            (cfg(true, false), scan(false, vec![], vec![]), FollowMode::Fallback),
            (cfg(true, true), scan(true, vec![], vec![]), FollowMode::Idle),
            (cfg(true, false), scan(true, vec![], vec![]), FollowMode::Fallback),
            (cfg(true, true), scan(true, vec![1], vec![file("p")]), FollowMode::Process),
            (cfg(true, false), scan(true, vec![1], vec![file("p")]), FollowMode::Process),
            (cfg(true, true), scan(true, vec![1], vec![]), FollowMode::WaitRollout),
            (cfg(true, false), scan(true, vec![1], vec![]), FollowMode::WaitRollout),
        ];
        for (cfg, scan, expected) in cases {
            let pick = pick_auto(&cfg, &scan, &recent);
            assert_eq!(pick.mode, expected, "cfg={cfg:?} scan={scan:?}");
            // Process mode never picks outside the process file set.
            if pick.mode == FollowMode::Process {
                let picked = pick.picked.as_ref().unwrap();
                assert!(scan.files.iter().any(|f| f.path == picked.path));
            }
        }
    }

    #[test]
    fn pin_resolves_file_then_thread_then_missing() {
        let dir = tempfile::tempdir().unwrap();
        let day = dir.path().join("2026").join("08").join("01");
        std::fs::create_dir_all(&day).unwrap();
        let name = "rollout-2026-08-01T10-00-00-a3953a61-af96-4bfc-8a05-f8355309f025.jsonl";
        let inside = day.join(name);
        std::fs::write(&inside, "{}\n").unwrap();

        let by_file = resolve_pin(dir.path(), Some(&inside), None);
        assert_eq!(by_file.mode, FollowMode::Pinned);
        assert_eq!(
            by_file.thread_id.as_deref(),
            Some("a3953a61-af96-4bfc-8a05-f8355309f025")
        );

        let by_thread = resolve_pin(dir.path(), None, Some("a3953a61-af96-4bfc-8a05-f8355309f025"));
        assert_eq!(by_thread.mode, FollowMode::Pinned);

        let outside = tempfile::tempdir().unwrap().path().join(name);
        let missing = resolve_pin(dir.path(), Some(&outside), None);
        assert_eq!(missing.mode, FollowMode::PinnedMissing);
        assert!(missing.mode.is_idle());
    }
}
