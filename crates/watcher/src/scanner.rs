// crates/watcher/src/scanner.rs
//! Process discovery for the monitored agent.
//!
//! Three one-shot operations against a process-table snapshot: match PIDs by
//! executable name, expand a PID set into its descendant tree, and find the
//! transcript files those processes hold open for writing.
//!
//! All functions do synchronous syscalls and should be called from
//! `tokio::task::spawn_blocking`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use regex_lite::Regex;
use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

use codex_view_core::paths::{is_rollout_path, RolloutFile};

/// Cap on matched root PIDs, to bound scan cost on busy hosts.
const MAX_MATCHED_PIDS: usize = 64;

/// Snapshot of one process-discovery pass, consumed by the follow picker.
#[derive(Debug, Clone, Default)]
pub struct ProcessScanOutcome {
    /// Whether the configured pattern compiled.
    pub pattern_ok: bool,
    /// Matched roots expanded to their full descendant trees.
    pub pids: Vec<u32>,
    /// Transcript files actively open for writing by those PIDs.
    pub files: Vec<RolloutFile>,
}

/// Run a full discovery pass: match, expand, inspect.
pub fn scan_processes(pattern: &str, sessions_root: &Path, limit: usize) -> ProcessScanOutcome {
    let re = match compile_pattern(pattern) {
        Some(re) => re,
        None => {
            return ProcessScanOutcome { pattern_ok: false, pids: Vec::new(), files: Vec::new() }
        }
    };
    let roots = list_matching_pids(&re);
    let pids = expand_process_tree(&roots);
    let (files, _writer_pids) = find_actively_written_files(&pids, sessions_root, limit);
    ProcessScanOutcome { pattern_ok: true, pids, files }
}

/// Compile the process pattern as a full match (never a substring match, so
/// `codex` cannot accidentally adopt `codex-helper`).
pub fn compile_pattern(pattern: &str) -> Option<Regex> {
    if pattern.trim().is_empty() {
        return None;
    }
    Regex::new(&format!("^(?:{pattern})$")).ok()
}

/// List PIDs whose executable basename or first argv token fully matches.
pub fn list_matching_pids(re: &Regex) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let mut matched = Vec::new();
    for (pid, process) in sys.processes() {
        let exe_name = process
            .exe()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| process.name().to_string_lossy().to_string());
        let argv0 = process
            .cmd()
            .first()
            .map(|a| basename(&a.to_string_lossy()))
            .unwrap_or_default();

        if re.is_match(&exe_name) || re.is_match(&argv0) {
            matched.push(pid.as_u32());
            if matched.len() >= MAX_MATCHED_PIDS {
                break;
            }
        }
    }
    matched
}

/// Expand `roots` into their full descendant trees using one process-table
/// snapshot. An unavailable snapshot degrades to returning `roots` unchanged.
pub fn expand_process_tree(roots: &[u32]) -> Vec<u32> {
    if roots.is_empty() {
        return Vec::new();
    }
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    if sys.processes().is_empty() {
        return roots.to_vec();
    }

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }
    expand_tree(&children, roots)
}

/// BFS over a parent→children adjacency map. The visited set guarantees
/// termination even on cyclic adjacency from malformed snapshots.
pub fn expand_tree(children: &HashMap<u32, Vec<u32>>, roots: &[u32]) -> Vec<u32> {
    let mut visited: HashSet<u32> = HashSet::new();
    let mut order: Vec<u32> = Vec::new();
    let mut queue: VecDeque<u32> = roots.iter().copied().collect();

    while let Some(pid) = queue.pop_front() {
        if !visited.insert(pid) {
            continue;
        }
        order.push(pid);
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().copied());
        }
    }
    order
}

/// Inspect `/proc/<pid>/fd` for transcript files open in write mode.
///
/// Keeps only paths that look like rollout transcripts, resolve inside the
/// sessions root (symlink-escape defense), and are opened `O_WRONLY` or
/// `O_RDWR` — a read-only open of a historical transcript is not evidence of
/// an active session. Returns files newest-mtime-first (bounded to `limit`)
/// plus the PIDs that held them open. Hosts without procfs yield nothing.
pub fn find_actively_written_files(
    pids: &[u32],
    sessions_root: &Path,
    limit: usize,
) -> (Vec<RolloutFile>, Vec<u32>) {
    let mut by_path: HashMap<PathBuf, RolloutFile> = HashMap::new();
    let mut writer_pids: HashSet<u32> = HashSet::new();

    for &pid in pids {
        let fd_dir = PathBuf::from(format!("/proc/{pid}/fd"));
        let entries = match std::fs::read_dir(&fd_dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let target = match std::fs::read_link(entry.path()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if !is_rollout_path(&target, sessions_root) {
                continue;
            }
            let fd_name = entry.file_name();
            let flags = read_fd_flags(pid, &fd_name.to_string_lossy());
            if !flags.map(is_write_mode).unwrap_or(false) {
                continue;
            }
            if let Some(file) = RolloutFile::from_path(target) {
                debug!(pid, path = %file.path.display(), "process is writing transcript");
                writer_pids.insert(pid);
                by_path.entry(file.path.clone()).or_insert(file);
            }
        }
    }

    let mut files: Vec<RolloutFile> = by_path.into_values().collect();
    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    files.truncate(limit);

    let mut pids: Vec<u32> = writer_pids.into_iter().collect();
    pids.sort_unstable();
    (files, pids)
}

fn read_fd_flags(pid: u32, fd: &str) -> Option<u32> {
    let info = std::fs::read_to_string(format!("/proc/{pid}/fdinfo/{fd}")).ok()?;
    parse_fdinfo_flags(&info)
}

/// Parse the octal `flags:` field of a procfs fdinfo blob.
pub fn parse_fdinfo_flags(fdinfo: &str) -> Option<u32> {
    fdinfo
        .lines()
        .find_map(|line| line.strip_prefix("flags:"))
        .and_then(|rest| u32::from_str_radix(rest.trim(), 8).ok())
}

/// Access-mode check: `O_WRONLY` (1) or `O_RDWR` (2).
pub fn is_write_mode(flags: u32) -> bool {
    matches!(flags & 0o3, 1 | 2)
}

fn basename(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
