// crates/core/src/paths.rs
//! Rollout transcript locations and filename handling.
//!
//! Transcripts live under `~/.codex/sessions/<year>/<month>/<day>/` and are
//! named `rollout-<timestamp>-<uuid>.jsonl`. The uuid is the thread id.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use regex_lite::Regex;

/// A discovered rollout transcript file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutFile {
    pub path: PathBuf,
    pub thread_id: String,
    pub modified: SystemTime,
}

impl RolloutFile {
    /// Build from a path, extracting the thread id from the filename.
    /// Returns `None` when the filename does not match the rollout shape.
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let thread_id = thread_id_from_filename(name)?;
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Some(Self { path, thread_id, modified })
    }
}

/// Sessions root for a given home directory: `<home>/.codex/sessions`.
pub fn sessions_root(home: &Path) -> PathBuf {
    home.join(".codex").join("sessions")
}

/// Sessions root under the user's home directory.
pub fn default_sessions_root() -> Option<PathBuf> {
    dirs::home_dir().map(|h| sessions_root(&h))
}

fn rollout_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^rollout-.+-([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})\.jsonl$",
        )
        .expect("rollout filename regex")
    })
}

/// Whether a bare filename looks like a rollout transcript.
pub fn is_rollout_filename(name: &str) -> bool {
    rollout_name_re().is_match(name)
}

/// Extract the thread id (uuid) from a rollout filename.
pub fn thread_id_from_filename(name: &str) -> Option<String> {
    rollout_name_re()
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// Whether `path` is a rollout transcript located inside `root`.
///
/// Both sides are canonicalized before the containment check, so a symlink
/// pointing out of the sessions tree does not pass. A path that cannot be
/// resolved (missing file, permission) does not pass either.
pub fn is_rollout_path(path: &Path, root: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    if !is_rollout_filename(name) {
        return false;
    }
    match (path.canonicalize(), root.canonicalize()) {
        (Ok(p), Ok(r)) => p.starts_with(&r),
        _ => false,
    }
}

/// Scan the sessions tree for rollout files, newest mtime first, bounded to
/// `limit`. Unreadable directories are skipped.
pub fn scan_recent(root: &Path, limit: usize) -> Vec<RolloutFile> {
    let mut found: Vec<RolloutFile> = Vec::new();
    collect_rollouts(root, &mut found, 0);
    found.sort_by(|a, b| b.modified.cmp(&a.modified));
    found.truncate(limit);
    found
}

/// Locate a rollout file by thread id anywhere under the sessions tree.
pub fn find_by_thread_id(root: &Path, thread_id: &str) -> Option<RolloutFile> {
    let wanted = thread_id.to_ascii_lowercase();
    let mut found: Vec<RolloutFile> = Vec::new();
    collect_rollouts(root, &mut found, 0);
    found.into_iter().find(|f| f.thread_id == wanted)
}

/// Year/month/day tree plus the files themselves: depth 4 is plenty.
const MAX_SCAN_DEPTH: usize = 6;

fn collect_rollouts(dir: &Path, out: &mut Vec<RolloutFile>, depth: usize) {
    if depth > MAX_SCAN_DEPTH {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(err) => {
            tracing::debug!(path = %dir.display(), error = %err, "skipping unreadable dir");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_rollouts(&path, out, depth + 1);
        } else if let Some(file) = RolloutFile::from_path(path) {
            out.push(file);
        }
    }
}
