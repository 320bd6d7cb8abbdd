// crates/watcher/src/targets.rs
//! Expansion of a follow pick into the bounded list of files to tail.
//!
//! Pure planning: (pick, exclusions, limits, backfill candidates) in, target
//! list out. The backfill policy differs per mode — process-follow trusts
//! only process-opened files, pin-follow never re-adopts scanned sessions,
//! auto-follow tops up from the newest directory entries.

use std::collections::HashSet;
use std::path::PathBuf;

use codex_view_core::paths::RolloutFile;

use crate::picker::{FollowMode, FollowPick, SelectionMode};

/// Operator-defined exclusions, by thread id or resolved file path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowExcludes {
    pub thread_ids: HashSet<String>,
    pub files: HashSet<PathBuf>,
}

impl FollowExcludes {
    pub fn is_empty(&self) -> bool {
        self.thread_ids.is_empty() && self.files.is_empty()
    }

    fn excludes(&self, file: &RolloutFile) -> bool {
        self.thread_ids.contains(&file.thread_id) || self.files.contains(&file.path)
    }
}

/// The resolved per-tick follow plan.
#[derive(Debug, Clone)]
pub struct FollowSyncPlan {
    pub mode: FollowMode,
    pub targets: Vec<RolloutFile>,
}

impl FollowSyncPlan {
    /// Paths in plan order, the identity used for change detection.
    pub fn target_paths(&self) -> Vec<PathBuf> {
        self.targets.iter().map(|f| f.path.clone()).collect()
    }
}

/// Build the follow plan for one tick.
///
/// `backfill` is the newest-first directory scan; callers request about three
/// times `max_sessions` candidates so exclusions do not starve the set. Only
/// auto-selection non-process modes ever consume it.
pub fn build_plan(
    pick: &FollowPick,
    selection: SelectionMode,
    excludes: &FollowExcludes,
    max_sessions: usize,
    backfill: &[RolloutFile],
) -> FollowSyncPlan {
    let mut targets: Vec<RolloutFile> = Vec::new();
    let mut push = |file: &RolloutFile, targets: &mut Vec<RolloutFile>| {
        if targets.len() >= max_sessions
            || excludes.excludes(file)
            || targets.iter().any(|t| t.path == file.path)
        {
            return;
        }
        targets.push(file.clone());
    };

    if pick.mode.is_idle() {
        return FollowSyncPlan { mode: pick.mode, targets };
    }

    match (selection, pick.mode) {
        // Process-opened files are ground truth; a directory scan here would
        // risk re-adopting a stale session during a brief write gap.
        (_, FollowMode::Process) if selection != SelectionMode::Pin => {
            for file in &pick.process_files {
                push(file, &mut targets);
            }
        }
        // Pin: the pinned file plus anything the process itself holds open.
        // Never the directory scan — that would reintroduce the zombie
        // sessions the operator pinned away from.
        (SelectionMode::Pin, _) => {
            if let Some(picked) = &pick.picked {
                push(picked, &mut targets);
            }
            for file in &pick.process_files {
                push(file, &mut targets);
            }
        }
        // Auto, non-process modes: picked first, then newest scan entries
        // until the budget is spent.
        (SelectionMode::Auto, _) => {
            if let Some(picked) = &pick.picked {
                push(picked, &mut targets);
            }
            for file in backfill {
                if targets.len() >= max_sessions {
                    break;
                }
                push(file, &mut targets);
            }
        }
    }

    FollowSyncPlan { mode: pick.mode, targets }
}
