// crates/watcher/src/lib.rs
//! Transcript follow engine: process scanning, follow-target selection,
//! per-file cursors, line ingestion, approval-gate detection, and the
//! orchestrating [`watch::RolloutWatcher`].

pub mod approval;
pub mod cursor;
pub mod ingest;
pub mod picker;
pub mod scanner;
pub mod targets;
pub mod tui_gate;
pub mod watch;

pub use approval::{ApprovalGateTracker, GateEvent, GateStatus};
pub use cursor::FileCursor;
pub use ingest::RolloutLineIngestor;
pub use picker::{FollowMode, FollowPick, PickerConfig, SelectionMode};
pub use scanner::ProcessScanOutcome;
pub use targets::{FollowExcludes, FollowSyncPlan};
pub use tui_gate::TuiGateTailer;
pub use watch::{RolloutWatcher, TranslateMode, WatcherConfig, WatcherStatus};
