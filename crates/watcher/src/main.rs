//! codex-view-watcher binary.
//!
//! Tails the monitored agent's rollout transcripts and prints every ingest
//! message as one JSON object per line on stdout — the local event store's
//! write interface made visible. Runs until ctrl-c.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use codex_view_core::event::{EventSink, IngestMessage};
use codex_view_translate::pump::{PumpConfig, TranslationPump};
use codex_view_watcher::watch::{translation_done_callback, RolloutWatcher, WatcherConfig};

#[derive(Debug, Parser)]
#[command(name = "codex-view-watcher", about = "Tail agent rollout transcripts into an event stream")]
struct Args {
    /// Sessions root to watch (default: ~/.codex/sessions).
    #[arg(long)]
    sessions_root: Option<PathBuf>,

    /// Process-name pattern for process-follow (full match).
    #[arg(long, default_value = "codex")]
    pattern: String,

    /// Disable process-follow; always pick the newest transcript.
    #[arg(long)]
    no_process_follow: bool,

    /// Stay idle while no matching process is detected.
    #[arg(long)]
    only_when_detected: bool,

    /// Max transcripts tailed in parallel.
    #[arg(long, default_value_t = 3)]
    max_sessions: usize,

    /// Replay the last N lines of each newly followed transcript.
    #[arg(long, default_value_t = 50)]
    replay_lines: usize,

    /// Poll interval in milliseconds.
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    /// Follow-target rescan interval in milliseconds.
    #[arg(long, default_value_t = 2000)]
    scan_ms: u64,

    /// Companion interactive-UI log to tail for gate signals.
    #[arg(long)]
    tui_log: Option<PathBuf>,
}

/// Writes each ingest message as a JSON line on stdout.
struct StdoutSink;

impl EventSink for StdoutSink {
    fn emit(&self, msg: IngestMessage) {
        match serde_json::to_string(&msg) {
            Ok(line) => {
                let stdout = std::io::stdout();
                let mut lock = stdout.lock();
                let _ = writeln!(lock, "{line}");
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize ingest message"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let sessions_root = match args.sessions_root {
        Some(root) => root,
        None => codex_view_core::paths::default_sessions_root()
            .context("cannot determine home directory; pass --sessions-root")?,
    };

    let config = WatcherConfig {
        sessions_root,
        process_pattern: args.pattern,
        process_follow: !args.no_process_follow,
        only_follow_when_detected: args.only_when_detected,
        max_sessions: args.max_sessions,
        replay_last_lines: args.replay_lines,
        poll_interval: Duration::from_millis(args.poll_ms),
        file_scan_interval: Duration::from_millis(args.scan_ms),
        tui_log: args.tui_log,
    };

    let sink: Arc<dyn EventSink> = Arc::new(StdoutSink);
    let pump = TranslationPump::new(PumpConfig::default(), translation_done_callback(sink.clone()));
    let watcher = RolloutWatcher::new(config, sink, pump.clone());

    let cancel = CancellationToken::new();
    let pump_task = tokio::spawn(pump.run(cancel.clone()));
    let watch_task = tokio::spawn(watcher.run(cancel.clone()));

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    cancel.cancel();

    let _ = watch_task.await;
    let _ = pump_task.await;
    Ok(())
}
